//! Semantic tier: validated knowledge and concept evolution.
//!
//! Critical insights are append-only blocks with confidence and evidence
//! references.  Concepts track how understanding of a topic shifts over time:
//! the current reading lives in `concepts.md`, every revision is appended to
//! `concepts_history.md`, and co-mentions accumulate as weighted edges in
//! `concepts_graph.json`.

use std::collections::BTreeMap;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::schema::{Reflection, SemanticInsight, new_record_id, truncate_str};
use crate::store::MemoryStore;

const INSIGHTS_HEADER: &str = "# Critical Insights\n\n\
Validated knowledge with evidence. Newer insights supersede older ones when confidence is higher.\n\n\
---\n";

const CONCEPTS_HEADER: &str = "# Concepts\n\nCurrent understanding per concept.\n";

const CONCEPTS_HISTORY_HEADER: &str = "# Concept History\n\nEvery revision, oldest first.\n";

const REFLECTIONS_HEADER: &str = "# Reflections\n\nOutputs of reflect-on-topic operations.\n";

/// Adjacency map of co-mentioned concepts with co-mention counts.
pub type ConceptGraph = BTreeMap<String, BTreeMap<String, u32>>;

#[derive(Debug, Clone)]
pub struct SemanticMemory {
    store: MemoryStore,
}

impl SemanticMemory {
    pub fn new(store: MemoryStore) -> Self {
        Self { store }
    }

    // ── Critical insights ──────────────────────────────────────────────────

    pub fn append_insight(
        &self,
        content: &str,
        confidence: f64,
        evidence: &[String],
        emotion: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<SemanticInsight> {
        let insight = SemanticInsight {
            id: new_record_id("insight", at),
            content: content.to_string(),
            confidence: confidence.clamp(0.0, 1.0),
            evidence: evidence.to_vec(),
            emotion: emotion.map(ToString::to_string),
            recorded_at: at,
        };

        let evidence_line = if insight.evidence.is_empty() {
            "(none)".to_string()
        } else {
            insight.evidence.join(", ")
        };
        let block = format!(
            "\n---\n\n\
             ## Insight: {}\n\n\
             **ID**: `{}`\n\
             **Recorded**: {}\n\
             **Confidence**: {:.2}\n\
             **Emotion**: {}\n\
             **Evidence**: {evidence_line}\n\n\
             {}\n",
            truncate_str(content, 60).replace('\n', " "),
            insight.id,
            at.format("%Y-%m-%d %H:%M:%S"),
            insight.confidence,
            insight.emotion.as_deref().unwrap_or("-"),
            content,
        );
        self.store.append_block(
            self.store.semantic_dir().join("critical_insights.md"),
            Some(INSIGHTS_HEADER),
            &block,
        )?;
        info!(id = %insight.id, confidence = insight.confidence, "semantic insight recorded");
        Ok(insight)
    }

    /// All insights on disk, oldest first.
    pub fn insights(&self) -> Result<Vec<SemanticInsight>> {
        let path = self.store.semantic_dir().join("critical_insights.md");
        let Some(content) = self.store.read_opt(&path)? else {
            return Ok(Vec::new());
        };
        Ok(parse_insights(&content))
    }

    /// Insights whose content mentions `topic`, case-insensitively.
    pub fn by_topic(&self, topic: &str, limit: usize) -> Result<Vec<SemanticInsight>> {
        let needle = topic.to_lowercase();
        Ok(self
            .insights()?
            .into_iter()
            .filter(|insight| insight.content.to_lowercase().contains(&needle))
            .take(limit)
            .collect())
    }

    /// Highest-confidence insights first.
    pub fn top_confidence(&self, limit: usize) -> Result<Vec<SemanticInsight>> {
        let mut insights = self.insights()?;
        insights.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        insights.truncate(limit);
        Ok(insights)
    }

    // ── Concept evolution ──────────────────────────────────────────────────

    /// Record a new reading of `concept`.  Replaces the current entry,
    /// appends to the history file, and strengthens graph edges to every
    /// concept in `related`.
    pub fn record_concept(
        &self,
        concept: &str,
        understanding: &str,
        confidence: f64,
        related: &[String],
        at: DateTime<Utc>,
    ) -> Result<()> {
        let concept = concept.trim().to_lowercase();
        self.replace_concept_section(&concept, understanding, confidence, at)?;

        let history_block = format!(
            "\n### {} - {concept}\n\n**Confidence**: {confidence:.2}\n\n{understanding}\n",
            at.format("%Y-%m-%d %H:%M:%S"),
        );
        self.store.append_block(
            self.store.semantic_dir().join("concepts_history.md"),
            Some(CONCEPTS_HISTORY_HEADER),
            &history_block,
        )?;

        if !related.is_empty() {
            let path = self.store.semantic_dir().join("concepts_graph.json");
            let mut graph: ConceptGraph = self.store.read_json_or_default(&path)?;
            for other in related {
                let other = other.trim().to_lowercase();
                if other == concept || other.is_empty() {
                    continue;
                }
                *graph.entry(concept.clone()).or_default().entry(other.clone()).or_insert(0) += 1;
                *graph.entry(other).or_default().entry(concept.clone()).or_insert(0) += 1;
            }
            self.store.write_json(&path, &graph)?;
        }

        debug!(concept, confidence, "concept understanding recorded");
        Ok(())
    }

    fn replace_concept_section(
        &self,
        concept: &str,
        understanding: &str,
        confidence: f64,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let path = self.store.semantic_dir().join("concepts.md");
        let existing = self
            .store
            .read_opt(&path)?
            .unwrap_or_else(|| CONCEPTS_HEADER.to_string());

        let heading = format!("## Concept: {concept}");
        let section = format!(
            "{heading}\n\n**Updated**: {}\n**Confidence**: {confidence:.2}\n\n{understanding}\n",
            at.format("%Y-%m-%d %H:%M:%S"),
        );

        let updated = match existing.find(&heading) {
            Some(start) => {
                let after = &existing[start + heading.len()..];
                let end = after
                    .find("\n## Concept: ")
                    .map(|offset| start + heading.len() + offset + 1)
                    .unwrap_or(existing.len());
                format!("{}{section}{}", &existing[..start], &existing[end..])
            }
            None => format!("{existing}\n{section}"),
        };
        self.store.write_atomic(&path, &updated)
    }

    /// Current understanding text for one concept, if recorded.
    pub fn concept_current(&self, concept: &str) -> Result<Option<String>> {
        let concept = concept.trim().to_lowercase();
        let path = self.store.semantic_dir().join("concepts.md");
        let Some(content) = self.store.read_opt(&path)? else {
            return Ok(None);
        };
        let heading = format!("## Concept: {concept}");
        let Some(start) = content.find(&heading) else {
            return Ok(None);
        };
        let after = &content[start..];
        let end = after[heading.len()..]
            .find("\n## Concept: ")
            .map(|offset| heading.len() + offset)
            .unwrap_or(after.len());
        Ok(Some(after[..end].trim().to_string()))
    }

    pub fn concept_graph(&self) -> Result<ConceptGraph> {
        self.store
            .read_json_or_default(self.store.semantic_dir().join("concepts_graph.json"))
    }

    // ── Reflections ────────────────────────────────────────────────────────

    pub fn append_reflection(&self, reflection: &Reflection) -> Result<()> {
        let list = |items: &[String]| {
            if items.is_empty() {
                "(none)\n".to_string()
            } else {
                items.iter().map(|item| format!("- {item}\n")).collect()
            }
        };
        let block = format!(
            "\n---\n\n\
             ## Reflection: {}\n\n\
             **ID**: `{}`\n\
             **Depth**: {}\n\
             **Created**: {}\n\
             **Confidence**: {:.2}\n\n\
             ### Insights\n{}\n\
             ### Patterns\n{}\n\
             ### Contradictions\n{}\n\
             ### Evolution\n{}\n",
            reflection.topic,
            reflection.id,
            reflection.depth.as_str(),
            reflection.created_at.format("%Y-%m-%d %H:%M:%S"),
            reflection.confidence,
            list(&reflection.insights),
            list(&reflection.patterns),
            list(&reflection.contradictions),
            reflection.evolution_narrative,
        );
        self.store.append_block(
            self.store.semantic_dir().join("reflections.md"),
            Some(REFLECTIONS_HEADER),
            &block,
        )
    }
}

fn parse_insights(content: &str) -> Vec<SemanticInsight> {
    let mut insights = Vec::new();
    for block in content.split("\n---\n").skip(1) {
        let value = |key: &str| -> Option<String> {
            let needle = format!("**{key}**:");
            block
                .lines()
                .find_map(|line| line.strip_prefix(&needle))
                .map(|rest| rest.trim().trim_matches('`').to_string())
        };
        let Some(id) = value("ID") else { continue };
        let Some(recorded_raw) = value("Recorded") else { continue };
        let Some(recorded) =
            chrono::NaiveDateTime::parse_from_str(&recorded_raw, "%Y-%m-%d %H:%M:%S")
                .ok()
                .map(|naive| naive.and_utc())
        else {
            continue;
        };
        let confidence: f64 = value("Confidence").and_then(|v| v.parse().ok()).unwrap_or(0.0);
        let emotion = value("Emotion").filter(|v| v != "-");
        let evidence: Vec<String> = match value("Evidence").as_deref() {
            Some("(none)") | None => Vec::new(),
            Some(raw) => raw.split(',').map(|s| s.trim().to_string()).collect(),
        };
        // Body: everything after the blank line following the metadata block.
        let body = block
            .split("\n\n")
            .skip(2)
            .collect::<Vec<_>>()
            .join("\n\n")
            .trim()
            .to_string();
        insights.push(SemanticInsight {
            id,
            content: body,
            confidence,
            evidence,
            emotion,
            recorded_at: recorded,
        });
    }
    insights
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use uuid::Uuid;

    use crate::schema::{Reflection, ReflectionDepth, new_record_id};
    use crate::store::MemoryStore;

    use super::SemanticMemory;

    fn temp_semantic() -> (MemoryStore, SemanticMemory) {
        let base = std::env::temp_dir().join(format!("anima-semantic-{}", Uuid::new_v4()));
        let store = MemoryStore::open(&base).unwrap();
        let semantic = SemanticMemory::new(store.clone());
        (store, semantic)
    }

    #[test]
    fn insights_round_trip_with_evidence() {
        let (store, semantic) = temp_semantic();
        let now = Utc::now();
        semantic
            .append_insight(
                "Retrieval quality depends on note density",
                0.85,
                &["note_20260101_080000_aaaaaaaa".to_string()],
                Some("curiosity"),
                now,
            )
            .unwrap();

        let insights = semantic.insights().unwrap();
        assert_eq!(insights.len(), 1);
        assert_eq!(insights[0].confidence, 0.85);
        assert_eq!(insights[0].evidence.len(), 1);
        assert_eq!(insights[0].emotion.as_deref(), Some("curiosity"));
        assert!(insights[0].content.contains("note density"));
        let _ = std::fs::remove_dir_all(store.base());
    }

    #[test]
    fn topic_and_confidence_retrieval() {
        let (store, semantic) = temp_semantic();
        let now = Utc::now();
        semantic.append_insight("Async tasks need structured ordering", 0.9, &[], None, now).unwrap();
        semantic
            .append_insight("Users value concise answers", 0.6, &[], None, now + Duration::seconds(1))
            .unwrap();

        let by_topic = semantic.by_topic("async", 5).unwrap();
        assert_eq!(by_topic.len(), 1);

        let top = semantic.top_confidence(1).unwrap();
        assert!(top[0].content.contains("Async"));
        let _ = std::fs::remove_dir_all(store.base());
    }

    #[test]
    fn concept_updates_replace_current_and_keep_history() {
        let (store, semantic) = temp_semantic();
        let now = Utc::now();
        semantic.record_concept("ownership", "a compile-time discipline", 0.5, &[], now).unwrap();
        semantic
            .record_concept("ownership", "a discipline that shapes API design", 0.8, &[], now + Duration::minutes(1))
            .unwrap();

        let current = semantic.concept_current("ownership").unwrap().unwrap();
        assert!(current.contains("shapes API design"));
        assert!(!current.contains("compile-time discipline"));

        let history = store
            .read_opt(store.semantic_dir().join("concepts_history.md"))
            .unwrap()
            .unwrap();
        assert!(history.contains("compile-time discipline"));
        assert!(history.contains("shapes API design"));
        let _ = std::fs::remove_dir_all(store.base());
    }

    #[test]
    fn concept_graph_edges_are_symmetric_and_counted() {
        let (store, semantic) = temp_semantic();
        let now = Utc::now();
        semantic
            .record_concept("borrowing", "tied to ownership", 0.7, &["ownership".to_string()], now)
            .unwrap();
        semantic
            .record_concept("borrowing", "still tied to ownership", 0.8, &["ownership".to_string()], now)
            .unwrap();

        let graph = semantic.concept_graph().unwrap();
        assert_eq!(graph["borrowing"]["ownership"], 2);
        assert_eq!(graph["ownership"]["borrowing"], 2);
        let _ = std::fs::remove_dir_all(store.base());
    }

    #[test]
    fn reflections_are_appended() {
        let (store, semantic) = temp_semantic();
        let now = Utc::now();
        let reflection = Reflection {
            id: new_record_id("reflection", now),
            topic: "learning pace".to_string(),
            depth: ReflectionDepth::Deep,
            insights: vec!["progress compounds".to_string()],
            patterns: vec![],
            contradictions: vec![],
            evolution_narrative: "Started slow, accelerating.".to_string(),
            confidence: 0.9,
            created_at: now,
        };
        semantic.append_reflection(&reflection).unwrap();
        let content = store
            .read_opt(store.semantic_dir().join("reflections.md"))
            .unwrap()
            .unwrap();
        assert!(content.contains("learning pace"));
        assert!(content.contains("progress compounds"));
        let _ = std::fs::remove_dir_all(store.base());
    }
}
