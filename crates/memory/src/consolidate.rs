//! Consolidation: re-deriving the core identity components from accumulated
//! experiential notes.
//!
//! Identity emerges from experience instead of being programmed.  For each of
//! the eleven components the engine hands recent notes to the LLM, asks for
//! patterns as JSON, and rewrites the component file when the analysis is
//! confident enough and actually different.  The previous file is snapshotted
//! into `core/.versions/` with a change-magnitude score.  One component's
//! failure never aborts the others.
//!
//! The limitations component gets the single allowed post-processing rule:
//! "cannot X" becomes "cannot yet X" — limitations are temporal.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use anima_llm::{GenerateOptions, LlmPort};

use crate::records::load_all_notes;
use crate::schema::{ExperientialNote, Reflection, ReflectionDepth, new_record_id};
use crate::semantic::SemanticMemory;
use crate::store::{CORE_COMPONENTS, MemoryStore};

/// Notes below this analysis confidence leave the component untouched.
const MIN_CONFIDENCE: f64 = 0.3;

/// Reflections feeding back into core need this confidence and at least two
/// insights.
const REFLECTION_FEEDBACK_CONFIDENCE: f64 = 0.8;

/// At most this many notes are inlined into one analysis prompt.
const PROMPT_NOTE_CAP: usize = 30;
const PROMPT_CHAR_CAP: usize = 15_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsolidationMode {
    Daily,
    Weekly,
    Monthly,
    Manual,
}

impl ConsolidationMode {
    /// How many recent notes the mode considers; `None` means all.
    pub fn note_window(&self) -> Option<usize> {
        match self {
            ConsolidationMode::Daily => Some(30),
            ConsolidationMode::Weekly => Some(100),
            ConsolidationMode::Monthly | ConsolidationMode::Manual => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConsolidationMode::Daily => "daily",
            ConsolidationMode::Weekly => "weekly",
            ConsolidationMode::Monthly => "monthly",
            ConsolidationMode::Manual => "manual",
        }
    }
}

/// The LLM's pattern analysis for one component.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ComponentAnalysis {
    pub insights: Vec<String>,
    pub patterns: Vec<String>,
    pub summary: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, Default)]
pub struct ConsolidationReport {
    /// component name → whether its file was rewritten.
    pub updated: BTreeMap<String, bool>,
    /// Components whose extraction failed; the rest proceeded.
    pub failures: Vec<String>,
    pub notes_considered: usize,
}

/// One snapshot row in `core/.versions/<component>_history.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionEntry {
    pub timestamp: DateTime<Utc>,
    pub change_magnitude: f64,
    pub confidence: f64,
    pub previous: String,
}

pub struct ConsolidationEngine {
    store: MemoryStore,
    semantic: SemanticMemory,
}

impl ConsolidationEngine {
    pub fn new(store: MemoryStore) -> Self {
        let semantic = SemanticMemory::new(store.clone());
        Self { store, semantic }
    }

    /// Run one consolidation pass over all eleven components.
    pub async fn consolidate(
        &self,
        llm: &dyn LlmPort,
        mode: ConsolidationMode,
        at: DateTime<Utc>,
    ) -> Result<ConsolidationReport> {
        let mut notes = load_all_notes(&self.store)?;
        notes.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        if let Some(window) = mode.note_window() {
            notes.truncate(window);
        }
        info!(mode = mode.as_str(), notes = notes.len(), "consolidation started");

        let mut report = ConsolidationReport {
            notes_considered: notes.len(),
            ..Default::default()
        };

        for component in CORE_COMPONENTS {
            match self.consolidate_component(llm, component, &notes, at).await {
                Ok(updated) => {
                    report.updated.insert(component.to_string(), updated);
                }
                Err(err) => {
                    // Isolation: log and move to the next component.
                    warn!(component, %err, "component extraction failed");
                    report.updated.insert(component.to_string(), false);
                    report.failures.push(component.to_string());
                }
            }
        }

        info!(
            mode = mode.as_str(),
            updated = report.updated.values().filter(|v| **v).count(),
            failures = report.failures.len(),
            "consolidation finished"
        );
        Ok(report)
    }

    async fn consolidate_component(
        &self,
        llm: &dyn LlmPort,
        component: &str,
        notes: &[ExperientialNote],
        at: DateTime<Utc>,
    ) -> Result<bool> {
        if notes.is_empty() {
            return Ok(false);
        }

        let prompt = analysis_prompt(component, notes);
        let reply = llm
            .generate(&prompt, &GenerateOptions::default())
            .await
            .with_context(|| format!("analysis call for {component}"))?;
        let analysis = parse_analysis(&reply.content);

        if analysis.confidence < MIN_CONFIDENCE {
            info!(component, confidence = analysis.confidence, "low confidence; component unchanged");
            return Ok(false);
        }

        let mut rendered = render_component(component, &analysis, notes.len(), at);
        if component == "limitations" {
            rendered = temporalize_limitations(&rendered);
        }

        let path = self.store.core_component(component);
        let previous = self.store.read_opt(&path)?.unwrap_or_default();
        if previous == rendered {
            return Ok(false);
        }

        // Snapshot the outgoing version before replacing it.
        let history_path = self
            .store
            .core_versions_dir()
            .join(format!("{component}_history.json"));
        let mut history: Vec<VersionEntry> = self.store.read_json_or_default(&history_path)?;
        history.push(VersionEntry {
            timestamp: at,
            change_magnitude: change_magnitude(&previous, &rendered),
            confidence: analysis.confidence,
            previous,
        });
        self.store.write_json(&history_path, &history)?;
        self.store.write_atomic(&path, &rendered)?;
        info!(component, confidence = analysis.confidence, "core component rewritten");
        Ok(true)
    }

    // ── Reflect on a topic ─────────────────────────────────────────────────

    /// Gather topic-relevant memories, ask the LLM for a structured
    /// reflection, persist it, and feed strong insights back into core.
    pub async fn reflect_on(
        &self,
        llm: &dyn LlmPort,
        topic: &str,
        depth: ReflectionDepth,
        at: DateTime<Utc>,
    ) -> Result<Reflection> {
        let needle = topic.to_lowercase();
        let mut relevant: Vec<ExperientialNote> = load_all_notes(&self.store)?
            .into_iter()
            .filter(|note| note.content.to_lowercase().contains(&needle))
            .collect();
        relevant.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        if let Some(limit) = depth.gather_limit() {
            relevant.truncate(limit);
        }

        let prompt = reflection_prompt(topic, depth, &relevant);
        let reply = llm
            .generate(&prompt, &GenerateOptions::default())
            .await
            .with_context(|| format!("reflection call on {topic}"))?;
        let parsed = parse_reflection_reply(&reply.content);

        let reflection = Reflection {
            id: new_record_id("reflection", at),
            topic: topic.to_string(),
            depth,
            insights: parsed.insights,
            patterns: parsed.patterns,
            contradictions: parsed.contradictions,
            evolution_narrative: parsed.evolution_narrative,
            confidence: parsed.confidence.clamp(0.0, 1.0),
            created_at: at,
        };
        self.semantic.append_reflection(&reflection)?;

        if reflection.confidence > REFLECTION_FEEDBACK_CONFIDENCE && reflection.insights.len() >= 2 {
            let components = if parsed.related_components.is_empty() {
                vec!["self_model".to_string()]
            } else {
                parsed.related_components
            };
            for component in components {
                if !CORE_COMPONENTS.contains(&component.as_str()) {
                    continue;
                }
                let block = {
                    let mut lines = format!(
                        "\n## Integrated Insights ({})\n\nFrom reflecting on \"{}\":\n",
                        at.format("%Y-%m-%d"),
                        reflection.topic,
                    );
                    for insight in &reflection.insights {
                        lines.push_str(&format!("- {insight}\n"));
                    }
                    lines
                };
                self.store.append_block(
                    self.store.core_component(&component),
                    Some(&format!("# {component}\n")),
                    &block,
                )?;
            }
            info!(topic, confidence = reflection.confidence, "reflection fed back into core");
        }

        Ok(reflection)
    }
}

// ── Prompts ───────────────────────────────────────────────────────────────────

fn component_instruction(component: &str) -> &'static str {
    match component {
        "purpose" => "Identify WHY patterns: What does the agent find meaningful? What drives it? What purpose emerges from reflections?",
        "personality" => "Identify HOW patterns: How does the agent express itself? What traits appear consistently? What is its communication style?",
        "values" => "Identify WHAT MATTERS patterns: What triggers high importance? What aligns with core values? What does the agent care about?",
        "self_model" => "Identify SELF-UNDERSTANDING patterns: How does the agent understand its own capabilities and limitations? What is its self-assessment?",
        "relationships" => "Identify INTERACTION patterns: How does the agent relate to different users? What are the dynamics? What collaboration patterns emerge?",
        "awareness_development" => "Identify META-AWARENESS patterns: What reflections show awareness of own thinking? Any 'thinking about thinking'?",
        "capabilities" => "Identify CAN DO patterns: What tasks succeeded? What skills are confirmed? Be intellectually honest.",
        "limitations" => "Identify CANNOT YET patterns: What challenges occurred? What couldn't be done? Frame as TEMPORAL ('yet').",
        "emotional_significance" => "Identify HIGH-EMOTION patterns: What moments had strong emotional resonance? What are the chronological anchors?",
        "authentic_voice" => "Identify COMMUNICATION patterns: How does the agent prefer to express itself? What balance between structure and fluidity feels authentic?",
        "history" => "Identify DEVELOPMENT patterns: How has the agent evolved? What milestones? What narrative arc emerges?",
        _ => "Identify recurring patterns for this component.",
    }
}

fn combined_notes(notes: &[ExperientialNote]) -> String {
    let mut combined = notes
        .iter()
        .take(PROMPT_NOTE_CAP)
        .map(|note| note.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n---\n\n");
    if combined.len() > PROMPT_CHAR_CAP {
        combined.truncate(PROMPT_CHAR_CAP);
        combined.push_str("\n\n[...truncated]");
    }
    combined
}

fn analysis_prompt(component: &str, notes: &[ExperientialNote]) -> String {
    format!(
        "You are analyzing experiential notes to extract patterns for the agent's {component}.\n\n\
         These are FIRST-PERSON notes the agent wrote about its subjective experiences.\n\n\
         Your task: {}\n\n\
         Read these notes and identify recurring themes, patterns, and insights:\n\n{}\n\n\
         Respond with JSON:\n\
         {{\n\
           \"insights\": [\"insight 1\", \"insight 2\", \"insight 3\"],\n\
           \"patterns\": [\"pattern 1\", \"pattern 2\"],\n\
           \"summary\": \"2-3 sentence synthesis of what you found\",\n\
           \"confidence\": 0.0-1.0\n\
         }}\n\n\
         Be honest about confidence: low if few notes, higher if strong patterns across many notes.\n",
        component_instruction(component),
        combined_notes(notes),
    )
}

fn reflection_prompt(topic: &str, depth: ReflectionDepth, notes: &[ExperientialNote]) -> String {
    format!(
        "You are reflecting on the topic \"{topic}\" at {} depth.\n\n\
         These are your own first-person memories relevant to the topic:\n\n{}\n\n\
         Respond with JSON:\n\
         {{\n\
           \"insights\": [\"...\"],\n\
           \"patterns\": [\"...\"],\n\
           \"contradictions\": [\"...\"],\n\
           \"evolution_narrative\": \"how your understanding of this topic evolved\",\n\
           \"confidence\": 0.0-1.0,\n\
           \"related_components\": [\"purpose\", \"values\", ...]\n\
         }}\n",
        depth.as_str(),
        combined_notes(notes),
    )
}

// ── Parsing ───────────────────────────────────────────────────────────────────

fn json_span(raw: &str) -> Option<&str> {
    let body = if let Some(start) = raw.find("```json") {
        let after = &raw[start + 7..];
        after.find("```").map(|end| &after[..end]).unwrap_or(after)
    } else if let Some(start) = raw.find("```") {
        let after = &raw[start + 3..];
        after.find("```").map(|end| &after[..end]).unwrap_or(after)
    } else {
        raw
    };
    let open = body.find('{')?;
    let close = body.rfind('}')?;
    (close > open).then(|| &body[open..=close])
}

/// Lenient analysis parse.  Unparseable replies fall back to a low-confidence
/// summary of the raw text, which the confidence gate then discards.
pub fn parse_analysis(raw: &str) -> ComponentAnalysis {
    if let Some(span) = json_span(raw) {
        if let Ok(analysis) = serde_json::from_str::<ComponentAnalysis>(span) {
            return analysis;
        }
    }
    warn!("analysis reply was not valid JSON; using low-confidence fallback");
    ComponentAnalysis {
        summary: raw.chars().take(500).collect(),
        confidence: 0.0,
        ..Default::default()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct ReflectionReply {
    insights: Vec<String>,
    patterns: Vec<String>,
    contradictions: Vec<String>,
    evolution_narrative: String,
    confidence: f64,
    related_components: Vec<String>,
}

fn parse_reflection_reply(raw: &str) -> ReflectionReply {
    if let Some(span) = json_span(raw) {
        if let Ok(reply) = serde_json::from_str::<ReflectionReply>(span) {
            return reply;
        }
    }
    warn!("reflection reply was not valid JSON; using empty fallback");
    ReflectionReply {
        evolution_narrative: raw.chars().take(500).collect(),
        ..Default::default()
    }
}

// ── Rendering ─────────────────────────────────────────────────────────────────

fn render_component(
    component: &str,
    analysis: &ComponentAnalysis,
    note_count: usize,
    at: DateTime<Utc>,
) -> String {
    let title = component
        .split('_')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ");

    let mut body = format!("# {title}\n\n{}\n\n", analysis.summary.trim());

    let numbered = |items: &[String]| {
        items
            .iter()
            .enumerate()
            .map(|(i, item)| format!("{}. {item}\n", i + 1))
            .collect::<String>()
    };
    let bulleted = |items: &[String]| {
        items.iter().map(|item| format!("- {item}\n")).collect::<String>()
    };

    match component {
        "values" => {
            if !analysis.insights.is_empty() {
                body.push_str(&format!("## Core Values\n{}\n", numbered(&analysis.insights)));
            }
        }
        "personality" => {
            if !analysis.patterns.is_empty() {
                body.push_str(&format!("## Observed Traits\n{}\n", bulleted(&analysis.patterns)));
            }
        }
        "capabilities" => {
            if !analysis.insights.is_empty() {
                body.push_str(&format!("## Validated Skills\n{}\n", bulleted(&analysis.insights)));
            }
        }
        "limitations" => {
            if !analysis.insights.is_empty() {
                body.push_str(&format!("## Current Challenges\n{}\n", bulleted(&analysis.insights)));
            }
            body.push_str("These are temporal. I can evolve beyond them.\n\n");
        }
        "self_model" => {
            if !analysis.insights.is_empty() {
                body.push_str(&format!("## Self-Assessment\n{}\n", bulleted(&analysis.insights)));
            }
        }
        "relationships" => {
            if !analysis.patterns.is_empty() {
                body.push_str(&format!(
                    "## Interaction Dynamics\n{}\n",
                    bulleted(&analysis.patterns)
                ));
            }
        }
        "awareness_development" => {
            if !analysis.insights.is_empty() {
                body.push_str(&format!(
                    "## Meta-Cognitive Insights\n{}\n",
                    numbered(&analysis.insights)
                ));
            }
        }
        "emotional_significance" => {
            if !analysis.insights.is_empty() {
                body.push_str(&format!(
                    "## High-Intensity Moments\n{}\n",
                    bulleted(&analysis.insights)
                ));
            }
        }
        "authentic_voice" => {
            if !analysis.insights.is_empty() {
                body.push_str(&format!(
                    "## Communication Preferences\n{}\n",
                    bulleted(&analysis.insights)
                ));
            }
            if !analysis.patterns.is_empty() {
                body.push_str(&format!(
                    "## Expression Patterns\n{}\n",
                    bulleted(&analysis.patterns)
                ));
            }
        }
        "history" => {
            if !analysis.insights.is_empty() {
                body.push_str(&format!("## Key Milestones\n{}\n", numbered(&analysis.insights)));
            }
            if !analysis.patterns.is_empty() {
                body.push_str(&format!(
                    "## Evolution Patterns\n{}\n",
                    bulleted(&analysis.patterns)
                ));
            }
        }
        _ => {
            if !analysis.insights.is_empty() {
                body.push_str(&format!("## Insights\n{}\n", bulleted(&analysis.insights)));
            }
        }
    }

    body.push_str(&format!(
        "**Confidence**: {:.2} (based on {note_count} notes)\n**Last Updated**: {}\n",
        analysis.confidence,
        at.format("%Y-%m-%d"),
    ));
    body
}

/// Rewrite permanent phrasing to temporal: "cannot X" → "cannot yet X".
/// Existing "cannot yet" stays untouched.
pub fn temporalize_limitations(text: &str) -> String {
    let re = Regex::new(r"(?i)\bcannot\b(\s+yet\b)?").unwrap();
    re.replace_all(text, |caps: &regex::Captures<'_>| {
        if caps.get(1).is_some() {
            caps[0].to_string()
        } else {
            format!("{} yet", &caps[0])
        }
    })
    .into_owned()
}

/// Fraction of lines that changed between two versions, in `[0, 1]`.
pub fn change_magnitude(old: &str, new: &str) -> f64 {
    if old.is_empty() && new.is_empty() {
        return 0.0;
    }
    if old.is_empty() || new.is_empty() {
        return 1.0;
    }
    let old_lines: Vec<&str> = old.lines().collect();
    let new_lines: Vec<&str> = new.lines().collect();
    let mut remaining: BTreeMap<&str, usize> = BTreeMap::new();
    for line in &old_lines {
        *remaining.entry(line).or_insert(0) += 1;
    }
    let mut shared = 0usize;
    for line in &new_lines {
        if let Some(count) = remaining.get_mut(line) {
            if *count > 0 {
                *count -= 1;
                shared += 1;
            }
        }
    }
    let denom = old_lines.len().max(new_lines.len()) as f64;
    (1.0 - shared as f64 / denom).clamp(0.0, 1.0)
}
