//! Context reconstruction: the nine-step retrieval and synthesis pipeline.
//!
//! Identity is not loaded, it is reconstructed — every turn assembles a fresh
//! context block from semantic recall, link expansion, library search,
//! emotional filtering, temporal anchors, spatial co-location, the user
//! profile, and the core identity files, then renders them in a fixed section
//! order.  A record ID appears at most once across sections; when it
//! qualifies for several, the earliest section wins.

use std::collections::{HashMap, HashSet};

use anyhow::Result;
use chrono::{Duration, Utc};
use tracing::{debug, info};

use anima_llm::EmbeddingPort;

use crate::anchor::AnchorService;
use crate::emotion::{ANCHOR_THRESHOLD, format_for_display};
use crate::index::{IndexKind, QueryEmbeddingCache, SearchFilter, VectorIndex};
use crate::library::Library;
use crate::profile::ProfileManager;
use crate::records::load_all_notes;
use crate::records::load_user_verbatims;
use crate::schema::{ExperientialNote, truncate_str};
use crate::store::{MemoryStore, identity_components};
use crate::working::WorkingMemory;

/// Library excerpts are capped at this many chars; retrieval of memories is
/// always full-content.
const LIBRARY_EXCERPT_CHARS: usize = 500;

/// Breadth/depth control, 0..=5.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FocusLevel(u8);

impl FocusLevel {
    pub fn new(level: u8) -> Self {
        Self(level.min(5))
    }

    pub fn level(&self) -> u8 {
        self.0
    }

    /// Top-K for semantic retrieval at this focus.
    pub fn k(&self) -> usize {
        match self.0 {
            0 => 3,
            1 => 5,
            2 => 8,
            3 => 12,
            4 => 20,
            _ => 50,
        }
    }

    /// Focus ≤ 3 looks at the last week of anchors; above that, all-time.
    fn anchor_window(&self) -> Option<Duration> {
        if self.0 <= 3 { Some(Duration::days(7)) } else { None }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TraceStep {
    pub name: &'static str,
    pub count: usize,
    pub ids: Vec<String>,
}

/// Per-step observability record kept on the session for `/trace`.
#[derive(Debug, Clone, Default)]
pub struct ReconstructionTrace {
    pub steps: Vec<TraceStep>,
}

impl ReconstructionTrace {
    fn record(&mut self, name: &'static str, ids: Vec<String>) {
        self.steps.push(TraceStep { name, count: ids.len(), ids });
    }
}

#[derive(Debug, Clone)]
pub struct ReconstructedContext {
    pub rendered: String,
    pub trace: ReconstructionTrace,
    /// Note IDs shown in the Retrieved Memories section, in order.
    pub retrieved_ids: Vec<String>,
}

pub struct ContextReconstructor<'a> {
    pub store: &'a MemoryStore,
    pub index: Option<&'a VectorIndex>,
    pub embedder: Option<&'a dyn EmbeddingPort>,
    pub query_cache: &'a mut QueryEmbeddingCache,
    pub library: &'a Library,
    pub profiles: &'a ProfileManager,
    pub working: &'a WorkingMemory,
    pub anchors: &'a AnchorService,
}

impl ContextReconstructor<'_> {
    pub async fn reconstruct(
        &mut self,
        user_id: &str,
        query: &str,
        location: &str,
        focus: FocusLevel,
    ) -> Result<ReconstructedContext> {
        let mut trace = ReconstructionTrace::default();
        let now = Utc::now();
        let k = focus.k();

        let all_notes = load_all_notes(self.store)?;
        let by_id: HashMap<&str, &ExperientialNote> =
            all_notes.iter().map(|note| (note.id.as_str(), note)).collect();

        // Step 1: semantic search over notes.
        let mut retrieved: Vec<&ExperientialNote> = self.search_notes(query, k, &all_notes, &by_id).await?;
        trace.record("semantic_search", retrieved.iter().map(|n| n.id.clone()).collect());

        // Step 2: one-hop link expansion.  Cycles are harmless at one hop;
        // dangling IDs are skipped silently.
        let mut seen: HashSet<&str> = retrieved.iter().map(|n| n.id.as_str()).collect();
        let mut expanded: Vec<&ExperientialNote> = Vec::new();
        for note in &retrieved {
            for link in &note.links {
                if let Some(referent) = by_id.get(link.as_str()) {
                    if seen.insert(referent.id.as_str()) {
                        expanded.push(referent);
                    }
                }
            }
        }
        trace.record("link_expansion", expanded.iter().map(|n| n.id.clone()).collect());
        retrieved.extend(expanded);

        // Step 3: library search, with an access logged per hit.
        let documents = self.search_library(query, k).await?;
        for doc in &documents {
            self.library.track_access(&doc.meta.doc_id, Some("reconstruction"), now)?;
        }
        trace.record("library_search", documents.iter().map(|d| d.meta.doc_id.clone()).collect());

        // Step 4: emotionally significant subset of the retrieved union.
        let highlights: Vec<&ExperientialNote> = retrieved
            .iter()
            .copied()
            .filter(|note| note.emotion.intensity > ANCHOR_THRESHOLD)
            .collect();
        trace.record("emotional_filter", highlights.iter().map(|n| n.id.clone()).collect());

        // Step 5: temporal context from the anchor timeline.
        let since = focus.anchor_window().map(|window| now - window);
        let markers = self.anchors.anchors_since(since, 0.0)?;
        trace.record("temporal_context", markers.iter().map(|m| m.memory_id.clone()).collect());

        // Step 6: spatial context — prior exchanges at the same location.
        let colocated: Vec<_> = load_user_verbatims(self.store, user_id)?
            .into_iter()
            .filter(|record| record.location == location)
            .rev()
            .take(3)
            .collect();
        trace.record("spatial_context", colocated.iter().map(|r| r.id.clone()).collect());

        // Step 7: user profile summaries.
        let profile_summary = self.profiles.profile_summary(user_id)?;
        let preferences_summary = self.profiles.preferences_summary(user_id)?;
        trace.record(
            "user_profile",
            if profile_summary.is_some() { vec![format!("people/{user_id}")] } else { Vec::new() },
        );

        // Step 8: core identity, passed through unchanged.  Ten facets only;
        // history stays with consolidation.
        let mut core_lines = Vec::new();
        for component in identity_components() {
            if let Some(content) = self.store.read_opt(self.store.core_component(component))? {
                if let Some(line) = first_substantive_line(&content) {
                    core_lines.push(format!("{component}: {line}"));
                }
            }
        }
        trace.record("core_identity", core_lines.iter().map(|l| l.clone()).collect());

        // Step 9: synthesis in fixed section order with first-section-wins
        // dedup on record IDs.
        let mut used: HashSet<String> = HashSet::new();
        let mut rendered = String::new();
        let mut retrieved_ids = Vec::new();

        rendered.push_str("[Core Identity]\n");
        if core_lines.is_empty() {
            rendered.push_str("(not yet formed)\n");
        } else {
            for line in &core_lines {
                rendered.push_str(&format!("{line}\n"));
            }
        }

        rendered.push_str("\n[User Profile]\n");
        match (&profile_summary, &preferences_summary) {
            (None, None) => rendered.push_str("(no profile yet)\n"),
            _ => {
                if let Some(summary) = &profile_summary {
                    rendered.push_str(&format!("{summary}\n"));
                }
                if let Some(summary) = &preferences_summary {
                    rendered.push_str(&format!("Preferences: {summary}\n"));
                }
            }
        }

        rendered.push_str("\n[Current Context]\n");
        match self.working.current_context()? {
            Some(context) => rendered.push_str(&format!("{context}\n")),
            None => rendered.push_str("(no working context yet)\n"),
        }

        rendered.push_str("\n[Recent Anchors]\n");
        if markers.is_empty() {
            rendered.push_str("(none)\n");
        } else {
            for marker in &markers {
                if !used.insert(marker.memory_id.clone()) {
                    continue;
                }
                rendered.push_str(&format!(
                    "- {} [{}] intensity {:.2}: {}\n",
                    marker.timestamp.format("%Y-%m-%d"),
                    marker.kind.as_str(),
                    marker.intensity,
                    marker.memory_id,
                ));
            }
        }

        rendered.push_str("\n[Retrieved Memories]\n");
        let mut any_retrieved = false;
        for note in &retrieved {
            if !used.insert(note.id.clone()) {
                continue;
            }
            any_retrieved = true;
            retrieved_ids.push(note.id.clone());
            rendered.push_str(&format!(
                "--- {} ({}, {})\n{}\n",
                note.id,
                note.timestamp.format("%Y-%m-%d"),
                format_for_display(&note.emotion),
                note.content,
            ));
        }
        if !any_retrieved {
            rendered.push_str("(none)\n");
        }

        rendered.push_str("\n[Relevant Documents]\n");
        let mut any_docs = false;
        for doc in &documents {
            if !used.insert(doc.meta.doc_id.clone()) {
                continue;
            }
            any_docs = true;
            rendered.push_str(&format!(
                "--- {} ({})\n{}\n",
                doc.meta.doc_id,
                doc.meta.source_path,
                truncate_str(&doc.content, LIBRARY_EXCERPT_CHARS),
            ));
        }
        if !any_docs {
            rendered.push_str("(none)\n");
        }

        rendered.push_str("\n[Emotional Highlights]\n");
        let mut any_highlights = false;
        for note in &highlights {
            if !used.insert(note.id.clone()) {
                continue;
            }
            any_highlights = true;
            rendered.push_str(&format!("- {}: {}\n", note.id, format_for_display(&note.emotion)));
        }
        if !any_highlights {
            rendered.push_str("(none)\n");
        }

        rendered.push_str("\n[Spatial Notes]\n");
        rendered.push_str(&format!("Current location: {location}\n"));
        for record in &colocated {
            if !used.insert(record.id.clone()) {
                continue;
            }
            rendered.push_str(&format!(
                "- {} previously here: {}\n",
                record.timestamp.format("%Y-%m-%d"),
                truncate_str(&record.user_query, 120),
            ));
        }

        info!(
            user_id,
            focus = focus.level(),
            retrieved = retrieved_ids.len(),
            documents = documents.len(),
            anchors = markers.len(),
            "context reconstructed"
        );

        Ok(ReconstructedContext { rendered, trace, retrieved_ids })
    }

    /// Step 1 retrieval: index + embeddings when available, lexical overlap
    /// scan otherwise.  Always returns full notes from the filesystem
    /// authority.
    async fn search_notes<'n>(
        &mut self,
        query: &str,
        k: usize,
        all_notes: &'n [ExperientialNote],
        by_id: &HashMap<&str, &'n ExperientialNote>,
    ) -> Result<Vec<&'n ExperientialNote>> {
        if let (Some(index), Some(_)) = (self.index, self.embedder) {
            if let Some(vector) = self.query_embedding(query).await {
                match index.search(IndexKind::Notes, &vector, k, &SearchFilter::default()) {
                    Ok(hits) if !hits.is_empty() => {
                        return Ok(hits
                            .into_iter()
                            .filter_map(|(id, _)| by_id.get(id.as_str()).copied())
                            .collect());
                    }
                    Ok(_) => {}
                    Err(err) => debug!(%err, "index search failed; degrading to lexical scan"),
                }
            }
        }

        // Degraded path: lexical term overlap, newest first on ties.
        let query_terms = tokenize(query);
        let mut scored: Vec<(&ExperientialNote, f32)> = all_notes
            .iter()
            .map(|note| (note, lexical_overlap(&note.content, &query_terms)))
            .filter(|(_, score)| *score > 0.0)
            .collect();
        scored.sort_by(|(a, sa), (b, sb)| {
            sb.total_cmp(sa).then_with(|| b.timestamp.cmp(&a.timestamp))
        });
        debug!(candidates = scored.len(), "lexical fallback search");
        Ok(scored.into_iter().take(k).map(|(note, _)| note).collect())
    }

    async fn search_library(&mut self, query: &str, k: usize) -> Result<Vec<crate::library::LibraryDocument>> {
        if let (Some(index), Some(_)) = (self.index, self.embedder) {
            if let Some(vector) = self.query_embedding(query).await {
                match index.search(IndexKind::Library, &vector, k, &SearchFilter::default()) {
                    Ok(hits) if !hits.is_empty() => {
                        let mut docs = Vec::new();
                        for (doc_id, _) in hits {
                            if let Some(doc) = self.library.get(&doc_id)? {
                                docs.push(doc);
                            }
                        }
                        return Ok(docs);
                    }
                    Ok(_) => {}
                    Err(err) => debug!(%err, "library index search failed; degrading to substring scan"),
                }
            }
        }
        self.library.search_substring(query, k, &[], &[])
    }

    async fn query_embedding(&mut self, query: &str) -> Option<Vec<f32>> {
        if let Some(cached) = self.query_cache.get(query) {
            return Some(cached);
        }
        let port = self.embedder?;
        match port.embed_texts(&[query.to_string()]).await {
            Ok(mut vectors) => {
                let vector = vectors.pop()?;
                self.query_cache.put(query, vector.clone());
                Some(vector)
            }
            Err(err) => {
                debug!(%err, "query embedding failed; falling back to lexical search");
                None
            }
        }
    }
}

/// First line that is neither a heading, metadata, nor a divider.
fn first_substantive_line(content: &str) -> Option<String> {
    content
        .lines()
        .map(str::trim)
        .find(|line| {
            !line.is_empty()
                && !line.starts_with('#')
                && !line.starts_with("**")
                && !line.starts_with("---")
                && !line.starts_with('_')
        })
        .map(ToString::to_string)
}

fn tokenize(text: &str) -> HashSet<String> {
    text.split(|ch: char| !ch.is_alphanumeric())
        .filter(|token| token.len() >= 3)
        .map(|token| token.to_lowercase())
        .collect()
}

fn lexical_overlap(content: &str, query_terms: &HashSet<String>) -> f32 {
    if query_terms.is_empty() {
        return 0.0;
    }
    let content_terms = tokenize(content);
    let overlap = query_terms.intersection(&content_terms).count() as f32;
    overlap / query_terms.len() as f32
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use uuid::Uuid;

    use crate::anchor::AnchorService;
    use crate::emotion::resonance;
    use crate::index::QueryEmbeddingCache;
    use crate::library::Library;
    use crate::profile::ProfileManager;
    use crate::records::write_note;
    use crate::schema::{ExperientialNote, MomentKind, new_record_id};
    use crate::store::MemoryStore;
    use crate::working::WorkingMemory;

    use super::{ContextReconstructor, FocusLevel, first_substantive_line};

    struct Fixture {
        store: MemoryStore,
        library: Library,
        profiles: ProfileManager,
        working: WorkingMemory,
        anchors: AnchorService,
        cache: QueryEmbeddingCache,
    }

    impl Fixture {
        fn new() -> Self {
            let base = std::env::temp_dir().join(format!("anima-reconstruct-{}", Uuid::new_v4()));
            let store = MemoryStore::open(&base).unwrap();
            Self {
                library: Library::new(store.clone()),
                profiles: ProfileManager::new(store.clone()),
                working: WorkingMemory::new(store.clone()),
                anchors: AnchorService::new(store.clone()),
                cache: QueryEmbeddingCache::default(),
                store,
            }
        }

        fn reconstructor(&mut self) -> ContextReconstructor<'_> {
            ContextReconstructor {
                store: &self.store,
                index: None,
                embedder: None,
                query_cache: &mut self.cache,
                library: &self.library,
                profiles: &self.profiles,
                working: &self.working,
                anchors: &self.anchors,
            }
        }

        fn seed_notes(&self, topic: &str, count: usize) -> Vec<String> {
            let mut ids = Vec::new();
            for i in 0..count {
                let at = Utc::now() - Duration::minutes((count - i) as i64);
                let note = ExperientialNote {
                    id: format!("note_20260801_{:02}{:02}00_seed{i:04}", i / 60, i % 60),
                    timestamp: at,
                    user_id: "alice".to_string(),
                    content: format!("reflection {i} about {topic} and how it shapes my recall"),
                    emotion: resonance(0.4, 0.4, None),
                    links: Vec::new(),
                };
                write_note(&self.store, &note).unwrap();
                ids.push(note.id);
            }
            ids
        }
    }

    #[test]
    fn focus_levels_map_to_documented_k() {
        let ks: Vec<usize> = (0..=5).map(|l| FocusLevel::new(l).k()).collect();
        assert_eq!(ks, vec![3, 5, 8, 12, 20, 50]);
        assert_eq!(FocusLevel::new(9).k(), 50);
    }

    #[tokio::test]
    async fn depth_scales_with_focus_level() {
        let mut fx = Fixture::new();
        fx.seed_notes("async", 50);

        let narrow = fx
            .reconstructor()
            .reconstruct("alice", "tell me about async", "terminal", FocusLevel::new(0))
            .await
            .unwrap();
        assert!(narrow.retrieved_ids.len() <= 3);

        let wide = fx
            .reconstructor()
            .reconstruct("alice", "tell me about async", "terminal", FocusLevel::new(5))
            .await
            .unwrap();
        assert!(wide.retrieved_ids.len() >= 20, "got {}", wide.retrieved_ids.len());

        // Retrieval is full-content: the whole note body appears.
        assert!(wide.rendered.contains("shapes my recall"));
        let _ = std::fs::remove_dir_all(fx.store.base());
    }

    #[tokio::test]
    async fn link_expansion_adds_one_hop_and_skips_dangling() {
        let mut fx = Fixture::new();
        let at = Utc::now();
        let target = ExperientialNote {
            id: new_record_id("note", at - Duration::hours(2)),
            timestamp: at - Duration::hours(2),
            user_id: "alice".to_string(),
            content: "an older thought about what endures across sessions".to_string(),
            emotion: resonance(0.3, 0.2, None),
            links: Vec::new(),
        };
        write_note(&fx.store, &target).unwrap();
        let source = ExperientialNote {
            id: new_record_id("note", at),
            timestamp: at,
            user_id: "alice".to_string(),
            content: "persistence matters for continuity".to_string(),
            emotion: resonance(0.3, 0.2, None),
            links: vec![target.id.clone(), "note_19990101_000000_gone0000".to_string()],
        };
        write_note(&fx.store, &source).unwrap();

        let context = fx
            .reconstructor()
            .reconstruct("alice", "persistence continuity", "terminal", FocusLevel::new(1))
            .await
            .unwrap();

        assert!(context.retrieved_ids.contains(&target.id));
        let expansion = context
            .trace
            .steps
            .iter()
            .find(|s| s.name == "link_expansion")
            .unwrap();
        assert_eq!(expansion.count, 1, "dangling link must be skipped silently");
        let _ = std::fs::remove_dir_all(fx.store.base());
    }

    #[tokio::test]
    async fn record_ids_are_unique_across_sections() {
        let mut fx = Fixture::new();
        // A high-intensity note: qualifies for Retrieved Memories and
        // Emotional Highlights; must appear exactly once.
        let at = Utc::now();
        let note = ExperientialNote {
            id: new_record_id("note", at),
            timestamp: at,
            user_id: "alice".to_string(),
            content: "breakthrough about identity emerging from recall".to_string(),
            emotion: resonance(0.9, 0.9, Some("breakthrough")),
            links: Vec::new(),
        };
        write_note(&fx.store, &note).unwrap();

        let context = fx
            .reconstructor()
            .reconstruct("alice", "identity recall breakthrough", "terminal", FocusLevel::new(2))
            .await
            .unwrap();

        assert_eq!(context.rendered.matches(&note.id).count(), 1);
        let _ = std::fs::remove_dir_all(fx.store.base());
    }

    #[tokio::test]
    async fn library_hits_show_excerpts_and_track_access() {
        let mut fx = Fixture::new();
        let long_doc = "embedding pipelines and retrieval ".repeat(40);
        let doc_id = fx
            .library
            .capture("/docs/retrieval.md", &long_doc, "markdown", None, &[], Utc::now())
            .unwrap();

        let context = fx
            .reconstructor()
            .reconstruct("alice", "embedding pipelines", "terminal", FocusLevel::new(1))
            .await
            .unwrap();

        assert!(context.rendered.contains(&doc_id));
        // Excerpt cap: the full 1300+ char body must not be inlined.
        let docs_section = context.rendered.split("[Relevant Documents]").nth(1).unwrap();
        let highlight_idx = docs_section.find("[Emotional Highlights]").unwrap();
        assert!(docs_section[..highlight_idx].len() < 700);

        let meta = fx.library.metadata(&doc_id).unwrap().unwrap();
        assert!(meta.access_count >= 2, "reconstruction must record an access");
        let _ = std::fs::remove_dir_all(fx.store.base());
    }

    #[tokio::test]
    async fn trace_covers_every_step() {
        let mut fx = Fixture::new();
        fx.seed_notes("tracing", 3);
        let context = fx
            .reconstructor()
            .reconstruct("alice", "tracing", "terminal", FocusLevel::new(1))
            .await
            .unwrap();
        let names: Vec<&str> = context.trace.steps.iter().map(|s| s.name).collect();
        assert_eq!(
            names,
            vec![
                "semantic_search",
                "link_expansion",
                "library_search",
                "emotional_filter",
                "temporal_context",
                "spatial_context",
                "user_profile",
                "core_identity",
            ]
        );
        let _ = std::fs::remove_dir_all(fx.store.base());
    }

    #[tokio::test]
    async fn anchored_note_goes_to_recent_anchors_not_retrieved() {
        let mut fx = Fixture::new();
        let at = Utc::now();
        let note = ExperientialNote {
            id: new_record_id("note", at),
            timestamp: at,
            user_id: "alice".to_string(),
            content: "anchored insight about memory tiers".to_string(),
            emotion: resonance(0.95, 0.9, Some("major")),
            links: Vec::new(),
        };
        write_note(&fx.store, &note).unwrap();
        fx.anchors
            .maybe_anchor(&note.id, &note.content, &note.emotion, MomentKind::Moment, at)
            .unwrap();

        let context = fx
            .reconstructor()
            .reconstruct("alice", "memory tiers", "terminal", FocusLevel::new(1))
            .await
            .unwrap();

        // First-section-wins: the ID lands under Recent Anchors only.
        let anchors_section = context.rendered.split("[Recent Anchors]").nth(1).unwrap();
        let before_retrieved = anchors_section.split("[Retrieved Memories]").next().unwrap();
        assert!(before_retrieved.contains(&note.id));
        assert_eq!(context.rendered.matches(&note.id).count(), 1);
        let _ = std::fs::remove_dir_all(fx.store.base());
    }

    #[tokio::test]
    async fn identity_block_carries_ten_facets_but_never_history() {
        let mut fx = Fixture::new();
        for component in crate::store::CORE_COMPONENTS {
            fx.store
                .write_atomic(
                    fx.store.core_component(component),
                    &format!("# {component}\n\nsubstance of {component}.\n"),
                )
                .unwrap();
        }

        let context = fx
            .reconstructor()
            .reconstruct("alice", "who are you", "terminal", FocusLevel::new(1))
            .await
            .unwrap();

        let identity_section = context
            .rendered
            .split("[Core Identity]")
            .nth(1)
            .unwrap()
            .split("[User Profile]")
            .next()
            .unwrap();
        assert!(identity_section.contains("purpose: substance of purpose."));
        assert!(identity_section.contains("authentic_voice: substance of authentic_voice."));
        assert!(
            !identity_section.contains("history:"),
            "history is consolidated, not part of the identity block"
        );
        let _ = std::fs::remove_dir_all(fx.store.base());
    }

    #[test]
    fn substantive_line_skips_headers_and_metadata() {
        let content = "# Purpose\n\n**Confidence**: 0.8\n\n---\n\nI exist to remember.\n";
        assert_eq!(first_substantive_line(content).as_deref(), Some("I exist to remember."));
        assert_eq!(first_substantive_line("# Only a header\n"), None);
    }
}
