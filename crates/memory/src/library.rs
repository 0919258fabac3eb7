//! Library: content-addressed store of external documents the agent has read.
//!
//! A document is captured once — the doc ID is a prefix of the content hash,
//! so re-capturing the same body refreshes metadata instead of duplicating.
//! Access is tracked per read and feeds a deterministic importance score in
//! `[0, 1]`: `log(1+access) / log(1+max_access)` damped by recency decay.

use std::collections::BTreeMap;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::index::IndexedRow;
use crate::store::MemoryStore;

/// Days for the recency half of the importance score to fall to ~1/e.
const RECENCY_DECAY_DAYS: f64 = 30.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocMetadata {
    pub doc_id: String,
    pub source_path: String,
    pub content_type: String,
    pub tags: Vec<String>,
    pub context: Option<String>,
    pub captured_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub access_count: u64,
    pub importance: f64,
}

#[derive(Debug, Clone)]
pub struct LibraryDocument {
    pub meta: DocMetadata,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AccessLogRow {
    doc_id: String,
    at: DateTime<Utc>,
    context: Option<String>,
}

/// `index.json` summary row, one per captured document.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexSummary {
    source_path: String,
    content_type: String,
    tags: Vec<String>,
    captured_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Library {
    store: MemoryStore,
}

impl Library {
    pub fn new(store: MemoryStore) -> Self {
        Self { store }
    }

    fn doc_dir(&self, doc_id: &str) -> std::path::PathBuf {
        self.store.library_dir().join("documents").join(doc_id)
    }

    fn index_path(&self) -> std::path::PathBuf {
        self.store.library_dir().join("index.json")
    }

    fn access_log_path(&self) -> std::path::PathBuf {
        self.store.library_dir().join("access_log.json")
    }

    fn importance_map_path(&self) -> std::path::PathBuf {
        self.store.library_dir().join("importance_map.json")
    }

    // ── Capture ────────────────────────────────────────────────────────────

    /// Capture external content.  Returns the stable doc ID.  Capturing the
    /// same body again refreshes metadata and bumps the access count.
    pub fn capture(
        &self,
        source_path: &str,
        content: &str,
        content_type: &str,
        context: Option<&str>,
        tags: &[String],
        at: DateTime<Utc>,
    ) -> Result<String> {
        let hash = MemoryStore::content_hash(content);
        let doc_id = format!("doc_{}", &hash[..12]);
        let dir = self.doc_dir(&doc_id);

        if let Some(mut meta) = self.metadata(&doc_id)? {
            meta.access_count += 1;
            meta.last_accessed = at;
            meta.context = context.map(ToString::to_string).or(meta.context);
            for tag in tags {
                if !meta.tags.contains(tag) {
                    meta.tags.push(tag.clone());
                }
            }
            self.store.write_json(dir.join("metadata.json"), &meta)?;
            self.recompute_importance(at)?;
            debug!(doc_id, "document re-captured; metadata refreshed");
            return Ok(doc_id);
        }

        let meta = DocMetadata {
            doc_id: doc_id.clone(),
            source_path: source_path.to_string(),
            content_type: content_type.to_string(),
            tags: tags.to_vec(),
            context: context.map(ToString::to_string),
            captured_at: at,
            last_accessed: at,
            access_count: 1,
            importance: 0.0,
        };
        self.store.write_atomic(dir.join("content.md"), content)?;
        self.store.write_json(dir.join("metadata.json"), &meta)?;

        let mut index: BTreeMap<String, IndexSummary> =
            self.store.read_json_or_default(self.index_path())?;
        index.insert(
            doc_id.clone(),
            IndexSummary {
                source_path: source_path.to_string(),
                content_type: content_type.to_string(),
                tags: tags.to_vec(),
                captured_at: at,
            },
        );
        self.store.write_json(self.index_path(), &index)?;
        self.recompute_importance(at)?;

        info!(doc_id, source_path, content_type, "document captured");
        Ok(doc_id)
    }

    // ── Access tracking ────────────────────────────────────────────────────

    /// Record one read of `doc_id` and refresh importance scores.
    pub fn track_access(&self, doc_id: &str, context: Option<&str>, at: DateTime<Utc>) -> Result<()> {
        let Some(mut meta) = self.metadata(doc_id)? else {
            debug!(doc_id, "access to unknown document ignored");
            return Ok(());
        };

        let mut log: Vec<AccessLogRow> = self.store.read_json_or_default(self.access_log_path())?;
        log.push(AccessLogRow {
            doc_id: doc_id.to_string(),
            at,
            context: context.map(ToString::to_string),
        });
        self.store.write_json(self.access_log_path(), &log)?;

        meta.access_count += 1;
        meta.last_accessed = at;
        self.store.write_json(self.doc_dir(doc_id).join("metadata.json"), &meta)?;
        self.recompute_importance(at)
    }

    /// Deterministic importance in `[0, 1]` for one document.
    pub fn importance(&self, doc_id: &str, now: DateTime<Utc>) -> Result<f64> {
        let Some(meta) = self.metadata(doc_id)? else {
            return Ok(0.0);
        };
        let max_access = self
            .all()?
            .iter()
            .map(|m| m.access_count)
            .max()
            .unwrap_or(0);
        Ok(importance_score(meta.access_count, max_access, meta.last_accessed, now))
    }

    fn recompute_importance(&self, now: DateTime<Utc>) -> Result<()> {
        let docs = self.all()?;
        let max_access = docs.iter().map(|m| m.access_count).max().unwrap_or(0);
        let mut map: BTreeMap<String, f64> = BTreeMap::new();
        for mut meta in docs {
            let score = importance_score(meta.access_count, max_access, meta.last_accessed, now);
            map.insert(meta.doc_id.clone(), score);
            if (meta.importance - score).abs() > f64::EPSILON {
                meta.importance = score;
                self.store.write_json(self.doc_dir(&meta.doc_id).join("metadata.json"), &meta)?;
            }
        }
        self.store.write_json(self.importance_map_path(), &map)
    }

    // ── Retrieval ──────────────────────────────────────────────────────────

    pub fn metadata(&self, doc_id: &str) -> Result<Option<DocMetadata>> {
        match self.store.read_opt(self.doc_dir(doc_id).join("metadata.json"))? {
            Some(raw) => Ok(serde_json::from_str(&raw).ok()),
            None => Ok(None),
        }
    }

    pub fn get(&self, doc_id: &str) -> Result<Option<LibraryDocument>> {
        let Some(meta) = self.metadata(doc_id)? else {
            return Ok(None);
        };
        let Some(content) = self.store.read_opt(self.doc_dir(doc_id).join("content.md"))? else {
            return Ok(None);
        };
        Ok(Some(LibraryDocument { meta, content }))
    }

    /// All document metadata, capture order.
    pub fn all(&self) -> Result<Vec<DocMetadata>> {
        let index: BTreeMap<String, IndexSummary> =
            self.store.read_json_or_default(self.index_path())?;
        let mut docs = Vec::new();
        for doc_id in index.keys() {
            if let Some(meta) = self.metadata(doc_id)? {
                docs.push(meta);
            }
        }
        docs.sort_by(|a, b| a.captured_at.cmp(&b.captured_at));
        Ok(docs)
    }

    /// Substring scan over content and source path.  The fallback path when
    /// no vector index is available; also applies type/tag filters.
    pub fn search_substring(
        &self,
        query: &str,
        limit: usize,
        content_types: &[String],
        tags: &[String],
    ) -> Result<Vec<LibraryDocument>> {
        let needle = query.to_lowercase();
        let mut hits = Vec::new();
        for meta in self.all()? {
            if !content_types.is_empty() && !content_types.contains(&meta.content_type) {
                continue;
            }
            if !tags.is_empty() && !tags.iter().any(|tag| meta.tags.contains(tag)) {
                continue;
            }
            let Some(doc) = self.get(&meta.doc_id)? else {
                continue;
            };
            if doc.content.to_lowercase().contains(&needle)
                || doc.meta.source_path.to_lowercase().contains(&needle)
            {
                hits.push(doc);
                if hits.len() >= limit {
                    break;
                }
            }
        }
        Ok(hits)
    }

    /// Rows for the vector-index rebuild: one per document, embedding left
    /// for the index to fill.
    pub fn index_rows(&self) -> Result<Vec<(IndexedRow, String)>> {
        let mut rows = Vec::new();
        for meta in self.all()? {
            let Some(doc) = self.get(&meta.doc_id)? else {
                continue;
            };
            rows.push((
                IndexedRow {
                    id: meta.doc_id.clone(),
                    content_hash: MemoryStore::content_hash(&doc.content),
                    embedding: Vec::new(),
                    timestamp: meta.captured_at,
                    user_id: None,
                    intensity: 0.0,
                    valence: None,
                    tags: meta.tags.clone(),
                },
                doc.content,
            ));
        }
        Ok(rows)
    }
}

fn importance_score(
    access_count: u64,
    max_access: u64,
    last_accessed: DateTime<Utc>,
    now: DateTime<Utc>,
) -> f64 {
    if max_access == 0 {
        return 0.0;
    }
    let frequency = ((1 + access_count) as f64).ln() / ((1 + max_access) as f64).ln();
    let days_idle = (now - last_accessed).num_seconds().max(0) as f64 / 86_400.0;
    let recency = 0.5 + 0.5 * (-days_idle / RECENCY_DECAY_DAYS).exp();
    (frequency * recency).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use uuid::Uuid;

    use crate::store::MemoryStore;

    use super::{Library, importance_score};

    fn temp_library() -> (MemoryStore, Library) {
        let base = std::env::temp_dir().join(format!("anima-library-{}", Uuid::new_v4()));
        let store = MemoryStore::open(&base).unwrap();
        let library = Library::new(store.clone());
        (store, library)
    }

    #[test]
    fn capture_is_content_addressed() {
        let (store, library) = temp_library();
        let now = Utc::now();
        let first = library
            .capture("/docs/a.md", "shared body", "markdown", None, &[], now)
            .unwrap();
        let second = library
            .capture("/docs/b.md", "shared body", "markdown", None, &[], now)
            .unwrap();
        assert_eq!(first, second, "same content must yield the same doc id");
        assert!(first.starts_with("doc_"));

        let meta = library.metadata(&first).unwrap().unwrap();
        assert_eq!(meta.access_count, 2);
        assert_eq!(library.all().unwrap().len(), 1);
        let _ = std::fs::remove_dir_all(store.base());
    }

    #[test]
    fn distinct_content_yields_distinct_docs() {
        let (store, library) = temp_library();
        let now = Utc::now();
        let a = library.capture("/a", "alpha body", "text", None, &[], now).unwrap();
        let b = library.capture("/b", "beta body", "text", None, &[], now).unwrap();
        assert_ne!(a, b);
        assert_eq!(library.all().unwrap().len(), 2);
        let _ = std::fs::remove_dir_all(store.base());
    }

    #[test]
    fn access_tracking_raises_importance() {
        let (store, library) = temp_library();
        let now = Utc::now();
        let hot = library.capture("/hot", "frequently read", "text", None, &[], now).unwrap();
        let cold = library.capture("/cold", "rarely read", "text", None, &[], now).unwrap();
        for _ in 0..5 {
            library.track_access(&hot, Some("reconstruction"), now).unwrap();
        }

        let hot_score = library.importance(&hot, now).unwrap();
        let cold_score = library.importance(&cold, now).unwrap();
        assert!(hot_score > cold_score);
        assert!((0.0..=1.0).contains(&hot_score));
        assert!((0.0..=1.0).contains(&cold_score));
        let _ = std::fs::remove_dir_all(store.base());
    }

    #[test]
    fn importance_is_deterministic_and_decays() {
        let now = Utc::now();
        let fresh = importance_score(5, 10, now, now);
        let again = importance_score(5, 10, now, now);
        assert_eq!(fresh, again);
        let stale = importance_score(5, 10, now - Duration::days(90), now);
        assert!(stale < fresh);
        assert_eq!(importance_score(0, 0, now, now), 0.0);
    }

    #[test]
    fn substring_search_respects_filters() {
        let (store, library) = temp_library();
        let now = Utc::now();
        library
            .capture("/rust.md", "rust ownership notes", "markdown", None, &["lang".to_string()], now)
            .unwrap();
        library
            .capture("/cooking.txt", "rust removal from pans", "text", None, &[], now)
            .unwrap();

        let hits = library
            .search_substring("rust", 10, &["markdown".to_string()], &[])
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].meta.source_path, "/rust.md");

        let tagged = library
            .search_substring("rust", 10, &[], &["lang".to_string()])
            .unwrap();
        assert_eq!(tagged.len(), 1);
        let _ = std::fs::remove_dir_all(store.base());
    }

    #[test]
    fn unknown_doc_access_is_ignored() {
        let (store, library) = temp_library();
        library.track_access("doc_missing000000", None, Utc::now()).unwrap();
        assert_eq!(library.importance("doc_missing000000", Utc::now()).unwrap(), 0.0);
        let _ = std::fs::remove_dir_all(store.base());
    }
}
