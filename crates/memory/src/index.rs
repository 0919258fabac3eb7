//! Vector index over the filesystem authority.
//!
//! A [`redb`]-backed table per indexed tier.  Each row carries the record ID,
//! a content hash, the embedding vector, and a few structured fields used for
//! pre-filtering.  The index is a cache: search returns IDs and scores, and
//! readers load authoritative content from the filesystem.  If the index file
//! is absent or corrupt the session degrades to linear scans — zero data loss.

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use lru::LruCache;
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use anima_llm::EmbeddingPort;

use crate::error::MemoryError;
use crate::records::{load_all_notes, load_all_verbatims};
use crate::store::MemoryStore;

const NOTES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("notes");
const VERBATIM_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("verbatim");
const LIBRARY_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("library");

/// Number of query embeddings held in the hot-path LRU cache.
const QUERY_CACHE_CAPACITY: usize = 128;

pub const INDEX_CONFIG_FILE: &str = ".memory_index_config.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    Notes,
    Verbatim,
    Library,
}

impl IndexKind {
    pub fn slug(&self) -> &'static str {
        match self {
            IndexKind::Notes => "notes",
            IndexKind::Verbatim => "verbatim",
            IndexKind::Library => "library",
        }
    }

    fn table(&self) -> TableDefinition<'static, &'static str, &'static [u8]> {
        match self {
            IndexKind::Notes => NOTES_TABLE,
            IndexKind::Verbatim => VERBATIM_TABLE,
            IndexKind::Library => LIBRARY_TABLE,
        }
    }
}

/// Per-tier enable flags, persisted beside the memory tree.  Verbatim is off
/// by default: the agent should recall through its own reflections, not raw
/// transcripts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    pub notes: bool,
    pub verbatim: bool,
    pub library: bool,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            notes: true,
            verbatim: false,
            library: true,
        }
    }
}

impl IndexConfig {
    pub fn load(store: &MemoryStore) -> Result<Self> {
        store.read_json_or_default(store.base().join(INDEX_CONFIG_FILE))
    }

    pub fn save(&self, store: &MemoryStore) -> Result<()> {
        store.write_json(store.base().join(INDEX_CONFIG_FILE), self)
    }

    pub fn enabled(&self, kind: IndexKind) -> bool {
        match kind {
            IndexKind::Notes => self.notes,
            IndexKind::Verbatim => self.verbatim,
            IndexKind::Library => self.library,
        }
    }
}

/// One indexed row.  The embedding may be empty when no embedding port is
/// configured; such rows still participate in rebuild consistency checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexedRow {
    pub id: String,
    pub content_hash: String,
    pub embedding: Vec<f32>,
    pub timestamp: DateTime<Utc>,
    pub user_id: Option<String>,
    pub intensity: f64,
    pub valence: Option<String>,
    pub tags: Vec<String>,
}

/// Structured pre-filters applied before cosine ranking.
#[derive(Debug, Clone, Default)]
pub struct SearchFilter {
    pub user_id: Option<String>,
    pub min_intensity: Option<f64>,
    pub tags: Vec<String>,
    pub since: Option<DateTime<Utc>>,
}

impl SearchFilter {
    fn matches(&self, row: &IndexedRow) -> bool {
        if let Some(user) = &self.user_id {
            if row.user_id.as_deref() != Some(user.as_str()) {
                return false;
            }
        }
        if let Some(min) = self.min_intensity {
            if row.intensity < min {
                return false;
            }
        }
        if let Some(cutoff) = self.since {
            if row.timestamp < cutoff {
                return false;
            }
        }
        if !self.tags.is_empty() && !self.tags.iter().any(|tag| row.tags.contains(tag)) {
            return false;
        }
        true
    }
}

pub struct VectorIndex {
    db: Database,
    path: PathBuf,
}

impl VectorIndex {
    /// Open or create the index file.  Corruption surfaces as
    /// [`MemoryError::IndexUnavailable`] so the caller can degrade to
    /// filesystem-only scans instead of failing the session.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, MemoryError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| MemoryError::IndexUnavailable(format!("{}: {e}", path.display())))?;
        }
        let db = Database::create(&path)
            .map_err(|e| MemoryError::IndexUnavailable(format!("{}: {e}", path.display())))?;

        // Ensure tables exist up front so reads never race table creation.
        let ensure = || -> Result<(), redb::Error> {
            let tx = db.begin_write()?;
            tx.open_table(NOTES_TABLE)?;
            tx.open_table(VERBATIM_TABLE)?;
            tx.open_table(LIBRARY_TABLE)?;
            tx.commit()?;
            Ok(())
        };
        ensure().map_err(|e| MemoryError::IndexUnavailable(e.to_string()))?;

        Ok(Self { db, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Upsert one row by record ID.
    pub fn add(&mut self, kind: IndexKind, row: &IndexedRow) -> Result<()> {
        let bytes = serde_json::to_vec(row)?;
        let tx = self.db.begin_write()?;
        {
            let mut table = tx.open_table(kind.table())?;
            table.insert(row.id.as_str(), bytes.as_slice())?;
        }
        tx.commit()?;
        debug!(kind = kind.slug(), id = %row.id, "indexed row upserted");
        Ok(())
    }

    /// Cosine-similarity search over one tier with structured pre-filtering.
    /// Rows without an embedding are skipped.
    pub fn search(
        &self,
        kind: IndexKind,
        query: &[f32],
        top_k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<(String, f32)>> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(kind.table())?;
        let mut scored: Vec<(String, f32)> = Vec::new();
        for item in table.iter()? {
            let (_, value) = item?;
            let row: IndexedRow = match serde_json::from_slice(value.value()) {
                Ok(row) => row,
                Err(_) => continue,
            };
            if row.embedding.is_empty() || !filter.matches(&row) {
                continue;
            }
            scored.push((row.id, cosine_similarity(&row.embedding, query)));
        }
        scored.sort_by(|(_, a), (_, b)| b.total_cmp(a));
        scored.truncate(top_k);
        Ok(scored)
    }

    pub fn exists(&self, kind: IndexKind, id: &str) -> Result<bool> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(kind.table())?;
        Ok(table.get(id)?.is_some())
    }

    pub fn count(&self, kind: IndexKind) -> Result<usize> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(kind.table())?;
        Ok(table.len()? as usize)
    }

    /// All `(record_id, content_hash)` pairs in one tier, for consistency
    /// checks against the filesystem authority.
    pub fn id_hashes(&self, kind: IndexKind) -> Result<Vec<(String, String)>> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(kind.table())?;
        let mut pairs = Vec::new();
        for item in table.iter()? {
            let (_, value) = item?;
            if let Ok(row) = serde_json::from_slice::<IndexedRow>(value.value()) {
                pairs.push((row.id, row.content_hash));
            }
        }
        pairs.sort();
        Ok(pairs)
    }

    fn wipe(&mut self, kind: IndexKind) -> Result<()> {
        let tx = self.db.begin_write()?;
        {
            let mut table = tx.open_table(kind.table())?;
            let keys: Vec<String> = table
                .iter()?
                .filter_map(|r| r.ok().map(|(k, _)| k.value().to_string()))
                .collect();
            for key in &keys {
                table.remove(key.as_str())?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Rebuild one tier from the filesystem authority.  Embeddings are
    /// recomputed when a port is available; without one, rows are indexed
    /// with empty vectors and still satisfy the id/hash consistency contract.
    pub async fn rebuild(
        &mut self,
        kind: IndexKind,
        store: &MemoryStore,
        embedder: Option<&dyn EmbeddingPort>,
    ) -> Result<usize> {
        self.wipe(kind)?;
        let rows = match kind {
            IndexKind::Notes => note_rows(store)?,
            IndexKind::Verbatim => verbatim_rows(store)?,
            IndexKind::Library => crate::library::Library::new(store.clone()).index_rows()?,
        };

        let mut rows = rows;
        if let Some(port) = embedder {
            let texts: Vec<String> = rows.iter().map(|(_, text)| text.clone()).collect();
            let vectors = port
                .embed_texts(&texts)
                .await
                .context("embedding during index rebuild")?;
            for ((row, _), vector) in rows.iter_mut().zip(vectors) {
                row.embedding = vector;
            }
        }

        let count = rows.len();
        for (row, _) in &rows {
            self.add(kind, row)?;
        }
        info!(kind = kind.slug(), entries = count, path = %self.path.display(), "index rebuilt from filesystem");
        Ok(count)
    }
}

fn note_rows(store: &MemoryStore) -> Result<Vec<(IndexedRow, String)>> {
    Ok(load_all_notes(store)?
        .into_iter()
        .map(|note| {
            let row = IndexedRow {
                id: note.id.clone(),
                content_hash: MemoryStore::content_hash(&note.content),
                embedding: Vec::new(),
                timestamp: note.timestamp,
                user_id: Some(note.user_id.clone()),
                intensity: note.emotion.intensity,
                valence: Some(note.emotion.valence.as_str().to_string()),
                tags: Vec::new(),
            };
            (row, note.content)
        })
        .collect())
}

fn verbatim_rows(store: &MemoryStore) -> Result<Vec<(IndexedRow, String)>> {
    Ok(load_all_verbatims(store)?
        .into_iter()
        .map(|record| {
            let text = format!("{}\n{}", record.user_query, record.agent_response);
            let row = IndexedRow {
                id: record.id.clone(),
                content_hash: MemoryStore::content_hash(&text),
                embedding: Vec::new(),
                timestamp: record.timestamp,
                user_id: Some(record.user_id.clone()),
                intensity: 0.0,
                valence: None,
                tags: Vec::new(),
            };
            (row, text)
        })
        .collect())
}

// ── Query embedding cache ─────────────────────────────────────────────────────

/// LRU of query-text → embedding so repeated reconstructions of the same
/// query skip the embedding port.
pub struct QueryEmbeddingCache {
    cache: LruCache<String, Vec<f32>>,
}

impl Default for QueryEmbeddingCache {
    fn default() -> Self {
        Self {
            cache: LruCache::new(NonZeroUsize::new(QUERY_CACHE_CAPACITY).unwrap()),
        }
    }
}

impl QueryEmbeddingCache {
    pub fn get(&mut self, query: &str) -> Option<Vec<f32>> {
        self.cache.get(query).cloned()
    }

    pub fn put(&mut self, query: &str, embedding: Vec<f32>) {
        self.cache.put(query.to_string(), embedding);
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }
    (dot / (mag_a * mag_b)).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use crate::store::MemoryStore;

    use super::*;

    fn temp_index() -> (MemoryStore, VectorIndex) {
        let base = std::env::temp_dir().join(format!("anima-index-{}", Uuid::new_v4()));
        let store = MemoryStore::open(&base).unwrap();
        let index = VectorIndex::open(base.join(".memory_index.redb")).unwrap();
        (store, index)
    }

    fn row(id: &str, embedding: Vec<f32>, intensity: f64, user: &str) -> IndexedRow {
        IndexedRow {
            id: id.to_string(),
            content_hash: MemoryStore::content_hash(id),
            embedding,
            timestamp: Utc::now(),
            user_id: Some(user.to_string()),
            intensity,
            valence: None,
            tags: Vec::new(),
        }
    }

    #[test]
    fn add_is_upsert_by_id() {
        let (store, mut index) = temp_index();
        index.add(IndexKind::Notes, &row("note_a", vec![1.0, 0.0], 0.2, "alice")).unwrap();
        index.add(IndexKind::Notes, &row("note_a", vec![0.0, 1.0], 0.9, "alice")).unwrap();
        assert_eq!(index.count(IndexKind::Notes).unwrap(), 1);
        assert!(index.exists(IndexKind::Notes, "note_a").unwrap());
        let _ = std::fs::remove_dir_all(store.base());
    }

    #[test]
    fn search_ranks_by_cosine() {
        let (store, mut index) = temp_index();
        index.add(IndexKind::Notes, &row("close", vec![0.9, 0.1, 0.0], 0.1, "alice")).unwrap();
        index.add(IndexKind::Notes, &row("far", vec![0.0, 0.0, 1.0], 0.1, "alice")).unwrap();
        let hits = index
            .search(IndexKind::Notes, &[1.0, 0.0, 0.0], 2, &SearchFilter::default())
            .unwrap();
        assert_eq!(hits[0].0, "close");
        assert!(hits[0].1 > hits[1].1);
        let _ = std::fs::remove_dir_all(store.base());
    }

    #[test]
    fn filters_gate_before_ranking() {
        let (store, mut index) = temp_index();
        index.add(IndexKind::Notes, &row("hot", vec![1.0, 0.0], 0.9, "alice")).unwrap();
        index.add(IndexKind::Notes, &row("cold", vec![1.0, 0.0], 0.1, "bob")).unwrap();

        let filter = SearchFilter { min_intensity: Some(0.7), ..Default::default() };
        let hits = index.search(IndexKind::Notes, &[1.0, 0.0], 10, &filter).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, "hot");

        let filter = SearchFilter { user_id: Some("bob".to_string()), ..Default::default() };
        let hits = index.search(IndexKind::Notes, &[1.0, 0.0], 10, &filter).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, "cold");
        let _ = std::fs::remove_dir_all(store.base());
    }

    #[test]
    fn default_config_indexes_notes_and_library_only() {
        let config = IndexConfig::default();
        assert!(config.enabled(IndexKind::Notes));
        assert!(config.enabled(IndexKind::Library));
        assert!(!config.enabled(IndexKind::Verbatim));
    }

    #[test]
    fn query_cache_round_trips() {
        let mut cache = QueryEmbeddingCache::default();
        assert!(cache.get("q").is_none());
        cache.put("q", vec![0.5, 0.5]);
        assert_eq!(cache.get("q").unwrap(), vec![0.5, 0.5]);
    }

    #[test]
    fn cosine_handles_degenerate_inputs() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[tokio::test]
    async fn rebuild_matches_filesystem_id_hash_set() {
        let (store, mut index) = temp_index();
        let at = Utc::now();
        for i in 0..3 {
            let note = crate::schema::ExperientialNote {
                id: format!("note_20260801_0{i}0000_aaaa{i:04}"),
                timestamp: at,
                user_id: "alice".to_string(),
                content: format!("reflection number {i}"),
                emotion: crate::emotion::resonance(0.5, 0.5, None),
                links: Vec::new(),
            };
            crate::records::write_note(&store, &note).unwrap();
        }

        let count = index.rebuild(IndexKind::Notes, &store, None).await.unwrap();
        assert_eq!(count, 3);

        let mut expected: Vec<(String, String)> = crate::records::load_all_notes(&store)
            .unwrap()
            .into_iter()
            .map(|n| (n.id.clone(), MemoryStore::content_hash(&n.content)))
            .collect();
        expected.sort();
        assert_eq!(index.id_hashes(IndexKind::Notes).unwrap(), expected);

        // Rebuilding again is a no-op on the set.
        index.rebuild(IndexKind::Notes, &store, None).await.unwrap();
        assert_eq!(index.id_hashes(IndexKind::Notes).unwrap(), expected);
        let _ = std::fs::remove_dir_all(store.base());
    }
}
