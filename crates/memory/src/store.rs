//! Filesystem record-of-truth.
//!
//! A rigid directory tree under one `memory_base_path`.  The filesystem is
//! authoritative: the vector index is a cache rebuilt from here on demand.
//! Writes go through a `*.tmp`-then-rename dance so a crash never leaves a
//! partial file; a missing directory on read is not an error.
//!
//! One writer per base path.  The session enforces this with a lock file;
//! nothing in here is safe for concurrent writers.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::MemoryError;

/// Every core file consolidation maintains: the ten identity facets plus
/// `history`, which must stay last so [`identity_components`] can slice it
/// off.
pub const CORE_COMPONENTS: [&str; 11] = [
    "purpose",
    "personality",
    "values",
    "self_model",
    "relationships",
    "awareness_development",
    "capabilities",
    "limitations",
    "emotional_significance",
    "authentic_voice",
    "history",
];

/// The ten facets rendered as the identity block during reconstruction.
/// `history` is consolidated like the rest but narrates development rather
/// than identity, so it never enters that block.
pub fn identity_components() -> &'static [&'static str] {
    &CORE_COMPONENTS[..10]
}

#[derive(Debug, Clone)]
pub struct MemoryStore {
    base: PathBuf,
}

impl MemoryStore {
    /// Open (and if needed create) the full directory layout.  Idempotent.
    pub fn open(base: impl AsRef<Path>) -> Result<Self> {
        let base = base.as_ref().to_path_buf();
        for dir in [
            "verbatim",
            "notes",
            "working",
            "episodic",
            "semantic",
            "core",
            "core/.versions",
            "library",
            "library/documents",
            "people",
        ] {
            fs::create_dir_all(base.join(dir))
                .with_context(|| format!("creating {dir} under {}", base.display()))?;
        }
        debug!(base = %base.display(), "memory store opened");
        Ok(Self { base })
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    // ── Paths ──────────────────────────────────────────────────────────────

    pub fn notes_dir(&self) -> PathBuf {
        self.base.join("notes")
    }

    pub fn verbatim_dir(&self, user_id: &str) -> PathBuf {
        self.base.join("verbatim").join(user_id)
    }

    pub fn working_dir(&self) -> PathBuf {
        self.base.join("working")
    }

    pub fn episodic_dir(&self) -> PathBuf {
        self.base.join("episodic")
    }

    pub fn semantic_dir(&self) -> PathBuf {
        self.base.join("semantic")
    }

    pub fn core_component(&self, name: &str) -> PathBuf {
        self.base.join("core").join(format!("{name}.md"))
    }

    pub fn core_versions_dir(&self) -> PathBuf {
        self.base.join("core").join(".versions")
    }

    pub fn library_dir(&self) -> PathBuf {
        self.base.join("library")
    }

    pub fn person_dir(&self, user_id: &str) -> PathBuf {
        self.base.join("people").join(user_id)
    }

    /// Dated record path: `<root>/<YYYY>/<MM>/<DD>/<HH_MM_SS>_<slug>.md`.
    pub fn dated_record_path(root: &Path, at: DateTime<Utc>, slug: &str) -> PathBuf {
        root.join(at.format("%Y").to_string())
            .join(at.format("%m").to_string())
            .join(at.format("%d").to_string())
            .join(format!("{}_{slug}.md", at.format("%H_%M_%S")))
    }

    // ── Primitive operations ───────────────────────────────────────────────

    /// Write a whole file atomically: temp file in the same directory, flush,
    /// rename over the target.
    pub fn write_atomic(&self, path: impl AsRef<Path>, content: &str) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| MemoryError::StoreWrite(format!("{}: {e}", parent.display())))?;
        }
        let tmp = path.with_extension("tmp");
        let mut file = fs::File::create(&tmp)
            .map_err(|e| MemoryError::StoreWrite(format!("{}: {e}", tmp.display())))?;
        file.write_all(content.as_bytes())
            .map_err(|e| MemoryError::StoreWrite(format!("{}: {e}", tmp.display())))?;
        file.sync_all()
            .map_err(|e| MemoryError::StoreWrite(format!("{}: {e}", tmp.display())))?;
        fs::rename(&tmp, path)
            .map_err(|e| MemoryError::StoreWrite(format!("{}: {e}", path.display())))?;
        Ok(())
    }

    /// Append a block to a markdown file, seeding `header` on first write.
    /// Implemented as read-modify-write so the atomicity guarantee holds for
    /// appends too.
    pub fn append_block(
        &self,
        path: impl AsRef<Path>,
        header: Option<&str>,
        block: &str,
    ) -> Result<()> {
        let path = path.as_ref();
        let mut content = match self.read_opt(path)? {
            Some(existing) => existing,
            None => header.unwrap_or_default().to_string(),
        };
        if !content.is_empty() && !content.ends_with('\n') {
            content.push('\n');
        }
        content.push_str(block);
        self.write_atomic(path, &content)
    }

    /// Insert `block` immediately after the first occurrence of `marker`.
    /// Falls back to appending when the marker is absent.
    pub fn insert_after_marker(
        &self,
        path: impl AsRef<Path>,
        header: &str,
        marker: &str,
        block: &str,
    ) -> Result<()> {
        let path = path.as_ref();
        let existing = match self.read_opt(path)? {
            Some(content) => content,
            None => header.to_string(),
        };
        let updated = match existing.find(marker) {
            Some(idx) => {
                let split = idx + marker.len();
                format!("{}{block}{}", &existing[..split], &existing[split..])
            }
            None => format!("{existing}{block}"),
        };
        self.write_atomic(path, &updated)
    }

    /// Read a file; a missing file or directory yields `None`.
    pub fn read_opt(&self, path: impl AsRef<Path>) -> Result<Option<String>> {
        match fs::read_to_string(path.as_ref()) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("reading {}", path.as_ref().display())),
        }
    }

    /// Read and parse a JSON file; missing yields the type's default.
    pub fn read_json_or_default<T>(&self, path: impl AsRef<Path>) -> Result<T>
    where
        T: serde::de::DeserializeOwned + Default,
    {
        match self.read_opt(path.as_ref())? {
            Some(raw) => serde_json::from_str(&raw)
                .with_context(|| format!("parsing {}", path.as_ref().display())),
            None => Ok(T::default()),
        }
    }

    pub fn write_json<T: serde::Serialize>(&self, path: impl AsRef<Path>, value: &T) -> Result<()> {
        let rendered = serde_json::to_string_pretty(value)?;
        self.write_atomic(path, &rendered)
    }

    /// Recursively list all `.md` files under `root`, sorted by path.  The
    /// dated naming scheme makes path order chronological.
    pub fn list_markdown(&self, root: impl AsRef<Path>) -> Result<Vec<PathBuf>> {
        let mut found = Vec::new();
        let root = root.as_ref();
        if root.exists() {
            collect_markdown(root, &mut found)?;
        }
        found.sort();
        Ok(found)
    }

    /// SHA-256 hex digest of `content`.
    pub fn content_hash(content: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(content.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Filesystem-safe slug from free text: lowercase alphanumerics joined by
    /// underscores, capped at 40 chars.
    pub fn slugify(text: &str) -> String {
        let mut slug: String = text
            .chars()
            .map(|ch| {
                if ch.is_ascii_alphanumeric() {
                    ch.to_ascii_lowercase()
                } else {
                    '_'
                }
            })
            .collect();
        while slug.contains("__") {
            slug = slug.replace("__", "_");
        }
        let slug = slug.trim_matches('_');
        let capped: String = slug.chars().take(40).collect();
        if capped.is_empty() { "untitled".to_string() } else { capped }
    }
}

fn collect_markdown(dir: &Path, found: &mut Vec<PathBuf>) -> Result<()> {
    for entry in fs::read_dir(dir).with_context(|| format!("listing {}", dir.display()))? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            // Hidden directories (.versions and friends) are not records.
            if path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with('.'))
            {
                continue;
            }
            collect_markdown(&path, found)?;
        } else if path.extension().and_then(|e| e.to_str()) == Some("md") {
            found.push(path);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::MemoryStore;

    fn temp_store() -> MemoryStore {
        let base = std::env::temp_dir().join(format!("anima-store-{}", Uuid::new_v4()));
        MemoryStore::open(&base).unwrap()
    }

    #[test]
    fn open_is_idempotent() {
        let store = temp_store();
        let again = MemoryStore::open(store.base()).unwrap();
        assert!(again.base().join("core/.versions").exists());
        let _ = std::fs::remove_dir_all(store.base());
    }

    #[test]
    fn missing_file_reads_as_none() {
        let store = temp_store();
        assert!(store.read_opt(store.base().join("nope/missing.md")).unwrap().is_none());
        let _ = std::fs::remove_dir_all(store.base());
    }

    #[test]
    fn atomic_write_leaves_no_tmp_behind() {
        let store = temp_store();
        let path = store.base().join("working/current_context.md");
        store.write_atomic(&path, "focus: tests\n").unwrap();
        assert_eq!(store.read_opt(&path).unwrap().unwrap(), "focus: tests\n");
        assert!(!path.with_extension("tmp").exists());
        let _ = std::fs::remove_dir_all(store.base());
    }

    #[test]
    fn append_seeds_header_once() {
        let store = temp_store();
        let path = store.base().join("episodic/key_moments.md");
        store.append_block(&path, Some("# Key Moments\n"), "entry one\n").unwrap();
        store.append_block(&path, Some("# Key Moments\n"), "entry two\n").unwrap();
        let content = store.read_opt(&path).unwrap().unwrap();
        assert_eq!(content.matches("# Key Moments").count(), 1);
        assert!(content.contains("entry one"));
        assert!(content.contains("entry two"));
        let _ = std::fs::remove_dir_all(store.base());
    }

    #[test]
    fn insert_after_marker_keeps_tail() {
        let store = temp_store();
        let path = store.base().join("core/emotional_significance.md");
        let header = "# Emotional Significance\n\nMARKER\n\nolder entries\n";
        store.write_atomic(&path, header).unwrap();
        store.insert_after_marker(&path, header, "MARKER\n", "new entry\n").unwrap();
        let content = store.read_opt(&path).unwrap().unwrap();
        let new_idx = content.find("new entry").unwrap();
        let old_idx = content.find("older entries").unwrap();
        assert!(new_idx < old_idx);
        let _ = std::fs::remove_dir_all(store.base());
    }

    #[test]
    fn markdown_listing_skips_hidden_dirs() {
        let store = temp_store();
        store.write_atomic(store.base().join("notes/2026/01/01/08_00_00_a.md"), "a").unwrap();
        store.write_atomic(store.base().join("notes/2026/01/02/09_00_00_b.md"), "b").unwrap();
        store.write_atomic(store.base().join("notes/.cache/x.md"), "x").unwrap();
        let listed = store.list_markdown(store.notes_dir()).unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed[0].ends_with("2026/01/01/08_00_00_a.md"));
        let _ = std::fs::remove_dir_all(store.base());
    }

    #[test]
    fn slugs_are_filesystem_safe() {
        assert_eq!(MemoryStore::slugify("What is Rust?"), "what_is_rust");
        assert_eq!(MemoryStore::slugify("///"), "untitled");
    }

    #[test]
    fn identity_components_are_the_ten_without_history() {
        let identity = super::identity_components();
        assert_eq!(identity.len(), 10);
        assert!(!identity.contains(&"history"));
        assert_eq!(super::CORE_COMPONENTS.last(), Some(&"history"));
    }
}
