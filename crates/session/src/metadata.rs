//! Session metadata: the cumulative counters that give the agent continuity.
//!
//! A new session restores these counts instead of resetting them — the
//! interaction total is part of who the agent has become.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use anima_memory::MemoryStore;

pub const METADATA_FILE: &str = ".session_metadata.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEntry {
    pub session_id: String,
    pub started: DateTime<Utc>,
    pub ended: Option<DateTime<Utc>>,
    pub interactions: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionMetadata {
    pub total_interactions: u64,
    pub total_memories: u64,
    pub total_reconstructions: u64,
    pub sessions: Vec<SessionEntry>,
}

impl SessionMetadata {
    pub fn load(store: &MemoryStore) -> Result<Self> {
        store.read_json_or_default(store.base().join(METADATA_FILE))
    }

    pub fn save(&self, store: &MemoryStore) -> Result<()> {
        store.write_json(store.base().join(METADATA_FILE), self)
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use anima_memory::MemoryStore;

    use super::{SessionEntry, SessionMetadata};

    #[test]
    fn counters_round_trip() {
        let base = std::env::temp_dir().join(format!("anima-metadata-{}", Uuid::new_v4()));
        let store = MemoryStore::open(&base).unwrap();

        let mut metadata = SessionMetadata::default();
        metadata.total_interactions = 7;
        metadata.total_memories = 12;
        metadata.sessions.push(SessionEntry {
            session_id: "session_a".to_string(),
            started: chrono::Utc::now(),
            ended: None,
            interactions: 7,
        });
        metadata.save(&store).unwrap();

        let restored = SessionMetadata::load(&store).unwrap();
        assert_eq!(restored.total_interactions, 7);
        assert_eq!(restored.total_memories, 12);
        assert_eq!(restored.sessions.len(), 1);
        let _ = std::fs::remove_dir_all(&base);
    }

    #[test]
    fn missing_file_yields_zeroed_counters() {
        let base = std::env::temp_dir().join(format!("anima-metadata-{}", Uuid::new_v4()));
        let store = MemoryStore::open(&base).unwrap();
        let metadata = SessionMetadata::load(&store).unwrap();
        assert_eq!(metadata.total_interactions, 0);
        assert!(metadata.sessions.is_empty());
        let _ = std::fs::remove_dir_all(&base);
    }
}
