//! Rendering and parsing of the paired durable records: verbatim transcripts
//! and experiential notes.
//!
//! Both are markdown files with a `**Key**: value` metadata block.  The parse
//! direction exists because the filesystem is authoritative — the vector
//! index is rebuilt by re-reading these files.

use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::{DateTime, NaiveDateTime, Utc};
use tracing::warn;

use crate::schema::{
    EmotionalResonance, ExperientialNote, Valence, VerbatimRecord, truncate_str,
};
use crate::store::MemoryStore;

const TIMESTAMP_FMT: &str = "%Y-%m-%d %H:%M:%S";

pub fn render_verbatim(record: &VerbatimRecord) -> String {
    format!(
        "# Interaction: {}\n\n\
         **Record ID**: `{}`\n\
         **User**: {}\n\
         **Location**: {}\n\
         **Timestamp**: {}\n\n\
         ## Query\n\n{}\n\n\
         ## Response\n\n{}\n",
        truncate_str(&record.user_query, 60).replace('\n', " "),
        record.id,
        record.user_id,
        record.location,
        record.timestamp.format(TIMESTAMP_FMT),
        record.user_query,
        record.agent_response,
    )
}

pub fn render_note(note: &ExperientialNote) -> String {
    let links = if note.links.is_empty() {
        "(none)".to_string()
    } else {
        note.links.join(", ")
    };
    format!(
        "# Experiential Note\n\n\
         **Record ID**: `{}`\n\
         **Timestamp**: {}\n\
         **User**: {}\n\
         **Importance**: {:.3}\n\
         **Alignment**: {:.3}\n\
         **Emotion Intensity**: {:.3}\n\
         **Valence**: {}\n\
         **Reason**: {}\n\
         **Links**: {}\n\n\
         ---\n\n{}\n",
        note.id,
        note.timestamp.format(TIMESTAMP_FMT),
        note.user_id,
        note.emotion.importance,
        note.emotion.alignment,
        note.emotion.intensity,
        note.emotion.valence.as_str(),
        note.emotion.reason.replace('\n', " "),
        links,
        note.content,
    )
}

/// Write a verbatim record into `verbatim/<user>/<Y>/<M>/<D>/` and return the
/// path.  The slug derives from the query so the tree stays human-browsable.
pub fn write_verbatim(store: &MemoryStore, record: &VerbatimRecord) -> Result<PathBuf> {
    let path = MemoryStore::dated_record_path(
        &store.verbatim_dir(&record.user_id),
        record.timestamp,
        &MemoryStore::slugify(&record.user_query),
    );
    store.write_atomic(&path, &render_verbatim(record))?;
    Ok(path)
}

/// Write an experiential note into `notes/<Y>/<M>/<D>/`.  The timestamp
/// prefix co-locates it with its verbatim.
pub fn write_note(store: &MemoryStore, note: &ExperientialNote) -> Result<PathBuf> {
    let path = MemoryStore::dated_record_path(
        &store.notes_dir(),
        note.timestamp,
        &MemoryStore::slugify(&note.content),
    );
    store.write_atomic(&path, &render_note(note))?;
    Ok(path)
}

// ── Parsing ───────────────────────────────────────────────────────────────────

fn metadata_value<'a>(content: &'a str, key: &str) -> Option<&'a str> {
    let needle = format!("**{key}**:");
    for line in content.lines() {
        if let Some(rest) = line.strip_prefix(&needle) {
            return Some(rest.trim().trim_matches('`'));
        }
    }
    None
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(raw.trim(), TIMESTAMP_FMT)
        .ok()
        .map(|naive| naive.and_utc())
}

pub fn parse_note(content: &str) -> Option<ExperientialNote> {
    let id = metadata_value(content, "Record ID")?.to_string();
    let timestamp = parse_timestamp(metadata_value(content, "Timestamp")?)?;
    let user_id = metadata_value(content, "User").unwrap_or("unknown").to_string();
    let importance: f64 = metadata_value(content, "Importance")?.parse().ok()?;
    let alignment: f64 = metadata_value(content, "Alignment")?.parse().ok()?;
    let intensity: f64 = metadata_value(content, "Emotion Intensity")?.parse().ok()?;
    let valence = Valence::parse(metadata_value(content, "Valence").unwrap_or("mixed"));
    let reason = metadata_value(content, "Reason").unwrap_or_default().to_string();
    let links: Vec<String> = match metadata_value(content, "Links") {
        Some("(none)") | None => Vec::new(),
        Some(raw) => raw
            .split(',')
            .map(|link| link.trim().to_string())
            .filter(|link| !link.is_empty())
            .collect(),
    };
    let body = content
        .split_once("\n---\n")
        .map(|(_, tail)| tail.trim().to_string())
        .unwrap_or_default();

    Some(ExperientialNote {
        id,
        timestamp,
        user_id,
        content: body,
        emotion: EmotionalResonance {
            intensity,
            valence,
            reason,
            alignment,
            importance,
        },
        links,
    })
}

pub fn parse_verbatim(content: &str) -> Option<VerbatimRecord> {
    let id = metadata_value(content, "Record ID")?.to_string();
    let timestamp = parse_timestamp(metadata_value(content, "Timestamp")?)?;
    let user_id = metadata_value(content, "User")?.to_string();
    let location = metadata_value(content, "Location").unwrap_or_default().to_string();
    let query = section_body(content, "## Query");
    let response = section_body(content, "## Response");

    Some(VerbatimRecord {
        id,
        timestamp,
        user_id,
        location,
        user_query: query,
        agent_response: response,
    })
}

fn section_body(content: &str, heading: &str) -> String {
    let Some(start) = content.find(heading) else {
        return String::new();
    };
    let after = &content[start + heading.len()..];
    let end = after.find("\n## ").unwrap_or(after.len());
    after[..end].trim().to_string()
}

// ── Loading ───────────────────────────────────────────────────────────────────

/// Load every experiential note on disk, oldest first.  Files that fail to
/// parse are skipped with a warning rather than aborting the scan.
pub fn load_all_notes(store: &MemoryStore) -> Result<Vec<ExperientialNote>> {
    let mut notes = Vec::new();
    for path in store.list_markdown(store.notes_dir())? {
        let Some(content) = store.read_opt(&path)? else {
            continue;
        };
        match parse_note(&content) {
            Some(note) => notes.push(note),
            None => warn!(path = %path.display(), "skipping unparseable note"),
        }
    }
    Ok(notes)
}

/// Find one note by record ID.  Linear scan — callers with an index should
/// prefer it and fall back here.
pub fn find_note_by_id(store: &MemoryStore, id: &str) -> Result<Option<ExperientialNote>> {
    for path in store.list_markdown(store.notes_dir())? {
        if let Some(content) = store.read_opt(&path)? {
            if content.contains(id) {
                if let Some(note) = parse_note(&content) {
                    if note.id == id {
                        return Ok(Some(note));
                    }
                }
            }
        }
    }
    Ok(None)
}

/// Load every verbatim record for one user, oldest first.
pub fn load_user_verbatims(store: &MemoryStore, user_id: &str) -> Result<Vec<VerbatimRecord>> {
    let mut records = Vec::new();
    let dir = store.verbatim_dir(user_id);
    if !dir.exists() {
        return Ok(records);
    }
    for path in store.list_markdown(&dir)? {
        if let Some(content) = store.read_opt(&path)? {
            match parse_verbatim(&content) {
                Some(record) => records.push(record),
                None => warn!(path = %path.display(), "skipping unparseable verbatim"),
            }
        }
    }
    Ok(records)
}

/// Load all verbatim records across users, oldest first.
pub fn load_all_verbatims(store: &MemoryStore) -> Result<Vec<VerbatimRecord>> {
    let mut records = Vec::new();
    let root = store.base().join("verbatim");
    if !root.exists() {
        return Ok(records);
    }
    for path in store.list_markdown(&root)? {
        if let Some(content) = store.read_opt(&path)? {
            if let Some(record) = parse_verbatim(&content) {
                records.push(record);
            }
        }
    }
    records.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
    Ok(records)
}

/// Count a user's verbatim interactions without parsing file bodies.
pub fn count_user_verbatims(store: &MemoryStore, user_id: &str) -> Result<usize> {
    let dir = store.verbatim_dir(user_id);
    if !dir.exists() {
        return Ok(0);
    }
    Ok(store.list_markdown(&dir)?.len())
}

/// The `<HH_MM_SS>` prefix shared by a note and its verbatim.
pub fn timestamp_prefix(path: &Path) -> Option<String> {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(|name| name.chars().take(8).collect())
}
