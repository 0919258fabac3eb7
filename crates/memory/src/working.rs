//! Working memory: the five fixed files of current focus.
//!
//! `current_context.md` is rewritten wholesale on every interaction; the task
//! and reference lists are bounded FIFO queues; open questions migrate from
//! `unresolved.md` to `resolved.md` when answered.

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::store::MemoryStore;

pub const DEFAULT_WORKING_CAP: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkingFile {
    CurrentContext,
    CurrentTasks,
    CurrentReferences,
    Unresolved,
    Resolved,
}

impl WorkingFile {
    pub fn file_name(&self) -> &'static str {
        match self {
            WorkingFile::CurrentContext => "current_context.md",
            WorkingFile::CurrentTasks => "current_tasks.md",
            WorkingFile::CurrentReferences => "current_references.md",
            WorkingFile::Unresolved => "unresolved.md",
            WorkingFile::Resolved => "resolved.md",
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkingMemory {
    store: MemoryStore,
    cap: usize,
}

impl WorkingMemory {
    pub fn new(store: MemoryStore) -> Self {
        Self { store, cap: DEFAULT_WORKING_CAP }
    }

    pub fn with_cap(store: MemoryStore, cap: usize) -> Self {
        Self { store, cap }
    }

    fn path(&self, file: WorkingFile) -> std::path::PathBuf {
        self.store.working_dir().join(file.file_name())
    }

    // ── Current context ────────────────────────────────────────────────────

    /// Rewrite `current_context.md` with the latest interaction snapshot.
    #[allow(clippy::too_many_arguments)]
    pub fn rewrite_current_context(
        &self,
        user_id: &str,
        location: &str,
        latest_query: &str,
        recent_history: &[String],
        emotional_tone: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let tasks = self.entries(WorkingFile::CurrentTasks)?;
        let questions = self.unresolved_questions()?;

        let mut content = format!(
            "# Current Context\n\n\
             **Updated**: {}\n\
             **User**: {user_id}\n\
             **Location**: {location}\n\n\
             ## Latest Query\n\n{latest_query}\n\n\
             ## Recent History\n\n",
            at.format("%Y-%m-%d %H:%M:%S"),
        );
        if recent_history.is_empty() {
            content.push_str("(none yet)\n");
        } else {
            for line in recent_history {
                content.push_str(&format!("- {}\n", line.replace('\n', " ")));
            }
        }

        content.push_str("\n## Active Tasks\n\n");
        if tasks.is_empty() {
            content.push_str("(none)\n");
        } else {
            for task in &tasks {
                content.push_str(&format!("- {task}\n"));
            }
        }

        content.push_str("\n## Open Questions\n\n");
        if questions.is_empty() {
            content.push_str("(none)\n");
        } else {
            for question in &questions {
                content.push_str(&format!("- {question}\n"));
            }
        }

        content.push_str(&format!("\n## Emotional Tone\n\n{emotional_tone}\n"));

        self.store.write_atomic(self.path(WorkingFile::CurrentContext), &content)?;
        debug!(user_id, "current context rewritten");
        Ok(())
    }

    pub fn current_context(&self) -> Result<Option<String>> {
        self.store.read_opt(self.path(WorkingFile::CurrentContext))
    }

    // ── Bounded lists ──────────────────────────────────────────────────────

    pub fn add_task(&self, text: &str, at: DateTime<Utc>) -> Result<()> {
        self.push_bounded(WorkingFile::CurrentTasks, "# Current Tasks\n\n", text, at)
    }

    pub fn add_reference(&self, text: &str, at: DateTime<Utc>) -> Result<()> {
        self.push_bounded(WorkingFile::CurrentReferences, "# Current References\n\n", text, at)
    }

    fn push_bounded(
        &self,
        file: WorkingFile,
        header: &str,
        text: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut entries = self.entries(file)?;
        entries.push(format!("[{}] {}", at.format("%Y-%m-%d %H:%M"), text.replace('\n', " ")));
        // FIFO prune: oldest entries fall off the front.
        if entries.len() > self.cap {
            let overflow = entries.len() - self.cap;
            entries.drain(..overflow);
            debug!(file = file.file_name(), pruned = overflow, "working list pruned");
        }
        let mut content = header.to_string();
        for entry in &entries {
            content.push_str(&format!("- {entry}\n"));
        }
        self.store.write_atomic(self.path(file), &content)
    }

    /// Bullet entries of one working file, oldest first.
    pub fn entries(&self, file: WorkingFile) -> Result<Vec<String>> {
        let Some(content) = self.store.read_opt(self.path(file))? else {
            return Ok(Vec::new());
        };
        Ok(content
            .lines()
            .filter_map(|line| line.strip_prefix("- "))
            .map(ToString::to_string)
            .collect())
    }

    // ── Unresolved questions ───────────────────────────────────────────────

    /// Record an open question raised by a response.
    pub fn add_unresolved(&self, question: &str, context: &str, at: DateTime<Utc>) -> Result<()> {
        let block = format!(
            "\n## Q: {}\n\n\
             **Raised**: {}\n\
             **Context**: {}\n",
            question.replace('\n', " "),
            at.format("%Y-%m-%d %H:%M:%S"),
            context.replace('\n', " "),
        );
        self.store.append_block(
            self.path(WorkingFile::Unresolved),
            Some("# Unresolved Questions\n"),
            &block,
        )?;
        self.prune_unresolved()?;
        info!(question, "unresolved question recorded");
        Ok(())
    }

    /// Move the first question containing `needle` to `resolved.md` with a
    /// resolution note.  Returns whether a match was found.
    pub fn resolve(&self, needle: &str, resolution: &str, at: DateTime<Utc>) -> Result<bool> {
        let Some(content) = self.store.read_opt(self.path(WorkingFile::Unresolved))? else {
            return Ok(false);
        };

        let mut blocks = split_question_blocks(&content);
        let Some(idx) = blocks.iter().position(|block| block.contains(needle)) else {
            return Ok(false);
        };
        let resolved_block = blocks.remove(idx);

        let mut remaining = String::from("# Unresolved Questions\n");
        for block in &blocks {
            remaining.push_str(block);
        }
        self.store.write_atomic(self.path(WorkingFile::Unresolved), &remaining)?;

        let migrated = format!(
            "{}**Resolved**: {}\n**Resolution**: {}\n",
            resolved_block,
            at.format("%Y-%m-%d %H:%M:%S"),
            resolution.replace('\n', " "),
        );
        self.store.append_block(
            self.path(WorkingFile::Resolved),
            Some("# Resolved Questions\n"),
            &migrated,
        )?;
        info!(needle, "question resolved");
        Ok(true)
    }

    /// Question titles currently open, oldest first.
    pub fn unresolved_questions(&self) -> Result<Vec<String>> {
        let Some(content) = self.store.read_opt(self.path(WorkingFile::Unresolved))? else {
            return Ok(Vec::new());
        };
        Ok(content
            .lines()
            .filter_map(|line| line.strip_prefix("## Q: "))
            .map(ToString::to_string)
            .collect())
    }

    fn prune_unresolved(&self) -> Result<()> {
        let Some(content) = self.store.read_opt(self.path(WorkingFile::Unresolved))? else {
            return Ok(());
        };
        let mut blocks = split_question_blocks(&content);
        if blocks.len() <= self.cap {
            return Ok(());
        }
        let overflow = blocks.len() - self.cap;
        blocks.drain(..overflow);
        let mut remaining = String::from("# Unresolved Questions\n");
        for block in &blocks {
            remaining.push_str(block);
        }
        self.store.write_atomic(self.path(WorkingFile::Unresolved), &remaining)
    }
}

fn split_question_blocks(content: &str) -> Vec<String> {
    let mut blocks = Vec::new();
    let mut current = String::new();
    for line in content.lines() {
        if line.starts_with("## Q: ") {
            if !current.is_empty() {
                blocks.push(current.clone());
            }
            current = format!("\n{line}\n");
        } else if !current.is_empty() {
            current.push_str(line);
            current.push('\n');
        }
    }
    if !current.is_empty() {
        blocks.push(current);
    }
    blocks
}
