//! Emergent user profiles.
//!
//! A profile is extracted, not configured: once a user has enough recorded
//! interactions the manager summarizes their verbatim history and asks the
//! LLM for a profile and a preferences document.  Below the threshold a
//! deterministic template stub is written so downstream readers never see an
//! absent file after first contact.

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{info, warn};

use anima_llm::{GenerateOptions, LlmPort};

use crate::records::{count_user_verbatims, load_user_verbatims};
use crate::schema::truncate_str;
use crate::store::MemoryStore;

pub const DEFAULT_PROFILE_THRESHOLD: usize = 5;

/// Interaction summaries handed to the LLM are capped near this length.
const SUMMARY_CAP_CHARS: usize = 3_000;

/// Reconstruction shows profile/preference summaries truncated to this.
const SECTION_SUMMARY_CHARS: usize = 400;

#[derive(Debug, Clone)]
pub struct ProfileUpdate {
    pub user_id: String,
    pub interactions: usize,
    /// False when only template stubs were written.
    pub extracted: bool,
}

#[derive(Debug, Clone)]
pub struct ProfileManager {
    store: MemoryStore,
    threshold: usize,
}

impl ProfileManager {
    pub fn new(store: MemoryStore) -> Self {
        Self { store, threshold: DEFAULT_PROFILE_THRESHOLD }
    }

    pub fn with_threshold(store: MemoryStore, threshold: usize) -> Self {
        Self { store, threshold }
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn interaction_count(&self, user_id: &str) -> Result<usize> {
        count_user_verbatims(&self.store, user_id)
    }

    /// Refresh `people/<user>/{profile.md, preferences.md}`.
    ///
    /// Below the interaction threshold this writes template stubs; at or
    /// above it, two LLM calls produce the real documents.  A too-short LLM
    /// reply falls back to the stub rather than persisting noise.
    pub async fn update_profile(
        &self,
        user_id: &str,
        llm: &dyn LlmPort,
        at: DateTime<Utc>,
    ) -> Result<ProfileUpdate> {
        let interactions = load_user_verbatims(&self.store, user_id)?;
        let count = interactions.len();
        let dir = self.store.person_dir(user_id);

        if count < self.threshold {
            self.store.write_atomic(dir.join("profile.md"), &template_profile(user_id, count, at))?;
            self.store
                .write_atomic(dir.join("preferences.md"), &template_preferences(user_id, count, at))?;
            info!(user_id, count, threshold = self.threshold, "below threshold; template stubs written");
            return Ok(ProfileUpdate { user_id: user_id.to_string(), interactions: count, extracted: false });
        }

        let summary = summarize_interactions(&interactions);
        let options = GenerateOptions::default();

        let profile_reply = llm.generate(&profile_prompt(user_id, count, &summary), &options).await?;
        let profile_body = if profile_reply.content.trim().len() < 100 {
            warn!(user_id, "profile extraction too short; keeping template");
            template_profile(user_id, count, at)
        } else {
            format!(
                "# User Profile: {user_id}\n\n\
                 **Last Updated**: {}\n\
                 **Interactions Analyzed**: {count}\n\
                 **Confidence**: Emergent (based on observed patterns)\n\n\
                 ---\n\n{}",
                at.format("%Y-%m-%d %H:%M:%S"),
                profile_reply.content.trim(),
            )
        };
        self.store.write_atomic(dir.join("profile.md"), &profile_body)?;

        let preferences_reply =
            llm.generate(&preferences_prompt(user_id, count, &summary), &options).await?;
        let preferences_body = if preferences_reply.content.trim().len() < 100 {
            warn!(user_id, "preferences extraction too short; keeping template");
            template_preferences(user_id, count, at)
        } else {
            format!(
                "# Preferences: {user_id}\n\n\
                 **Last Updated**: {}\n\
                 **Interactions Analyzed**: {count}\n\
                 **Confidence**: Emergent (observed patterns)\n\n\
                 ---\n\n{}",
                at.format("%Y-%m-%d %H:%M:%S"),
                preferences_reply.content.trim(),
            )
        };
        self.store.write_atomic(dir.join("preferences.md"), &preferences_body)?;

        info!(user_id, count, "user profile extracted");
        Ok(ProfileUpdate { user_id: user_id.to_string(), interactions: count, extracted: true })
    }

    /// Short profile summary for reconstruction, ~400 chars of the first
    /// substantive content after the metadata header.
    pub fn profile_summary(&self, user_id: &str) -> Result<Option<String>> {
        self.file_summary(user_id, "profile.md")
    }

    pub fn preferences_summary(&self, user_id: &str) -> Result<Option<String>> {
        self.file_summary(user_id, "preferences.md")
    }

    fn file_summary(&self, user_id: &str, file: &str) -> Result<Option<String>> {
        let Some(content) = self.store.read_opt(self.store.person_dir(user_id).join(file))? else {
            return Ok(None);
        };
        let body = content
            .split_once("---\n")
            .map(|(_, tail)| tail.trim())
            .unwrap_or(content.trim());
        Ok(Some(truncate_str(body, SECTION_SUMMARY_CHARS)))
    }

    pub fn has_profile(&self, user_id: &str) -> bool {
        self.store.person_dir(user_id).join("profile.md").exists()
    }
}

fn summarize_interactions(interactions: &[crate::schema::VerbatimRecord]) -> String {
    let mut summary = String::new();
    for (i, record) in interactions.iter().enumerate() {
        let entry = format!(
            "Interaction {} ({}):\n  Q: {}\n  A: {}\n\n",
            i + 1,
            record.timestamp.format("%Y-%m-%d %H:%M"),
            truncate_str(&record.user_query, 200).replace('\n', " "),
            truncate_str(&record.agent_response, 200).replace('\n', " "),
        );
        if summary.len() + entry.len() > SUMMARY_CAP_CHARS {
            summary.push_str("[...truncated]\n");
            break;
        }
        summary.push_str(&entry);
    }
    summary
}

fn profile_prompt(user_id: &str, count: usize, summary: &str) -> String {
    format!(
        "You are analyzing user interactions to extract an emergent user profile.\n\n\
         CRITICAL: Base your analysis ONLY on observed patterns in the interactions below.\n\
         Do NOT make assumptions. If you cannot determine something, say \"Not yet observed.\"\n\n\
         Analyze these {count} interactions for user '{user_id}':\n\n{summary}\n\
         Extract a user profile covering:\n\n\
         1. Background & Expertise: domains they ask about, apparent skill level.\n\
         2. Thinking Style: analytical, exploratory, practical, or creative; depth vs breadth.\n\
         3. Communication Style: technical or casual phrasing, concise or detailed.\n\
         4. Interests & Focus: recurring topics and what they are trying to accomplish.\n\n\
         Format your response as a markdown profile with these sections.\n\
         Be specific, cite examples from interactions, and avoid generic statements.\n\
         If evidence is insufficient for a section, state \"Not yet observed - need more interactions.\"\n\n\
         Generate the profile now:"
    )
}

fn preferences_prompt(user_id: &str, count: usize, summary: &str) -> String {
    format!(
        "You are analyzing user interactions to extract emergent preferences.\n\n\
         CRITICAL: Base your analysis ONLY on observed patterns.\n\
         Look for what they ACTUALLY prefer based on how they interact, NOT assumptions.\n\n\
         Analyze these {count} interactions for user '{user_id}':\n\n{summary}\n\
         Extract user preferences covering:\n\n\
         1. Communication Preferences: concise vs detailed, technical vs accessible, tone.\n\
         2. Organization Preferences: structured vs freeform, examples first or concepts first.\n\
         3. Content Preferences: depth vs breadth, practical vs theoretical.\n\
         4. Interaction Patterns: short queries or detailed questions, follow-ups or one-offs.\n\
         5. Decision-Making Style: quick choices or careful comparison, guidance or autonomy.\n\n\
         Format as markdown with the sections above. Cite specific examples.\n\
         If evidence is insufficient, state \"Not yet observed.\"\n\n\
         Generate preferences now:"
    )
}

fn template_profile(user_id: &str, count: usize, at: DateTime<Utc>) -> String {
    format!(
        "# User Profile: {user_id}\n\n\
         **Last Updated**: {}\n\
         **Interactions Analyzed**: {count}\n\
         **Status**: Template (not enough interactions yet)\n\n\
         ---\n\n\
         ## Background & Expertise\n\nNot yet observed - need more interactions.\n\n\
         ## Thinking Style\n\nNot yet observed - need more interactions.\n\n\
         ## Communication Style\n\nNot yet observed - need more interactions.\n\n\
         ## Interests & Focus\n\nNot yet observed - need more interactions.\n",
        at.format("%Y-%m-%d %H:%M:%S"),
    )
}

fn template_preferences(user_id: &str, count: usize, at: DateTime<Utc>) -> String {
    format!(
        "# Preferences: {user_id}\n\n\
         **Last Updated**: {}\n\
         **Interactions Analyzed**: {count}\n\
         **Status**: Template (not enough interactions yet)\n\n\
         ---\n\n\
         ## Communication Preferences\n\nNot yet observed.\n\n\
         ## Organization Preferences\n\nNot yet observed.\n\n\
         ## Content Preferences\n\nNot yet observed.\n\n\
         ## Interaction Patterns\n\nNot yet observed.\n",
        at.format("%Y-%m-%d %H:%M:%S"),
    )
}
