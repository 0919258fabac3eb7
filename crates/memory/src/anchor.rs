//! Temporal anchoring.
//!
//! High-emotion events become "before/after" markers in experiential history.
//! When a record's intensity exceeds [`ANCHOR_THRESHOLD`] the service writes
//! a key-moment block, a timeline row, and a chronological-anchor entry in
//! the emotional-significance core component.  Whether a moment is also a
//! discovery or an experiment is decided by the LLM at ingestion through a
//! structured field — never by engine-side phrase matching.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::emotion::ANCHOR_THRESHOLD;
use crate::schema::{EmotionalResonance, MomentKind, truncate_str};
use crate::store::MemoryStore;

const KEY_MOMENTS_HEADER: &str = "# Key Moments\n\n\
**Purpose**: Track significant moments that mark turning points in development\n\n\
**Threshold**: Emotion intensity > 0.7\n\n\
These are the temporal anchors - \"before/after\" divisions in experiential history.\n\n\
---\n";

const KEY_DISCOVERIES_HEADER: &str = "# Key Discoveries\n\n\
**Purpose**: Moments the agent flagged as discoveries - new understanding gained\n\n\
---\n";

const KEY_EXPERIMENTS_HEADER: &str = "# Key Experiments\n\n\
**Purpose**: Moments the agent flagged as experiments - something deliberately tried\n\n\
---\n";

const SIGNIFICANCE_MARKER: &str =
    "Temporal anchors mark turning points where understanding shifts fundamentally.\n";

fn significance_header(at: DateTime<Utc>) -> String {
    format!(
        "# Emotional Significance\n\n\
         **Last Updated**: {}\n\
         **Purpose**: Track what is emotionally significant\n\n\
         This file tracks chronological anchors, learning rate modulators, and value-aligned significance.\n\n\
         ---\n\n\
         ## Chronological Anchors (Before/After Moments)\n\n\
         {SIGNIFICANCE_MARKER}\n",
        at.format("%Y-%m-%d"),
    )
}

/// One row of `episodic/history.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub memory_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: MomentKind,
    pub intensity: f64,
}

#[derive(Debug, Clone)]
pub struct AnchorService {
    store: MemoryStore,
}

impl AnchorService {
    pub fn new(store: MemoryStore) -> Self {
        Self { store }
    }

    /// Anchor the record if its intensity crosses the threshold.  Returns the
    /// anchor ID when one was created.
    pub fn maybe_anchor(
        &self,
        memory_id: &str,
        content: &str,
        emotion: &EmotionalResonance,
        kind: MomentKind,
        at: DateTime<Utc>,
    ) -> Result<Option<String>> {
        if emotion.intensity <= ANCHOR_THRESHOLD {
            debug!(memory_id, intensity = emotion.intensity, "below anchor threshold");
            return Ok(None);
        }
        self.create_anchor(memory_id, content, emotion, kind, at).map(Some)
    }

    fn create_anchor(
        &self,
        memory_id: &str,
        content: &str,
        emotion: &EmotionalResonance,
        kind: MomentKind,
        at: DateTime<Utc>,
    ) -> Result<String> {
        let anchor_id = format!("anchor_{}", at.format("%Y%m%d_%H%M%S"));
        info!(anchor_id, memory_id, intensity = emotion.intensity, "creating temporal anchor");

        self.append_key_moment(memory_id, content, emotion, at)?;
        self.append_timeline(memory_id, kind, emotion.intensity, at)?;
        self.update_significance(memory_id, content, emotion, at)?;

        match kind {
            MomentKind::Discovery => self.append_flagged(
                "key_discoveries.md",
                KEY_DISCOVERIES_HEADER,
                "Discovery",
                memory_id,
                content,
                emotion,
                at,
            )?,
            MomentKind::Experiment => self.append_flagged(
                "key_experiments.md",
                KEY_EXPERIMENTS_HEADER,
                "Experiment",
                memory_id,
                content,
                emotion,
                at,
            )?,
            MomentKind::Moment => {}
        }

        Ok(anchor_id)
    }

    fn append_key_moment(
        &self,
        memory_id: &str,
        content: &str,
        emotion: &EmotionalResonance,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let title: String = truncate_str(content, 60).replace('\n', " ");
        let valence = emotion.valence.as_str();
        let entry = format!(
            "\n---\n\n\
             ## Key Moment: {title}\n\n\
             **Memory ID**: `{memory_id}`\n\
             **Date**: {}\n\
             **Emotion Intensity**: {:.2} (High)\n\
             **Valence**: {valence}\n\n\
             ### What Happened\n{content}\n\n\
             ### Why Significant\n{}\n\n\
             This marks a temporal anchor - a \"before/after\" moment in development.\n",
            at.format("%Y-%m-%d %H:%M:%S"),
            emotion.intensity,
            emotion.reason,
        );
        self.store.append_block(
            self.store.episodic_dir().join("key_moments.md"),
            Some(KEY_MOMENTS_HEADER),
            &entry,
        )
    }

    fn append_timeline(
        &self,
        memory_id: &str,
        kind: MomentKind,
        intensity: f64,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let path = self.store.episodic_dir().join("history.json");
        let mut timeline: Vec<TimelineEntry> = self.store.read_json_or_default(&path)?;
        timeline.push(TimelineEntry {
            memory_id: memory_id.to_string(),
            timestamp: at,
            kind,
            intensity,
        });
        self.store.write_json(&path, &timeline)
    }

    fn update_significance(
        &self,
        memory_id: &str,
        content: &str,
        emotion: &EmotionalResonance,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let title: String = truncate_str(content, 60).replace('\n', " ");
        let valence = emotion.valence.as_str();
        let entry = format!(
            "\n### {}: {title}\n\n\
             **Intensity**: {:.2} (High)\n\
             **Valence**: {valence} (Alignment: {:+.2})\n\n\
             {}\n\n\
             **Memory ID**: `{memory_id}`\n",
            at.format("%Y-%m-%d"),
            emotion.intensity,
            emotion.alignment,
            emotion.reason,
        );
        self.store.insert_after_marker(
            self.store.core_component("emotional_significance"),
            &significance_header(at),
            SIGNIFICANCE_MARKER,
            &entry,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn append_flagged(
        &self,
        file: &str,
        header: &str,
        label: &str,
        memory_id: &str,
        content: &str,
        emotion: &EmotionalResonance,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let title: String = truncate_str(content, 60).replace('\n', " ");
        let entry = format!(
            "\n---\n\n\
             ## {label}: {title}\n\n\
             **Memory ID**: `{memory_id}`\n\
             **Date**: {}\n\
             **Emotion Intensity**: {:.2}\n\n\
             {content}\n",
            at.format("%Y-%m-%d %H:%M:%S"),
            emotion.intensity,
        );
        self.store
            .append_block(self.store.episodic_dir().join(file), Some(header), &entry)
    }

    // ── Retrieval ──────────────────────────────────────────────────────────

    /// Timeline entries at or above `min_intensity`, optionally bounded to
    /// those after `since`.  Reads the JSON timeline, not the markdown.
    pub fn anchors_since(
        &self,
        since: Option<DateTime<Utc>>,
        min_intensity: f64,
    ) -> Result<Vec<TimelineEntry>> {
        let path = self.store.episodic_dir().join("history.json");
        let timeline: Vec<TimelineEntry> = self.store.read_json_or_default(&path)?;
        Ok(timeline
            .into_iter()
            .filter(|entry| entry.intensity >= min_intensity)
            .filter(|entry| since.is_none_or(|cutoff| entry.timestamp >= cutoff))
            .collect())
    }

    pub fn count(&self) -> Result<usize> {
        Ok(self.anchors_since(None, 0.0)?.len())
    }
}
