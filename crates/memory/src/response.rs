//! Structured response ingestion.
//!
//! The engine asks the LLM to answer with one JSON object carrying the
//! answer, a first-person experiential note, an emotional self-assessment,
//! memory actions, and open questions.  Parsing is tolerant by design:
//! fenced code blocks are stripped, the first `{ … }` span is taken, and
//! malformed JSON degrades to a raw-text answer with no actions rather than
//! failing the turn.  Unknown actions are skipped with a warning.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use anima_llm::EmbeddingPort;

use crate::anchor::AnchorService;
use crate::emotion::resonance;
use crate::index::{IndexConfig, IndexKind, IndexedRow, VectorIndex};
use crate::records::{find_note_by_id, parse_note, render_note, write_note, write_verbatim};
use crate::schema::{
    ActionSource, ExperientialNote, MomentKind, VerbatimRecord, new_record_id,
};
use crate::store::MemoryStore;
use crate::working::WorkingMemory;

// ── Wire schema ───────────────────────────────────────────────────────────────

/// The LLM's own `{importance, alignment_with_values, reason}` judgment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResonanceAssessment {
    #[serde(default = "default_importance")]
    pub importance: f64,
    #[serde(default)]
    pub alignment_with_values: f64,
    #[serde(default)]
    pub reason: String,
}

fn default_importance() -> f64 {
    0.5
}

fn default_source() -> ActionSource {
    ActionSource::AiObserved
}

/// Closed sum of memory actions.  Anything else in the array is skipped.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum MemoryAction {
    Remember {
        content: String,
        #[serde(default = "default_importance")]
        importance: f64,
        #[serde(default)]
        alignment_with_values: f64,
        #[serde(default)]
        reason: String,
        #[serde(default)]
        emotion: Option<String>,
        #[serde(default = "default_source")]
        source: ActionSource,
        #[serde(default)]
        evidence: Option<String>,
        #[serde(default)]
        links_to: Vec<String>,
        #[serde(default)]
        moment_kind: Option<MomentKind>,
    },
    Link {
        from: String,
        to: String,
        #[serde(default)]
        reason: Option<String>,
    },
    Forget {
        target: String,
        #[serde(default)]
        reason: Option<String>,
    },
}

#[derive(Debug, Clone, Default)]
pub struct StructuredResponse {
    pub answer: String,
    pub experiential_note: Option<String>,
    pub emotional_resonance: Option<ResonanceAssessment>,
    pub memory_actions: Vec<MemoryAction>,
    pub unresolved_questions: Vec<String>,
    /// How a high-intensity turn should be filed episodically.
    pub moment_kind: Option<MomentKind>,
}

#[derive(Debug, Clone)]
pub struct ParsedResponse {
    pub response: StructuredResponse,
    /// True when the reply was not valid structured JSON and the answer is
    /// the raw text.
    pub degraded: bool,
}

// ── Parsing ───────────────────────────────────────────────────────────────────

/// Extract the JSON object from a possibly-fenced, possibly-chatty reply.
fn extract_json_span(raw: &str) -> Option<&str> {
    let body = if let Some(start) = raw.find("```json") {
        let after = &raw[start + 7..];
        match after.find("```") {
            Some(end) => &after[..end],
            None => after,
        }
    } else if let Some(start) = raw.find("```") {
        let after = &raw[start + 3..];
        match after.find("```") {
            Some(end) => &after[..end],
            None => after,
        }
    } else {
        raw
    };
    let open = body.find('{')?;
    let close = body.rfind('}')?;
    if close <= open {
        return None;
    }
    Some(&body[open..=close])
}

/// Parse the LLM reply.  Never errors: malformed input degrades.
pub fn parse_structured(raw: &str) -> ParsedResponse {
    let Some(span) = extract_json_span(raw) else {
        debug!("no JSON object in reply; degrading to raw answer");
        return degraded(raw);
    };
    let value: serde_json::Value = match serde_json::from_str(span) {
        Ok(value) => value,
        Err(err) => {
            warn!(%err, "structured response is not valid JSON; degrading");
            return degraded(raw);
        }
    };

    let Some(answer) = value.get("answer").and_then(|v| v.as_str()) else {
        warn!("structured response lacks an answer field; degrading");
        return degraded(raw);
    };

    let mut response = StructuredResponse {
        answer: answer.to_string(),
        ..Default::default()
    };

    response.experiential_note = value
        .get("experiential_note")
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .map(ToString::to_string);

    response.emotional_resonance = value
        .get("emotional_resonance")
        .and_then(|v| serde_json::from_value(v.clone()).ok());

    response.moment_kind = value
        .get("moment_kind")
        .and_then(|v| serde_json::from_value(v.clone()).ok());

    if let Some(actions) = value.get("memory_actions").and_then(|v| v.as_array()) {
        for entry in actions {
            match serde_json::from_value::<MemoryAction>(entry.clone()) {
                Ok(action) => response.memory_actions.push(action),
                Err(err) => {
                    warn!(%err, raw = %entry, "unknown memory action skipped");
                }
            }
        }
    }

    if let Some(questions) = value.get("unresolved_questions").and_then(|v| v.as_array()) {
        response.unresolved_questions = questions
            .iter()
            .filter_map(|q| q.as_str())
            .map(ToString::to_string)
            .collect();
    }

    ParsedResponse { response, degraded: false }
}

/// Extract just a `memory_actions` list from a reply — either a top-level
/// object carrying the field or a bare JSON array.  Used by deferred fact
/// extraction, where there is no surrounding answer.
pub fn parse_action_list(raw: &str) -> Vec<MemoryAction> {
    let mut actions = Vec::new();
    let span = match extract_json_span(raw) {
        Some(span) => span,
        None => raw,
    };
    let value: serde_json::Value = match serde_json::from_str(span) {
        Ok(value) => value,
        Err(_) => {
            // The reply may be a bare array rather than an object.
            let open = raw.find('[');
            let close = raw.rfind(']');
            match (open, close) {
                (Some(open), Some(close)) if close > open => {
                    match serde_json::from_str(&raw[open..=close]) {
                        Ok(value) => value,
                        Err(err) => {
                            warn!(%err, "no parseable action list in reply");
                            return actions;
                        }
                    }
                }
                _ => return actions,
            }
        }
    };
    let entries = value
        .get("memory_actions")
        .and_then(|v| v.as_array())
        .cloned()
        .or_else(|| value.as_array().cloned())
        .unwrap_or_default();
    for entry in entries {
        match serde_json::from_value::<MemoryAction>(entry.clone()) {
            Ok(action) => actions.push(action),
            Err(err) => warn!(%err, raw = %entry, "unknown memory action skipped"),
        }
    }
    actions
}

fn degraded(raw: &str) -> ParsedResponse {
    ParsedResponse {
        response: StructuredResponse {
            answer: raw.trim().to_string(),
            ..Default::default()
        },
        degraded: true,
    }
}

// ── Validation ────────────────────────────────────────────────────────────────

/// Gate against invented user facts: a user-referring claim whose provenance
/// is the agent's own observation or inference needs evidence.  Rejection is
/// a normal outcome, not an error.
pub fn validate_remember(
    content: &str,
    source: ActionSource,
    evidence: Option<&str>,
    user_id: &str,
) -> Option<String> {
    let unsupported = matches!(source, ActionSource::AiObserved | ActionSource::AiInferred)
        && evidence.is_none_or(|e| e.trim().is_empty());
    if unsupported && refers_to_user(content, user_id) {
        return Some(format!(
            "user-referring claim with source {} and no evidence",
            source.as_str()
        ));
    }
    None
}

fn refers_to_user(content: &str, user_id: &str) -> bool {
    let lower = content.to_lowercase();
    lower.contains(&user_id.to_lowercase()) || lower.contains("user")
}

// ── Handler ───────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct ResponseOutcome {
    pub verbatim_id: String,
    pub note_id: Option<String>,
    /// IDs created by accepted memory actions, in dispatch order.
    pub created_ids: Vec<String>,
    pub anchor_ids: Vec<String>,
    pub rejected_actions: usize,
    pub unresolved_added: usize,
    pub degraded: bool,
    pub answer: String,
    /// Valence + reason of the turn's own resonance, for working memory.
    pub emotional_tone: Option<String>,
}

/// Dispatches one parsed reply into the tiers: verbatim + note dual write,
/// memory actions in array order, unresolved question capture.
pub struct ResponseHandler<'a> {
    pub store: &'a MemoryStore,
    pub anchors: &'a AnchorService,
    pub working: &'a WorkingMemory,
    pub index: Option<&'a mut VectorIndex>,
    pub index_config: &'a IndexConfig,
    pub embedder: Option<&'a dyn EmbeddingPort>,
}

impl ResponseHandler<'_> {
    pub async fn ingest(
        &mut self,
        user_id: &str,
        location: &str,
        user_query: &str,
        raw_reply: &str,
        at: DateTime<Utc>,
    ) -> Result<ResponseOutcome> {
        let parsed = parse_structured(raw_reply);
        let response = parsed.response;
        let mut outcome = ResponseOutcome {
            degraded: parsed.degraded,
            answer: response.answer.clone(),
            ..Default::default()
        };

        // 1. Verbatim: raw, deterministic, always written.
        let verbatim = VerbatimRecord {
            id: new_record_id("verbatim", at),
            timestamp: at,
            user_id: user_id.to_string(),
            location: location.to_string(),
            user_query: user_query.to_string(),
            agent_response: response.answer.clone(),
        };
        write_verbatim(self.store, &verbatim)?;
        if self.index_config.enabled(IndexKind::Verbatim) {
            let text = format!("{}\n{}", verbatim.user_query, verbatim.agent_response);
            self.index_record(IndexKind::Verbatim, &verbatim.id, &text, at, Some(user_id), 0.0)
                .await;
        }
        outcome.verbatim_id = verbatim.id.clone();

        // 2. Experiential note with full emotion metadata.
        if let Some(note_text) = &response.experiential_note {
            let assessment = response.emotional_resonance.as_ref();
            let emotion = resonance(
                assessment.map_or(0.5, |a| a.importance),
                assessment.map_or(0.0, |a| a.alignment_with_values),
                assessment.map(|a| a.reason.as_str()),
            );
            let note = ExperientialNote {
                id: new_record_id("note", at),
                timestamp: at,
                user_id: user_id.to_string(),
                content: note_text.clone(),
                emotion: emotion.clone(),
                links: Vec::new(),
            };
            write_note(self.store, &note)?;
            if self.index_config.enabled(IndexKind::Notes) {
                self.index_record(
                    IndexKind::Notes,
                    &note.id,
                    &note.content,
                    at,
                    Some(user_id),
                    emotion.intensity,
                )
                .await;
            }
            let kind = response.moment_kind.unwrap_or(MomentKind::Moment);
            if let Some(anchor) =
                self.anchors.maybe_anchor(&note.id, &note.content, &emotion, kind, at)?
            {
                outcome.anchor_ids.push(anchor);
            }
            outcome.emotional_tone = Some(crate::emotion::format_for_display(&emotion));
            outcome.note_id = Some(note.id);
        }

        // 3. Memory actions, in array order so links to earlier actions in
        //    the same reply resolve.
        for action in response.memory_actions {
            self.dispatch_action(action, user_id, at, &mut outcome).await?;
        }

        // 4. Open questions into working memory.
        for question in &response.unresolved_questions {
            self.working.add_unresolved(question, user_query, at)?;
            outcome.unresolved_added += 1;
        }

        info!(
            verbatim = %outcome.verbatim_id,
            note = outcome.note_id.as_deref().unwrap_or("-"),
            created = outcome.created_ids.len(),
            anchors = outcome.anchor_ids.len(),
            rejected = outcome.rejected_actions,
            degraded = outcome.degraded,
            "response ingested"
        );
        Ok(outcome)
    }

    /// Apply one accepted `remember` outside a chat turn (the tool surface).
    /// Returns `None` when validation rejects.
    #[allow(clippy::too_many_arguments)]
    pub async fn remember_fact(
        &mut self,
        user_id: &str,
        content: &str,
        importance: f64,
        alignment: f64,
        reason: &str,
        emotion_label: Option<&str>,
        source: ActionSource,
        evidence: Option<&str>,
        links_to: &[String],
        moment_kind: Option<MomentKind>,
        at: DateTime<Utc>,
    ) -> Result<Option<String>> {
        if let Some(rejection) = validate_remember(content, source, evidence, user_id) {
            info!(rejection, "remember rejected");
            return Ok(None);
        }

        let mut emotion = resonance(importance, alignment, Some(reason));
        if let Some(label) = emotion_label {
            // The label rides along in the reason line; intensity stays pure.
            if !label.trim().is_empty() && !emotion.reason.contains(label) {
                emotion.reason = format!("{} [{label}]", emotion.reason);
            }
        }

        let note = ExperientialNote {
            id: new_record_id("fact", at),
            timestamp: at,
            user_id: user_id.to_string(),
            content: content.to_string(),
            emotion: emotion.clone(),
            links: links_to.to_vec(),
        };
        write_note(self.store, &note)?;
        if self.index_config.enabled(IndexKind::Notes) {
            self.index_record(
                IndexKind::Notes,
                &note.id,
                &note.content,
                at,
                Some(user_id),
                emotion.intensity,
            )
            .await;
        }

        let kind = moment_kind.unwrap_or(MomentKind::Moment);
        self.anchors.maybe_anchor(&note.id, &note.content, &emotion, kind, at)?;
        Ok(Some(note.id))
    }

    async fn dispatch_action(
        &mut self,
        action: MemoryAction,
        user_id: &str,
        at: DateTime<Utc>,
        outcome: &mut ResponseOutcome,
    ) -> Result<()> {
        match action {
            MemoryAction::Remember {
                content,
                importance,
                alignment_with_values,
                reason,
                emotion,
                source,
                evidence,
                links_to,
                moment_kind,
            } => {
                let created = self
                    .remember_fact(
                        user_id,
                        &content,
                        importance,
                        alignment_with_values,
                        &reason,
                        emotion.as_deref(),
                        source,
                        evidence.as_deref(),
                        &links_to,
                        moment_kind,
                        at,
                    )
                    .await?;
                match created {
                    Some(id) => outcome.created_ids.push(id),
                    None => outcome.rejected_actions += 1,
                }
            }
            MemoryAction::Link { from, to, .. } => {
                if !self.add_link(&from, &to)? {
                    // Dangling link targets are legal; traversal skips them.
                    debug!(from, to, "link action skipped; source record not found");
                }
            }
            MemoryAction::Forget { target, .. } => {
                // Out of scope by design: tiers are append-only.
                warn!(target, "forget action acknowledged but not executed");
            }
        }
        Ok(())
    }

    /// Append `to` to the links of note `from`, rewriting the note file.
    fn add_link(&self, from: &str, to: &str) -> Result<bool> {
        let Some(mut note) = find_note_by_id(self.store, from)? else {
            return Ok(false);
        };
        if note.links.iter().any(|link| link == to) {
            return Ok(true);
        }
        note.links.push(to.to_string());
        // Rewrite in place at the original dated path.
        for path in self.store.list_markdown(self.store.notes_dir())? {
            if let Some(content) = self.store.read_opt(&path)? {
                if parse_note(&content).is_some_and(|n| n.id == note.id) {
                    self.store.write_atomic(&path, &render_note(&note))?;
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    async fn index_record(
        &mut self,
        kind: IndexKind,
        id: &str,
        text: &str,
        at: DateTime<Utc>,
        user_id: Option<&str>,
        intensity: f64,
    ) {
        let Some(index) = self.index.as_deref_mut() else {
            return;
        };
        let embedding = match self.embedder {
            Some(port) => match port.embed_texts(&[text.to_string()]).await {
                Ok(mut vectors) => vectors.pop().unwrap_or_default(),
                Err(err) => {
                    warn!(%err, "embedding failed; indexing without vector");
                    Vec::new()
                }
            },
            None => Vec::new(),
        };
        let row = IndexedRow {
            id: id.to_string(),
            content_hash: MemoryStore::content_hash(text),
            embedding,
            timestamp: at,
            user_id: user_id.map(ToString::to_string),
            intensity,
            valence: None,
            tags: Vec::new(),
        };
        if let Err(err) = index.add(kind, &row) {
            warn!(%err, id, "index insert failed; index may be stale");
        }
    }
}
