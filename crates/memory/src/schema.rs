use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable record identifier: `<kind>_<YYYYMMDD>_<HHMMSS>_<rand>`.
///
/// IDs never change once minted; links between records use them.
pub fn new_record_id(kind: &str, at: DateTime<Utc>) -> String {
    let rand: String = Uuid::new_v4().simple().to_string().chars().take(8).collect();
    format!("{kind}_{}_{}_{rand}", at.format("%Y%m%d"), at.format("%H%M%S"))
}

/// Recover the timestamp encoded in a record ID, if well-formed.
pub fn record_id_timestamp(id: &str) -> Option<DateTime<Utc>> {
    let parts: Vec<&str> = id.split('_').collect();
    if parts.len() < 4 {
        return None;
    }
    let date = parts[parts.len() - 3];
    let time = parts[parts.len() - 2];
    let naive = NaiveDateTime::parse_from_str(&format!("{date} {time}"), "%Y%m%d %H%M%S").ok()?;
    Some(naive.and_utc())
}

/// Truncate at a char boundary, appending an ellipsis marker when cut.
pub fn truncate_str(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let cut: String = s.chars().take(max_chars).collect();
    format!("{cut}...")
}

// ── Emotion ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Valence {
    Positive,
    Negative,
    Mixed,
}

impl Valence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Valence::Positive => "positive",
            Valence::Negative => "negative",
            Valence::Mixed => "mixed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "positive" => Valence::Positive,
            "negative" => Valence::Negative,
            _ => Valence::Mixed,
        }
    }
}

/// The `{intensity, valence, reason}` bundle attached to every affective
/// record.  Intensity is always `importance × |alignment|`, rounded to three
/// decimals; the inputs come from the LLM's structured assessment, never from
/// engine-side text analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmotionalResonance {
    pub intensity: f64,
    pub valence: Valence,
    pub reason: String,
    pub alignment: f64,
    pub importance: f64,
}

// ── Durable records ───────────────────────────────────────────────────────────

/// Raw, deterministic record of one user↔agent exchange.  Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerbatimRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub user_id: String,
    pub location: String,
    pub user_query: String,
    pub agent_response: String,
}

/// First-person reflection on an exchange, authored by the LLM and paired
/// with exactly one verbatim record by timestamp co-location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperientialNote {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub user_id: String,
    pub content: String,
    pub emotion: EmotionalResonance,
    pub links: Vec<String>,
}

/// How a high-intensity moment is filed in the episodic tier.  Supplied by
/// the LLM as a structured field at ingestion; the engine never infers it
/// from phrasing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MomentKind {
    Moment,
    Discovery,
    Experiment,
}

impl MomentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MomentKind::Moment => "moment",
            MomentKind::Discovery => "discovery",
            MomentKind::Experiment => "experiment",
        }
    }
}

/// Validated piece of learned knowledge in the semantic tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SemanticInsight {
    pub id: String,
    pub content: String,
    pub confidence: f64,
    pub evidence: Vec<String>,
    pub emotion: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// Provenance of a `remember` memory action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionSource {
    UserStated,
    AiObserved,
    AiInferred,
    AiReflection,
}

impl ActionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionSource::UserStated => "user_stated",
            ActionSource::AiObserved => "ai_observed",
            ActionSource::AiInferred => "ai_inferred",
            ActionSource::AiReflection => "ai_reflection",
        }
    }
}

// ── Reflection ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReflectionDepth {
    Shallow,
    Deep,
    Exhaustive,
}

impl ReflectionDepth {
    /// How many topic-relevant memories to gather; `None` means all.
    pub fn gather_limit(&self) -> Option<usize> {
        match self {
            ReflectionDepth::Shallow => Some(5),
            ReflectionDepth::Deep => Some(20),
            ReflectionDepth::Exhaustive => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReflectionDepth::Shallow => "shallow",
            ReflectionDepth::Deep => "deep",
            ReflectionDepth::Exhaustive => "exhaustive",
        }
    }
}

/// Output of a reflect-on-topic operation.  Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reflection {
    pub id: String,
    pub topic: String,
    pub depth: ReflectionDepth,
    pub insights: Vec<String>,
    pub patterns: Vec<String>,
    pub contradictions: Vec<String>,
    pub evolution_narrative: String,
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
}
