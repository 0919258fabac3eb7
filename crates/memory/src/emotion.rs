//! Emotional resonance calculation.
//!
//! All cognitive assessment comes from the LLM's structured response: the
//! importance and alignment numbers arrive already judged.  This module only
//! does the arithmetic — no keywords, no sentiment heuristics, no text
//! analysis of any kind.

use crate::schema::{EmotionalResonance, Valence};

/// Intensity above this creates a temporal anchor.  A policy constant, not a
/// tuning knob.
pub const ANCHOR_THRESHOLD: f64 = 0.7;

/// Round to three decimals for deterministic persistence.
pub fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

/// Compute emotional resonance from LLM-assessed inputs.
///
/// `intensity = importance × |alignment|`, rounded to three decimals.
/// Valence follows the sign of alignment with a ±0.3 neutral band.
/// Inputs are clamped to their contract ranges.
pub fn resonance(importance: f64, alignment: f64, reason: Option<&str>) -> EmotionalResonance {
    let importance = importance.clamp(0.0, 1.0);
    let alignment = alignment.clamp(-1.0, 1.0);

    let intensity = round3(importance * alignment.abs());

    let valence = if alignment > 0.3 {
        Valence::Positive
    } else if alignment < -0.3 {
        Valence::Negative
    } else {
        Valence::Mixed
    };

    let reason = match reason {
        Some(r) if !r.trim().is_empty() => r.to_string(),
        _ => match valence {
            Valence::Positive => format!(
                "Aligns with core values (importance={importance:.2}, alignment={alignment:.2})"
            ),
            Valence::Negative => format!(
                "Contradicts core values (importance={importance:.2}, alignment={alignment:.2})"
            ),
            Valence::Mixed => format!(
                "Neutral alignment (importance={importance:.2}, alignment={alignment:.2})"
            ),
        },
    };

    EmotionalResonance {
        intensity,
        valence,
        reason,
        alignment: round3(alignment),
        importance: round3(importance),
    }
}

/// Human-readable rendering, e.g. `"Positive (0.72) - Breakthrough"`.
pub fn format_for_display(emotion: &EmotionalResonance) -> String {
    let valence = emotion.valence.as_str();
    let mut chars = valence.chars();
    let capitalized = match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    };
    format!("{capitalized} ({:.2}) - {}", emotion.intensity, emotion.reason)
}
