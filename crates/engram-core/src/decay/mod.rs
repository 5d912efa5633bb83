//! Decay model
//!
//! Each engram carries a decay rate derived from its importance band. The
//! decay *score* estimates current salience from importance, age, and access
//! history; engrams falling below a threshold are "at risk" and eventually
//! pruned by the sleep cycle unless protected.

use chrono::{DateTime, Utc};

use crate::engram::Engram;

/// Furthest horizon the forgetting predictor looks ahead (10 years)
const PREDICTION_HORIZON_DAYS: u32 = 3650;

/// Derive a decay rate from an importance value
///
/// Banded rather than continuous so that small importance edits do not
/// silently reschedule a memory's whole lifetime.
pub fn rate_for_importance(importance: f64) -> f64 {
    if importance >= 0.9 {
        0.0001
    } else if importance >= 0.7 {
        0.001
    } else if importance >= 0.5 {
        0.005
    } else if importance >= 0.3 {
        0.02
    } else {
        0.1
    }
}

/// Decay score in [0, 1]
///
/// `s = importance * exp(-decay_rate * age_days) * (1 + ln(1 + access_count))`
pub fn decay_score(importance: f64, decay_rate: f64, age_days: f64, access_count: i64) -> f64 {
    let access_boost = 1.0 + (1.0 + access_count.max(0) as f64).ln();
    (importance * (-decay_rate * age_days).exp() * access_boost).clamp(0.0, 1.0)
}

/// Decay score of an engram at the given instant
pub fn score_for(engram: &Engram, now: DateTime<Utc>) -> f64 {
    decay_score(
        engram.importance,
        engram.decay_rate,
        engram.age_days(now),
        engram.access_count,
    )
}

/// Whether the engram has fallen below the threshold
///
/// Protected engrams are never at risk.
pub fn is_at_risk(engram: &Engram, threshold: f64, now: DateTime<Utc>) -> bool {
    !engram.protected && score_for(engram, now) < threshold
}

/// Smallest whole number of days until the score crosses the threshold
///
/// Returns `Some(0)` when already below, `None` when the score stays above
/// the threshold for the whole prediction horizon (protected engrams always
/// return `None`).
pub fn predict_forgetting_days(
    engram: &Engram,
    threshold: f64,
    now: DateTime<Utc>,
) -> Option<u32> {
    if engram.protected {
        return None;
    }
    let age = engram.age_days(now);
    for days in 0..=PREDICTION_HORIZON_DAYS {
        let score = decay_score(
            engram.importance,
            engram.decay_rate,
            age + days as f64,
            engram.access_count,
        );
        if score < threshold {
            return Some(days);
        }
    }
    None
}

// ============================================================================
// TESTS
// ============================================================================
