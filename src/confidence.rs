//! Rolling confidence over recent Sentinel verdicts.
//!
//! Confidence is a pure function of verdict history: the last few
//! verdicts are folded into a single traffic-light score the
//! orchestrator consults between tasks. Recent verdicts weigh more
//! than older ones.

use serde::{Deserialize, Serialize};

use crate::sentinel::SentinelVerdict;

/// Verdicts considered when scoring.
const WINDOW: usize = 5;

/// Score at or above this with an all-pass window reads Healthy.
const HEALTHY_FLOOR: f64 = 85.0;

/// Score below this reads Error regardless of pass mix.
const ERROR_CEILING: f64 = 40.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    Healthy,
    Warning,
    Error,
}

impl std::fmt::Display for Health {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Health::Healthy => write!(f, "healthy"),
            Health::Warning => write!(f, "warning"),
            Health::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfidenceScore {
    /// 0..=100, recency-weighted.
    pub score: u8,
    pub status: Health,
}

/// Fold verdict history into a confidence score.
///
/// Only the newest `WINDOW` verdicts count, weighted linearly toward
/// the most recent. Healthy requires every windowed verdict to have
/// passed and the weighted score to clear 85; Error means none passed
/// or the score fell under 40; everything else is Warning. An empty
/// history reads as a neutral 50 / Warning.
pub fn calculate_confidence(history: &[SentinelVerdict]) -> ConfidenceScore {
    let start = history.len().saturating_sub(WINDOW);
    let window = &history[start..];

    if window.is_empty() {
        return ConfidenceScore {
            score: 50,
            status: Health::Warning,
        };
    }

    let mut weighted = 0.0;
    let mut total = 0.0;
    for (i, verdict) in window.iter().enumerate() {
        let weight = (i + 1) as f64;
        weighted += weight * verdict.quality_score as f64;
        total += weight;
    }
    let score_f = weighted / total;
    let score = score_f.round().clamp(0.0, 100.0) as u8;

    let all_passed = window.iter().all(|v| v.passed);
    let none_passed = window.iter().all(|v| !v.passed);

    let status = if all_passed && score_f >= HEALTHY_FLOOR {
        Health::Healthy
    } else if none_passed || score_f < ERROR_CEILING {
        Health::Error
    } else {
        Health::Warning
    };

    ConfidenceScore { score, status }
}
