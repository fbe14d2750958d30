//! Exponential backoff applied after a window overflows.

use rand::Rng;

/// Longest backoff ever applied, in milliseconds (one hour).
pub const DEFAULT_MAX_BACKOFF_MS: u64 = 60 * 60 * 1000;
/// Upper bound of the additive jitter, as a fraction of the base backoff.
pub const DEFAULT_JITTER_RATIO: f64 = 0.1;

/// How long an identifier is locked out after a violation.
///
/// The base backoff is `2^penalty_level * window`. A jitter drawn uniformly
/// from `[0, jitter_ratio)` of the base is added on top, then the total is
/// capped at `max_backoff_ms`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    /// Cap on a single backoff
    pub max_backoff_ms: u64,
    /// Fraction of the base backoff added as jitter
    pub jitter_ratio: f64,
}

impl BackoffPolicy {
    /// Create a new policy.
    pub fn new(max_backoff_ms: u64, jitter_ratio: f64) -> Self {
        Self {
            max_backoff_ms,
            jitter_ratio: jitter_ratio.max(0.0),
        }
    }

    /// Backoff for a penalty level, with fresh jitter.
    pub fn backoff_ms(&self, penalty_level: u8, window_ms: u64) -> u64 {
        let sample: f64 = rand::thread_rng().gen();
        self.backoff_ms_with_sample(penalty_level, window_ms, sample)
    }

    /// Backoff for a penalty level given a jitter sample in `[0, 1)`.
    pub fn backoff_ms_with_sample(&self, penalty_level: u8, window_ms: u64, sample: f64) -> u64 {
        let base = 2f64.powi(penalty_level as i32) * window_ms as f64;
        let jitter = sample.clamp(0.0, 1.0) * self.jitter_ratio * base;
        (base + jitter).min(self.max_backoff_ms as f64).ceil() as u64
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BACKOFF_MS, DEFAULT_JITTER_RATIO)
    }
}
