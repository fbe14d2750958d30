//! Per-key sliding window and penalty state.

use serde::Serialize;
use std::collections::VecDeque;

use super::backoff::BackoffPolicy;
use super::tier::TierLimit;

/// Highest penalty level an entry can reach.
pub const MAX_PENALTY_LEVEL: u8 = 5;
/// Penalty level at which an entry counts as an attack.
pub const ATTACK_PENALTY_LEVEL: u8 = 3;
/// Violation count at which an entry counts as an attack.
pub const ATTACK_VIOLATIONS: u64 = 10;

/// The outcome of a single rate limit check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitDecision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Requests left in the current window after this one
    pub remaining: u32,
    /// Start of the window plus its length (ms since epoch); the backoff
    /// end while locked out
    pub reset_time: u64,
    /// Whole seconds until the backoff ends, only set on rejection
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
    /// Current penalty level, 0 through 5
    pub penalty_level: u8,
    /// Whether the key looks like an attack
    pub is_attack: bool,
}

/// Sliding window plus abuse history for one key.
#[derive(Debug, Clone, Default)]
pub struct RateLimitEntry {
    /// Accepted request timestamps still inside the window
    requests: VecDeque<u64>,
    /// Rejected attempts that triggered a backoff
    violations: u64,
    /// Timestamp of the latest violation
    last_violation: u64,
    /// All requests are rejected before this timestamp
    backoff_until: u64,
    /// Escalates on violations, decays on good behaviour
    penalty_level: u8,
}

impl RateLimitEntry {
    /// A never-seen entry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run one check at `now` against `limit`, recording the outcome.
    pub fn check(&mut self, now: u64, limit: TierLimit, backoff: &BackoffPolicy) -> RateLimitDecision {
        if self.in_backoff(now) {
            // Only the penalty level flags an attack while locked out
            return RateLimitDecision {
                allowed: false,
                remaining: 0,
                reset_time: self.backoff_until,
                retry_after: Some(ceil_secs(self.backoff_until - now)),
                penalty_level: self.penalty_level,
                is_attack: self.penalty_level >= ATTACK_PENALTY_LEVEL,
            };
        }

        let window_ms = limit.window_ms();
        let window_start = now.saturating_sub(window_ms);
        self.prune(now, window_ms);

        let used = self.requests.len();
        let max = limit.max_requests as usize;
        let allowed = used < max;

        if allowed {
            self.requests.push_back(now);

            if self.penalty_level > 0
                && now.saturating_sub(self.last_violation) > window_ms.saturating_mul(2)
            {
                self.penalty_level -= 1;
            }
        } else {
            self.violations += 1;
            self.last_violation = now;
            self.penalty_level = (self.penalty_level + 1).min(MAX_PENALTY_LEVEL);
            self.backoff_until =
                now.saturating_add(backoff.backoff_ms(self.penalty_level, window_ms));
        }

        RateLimitDecision {
            allowed,
            remaining: if allowed { (max - used - 1) as u32 } else { 0 },
            reset_time: window_start.saturating_add(window_ms),
            retry_after: (!allowed).then(|| ceil_secs(self.backoff_until.saturating_sub(now))),
            penalty_level: self.penalty_level,
            is_attack: self.is_attack(),
        }
    }

    /// Oldest request still tracked, if any.
    pub fn oldest_request(&self) -> Option<u64> {
        self.requests.front().copied()
    }

    /// Drop request timestamps that fell out of the window ending at `now`.
    pub fn prune(&mut self, now: u64, window_ms: u64) {
        let window_start = now.saturating_sub(window_ms);
        self.requests.retain(|&ts| ts > window_start);
    }

    /// Whether every request is rejected at `now`.
    pub fn in_backoff(&self, now: u64) -> bool {
        now < self.backoff_until
    }

    /// Latest of the last request, the last violation and the backoff end.
    pub fn last_activity(&self) -> u64 {
        let last_request = self.requests.back().copied().unwrap_or(0);
        last_request.max(self.last_violation).max(self.backoff_until)
    }

    /// Attack flag, derived from the current penalty and violation count.
    pub fn is_attack(&self) -> bool {
        self.penalty_level >= ATTACK_PENALTY_LEVEL || self.violations >= ATTACK_VIOLATIONS
    }

    /// Current penalty level.
    pub fn penalty_level(&self) -> u8 {
        self.penalty_level
    }

    /// Total violations recorded.
    pub fn violations(&self) -> u64 {
        self.violations
    }

    /// End of the current (or last) backoff.
    pub fn backoff_until(&self) -> u64 {
        self.backoff_until
    }

    /// Requests currently tracked in the window.
    pub fn request_count(&self) -> usize {
        self.requests.len()
    }
}

fn ceil_secs(ms: u64) -> u64 {
    ms.div_ceil(1000)
}
