//! Rate limiting logic and state management.

mod backoff;
mod clock;
mod entry;
mod key;
mod limiter;
mod tier;

pub use backoff::{BackoffPolicy, DEFAULT_JITTER_RATIO, DEFAULT_MAX_BACKOFF_MS};
pub use clock::{Clock, ManualClock, SystemClock};
pub use entry::{
    RateLimitDecision, RateLimitEntry, ATTACK_PENALTY_LEVEL, ATTACK_VIOLATIONS, MAX_PENALTY_LEVEL,
};
pub use key::LimitKey;
pub use limiter::{
    LimiterOptions, RateLimitStats, RateLimiter, UnknownTierPolicy, DEFAULT_CLEANUP_INTERVAL,
    DEFAULT_MAX_IDLE,
};
pub use tier::{Tier, TierLimit, TierLimitConfig, TierTable};
