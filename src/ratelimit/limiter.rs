//! Core rate limiter implementation.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use super::backoff::BackoffPolicy;
use super::clock::{Clock, SystemClock};
use super::entry::{RateLimitDecision, RateLimitEntry, ATTACK_PENALTY_LEVEL};
use super::key::LimitKey;
use super::tier::{Tier, TierLimit, TierTable};
use crate::config::RateLimitingConfig;
use crate::error::{Result, TollgateError};

/// Entries idle for longer than this are swept (24 hours).
pub const DEFAULT_MAX_IDLE: Duration = Duration::from_secs(24 * 60 * 60);
/// How often the background sweep runs (5 minutes).
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Remaining quota reported while the limiter is bypassed.
const BYPASS_REMAINING: u32 = 999;
/// Reset horizon reported while the limiter is bypassed.
const BYPASS_RESET_MS: u64 = 60_000;

/// What to do with a tier name that does not parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnknownTierPolicy {
    /// Return `TollgateError::UnknownTier`
    #[default]
    Reject,
    /// Log a warning and use the `api` tier
    Fallback,
}

/// Tunables that are not per-tier.
#[derive(Debug, Clone)]
pub struct LimiterOptions {
    /// Backoff applied after a violation
    pub backoff: BackoffPolicy,
    /// Idle time after which the sweep drops an entry
    pub max_idle: Duration,
    /// Handling of unrecognised tier names
    pub unknown_tier: UnknownTierPolicy,
    /// Allow everything without recording state
    pub bypass: bool,
}

impl Default for LimiterOptions {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            max_idle: DEFAULT_MAX_IDLE,
            unknown_tier: UnknownTierPolicy::default(),
            bypass: false,
        }
    }
}

/// Point-in-time counters for monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitStats {
    /// Entries currently tracked
    pub total_entries: usize,
    /// Entries whose backoff has not yet expired
    pub active_backoffs: usize,
    /// Entries at or above the attack penalty level
    pub high_penalty_entries: usize,
}

/// The core rate limiter that tracks one entry per `(scope, identifier)`.
///
/// This struct is thread-safe and can be shared across multiple tasks. Each
/// check holds the map shard lock for its key for the whole
/// read-modify-write, so concurrent checks on one key never interleave.
pub struct RateLimiter {
    /// Limiter state indexed by composite key
    entries: DashMap<LimitKey, RateLimitEntry>,
    /// Effective limit per tier
    tiers: TierTable,
    options: LimiterOptions,
    clock: Arc<dyn Clock>,
    /// Handle of the background sweep, if running
    sweeper: Mutex<Option<JoinHandle<()>>>,
    destroyed: AtomicBool,
}

impl RateLimiter {
    /// Create a new rate limiter with the built-in tiers and default settings.
    pub fn new() -> Self {
        Self::with_options(TierTable::new(), LimiterOptions::default())
    }

    /// Create a rate limiter with explicit tiers and options.
    pub fn with_options(tiers: TierTable, options: LimiterOptions) -> Self {
        Self {
            entries: DashMap::new(),
            tiers,
            options,
            clock: Arc::new(SystemClock),
            sweeper: Mutex::new(None),
            destroyed: AtomicBool::new(false),
        }
    }

    /// Build a rate limiter from the `rate_limiting` configuration section.
    pub fn from_config(config: &RateLimitingConfig) -> Result<Self> {
        let tiers = TierTable::with_overrides(&config.tiers)?;
        let options = LimiterOptions {
            backoff: BackoffPolicy::new(config.max_backoff_ms, config.jitter_ratio),
            max_idle: Duration::from_secs(config.max_idle_secs),
            unknown_tier: config.unknown_tier,
            bypass: config.bypass,
        };
        Ok(Self::with_options(tiers, options))
    }

    /// Replace the time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Check and record one request for `identifier` under `tier`.
    pub fn check_rate_limit(&self, identifier: &str, tier: Tier) -> RateLimitDecision {
        let limit = self.tiers.limit(tier);
        self.check_key(LimitKey::for_tier(tier, identifier), limit)
    }

    /// Check a request whose tier arrives as a string.
    ///
    /// Unknown names are handled according to the configured
    /// [`UnknownTierPolicy`].
    pub fn check_named(&self, identifier: &str, tier_name: &str) -> Result<RateLimitDecision> {
        let tier = self.resolve_tier(tier_name)?;
        Ok(self.check_rate_limit(identifier, tier))
    }

    /// Check a request against an ad-hoc limit under a custom scope.
    ///
    /// Scoped entries share the sweep, stats and backoff behaviour of tier
    /// entries. A scope equal to a tier name shares that tier's entries.
    pub fn check_with_limit(&self, scope: &str, identifier: &str, limit: TierLimit) -> RateLimitDecision {
        self.check_key(LimitKey::new(scope, identifier), limit)
    }

    /// Parse a tier name, applying the unknown-tier policy.
    pub fn resolve_tier(&self, name: &str) -> Result<Tier> {
        match name.parse::<Tier>() {
            Ok(tier) => Ok(tier),
            Err(err) => match self.options.unknown_tier {
                UnknownTierPolicy::Reject => Err(err),
                UnknownTierPolicy::Fallback => {
                    warn!(tier = %name, fallback = %Tier::default(), "Unknown rate limit tier, using fallback");
                    Ok(Tier::default())
                }
            },
        }
    }

    fn check_key(&self, key: LimitKey, limit: TierLimit) -> RateLimitDecision {
        let now = self.clock.now_ms();

        if self.options.bypass {
            trace!(key = %key, "Rate limiting bypassed");
            return RateLimitDecision {
                allowed: true,
                remaining: BYPASS_REMAINING,
                reset_time: now + BYPASS_RESET_MS,
                retry_after: None,
                penalty_level: 0,
                is_attack: false,
            };
        }

        trace!(
            key = %key,
            max_requests = limit.max_requests,
            window_ms = limit.window_ms(),
            "Checking rate limit"
        );

        let (decision, violations) = {
            let mut entry = self.entries.entry(key.clone()).or_insert_with(|| {
                debug!(key = %key, "Creating new rate limit entry");
                RateLimitEntry::new()
            });
            let decision = entry.check(now, limit, &self.options.backoff);
            (decision, entry.violations())
        };

        if !decision.allowed {
            if decision.is_attack {
                warn!(
                    key = %key,
                    penalty_level = decision.penalty_level,
                    violations = violations,
                    retry_after = ?decision.retry_after,
                    "Rate limit exceeded by suspected attacker"
                );
            } else {
                debug!(
                    key = %key,
                    penalty_level = decision.penalty_level,
                    retry_after = ?decision.retry_after,
                    "Rate limit exceeded"
                );
            }
        }

        decision
    }

    /// Snapshot of counters for monitoring.
    pub fn get_stats(&self) -> RateLimitStats {
        let now = self.clock.now_ms();
        let mut stats = RateLimitStats {
            total_entries: 0,
            active_backoffs: 0,
            high_penalty_entries: 0,
        };

        for entry in self.entries.iter() {
            stats.total_entries += 1;
            if entry.in_backoff(now) {
                stats.active_backoffs += 1;
            }
            if entry.penalty_level() >= ATTACK_PENALTY_LEVEL {
                stats.high_penalty_entries += 1;
            }
        }

        stats
    }

    /// Forget everything about `identifier` under `tier`.
    pub fn reset_rate_limit(&self, identifier: &str, tier: Tier) {
        self.remove_key(&LimitKey::for_tier(tier, identifier));
    }

    /// Forget everything about `identifier` under a custom scope.
    pub fn reset_scoped(&self, scope: &str, identifier: &str) {
        self.remove_key(&LimitKey::new(scope, identifier));
    }

    fn remove_key(&self, key: &LimitKey) {
        if self.entries.remove(key).is_some() {
            info!(key = %key, "Rate limit entry reset");
        }
    }

    /// Drop entries with no activity for longer than the idle limit.
    ///
    /// Returns the number of entries removed.
    pub fn cleanup(&self) -> usize {
        let now = self.clock.now_ms();
        let max_idle_ms = self.options.max_idle.as_millis() as u64;
        let mut removed = 0;

        self.entries.retain(|_, entry| {
            let keep = now.saturating_sub(entry.last_activity()) <= max_idle_ms;
            if !keep {
                removed += 1;
            }
            keep
        });

        if removed > 0 {
            debug!(removed = removed, remaining = self.entries.len(), "Swept idle rate limit entries");
        }
        removed
    }

    /// Start the periodic sweep on the current tokio runtime.
    ///
    /// The task holds a weak reference and stops once the limiter is dropped
    /// or destroyed. Starting it again replaces the previous task.
    pub fn spawn_cleanup(self: &Arc<Self>, every: Duration) -> Result<()> {
        if every.is_zero() {
            return Err(TollgateError::Config("cleanup interval must be greater than zero".into()));
        }

        let mut sweeper = self.sweeper.lock();
        if self.is_destroyed() {
            return Err(TollgateError::Destroyed);
        }

        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(limiter) = weak.upgrade() else {
                    break;
                };
                limiter.cleanup();
            }
        });

        if let Some(previous) = sweeper.replace(handle) {
            previous.abort();
        }
        info!(interval_secs = every.as_secs_f64(), "Rate limit cleanup task started");
        Ok(())
    }

    /// Stop the sweep and drop every entry. Cannot be undone.
    pub fn destroy(&self) {
        let mut sweeper = self.sweeper.lock();
        self.destroyed.store(true, Ordering::SeqCst);
        if let Some(handle) = sweeper.take() {
            handle.abort();
        }
        let dropped = self.entries.len();
        self.entries.clear();
        info!(dropped = dropped, "Rate limiter destroyed");
    }

    /// Whether `destroy()` has been called.
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Get the number of tracked entries.
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Copy of the entry for `identifier` under `tier`, if any.
    pub fn entry_snapshot(&self, identifier: &str, tier: Tier) -> Option<RateLimitEntry> {
        self.entries
            .get(&LimitKey::for_tier(tier, identifier))
            .map(|entry| entry.clone())
    }

    /// The effective limit for a tier.
    pub fn limit_for(&self, tier: Tier) -> TierLimit {
        self.tiers.limit(tier)
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.get_mut().take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("entries", &self.entries.len())
            .field("tiers", &self.tiers)
            .field("options", &self.options)
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}
