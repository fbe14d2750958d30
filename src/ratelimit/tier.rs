//! Rate limiting tiers and the limits attached to them.
//!
//! Every route family maps to a tier, and every tier carries a sliding window
//! length plus the number of requests accepted within that window. The
//! built-in limits can be overridden per tier from configuration.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Result, TollgateError};

/// A named class of requests sharing one limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Standard API requests, keyed per client address
    #[default]
    Api,
    /// Authentication endpoints
    Auth,
    /// Upload endpoints, keyed per user
    Upload,
    /// Search and filter endpoints
    Search,
    /// Admin actions, keyed per user
    Admin,
    /// Applied by hand to identifiers flagged as attackers
    Attack,
}

impl Tier {
    /// All tiers, in declaration order.
    pub const ALL: [Tier; 6] = [
        Tier::Api,
        Tier::Auth,
        Tier::Upload,
        Tier::Search,
        Tier::Admin,
        Tier::Attack,
    ];

    /// The name used in keys, configuration and URLs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Api => "api",
            Tier::Auth => "auth",
            Tier::Upload => "upload",
            Tier::Search => "search",
            Tier::Admin => "admin",
            Tier::Attack => "attack",
        }
    }

    /// The built-in limit for this tier.
    pub fn default_limit(&self) -> TierLimit {
        match self {
            Tier::Api => TierLimit::new(100, Duration::from_secs(60)),
            Tier::Auth => TierLimit::new(10, Duration::from_secs(15 * 60)),
            Tier::Upload => TierLimit::new(5, Duration::from_secs(60)),
            Tier::Search => TierLimit::new(200, Duration::from_secs(60)),
            Tier::Admin => TierLimit::new(50, Duration::from_secs(60)),
            Tier::Attack => TierLimit::new(1, Duration::from_secs(60 * 60)),
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = TollgateError;

    fn from_str(s: &str) -> Result<Self> {
        Tier::ALL
            .into_iter()
            .find(|tier| tier.as_str() == s)
            .ok_or_else(|| TollgateError::UnknownTier(s.to_string()))
    }
}

/// Capacity of a sliding window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierLimit {
    /// Maximum accepted requests inside one window
    pub max_requests: u32,
    /// Length of the sliding window
    pub window: Duration,
}

impl TierLimit {
    /// Create a new limit.
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
        }
    }

    /// Window length in milliseconds.
    pub fn window_ms(&self) -> u64 {
        self.window.as_millis() as u64
    }
}

/// A tier limit as written in configuration files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierLimitConfig {
    /// Window length in milliseconds
    pub window_ms: u64,
    /// Maximum accepted requests inside one window
    pub max_requests: u32,
}

impl TryFrom<TierLimitConfig> for TierLimit {
    type Error = TollgateError;

    fn try_from(cfg: TierLimitConfig) -> Result<Self> {
        if cfg.window_ms == 0 {
            return Err(TollgateError::Config("window_ms must be greater than zero".into()));
        }
        if cfg.max_requests == 0 {
            return Err(TollgateError::Config(
                "max_requests must be greater than zero".into(),
            ));
        }
        Ok(TierLimit::new(
            cfg.max_requests,
            Duration::from_millis(cfg.window_ms),
        ))
    }
}

/// The effective limit for every tier.
#[derive(Debug, Clone)]
pub struct TierTable {
    limits: HashMap<Tier, TierLimit>,
}

impl TierTable {
    /// A table holding the built-in limits.
    pub fn new() -> Self {
        let limits = Tier::ALL
            .into_iter()
            .map(|tier| (tier, tier.default_limit()))
            .collect();
        Self { limits }
    }

    /// Built-in limits with configured overrides applied on top.
    pub fn with_overrides(overrides: &HashMap<String, TierLimitConfig>) -> Result<Self> {
        let mut table = Self::new();
        for (name, cfg) in overrides {
            let tier: Tier = name.parse()?;
            let limit = TierLimit::try_from(*cfg).map_err(|e| match e {
                TollgateError::Config(msg) => TollgateError::Config(format!("tier '{}': {}", name, msg)),
                other => other,
            })?;
            table.set(tier, limit);
        }
        Ok(table)
    }

    /// The limit for a tier.
    pub fn limit(&self, tier: Tier) -> TierLimit {
        self.limits
            .get(&tier)
            .copied()
            .unwrap_or_else(|| tier.default_limit())
    }

    /// Replace the limit for a tier.
    pub fn set(&mut self, tier: Tier, limit: TierLimit) {
        self.limits.insert(tier, limit);
    }
}

impl Default for TierTable {
    fn default() -> Self {
        Self::new()
    }
}
