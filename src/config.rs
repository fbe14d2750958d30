//! Configuration management for Tollgate.
//!
//! Settings come from an optional YAML file layered under environment
//! variables prefixed with `TOLLGATE_`, using `__` between nested keys
//! (for example `TOLLGATE_RATE_LIMITING__BYPASS=true`).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use tracing::info;

use crate::error::{Result, TollgateError};
use crate::ratelimit::{
    TierLimit, TierLimitConfig, TierTable, UnknownTierPolicy, DEFAULT_JITTER_RATIO, DEFAULT_MAX_BACKOFF_MS,
};

/// Main configuration for the Tollgate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP server address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
        }
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Interval between idle-entry sweeps in seconds
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,

    /// Idle time after which an entry is swept, in seconds
    #[serde(default = "default_max_idle")]
    pub max_idle_secs: u64,

    /// Cap on a single backoff in milliseconds
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,

    /// Upper bound of the additive backoff jitter, as a fraction
    #[serde(default = "default_jitter_ratio")]
    pub jitter_ratio: f64,

    /// Handling of unrecognised tier names
    #[serde(default)]
    pub unknown_tier: UnknownTierPolicy,

    /// Allow every request without tracking (development only)
    #[serde(default)]
    pub bypass: bool,

    /// Per-tier overrides of the built-in limits
    #[serde(default)]
    pub tiers: HashMap<String, TierLimitConfig>,

    /// Path prefixes the middleware never rate limits
    #[serde(default = "default_exempt_paths")]
    pub exempt_paths: Vec<String>,

    /// Network-wide limit applied once a device looks suspicious
    #[serde(default = "default_network_limit")]
    pub network: TierLimitConfig,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            cleanup_interval_secs: default_cleanup_interval(),
            max_idle_secs: default_max_idle(),
            max_backoff_ms: default_max_backoff(),
            jitter_ratio: default_jitter_ratio(),
            unknown_tier: UnknownTierPolicy::default(),
            bypass: false,
            tiers: HashMap::new(),
            exempt_paths: default_exempt_paths(),
            network: default_network_limit(),
        }
    }
}

fn default_cleanup_interval() -> u64 {
    300
}

fn default_max_idle() -> u64 {
    86400
}

fn default_max_backoff() -> u64 {
    DEFAULT_MAX_BACKOFF_MS
}

fn default_jitter_ratio() -> f64 {
    DEFAULT_JITTER_RATIO
}

fn default_exempt_paths() -> Vec<String> {
    vec!["/health".to_string()]
}

fn default_network_limit() -> TierLimitConfig {
    TierLimitConfig {
        window_ms: 60_000,
        max_requests: 500,
    }
}

impl TollgateConfig {
    /// Load configuration from an optional file plus the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let config: TollgateConfig = builder
            .add_source(
                config::Environment::with_prefix("TOLLGATE")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TollgateConfig = serde_yaml::from_str(yaml)
            .map_err(|e| TollgateError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the limiter cannot run with.
    pub fn validate(&self) -> Result<()> {
        let limits = &self.rate_limiting;
        if limits.cleanup_interval_secs == 0 {
            return Err(TollgateError::Config(
                "cleanup_interval_secs must be greater than zero".into(),
            ));
        }
        if limits.max_backoff_ms == 0 {
            return Err(TollgateError::Config("max_backoff_ms must be greater than zero".into()));
        }
        if !(0.0..=1.0).contains(&limits.jitter_ratio) {
            return Err(TollgateError::Config("jitter_ratio must be between 0 and 1".into()));
        }
        TierTable::with_overrides(&limits.tiers)?;
        TierLimit::try_from(limits.network).map_err(|e| match e {
            TollgateError::Config(msg) => TollgateError::Config(format!("network: {}", msg)),
            other => other,
        })?;
        Ok(())
    }
}
