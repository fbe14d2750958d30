//! Rate limit response headers and rejection bodies.

use axum::http::header::RETRY_AFTER;
use axum::http::{HeaderMap, HeaderName, HeaderValue};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

use crate::ratelimit::RateLimitDecision;

/// Requests left in the current window.
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
/// When quota frees up again, as an RFC 3339 timestamp.
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");
/// Set on rejections of keys flagged as attacks.
pub const X_SECURITY_WARNING: HeaderName = HeaderName::from_static("x-security-warning");

/// Headers describing a decision.
///
/// Every decision carries the remaining quota and reset time. Rejections
/// add `Retry-After`, and attack-flagged rejections add a security warning.
pub fn rate_limit_headers(decision: &RateLimitDecision) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(decision.remaining));

    if let Ok(reset) = HeaderValue::from_str(&format_timestamp(decision.reset_time)) {
        headers.insert(X_RATELIMIT_RESET, reset);
    }

    if let Some(retry_after) = decision.retry_after {
        headers.insert(RETRY_AFTER, HeaderValue::from(retry_after));
    }

    if !decision.allowed && decision.is_attack {
        headers.insert(
            X_SECURITY_WARNING,
            HeaderValue::from_static("Rate limit violation detected"),
        );
    }

    headers
}

/// JSON body of a 429 response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectionBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_human: Option<String>,
    pub penalty_level: u8,
}

impl From<&RateLimitDecision> for RejectionBody {
    fn from(decision: &RateLimitDecision) -> Self {
        Self {
            error: rejection_message(decision),
            retry_after: decision.retry_after,
            retry_after_human: decision.retry_after.map(format_retry_after),
            penalty_level: decision.penalty_level,
        }
    }
}

/// Human-readable explanation of a rejection.
pub fn rejection_message(decision: &RateLimitDecision) -> String {
    match decision.retry_after {
        Some(secs) if decision.is_attack => format!(
            "Suspicious activity detected. Access temporarily restricted. Try again in {}.",
            format_retry_after(secs)
        ),
        Some(secs) => format!(
            "Rate limit exceeded. Please try again in {}.",
            format_retry_after(secs)
        ),
        None => "Too many requests. Please slow down.".to_string(),
    }
}

/// Render a wait in seconds as "45 seconds", "2 minutes" or "1 hour 30 minutes".
///
/// Partial minutes round up so the caller never retries too early.
pub fn format_retry_after(secs: u64) -> String {
    if secs < 60 {
        return plural(secs, "second");
    }

    let total_minutes = secs.div_ceil(60);
    if total_minutes < 60 {
        return plural(total_minutes, "minute");
    }

    let hours = total_minutes / 60;
    let minutes = total_minutes % 60;
    if minutes == 0 {
        plural(hours, "hour")
    } else {
        format!("{} {}", plural(hours, "hour"), plural(minutes, "minute"))
    }
}

fn plural(n: u64, unit: &str) -> String {
    if n == 1 {
        format!("1 {}", unit)
    } else {
        format!("{} {}s", n, unit)
    }
}

fn format_timestamp(ms: u64) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms as i64)
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_default()
}
