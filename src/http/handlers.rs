//! Request handlers for the decision and admin endpoints.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use super::headers::rate_limit_headers;
use super::AppState;
use crate::error::TollgateError;
use crate::ratelimit::{RateLimitStats, Tier};

/// Body of `POST /v1/check`.
#[derive(Debug, Clone, Deserialize)]
pub struct CheckRequest {
    /// Client address, user id or any other opaque key
    pub identifier: String,
    /// Tier name; `api` when omitted
    #[serde(default)]
    pub tier: Option<String>,
}

/// Error returned by handlers, rendered as `{ "error": ... }`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn invalid_argument(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<TollgateError> for ApiError {
    fn from(err: TollgateError) -> Self {
        let status = match err {
            TollgateError::UnknownTier(_) => StatusCode::BAD_REQUEST,
            TollgateError::Destroyed => StatusCode::SERVICE_UNAVAILABLE,
            TollgateError::Config(_) | TollgateError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

/// Liveness probe.
pub async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

/// Decide whether a request may proceed.
///
/// Always answers 200 with the decision; callers act on `allowed`.
#[instrument(skip_all, fields(identifier = %req.identifier, tier = ?req.tier))]
pub async fn check(
    State(state): State<AppState>,
    Json(req): Json<CheckRequest>,
) -> Result<Response, ApiError> {
    if req.identifier.is_empty() {
        warn!("Received rate limit check with empty identifier");
        return Err(ApiError::invalid_argument("identifier is required"));
    }

    let decision = match req.tier.as_deref() {
        Some(name) => state.limiter.check_named(&req.identifier, name)?,
        None => state.limiter.check_rate_limit(&req.identifier, Tier::default()),
    };

    debug!(
        allowed = decision.allowed,
        remaining = decision.remaining,
        penalty_level = decision.penalty_level,
        "Rate limit decision made"
    );

    Ok((StatusCode::OK, rate_limit_headers(&decision), Json(decision)).into_response())
}

/// Monitoring counters.
pub async fn stats(State(state): State<AppState>) -> Json<RateLimitStats> {
    Json(state.limiter.get_stats())
}

/// Forget an identifier under a tier. Idempotent.
pub async fn reset(
    State(state): State<AppState>,
    Path((tier, identifier)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    let tier: Tier = tier.parse()?;
    state.limiter.reset_rate_limit(&identifier, tier);
    info!(tier = %tier, identifier = %identifier, "Rate limit reset by admin");
    Ok(StatusCode::NO_CONTENT)
}
