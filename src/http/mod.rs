//! HTTP surface for the rate limiter.

mod handlers;
mod headers;
mod middleware;
mod server;

use std::sync::Arc;

use crate::ratelimit::RateLimiter;

pub use handlers::{ApiError, CheckRequest};
pub use headers::{
    format_retry_after, rate_limit_headers, rejection_message, RejectionBody,
    X_RATELIMIT_REMAINING, X_RATELIMIT_RESET, X_SECURITY_WARNING,
};
pub use middleware::{
    client_identifier, enforce, network_identifier, rejection_response, tier_for_path,
    user_identifier, EnforceOptions, NETWORK_ESCALATION_PENALTY, NETWORK_SCOPE, X_USER_ID,
};
pub use server::{build_router, build_router_with, HttpServer};

/// State shared by every handler.
#[derive(Clone)]
pub struct AppState {
    /// The process-wide limiter
    pub limiter: Arc<RateLimiter>,
    /// Exempt paths and the network-wide limit
    pub enforcement: Arc<EnforceOptions>,
}
