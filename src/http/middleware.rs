//! Enforcement middleware for axum routes.
//!
//! Requests are checked in layers: the client device first, then the whole
//! network once the device looks suspicious, then the authenticated user.

use axum::extract::{ConnectInfo, Query, Request, State};
use axum::http::header::USER_AGENT;
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tracing::{debug, trace, warn};

use super::headers::{rate_limit_headers, RejectionBody, X_RATELIMIT_REMAINING, X_RATELIMIT_RESET};
use super::AppState;
use crate::config::RateLimitingConfig;
use crate::error::Result;
use crate::ratelimit::{RateLimitDecision, Tier, TierLimit};

/// Identifier used when a request carries no client address at all.
const UNKNOWN_CLIENT: &str = "unknown";

/// Scope of the network-wide entries.
pub const NETWORK_SCOPE: &str = "network";
/// Device penalty level at which the network-wide limit applies.
pub const NETWORK_ESCALATION_PENALTY: u8 = 2;
/// Header carrying the authenticated user id, set by the auth proxy.
pub const X_USER_ID: &str = "x-user-id";

/// Settings for [`enforce`] that are not part of the limiter itself.
#[derive(Debug, Clone)]
pub struct EnforceOptions {
    /// Path prefixes that are never rate limited
    pub exempt_paths: Vec<String>,
    /// Limit shared by every device on one network
    pub network_limit: TierLimit,
}

impl Default for EnforceOptions {
    fn default() -> Self {
        Self {
            exempt_paths: vec!["/health".to_string()],
            network_limit: TierLimit::new(500, Duration::from_secs(60)),
        }
    }
}

impl EnforceOptions {
    /// Build from the `rate_limiting` configuration section.
    pub fn from_config(config: &RateLimitingConfig) -> Result<Self> {
        Ok(Self {
            exempt_paths: config.exempt_paths.clone(),
            network_limit: TierLimit::try_from(config.network)?,
        })
    }

    /// Whether `path` starts with one of the exempt prefixes.
    pub fn is_exempt(&self, path: &str) -> bool {
        self.exempt_paths
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
    }
}

/// Rate limit every request passing through.
///
/// Rejected requests never reach the inner handler and get a 429 with
/// `Retry-After`. Allowed responses are annotated with the device's
/// remaining quota.
pub async fn enforce(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let path = req.uri().path().to_string();
    if state.enforcement.is_exempt(&path) || is_dry_run(req.uri()) {
        trace!(path = %path, "Rate limiting skipped");
        return next.run(req).await;
    }

    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);
    let device = client_identifier(req.headers(), peer);
    let tier = tier_for_path(&path);

    let decision = state.limiter.check_rate_limit(&device, tier);
    if !decision.allowed {
        log_rejection("device", &device, tier, &path, &decision);
        return rejection_response(&decision);
    }

    let network = (decision.penalty_level >= NETWORK_ESCALATION_PENALTY)
        .then(|| network_identifier(&device));
    if let Some(network) = &network {
        let network_decision =
            state
                .limiter
                .check_with_limit(NETWORK_SCOPE, network, state.enforcement.network_limit);
        if !network_decision.allowed {
            warn!(
                network = %network,
                device_penalty = decision.penalty_level,
                network_penalty = network_decision.penalty_level,
                path = %path,
                "Network rate limit exceeded after suspicious device activity"
            );
            return rejection_response(&RateLimitDecision {
                is_attack: true,
                ..network_decision
            });
        }
    }

    if let Some(user) = user_identifier(req.headers()) {
        let user_decision = state.limiter.check_rate_limit(&user, tier);
        if !user_decision.allowed {
            log_rejection("user", &user, tier, &path, &user_decision);
            return rejection_response(&user_decision);
        }
    }

    if let Some(network) = &network {
        warn!(
            device = %device,
            network = %network,
            penalty_level = decision.penalty_level,
            path = %path,
            user_agent = ?req.headers().get(USER_AGENT),
            "Elevated penalty level detected"
        );
    }

    let mut response = next.run(req).await;
    let headers = rate_limit_headers(&decision);
    for name in [X_RATELIMIT_REMAINING, X_RATELIMIT_RESET] {
        if let Some(value) = headers.get(&name) {
            response.headers_mut().insert(name.clone(), value.clone());
        }
    }
    response
}

fn log_rejection(layer: &str, identifier: &str, tier: Tier, path: &str, decision: &RateLimitDecision) {
    if decision.is_attack {
        warn!(
            layer = layer,
            identifier = %identifier,
            tier = %tier,
            path = %path,
            penalty_level = decision.penalty_level,
            "Blocked request from suspected attacker"
        );
    } else {
        debug!(
            layer = layer,
            identifier = %identifier,
            tier = %tier,
            path = %path,
            "Request rate limited"
        );
    }
}

/// Whether the query string asks for `dry-run=true`.
fn is_dry_run(uri: &Uri) -> bool {
    Query::<HashMap<String, String>>::try_from_uri(uri)
        .map(|Query(params)| params.get("dry-run").is_some_and(|v| v == "true"))
        .unwrap_or(false)
}

/// 429 response for a rejected decision.
pub fn rejection_response(decision: &RateLimitDecision) -> Response {
    (
        StatusCode::TOO_MANY_REQUESTS,
        rate_limit_headers(decision),
        Json(RejectionBody::from(decision)),
    )
        .into_response()
}

/// Pick the identifier for a request.
///
/// Prefers the first `X-Forwarded-For` hop, then `X-Real-IP`, then the peer
/// socket address.
pub fn client_identifier(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());

    let real_ip = headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty());

    forwarded
        .or(real_ip)
        .map(str::to_string)
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
        .unwrap_or_else(|| UNKNOWN_CLIENT.to_string())
}

/// Map a request path to its tier; the first matching segment wins.
pub fn tier_for_path(path: &str) -> Tier {
    path.split('/')
        .find_map(|segment| match segment {
            "auth" | "login" | "signin" => Some(Tier::Auth),
            "upload" | "uploads" => Some(Tier::Upload),
            "search" => Some(Tier::Search),
            "admin" => Some(Tier::Admin),
            _ => None,
        })
        .unwrap_or(Tier::Api)
}

/// The network a client identifier belongs to.
///
/// IPv4 addresses group by /24 and IPv6 addresses by /64. Anything that is
/// not an address is its own network.
pub fn network_identifier(identifier: &str) -> String {
    match identifier.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => {
            let [a, b, c, _] = v4.octets();
            format!("{}.{}.{}.0/24", a, b, c)
        }
        Ok(IpAddr::V6(v6)) => {
            let masked = u128::from(v6) & (!0u128 << 64);
            format!("{}/64", Ipv6Addr::from(masked))
        }
        Err(_) => identifier.to_string(),
    }
}

/// Identifier of the authenticated user, if the request names one.
pub fn user_identifier(headers: &HeaderMap) -> Option<String> {
    headers
        .get(X_USER_ID)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(|id| format!("user:{}", id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_tier_for_path() {
        assert_eq!(tier_for_path("/api/auth/callback"), Tier::Auth);
        assert_eq!(tier_for_path("/api/upload"), Tier::Upload);
        assert_eq!(tier_for_path("/api/search"), Tier::Search);
        assert_eq!(tier_for_path("/v1/admin/stats"), Tier::Admin);
        assert_eq!(tier_for_path("/api/posts/42"), Tier::Api);
        assert_eq!(tier_for_path("/"), Tier::Api);
        // First matching segment wins
        assert_eq!(tier_for_path("/admin/search"), Tier::Admin);
        // Substrings do not count
        assert_eq!(tier_for_path("/api/authors"), Tier::Api);
    }

    #[test]
    fn test_client_identifier_precedence() {
        let peer: SocketAddr = "192.0.2.1:5555".parse().unwrap();

        let mut headers = HeaderMap::new();
        assert_eq!(client_identifier(&headers, Some(peer)), "192.0.2.1");
        assert_eq!(client_identifier(&headers, None), "unknown");

        headers.insert("x-real-ip", HeaderValue::from_static("198.51.100.7"));
        assert_eq!(client_identifier(&headers, Some(peer)), "198.51.100.7");

        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.9, 10.0.0.1"),
        );
        assert_eq!(client_identifier(&headers, Some(peer)), "203.0.113.9");
    }

    #[test]
    fn test_blank_forwarded_header_ignored() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static(" "));
        assert_eq!(client_identifier(&headers, None), "unknown");
    }

    #[test]
    fn test_rejection_response() {
        let decision = RateLimitDecision {
            allowed: false,
            remaining: 0,
            reset_time: 1_700_000_000_000,
            retry_after: Some(90),
            penalty_level: 4,
            is_attack: true,
        };

        let response = rejection_response(&decision);
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()["retry-after"], "90");
        assert!(response.headers().contains_key("x-security-warning"));
    }

    #[test]
    fn test_network_identifier() {
        assert_eq!(network_identifier("203.0.113.9"), "203.0.113.0/24");
        assert_eq!(network_identifier("203.0.113.200"), "203.0.113.0/24");
        assert_eq!(
            network_identifier("2001:db8:1:2:aaaa:bbbb:cccc:dddd"),
            "2001:db8:1:2::/64"
        );
        assert_eq!(network_identifier("unknown"), "unknown");
    }

    #[test]
    fn test_user_identifier() {
        let mut headers = HeaderMap::new();
        assert_eq!(user_identifier(&headers), None);

        headers.insert(X_USER_ID, HeaderValue::from_static("  "));
        assert_eq!(user_identifier(&headers), None);

        headers.insert(X_USER_ID, HeaderValue::from_static("42"));
        assert_eq!(user_identifier(&headers).as_deref(), Some("user:42"));
    }

    #[test]
    fn test_exempt_paths_match_prefix() {
        let options = EnforceOptions {
            exempt_paths: vec!["/health".to_string(), "/api/version".to_string()],
            ..Default::default()
        };
        assert!(options.is_exempt("/health"));
        assert!(options.is_exempt("/api/version/latest"));
        assert!(!options.is_exempt("/api/posts"));
        assert!(!options.is_exempt("/v1/health"));
    }

    #[test]
    fn test_dry_run_query() {
        assert!(is_dry_run(&"/api/posts?dry-run=true".parse().unwrap()));
        assert!(is_dry_run(&"/api/posts?a=1&dry-run=true".parse().unwrap()));
        assert!(!is_dry_run(&"/api/posts?dry-run=false".parse().unwrap()));
        assert!(!is_dry_run(&"/api/posts".parse().unwrap()));
    }

    #[test]
    fn test_options_from_config() {
        let config = RateLimitingConfig::default();
        let options = EnforceOptions::from_config(&config).unwrap();
        assert_eq!(options.network_limit, TierLimit::new(500, Duration::from_secs(60)));
        assert!(options.is_exempt("/health"));
    }
}
