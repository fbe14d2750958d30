//! HTTP server implementation.

use axum::middleware::from_fn_with_state;
use axum::routing::{delete, get, post};
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

use super::handlers::{check, health, reset, stats};
use super::middleware::{enforce, EnforceOptions};
use super::AppState;
use crate::error::Result;
use crate::ratelimit::RateLimiter;

/// Build the service router with default enforcement options.
pub fn build_router(limiter: Arc<RateLimiter>) -> Router {
    build_router_with(limiter, EnforceOptions::default())
}

/// Build the service router.
///
/// Admin routes are themselves rate limited under the `admin` tier.
pub fn build_router_with(limiter: Arc<RateLimiter>, enforcement: EnforceOptions) -> Router {
    let state = AppState {
        limiter,
        enforcement: Arc::new(enforcement),
    };

    let admin = Router::new()
        .route("/v1/admin/stats", get(stats))
        .route("/v1/admin/limits/{tier}/{identifier}", delete(reset))
        .route_layer(from_fn_with_state(state.clone(), enforce));

    Router::new()
        .route("/health", get(health))
        .route("/v1/check", post(check))
        .merge(admin)
        .with_state(state)
}

/// HTTP server for the rate limit service.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// The rate limiter instance
    rate_limiter: Arc<RateLimiter>,
    /// Middleware settings for the admin routes
    enforcement: EnforceOptions,
}

impl HttpServer {
    /// Create a new HTTP server around a limiter.
    pub fn new(addr: SocketAddr, rate_limiter: Arc<RateLimiter>) -> Self {
        Self {
            addr,
            rate_limiter,
            enforcement: EnforceOptions::default(),
        }
    }

    /// Replace the middleware settings.
    pub fn with_enforcement(mut self, enforcement: EnforceOptions) -> Self {
        self.enforcement = enforcement;
        self
    }

    /// The router this server would serve.
    pub fn router(&self) -> Router {
        build_router_with(self.rate_limiter.clone(), self.enforcement.clone())
    }

    /// Start the HTTP server.
    ///
    /// This method will block until the server fails.
    pub async fn serve(self) -> Result<()> {
        self.serve_with_shutdown(std::future::pending()).await
    }

    /// Start the HTTP server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let router = self.router();
        let listener = TcpListener::bind(self.addr).await.map_err(|e| {
            error!(addr = %self.addr, error = %e, "Failed to bind HTTP listener");
            e
        })?;

        info!(
            addr = %self.addr,
            "Starting HTTP server for rate limit service with graceful shutdown"
        );

        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            e.into()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{NETWORK_ESCALATION_PENALTY, X_USER_ID};
    use crate::ratelimit::{
        BackoffPolicy, LimiterOptions, ManualClock, Tier, TierLimit, TierTable,
        DEFAULT_MAX_BACKOFF_MS,
    };
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use serde_json::Value;
    use std::time::Duration;
    use tower::ServiceExt;

    const T0: u64 = 1_700_000_000_000;

    fn test_router() -> (Router, Arc<RateLimiter>) {
        let (app, limiter, _) = test_router_with(DEFAULT_MAX_BACKOFF_MS, EnforceOptions::default());
        (app, limiter)
    }

    /// Router with a 2 per minute admin tier, no jitter and a frozen clock.
    fn test_router_with(
        max_backoff_ms: u64,
        enforcement: EnforceOptions,
    ) -> (Router, Arc<RateLimiter>, Arc<ManualClock>) {
        let mut tiers = TierTable::new();
        tiers.set(Tier::Admin, TierLimit::new(2, Duration::from_secs(60)));
        let options = LimiterOptions {
            backoff: BackoffPolicy::new(max_backoff_ms, 0.0),
            ..Default::default()
        };
        let clock = Arc::new(ManualClock::new(T0));
        let limiter =
            Arc::new(RateLimiter::with_options(tiers, options).with_clock(clock.clone()));
        (build_router_with(limiter.clone(), enforcement), limiter, clock)
    }

    async fn get_status(app: &Router, request: Request<Body>) -> StatusCode {
        app.clone().oneshot(request).await.unwrap().status()
    }

    fn check_request(body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/v1/check")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn admin_request(method: &str, uri: &str, client: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("x-forwarded-for", client)
            .body(Body::empty())
            .unwrap()
    }

    async fn json_body(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_server_creation() {
        let addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();
        let rate_limiter = Arc::new(RateLimiter::new());
        let _server = HttpServer::new(addr, rate_limiter);
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _) = test_router();
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["status"], "healthy");
    }

    #[tokio::test]
    async fn test_check_returns_decision() {
        let (app, _) = test_router();
        let response = app
            .oneshot(check_request(r#"{"identifier":"1.2.3.4","tier":"upload"}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-ratelimit-remaining"], "4");
        assert!(response.headers().contains_key("x-ratelimit-reset"));

        let body = json_body(response).await;
        assert_eq!(body["allowed"], true);
        assert_eq!(body["remaining"], 4);
        assert_eq!(body["penaltyLevel"], 0);
        assert_eq!(body["isAttack"], false);
    }

    #[tokio::test]
    async fn test_check_defaults_to_api_tier() {
        let (app, limiter) = test_router();
        let response = app
            .oneshot(check_request(r#"{"identifier":"1.2.3.4"}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["remaining"], 99);
        assert!(limiter.entry_snapshot("1.2.3.4", Tier::Api).is_some());
    }

    #[tokio::test]
    async fn test_check_reports_rejection_in_body() {
        let (app, _) = test_router();

        for _ in 0..5 {
            let response = app
                .clone()
                .oneshot(check_request(r#"{"identifier":"u","tier":"upload"}"#))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let response = app
            .oneshot(check_request(r#"{"identifier":"u","tier":"upload"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("retry-after"));

        let body = json_body(response).await;
        assert_eq!(body["allowed"], false);
        assert_eq!(body["penaltyLevel"], 1);
        assert_eq!(body["retryAfter"], 120);
    }

    #[tokio::test]
    async fn test_check_unknown_tier_rejected() {
        let (app, limiter) = test_router();
        let response = app
            .oneshot(check_request(r#"{"identifier":"a","tier":"og-image"}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert!(body["error"].as_str().unwrap().contains("og-image"));
        assert_eq!(limiter.entry_count(), 0);
    }

    #[tokio::test]
    async fn test_check_empty_identifier_rejected() {
        let (app, _) = test_router();
        let response = app
            .oneshot(check_request(r#"{"identifier":""}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_admin_stats() {
        let (app, limiter) = test_router();
        limiter.check_rate_limit("someone", Tier::Search);

        let response = app
            .oneshot(admin_request("GET", "/v1/admin/stats", "10.0.0.1"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-ratelimit-remaining"], "1");

        let body = json_body(response).await;
        // The admin request itself is tracked too
        assert_eq!(body["totalEntries"], 2);
        assert_eq!(body["activeBackoffs"], 0);
        assert_eq!(body["highPenaltyEntries"], 0);
    }

    #[tokio::test]
    async fn test_admin_reset() {
        let (app, limiter) = test_router();
        for _ in 0..6 {
            limiter.check_rate_limit("203.0.113.5", Tier::Upload);
        }
        assert!(!limiter.check_rate_limit("203.0.113.5", Tier::Upload).allowed);

        let response = app
            .clone()
            .oneshot(admin_request(
                "DELETE",
                "/v1/admin/limits/upload/203.0.113.5",
                "10.0.0.1",
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(limiter.check_rate_limit("203.0.113.5", Tier::Upload).allowed);

        let response = app
            .oneshot(admin_request("DELETE", "/v1/admin/limits/bogus/x", "10.0.0.1"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_admin_routes_are_rate_limited() {
        let (app, limiter) = test_router();

        for _ in 0..2 {
            let response = app
                .clone()
                .oneshot(admin_request("GET", "/v1/admin/stats", "198.51.100.2"))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let response = app
            .clone()
            .oneshot(admin_request("GET", "/v1/admin/stats", "198.51.100.2"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(response.headers().contains_key("retry-after"));
        assert_eq!(response.headers()["x-ratelimit-remaining"], "0");

        let body = json_body(response).await;
        assert!(body["error"]
            .as_str()
            .unwrap()
            .starts_with("Rate limit exceeded. Please try again in"));
        assert_eq!(body["penaltyLevel"], 1);
        assert_eq!(body["retryAfterHuman"], "2 minutes");

        // Another client is unaffected
        let response = app
            .oneshot(admin_request("GET", "/v1/admin/stats", "198.51.100.3"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let entry = limiter.entry_snapshot("198.51.100.2", Tier::Admin).unwrap();
        assert_eq!(entry.violations(), 1);
    }

    #[tokio::test]
    async fn test_dry_run_skips_rate_limiting() {
        let (app, limiter) = test_router();

        for _ in 0..5 {
            let status = get_status(
                &app,
                admin_request("GET", "/v1/admin/stats?dry-run=true", "198.51.100.2"),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
        }
        assert!(limiter.entry_snapshot("198.51.100.2", Tier::Admin).is_none());

        // Any other value is rate limited as usual
        let response = app
            .oneshot(admin_request("GET", "/v1/admin/stats?dry-run=no", "198.51.100.2"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-ratelimit-remaining"], "1");
    }

    #[tokio::test]
    async fn test_exempt_paths_skip_rate_limiting() {
        let enforcement = EnforceOptions {
            exempt_paths: vec!["/v1/admin/stats".to_string()],
            ..Default::default()
        };
        let (app, limiter, _) = test_router_with(DEFAULT_MAX_BACKOFF_MS, enforcement);

        for _ in 0..5 {
            let status =
                get_status(&app, admin_request("GET", "/v1/admin/stats", "198.51.100.2")).await;
            assert_eq!(status, StatusCode::OK);
        }
        assert_eq!(limiter.entry_count(), 0);
    }

    #[tokio::test]
    async fn test_user_limit_spans_devices() {
        let (app, _) = test_router();

        let with_user = |client: &str| {
            let mut request = admin_request("GET", "/v1/admin/stats", client);
            request
                .headers_mut()
                .insert(X_USER_ID, "42".parse().unwrap());
            request
        };

        assert_eq!(get_status(&app, with_user("192.0.2.1")).await, StatusCode::OK);
        assert_eq!(get_status(&app, with_user("192.0.2.2")).await, StatusCode::OK);
        assert_eq!(
            get_status(&app, with_user("192.0.2.3")).await,
            StatusCode::TOO_MANY_REQUESTS
        );

        // The same device without a user id is fine
        assert_eq!(
            get_status(&app, admin_request("GET", "/v1/admin/stats", "192.0.2.3")).await,
            StatusCode::OK
        );
    }

    #[tokio::test]
    async fn test_network_limit_after_device_escalation() {
        let enforcement = EnforceOptions {
            network_limit: TierLimit::new(1, Duration::from_secs(60)),
            ..Default::default()
        };
        // Backoff capped at two windows so penalty 2 survives the lockout
        let (app, limiter, clock) = test_router_with(120_000, enforcement);
        let device = "198.51.100.2";

        for _ in 0..3 {
            limiter.check_rate_limit(device, Tier::Admin);
        }
        clock.set(T0 + 120_000);
        for _ in 0..3 {
            limiter.check_rate_limit(device, Tier::Admin);
        }
        let entry = limiter.entry_snapshot(device, Tier::Admin).unwrap();
        assert_eq!(entry.penalty_level(), NETWORK_ESCALATION_PENALTY);
        clock.set(entry.backoff_until());

        // First request spends the network quota
        let response = app
            .clone()
            .oneshot(admin_request("GET", "/v1/admin/stats", device))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .clone()
            .oneshot(admin_request("GET", "/v1/admin/stats", device))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(response.headers().contains_key("x-security-warning"));
        let body = json_body(response).await;
        assert!(body["error"]
            .as_str()
            .unwrap()
            .starts_with("Suspicious activity detected"));
        assert_eq!(body["penaltyLevel"], 1);

        // A clean device on the same network skips the network layer
        let status =
            get_status(&app, admin_request("GET", "/v1/admin/stats", "198.51.100.9")).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_serve_with_shutdown() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let server = HttpServer::new(addr, Arc::new(RateLimiter::new()));
        tokio_test::assert_ok!(server.serve_with_shutdown(async {}).await);
    }
}
