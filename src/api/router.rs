//! Router wiring, CORS, tracing and per-client rate limiting.

use std::num::NonZeroU32;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Request, State},
    http::{HeaderMap, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use governor::clock::{Clock, DefaultClock};
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::api::handlers::{
    ApiDoc, PAYER_ID_HEADER, health_check_handler, initiate_payment_handler,
    list_payments_handler, liveness_handler, mpesa_callback_handler, payment_status_handler,
    readiness_handler, retry_payment_handler,
};
use crate::app::AppState;
use crate::domain::{ErrorDetail, RateLimitResponse};

/// Per-client rate limit settings
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Sustained requests per second per client
    pub requests_per_second: u32,
    /// Burst capacity per client
    pub burst_size: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 10,
            burst_size: 20,
        }
    }
}

impl RateLimitConfig {
    /// Read settings from `RATE_LIMIT_RPS` / `RATE_LIMIT_BURST`, falling
    /// back to defaults for anything missing or unparseable
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            requests_per_second: std::env::var("RATE_LIMIT_RPS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.requests_per_second),
            burst_size: std::env::var("RATE_LIMIT_BURST")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.burst_size),
        }
    }

    fn quota(&self) -> Quota {
        let per_second = NonZeroU32::new(self.requests_per_second).unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(self.burst_size).unwrap_or(NonZeroU32::MIN);
        Quota::per_second(per_second).allow_burst(burst)
    }
}

type KeyedLimiter = RateLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>;

#[derive(Clone)]
struct RateLimitState {
    limiter: Arc<KeyedLimiter>,
    clock: DefaultClock,
}

impl RateLimitState {
    fn new(config: &RateLimitConfig) -> Self {
        Self {
            limiter: Arc::new(RateLimiter::keyed(config.quota())),
            clock: DefaultClock::default(),
        }
    }
}

/// Quota key for a request: the payer identity when present, else the
/// client address from the proxy chain.
fn client_key(headers: &HeaderMap) -> String {
    if let Some(payer) = headers.get(PAYER_ID_HEADER).and_then(|v| v.to_str().ok()) {
        let payer = payer.trim();
        if !payer.is_empty() {
            return format!("payer:{payer}");
        }
    }

    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|ip| format!("ip:{}", ip.trim()))
        .unwrap_or_else(|| "anonymous".to_string())
}

async fn rate_limit_middleware(
    State(rate_limit): State<RateLimitState>,
    request: Request,
    next: Next,
) -> Response {
    let key = client_key(request.headers());
    match rate_limit.limiter.check_key(&key) {
        Ok(_) => next.run(request).await,
        Err(not_until) => {
            let retry_after = not_until
                .wait_time_from(rate_limit.clock.now())
                .as_secs()
                .max(1);
            warn!(key = %key, retry_after = retry_after, "Rate limit exceeded");

            let body = Json(RateLimitResponse {
                error: ErrorDetail {
                    r#type: "rate_limited".to_string(),
                    message: "Too many requests".to_string(),
                },
                retry_after,
            });
            (
                StatusCode::TOO_MANY_REQUESTS,
                [(header::RETRY_AFTER, retry_after.to_string())],
                body,
            )
                .into_response()
        }
    }
}

/// Create the application router without rate limiting
pub fn create_router(state: Arc<AppState>) -> Router {
    build_router(state, None)
}

/// Create the application router with per-client rate limiting on the
/// payer-facing endpoints
pub fn create_router_with_rate_limit(state: Arc<AppState>, config: RateLimitConfig) -> Router {
    build_router(state, Some(config))
}

fn build_router(state: Arc<AppState>, rate_limit: Option<RateLimitConfig>) -> Router {
    let mut payer_routes = Router::new()
        .route("/payments/initiate", post(initiate_payment_handler))
        .route("/payments", get(list_payments_handler))
        .route(
            "/payments/{checkout_ref}/status",
            get(payment_status_handler),
        )
        .route("/payments/{payment_id}/retry", post(retry_payment_handler));

    if let Some(config) = rate_limit {
        info!(
            rps = config.requests_per_second,
            burst = config.burst_size,
            "Rate limiting enabled on payer endpoints"
        );
        payer_routes = payer_routes.layer(middleware::from_fn_with_state(
            RateLimitState::new(&config),
            rate_limit_middleware,
        ));
    }

    // The provider callback and the probes stay outside the limiter: Daraja
    // must receive its acknowledgment for every delivery attempt.
    let open_routes = Router::new()
        .route("/payments/callback", post(mpesa_callback_handler))
        .route("/health", get(health_check_handler))
        .route("/health/live", get(liveness_handler))
        .route("/health/ready", get(readiness_handler));

    Router::new()
        .merge(payer_routes)
        .merge(open_routes)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer())
        .with_state(state)
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
}
