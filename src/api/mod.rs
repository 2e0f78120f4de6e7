pub mod error;
mod handlers;
pub mod origin;
mod web;

use axum::{
    extract::DefaultBodyLimit,
    http::{header, HeaderName, HeaderValue, Method},
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::job::JobRunner;
use crate::session::SessionRegistry;
use crate::shutdown::ShutdownCoordinator;

use handlers::*;

/// Request bodies are three short strings; anything larger is refused.
const MAX_BODY_BYTES: usize = 64 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub sessions: SessionRegistry,
    pub runner: JobRunner,
    pub shutdown: ShutdownCoordinator,
}

impl AppState {
    /// Orderly shutdown of the session side of the server.
    ///
    /// Closes the registry and cancels running jobs, waits up to `grace` for
    /// their runners to publish the final `error` event to every subscriber,
    /// then tells the remaining WebSocket handlers to close. Returns `false`
    /// if some runner was still active when the grace period ran out.
    pub async fn wind_down(&self, grace: Duration) -> bool {
        let cancelled = self.sessions.drain();
        if cancelled > 0 {
            tracing::info!(cancelled, "cancelled running analyses");
        }
        let finished = self.runner.shutdown(grace).await;
        self.shutdown.shutdown();
        finished
    }
}

pub(crate) fn get_session(
    sessions: &SessionRegistry,
    id: &str,
) -> Result<crate::session::Session, error::ApiError> {
    sessions
        .get(id)
        .ok_or_else(|| error::ApiError::SessionNotFound(id.to_string()))
}

/// Configuration for the HTTP/WS router.
///
/// Controls CORS, rate limiting, and origin checks.
/// Use `RouterConfig::default()` in tests for a minimal setup.
pub struct RouterConfig {
    pub bind: SocketAddr,
    pub cors_origins: Vec<String>,
    pub rate_limit: Option<u32>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 8080)),
            cors_origins: vec![],
            rate_limit: None,
        }
    }
}

pub fn router(state: AppState, config: RouterConfig) -> Router {
    let api_routes = Router::new()
        .route("/api/analyze", post(analyze))
        .route("/api/sessions", get(session_list))
        .route("/api/session/{id}", get(session_get))
        .route("/api/session/{id}/cancel", post(session_cancel))
        .with_state(state.clone());

    // Rate limiting keys on the peer address, so the server must be started
    // with `into_make_service_with_connect_info::<SocketAddr>()`.
    let api_routes = match config.rate_limit.filter(|rps| *rps > 0) {
        Some(rps) => {
            use tower_governor::{
                governor::GovernorConfigBuilder, key_extractor::PeerIpKeyExtractor, GovernorLayer,
            };
            let governor_conf = GovernorConfigBuilder::default()
                .per_millisecond((1000 / u64::from(rps)).max(1))
                .burst_size(rps)
                .key_extractor(PeerIpKeyExtractor)
                .finish();
            match governor_conf {
                Some(conf) => api_routes.layer(GovernorLayer::new(Arc::new(conf))),
                None => {
                    tracing::warn!(rps, "invalid rate limit, API requests are not limited");
                    api_routes
                }
            }
        }
        None => api_routes,
    };

    // No authentication, so protect subscribers against cross-site
    // WebSocket hijacking by validating the Origin header on upgrades.
    let allowed_origins = origin::allowed_origins(config.bind.port(), &config.cors_origins);
    let ws_routes = Router::new()
        .route("/ws/{id}", get(session_ws))
        .with_state(state)
        .layer(axum::middleware::from_fn(move |req, next| {
            let origins = allowed_origins.clone();
            origin::check_ws_origin(origins, req, next)
        }));

    let router = Router::new()
        .route("/", get(web::index))
        .route("/static/{*path}", get(web::static_asset))
        .route("/health", get(health))
        .merge(api_routes)
        .merge(ws_routes)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("x-frame-options"),
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("x-content-type-options"),
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("referrer-policy"),
            HeaderValue::from_static("no-referrer"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("content-security-policy"),
            HeaderValue::from_static(
                "default-src 'self'; script-src 'self'; style-src 'self'; \
                 connect-src 'self'; img-src 'self' data:; frame-ancestors 'none'"
            ),
        ));

    // Conditionally apply CORS if origins are configured.
    if config.cors_origins.is_empty() {
        router
    } else {
        let origins: Vec<HeaderValue> = config.cors_origins.iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        router.layer(
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
                .allow_headers([header::CONTENT_TYPE])
        )
    }
}
