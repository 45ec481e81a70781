//! HTTP surface: MJPEG stream, status, and control endpoints

pub mod handlers;
pub mod mjpeg;

use axum::{
    extract::{Request, State},
    http::{header::HOST, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::app_state::AppState;
use crate::config::ServerConfig;

/// Builds the application router
pub fn build_router(state: Arc<AppState>, server: &ServerConfig) -> Router {
    let trusted = Arc::new(TrustedHosts::new(&server.trusted_hosts));

    Router::new()
        .route("/", get(handlers::index))
        .route("/video_feed", get(handlers::video_feed))
        .route("/snapshot", get(handlers::snapshot))
        .route("/status", get(handlers::status))
        .route("/health", get(handlers::health))
        .route("/camera/restart", post(handlers::restart_camera))
        .route("/server/reload-config", post(handlers::reload_config))
        .route("/server/shutdown", post(handlers::shutdown))
        .route("/server/pid", get(handlers::process_info))
        .route("/config", get(handlers::get_config).put(handlers::update_config))
        .layer(middleware::from_fn_with_state(trusted, require_trusted_host))
        .layer(cors_layer(&server.cors_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serves until shutdown is requested through `state`
pub async fn serve(state: Arc<AppState>, server: &ServerConfig) -> anyhow::Result<()> {
    let app = build_router(Arc::clone(&state), server);

    let addr = server.bind_addr();
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, "Starting web server");

    let mut shutdown = state.shutdown_signal();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            // An error means the sender is gone, which only happens at exit
            let _ = shutdown.wait_for(|stopping| *stopping).await;
        })
        .await?;

    info!("Web server stopped");
    Ok(())
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.is_empty() || origins.iter().any(|origin| origin == "*") {
        return CorsLayer::permissive();
    }

    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed))
        .allow_methods(Any)
        .allow_headers(Any)
}

/// Host-header allow list; `*` accepts anything and `*.domain` matches subdomains
#[derive(Debug, Clone)]
pub struct TrustedHosts {
    patterns: Option<Vec<String>>,
}

impl TrustedHosts {
    pub fn new(hosts: &[String]) -> Self {
        if hosts.is_empty() || hosts.iter().any(|host| host == "*") {
            return Self { patterns: None };
        }

        Self {
            patterns: Some(hosts.iter().map(|host| host.to_ascii_lowercase()).collect()),
        }
    }

    pub fn allows(&self, host: Option<&str>) -> bool {
        let Some(patterns) = &self.patterns else {
            return true;
        };
        let Some(host) = host else {
            return false;
        };

        let host = strip_port(host).to_ascii_lowercase();
        patterns.iter().any(|pattern| match pattern.strip_prefix("*.") {
            Some(domain) => host == domain || host.ends_with(&format!(".{}", domain)),
            None => host == *pattern,
        })
    }
}

fn strip_port(host: &str) -> &str {
    // IPv6 literal: [::1]:8000
    if let Some(rest) = host.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    host.rsplit_once(':').map_or(host, |(name, _)| name)
}

async fn require_trusted_host(
    State(trusted): State<Arc<TrustedHosts>>,
    request: Request,
    next: Next,
) -> Response {
    let host = request
        .headers()
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .or_else(|| request.uri().host());

    if trusted.allows(host) {
        return next.run(request).await;
    }

    warn!(host = ?host, "Rejected request with untrusted host");
    (StatusCode::BAD_REQUEST, "Invalid host header").into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hosts(list: &[&str]) -> TrustedHosts {
        TrustedHosts::new(&list.iter().map(|s| s.to_string()).collect::<Vec<_>>())
    }

    #[test]
    fn test_wildcard_allows_everything() {
        let trusted = hosts(&["*"]);
        assert!(trusted.allows(Some("anything:8000")));
        assert!(trusted.allows(None));
    }

    #[test]
    fn test_exact_and_subdomain_match() {
        let trusted = hosts(&["localhost", "*.example.com"]);
        assert!(trusted.allows(Some("localhost:8000")));
        assert!(trusted.allows(Some("cam.example.com")));
        assert!(trusted.allows(Some("example.com")));
        assert!(!trusted.allows(Some("evil.com")));
        assert!(!trusted.allows(Some("notexample.com")));
        assert!(!trusted.allows(None));
    }

    #[test]
    fn test_strip_port() {
        assert_eq!(strip_port("host:80"), "host");
        assert_eq!(strip_port("host"), "host");
        assert_eq!(strip_port("[::1]:8000"), "::1");
    }
}
