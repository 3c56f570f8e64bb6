//! HTTP side of the server: routes, auth, and the WebSocket entrypoint.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use axum::http::StatusCode;
use axum::middleware;
use axum::routing::get;
use tokio::net::TcpListener;
use tower_http::trace::{MakeSpan, TraceLayer};
use tracing::info;
use uuid::Uuid;

use crate::config::ServerConfig;

mod auth;
mod connect;
mod connection;
mod handler;
mod page;
mod query;

pub use auth::REALM;
pub use connect::{ConnectOptions, resolve_session};
pub use connection::ConnectionState;
pub use query::ConnectQuery;

/// Shared state for all routes
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
}

/// Custom span maker that adds a unique request ID to each incoming request
#[derive(Clone)]
struct RequestIdMakeSpan;

impl<B> MakeSpan<B> for RequestIdMakeSpan {
    fn make_span(&mut self, request: &axum::http::Request<B>) -> tracing::Span {
        let request_id = Uuid::new_v4().to_string();
        tracing::info_span!(
            "request",
            method = %request.method(),
            uri = %request.uri(),
            request_id = %request_id,
        )
    }
}

/// Build the application router. `config` must pass [`ServerConfig::validate`].
pub fn router(config: ServerConfig) -> Router {
    let ws_path = config.path.clone();
    let state = AppState {
        config: Arc::new(config),
    };

    Router::new()
        .route("/", get(page::index))
        .route(&ws_path, get(handler::websocket_handler))
        // Only the routes above are gated
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::basic_auth,
        ))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http().make_span_with(RequestIdMakeSpan))
        .with_state(state)
}

async fn health() -> StatusCode {
    StatusCode::OK
}

/// Bind the configured address and serve until Ctrl-C
pub async fn serve(config: ServerConfig) -> Result<()> {
    config.validate()?;
    let addr = format!("{}:{}", config.host, config.port)
        .parse::<SocketAddr>()
        .with_context(|| format!("invalid listen address {}:{}", config.host, config.port))?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    let actual_addr = listener.local_addr()?;

    info!(
        driver = %config.driver,
        shell = %config.shell,
        auth = config.auth_enabled(),
        read_only = config.read_only,
        "terminal server listening on http://{}",
        actual_addr
    );
    info!("WebSocket endpoint: ws://{}{}", actual_addr, config.path);

    let shutdown_signal = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("received shutdown signal");
    };

    axum::serve(listener, router(config))
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("server error")
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, header};
    use data_encoding::BASE64;
    use tower::ServiceExt;

    fn with_auth() -> Router {
        router(ServerConfig {
            username: "admin".into(),
            password: "secret".into(),
            ..Default::default()
        })
    }

    fn basic(user: &str, pass: &str) -> String {
        format!("Basic {}", BASE64.encode(format!("{user}:{pass}").as_bytes()))
    }

    #[tokio::test]
    async fn test_health_is_public() {
        let resp = with_auth()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_page_without_auth_configured() {
        let resp = router(ServerConfig::default())
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        assert!(String::from_utf8_lossy(&body).contains("WS_PATH"));
    }

    #[tokio::test]
    async fn test_missing_credentials_challenge() {
        let resp = with_auth()
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            resp.headers().get(header::WWW_AUTHENTICATE).unwrap(),
            "Basic realm=\"terminal\""
        );
    }

    #[tokio::test]
    async fn test_wrong_credentials_rejected() {
        let resp = with_auth()
            .oneshot(
                Request::get("/")
                    .header(header::AUTHORIZATION, basic("admin", "wrong"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_correct_credentials_pass() {
        let resp = with_auth()
            .oneshot(
                Request::get("/")
                    .header(header::AUTHORIZATION, basic("admin", "secret"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_ws_route_is_gated() {
        let resp = with_auth()
            .oneshot(Request::get("/ws").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }
}
