use axum::extract::{Request, State};
use axum::http::{StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum_extra::headers::authorization::Basic;
use axum_extra::headers::{Authorization, HeaderMapExt};
use tracing::warn;

use crate::server::AppState;

pub const REALM: &str = "terminal";

/// Basic auth gate for the page and the WebSocket upgrade.
///
/// Pass-through when the server has no credentials configured.
pub async fn basic_auth(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let config = &state.config;
    if !config.auth_enabled() {
        return next.run(request).await;
    }

    match request.headers().typed_get::<Authorization<Basic>>() {
        Some(Authorization(credentials))
            if credentials.username() == config.username
                && credentials.password() == config.password =>
        {
            next.run(request).await
        }
        Some(Authorization(credentials)) => {
            warn!(username = %credentials.username(), "rejected basic auth credentials");
            unauthorized()
        }
        None => unauthorized(),
    }
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(
            header::WWW_AUTHENTICATE,
            format!("Basic realm=\"{REALM}\""),
        )],
        "Unauthorized",
    )
        .into_response()
}
