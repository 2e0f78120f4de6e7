use axum::{extract::Request, middleware::Next, response::Response};
use super::error::ApiError;

/// Origins a browser page served by this server would send: the bound port
/// on every loopback spelling, plus any configured extras.
pub fn allowed_origins(port: u16, extra: &[String]) -> Vec<String> {
    let mut origins = vec![
        format!("http://127.0.0.1:{}", port),
        format!("http://localhost:{}", port),
        format!("http://[::1]:{}", port),
    ];
    origins.extend(extra.iter().cloned());
    origins
}

/// Check the Origin header on WebSocket upgrade requests.
///
/// The server has no authentication, so a page on another site could
/// otherwise open a subscriber socket through the user's browser (CSWSH).
///
/// - Non-WebSocket requests pass through (CORS handles HTTP).
/// - No Origin header passes through (non-browser clients).
/// - An Origin on the allowed list passes through.
/// - Anything else is rejected with 403.
pub async fn check_ws_origin(
    allowed_origins: Vec<String>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let is_ws_upgrade = req.headers()
        .get("upgrade")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);

    if !is_ws_upgrade {
        return Ok(next.run(req).await);
    }

    let origin = match req.headers().get("origin").and_then(|v| v.to_str().ok()) {
        None => return Ok(next.run(req).await),
        Some(o) => o.to_string(),
    };

    if allowed_origins.iter().any(|allowed| allowed == &origin) {
        return Ok(next.run(req).await);
    }

    tracing::warn!(%origin, "rejected cross-origin WebSocket upgrade");
    Err(ApiError::OriginNotAllowed)
}
