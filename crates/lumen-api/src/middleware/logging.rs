use axum::{extract::Request, middleware::Next, response::Response};
use std::time::Instant;

use crate::state::USER_HEADER;

/// Request logging middleware
pub async fn log_request(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let uri = req.uri().clone();
    let user = req
        .headers()
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-")
        .to_string();
    let start = Instant::now();

    let response = next.run(req).await;

    let status = response.status();
    // SSE responses return at once; this is time to first byte for them
    let duration_ms = start.elapsed().as_millis() as u64;
    if status.is_server_error() {
        tracing::warn!(%method, %uri, %status, user = %user, duration_ms, "Request failed");
    } else {
        tracing::info!(%method, %uri, %status, user = %user, duration_ms, "Request processed");
    }

    response
}
