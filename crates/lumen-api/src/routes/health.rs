use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::state::AppState;

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub services: HashMap<String, String>,
}

/// Health check endpoint
///
/// Returns the health status of the API and its dependencies
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse)
    ),
    tag = "health"
)]
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let mut services = HashMap::new();

    // A one-row read against the thread store
    let storage = match state.engine.stores.threads.list_threads(Uuid::nil(), 1).await {
        Ok(_) => "connected",
        Err(e) => {
            tracing::warn!(error = %e, "storage health check failed");
            "disconnected"
        }
    };
    services.insert("storage".to_string(), storage.to_string());
    services.insert(
        "sse_subscribers".to_string(),
        state.engine.notifier.hub().subscriber_count().to_string(),
    );

    let status = if storage == "connected" { "healthy" } else { "degraded" };
    Json(HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        services,
    })
}
