//! HTTP surface for the Lumen chat engine
//!
//! Posting a message returns at once with the queued turn; the reply arrives
//! over the thread's SSE stream while a job worker produces it.

pub mod config;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod routes;
pub mod state;

use std::time::Duration;

use axum::{
    http::{HeaderName, HeaderValue, Method},
    middleware as axum_middleware,
    routing::get,
    Json, Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use utoipa::OpenApi;

use crate::config::CorsConfig;
use crate::handlers::stream;
use crate::middleware::logging;
use crate::routes::{health, messages, threads};
use crate::state::{AppState, USER_HEADER};

#[derive(OpenApi)]
#[openapi(
    paths(
        health::health_check,
        threads::create_thread,
        threads::list_threads,
        threads::get_thread,
        messages::list_messages,
        messages::send_message,
        stream::stream_thread,
    ),
    components(schemas(
        health::HealthResponse,
        threads::CreateThreadRequest,
        threads::ThreadResponse,
        threads::ListThreadsResponse,
        messages::MessageResponse,
        messages::ListMessagesResponse,
        messages::SendMessageRequest,
        messages::SendMessageResponse,
    )),
    tags(
        (name = "health", description = "Service status"),
        (name = "threads", description = "Chat threads"),
        (name = "messages", description = "Chat messages and turn events")
    )
)]
pub struct ApiDoc;

pub fn build_router(state: AppState) -> Router {
    let timeout = Duration::from_secs(state.config.server.request_timeout_secs.max(1));

    let api_routes = Router::new()
        .route("/health", get(health::health_check))
        .route("/threads", get(threads::list_threads).post(threads::create_thread))
        .route("/threads/:thread_id", get(threads::get_thread))
        .route(
            "/threads/:thread_id/messages",
            get(messages::list_messages).post(messages::send_message),
        )
        .route("/api/docs/openapi.json", get(|| async { Json(ApiDoc::openapi()) }))
        .layer(TimeoutLayer::new(timeout));

    // Long-lived; kept out of the request timeout
    let stream_routes = Router::new().route("/threads/:thread_id/stream", get(stream::stream_thread));

    Router::new()
        .merge(api_routes)
        .merge(stream_routes)
        .layer(axum_middleware::from_fn(logging::log_request))
        .layer(build_cors_layer(&state.config.cors))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn build_cors_layer(config: &CorsConfig) -> CorsLayer {
    if !config.enabled {
        return CorsLayer::new();
    }

    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            axum::http::header::CONTENT_TYPE,
            axum::http::header::ACCEPT,
            HeaderName::from_static(USER_HEADER),
        ]);

    if config.origins.iter().any(|o| o == "*") {
        cors.allow_origin(Any)
    } else {
        let origins: Vec<HeaderValue> = config
            .origins
            .iter()
            .filter_map(|origin| origin.parse::<HeaderValue>().ok())
            .collect();
        cors.allow_origin(origins)
    }
}
