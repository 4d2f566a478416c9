use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use lumen_types::Thread;
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use crate::{
    error::ApiResult,
    state::{AppState, UserId},
};

#[derive(Debug, Default, Serialize, Deserialize, ToSchema)]
pub struct CreateThreadRequest {
    #[serde(default)]
    pub title: Option<String>,
    /// Bind the thread to one of the caller's learning paths
    #[serde(default)]
    pub path_id: Option<Uuid>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ThreadResponse {
    pub thread_id: Uuid,
    pub user_id: Uuid,
    pub title: String,
    pub path_id: Option<Uuid>,
    pub message_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Thread> for ThreadResponse {
    fn from(thread: Thread) -> Self {
        Self {
            thread_id: thread.id,
            user_id: thread.user_id,
            title: thread.title,
            path_id: thread.path_id,
            message_count: thread.next_seq - 1,
            created_at: thread.created_at,
            updated_at: thread.updated_at,
        }
    }
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct ListThreadsQuery {
    /// Maximum number of threads to return (default: 20)
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    20
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ListThreadsResponse {
    pub threads: Vec<ThreadResponse>,
    pub has_more: bool,
}

/// Create a new thread
#[utoipa::path(
    post,
    path = "/threads",
    request_body = CreateThreadRequest,
    params(("x-user-id" = Uuid, Header, description = "Caller")),
    responses(
        (status = 201, description = "Thread created", body = ThreadResponse),
        (status = 403, description = "Path belongs to another user"),
        (status = 404, description = "Path not found")
    ),
    tag = "threads"
)]
pub async fn create_thread(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Json(req): Json<CreateThreadRequest>,
) -> ApiResult<(StatusCode, Json<ThreadResponse>)> {
    let thread = state.engine.chat.create_thread(user_id, req.title, req.path_id).await?;
    Ok((StatusCode::CREATED, Json(thread.into())))
}

/// List the caller's threads, most recently active first
#[utoipa::path(
    get,
    path = "/threads",
    params(("x-user-id" = Uuid, Header, description = "Caller"), ListThreadsQuery),
    responses(
        (status = 200, description = "List of threads", body = ListThreadsResponse)
    ),
    tag = "threads"
)]
pub async fn list_threads(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Query(query): Query<ListThreadsQuery>,
) -> ApiResult<Json<ListThreadsResponse>> {
    let limit = query.limit.clamp(1, 100);
    let threads = state.engine.chat.list_threads(user_id, limit).await?;

    let has_more = threads.len() == limit;
    Ok(Json(ListThreadsResponse {
        threads: threads.into_iter().map(ThreadResponse::from).collect(),
        has_more,
    }))
}

/// Get a specific thread by ID
#[utoipa::path(
    get,
    path = "/threads/{thread_id}",
    params(
        ("x-user-id" = Uuid, Header, description = "Caller"),
        ("thread_id" = Uuid, Path, description = "Thread ID")
    ),
    responses(
        (status = 200, description = "Thread details", body = ThreadResponse),
        (status = 403, description = "Thread belongs to another user"),
        (status = 404, description = "Thread not found")
    ),
    tag = "threads"
)]
pub async fn get_thread(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Path(thread_id): Path<Uuid>,
) -> ApiResult<Json<ThreadResponse>> {
    let thread = state.engine.chat.get_thread(user_id, thread_id).await?;
    Ok(Json(thread.into()))
}
