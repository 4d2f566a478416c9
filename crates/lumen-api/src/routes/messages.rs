use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use lumen_engine::PostedTurn;
use lumen_types::{ChatMessage, MessageRole, MessageStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use crate::{
    error::ApiResult,
    state::{AppState, UserId},
};

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct MessageResponse {
    pub message_id: Uuid,
    pub thread_id: Uuid,
    pub seq: i64,
    #[schema(value_type = String, example = "assistant")]
    pub role: MessageRole,
    #[schema(value_type = String, example = "done")]
    pub status: MessageStatus,
    pub content: String,
    #[schema(value_type = Object)]
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<ChatMessage> for MessageResponse {
    fn from(message: ChatMessage) -> Self {
        Self {
            message_id: message.id,
            thread_id: message.thread_id,
            seq: message.seq,
            role: message.role,
            status: message.status,
            content: message.content,
            metadata: message.metadata,
            created_at: message.created_at,
            updated_at: message.updated_at,
        }
    }
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct ListMessagesQuery {
    /// Maximum number of messages (default: 50)
    #[serde(default = "default_limit")]
    pub limit: usize,
    /// Only messages with a lower seq; the newest page when absent
    pub before_seq: Option<i64>,
}

fn default_limit() -> usize {
    50
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ListMessagesResponse {
    pub messages: Vec<MessageResponse>,
    pub has_more: bool,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SendMessageRequest {
    pub content: String,
}

/// Accepted turn; the reply streams over `GET /threads/{thread_id}/stream`
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SendMessageResponse {
    pub turn_id: Uuid,
    pub job_id: Uuid,
    pub user_message: MessageResponse,
    pub assistant_message: MessageResponse,
}

impl From<PostedTurn> for SendMessageResponse {
    fn from(posted: PostedTurn) -> Self {
        Self {
            turn_id: posted.turn.id,
            job_id: posted.job_id,
            user_message: posted.user_message.into(),
            assistant_message: posted.assistant_message.into(),
        }
    }
}

/// List messages in a thread, ascending by seq
#[utoipa::path(
    get,
    path = "/threads/{thread_id}/messages",
    params(
        ("x-user-id" = Uuid, Header, description = "Caller"),
        ("thread_id" = Uuid, Path, description = "Thread ID"),
        ListMessagesQuery
    ),
    responses(
        (status = 200, description = "List of messages", body = ListMessagesResponse),
        (status = 403, description = "Thread belongs to another user"),
        (status = 404, description = "Thread not found")
    ),
    tag = "messages"
)]
pub async fn list_messages(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Path(thread_id): Path<Uuid>,
    Query(query): Query<ListMessagesQuery>,
) -> ApiResult<Json<ListMessagesResponse>> {
    let limit = query.limit.clamp(1, 200);
    let messages = state
        .engine
        .chat
        .list_messages(user_id, thread_id, query.before_seq, limit)
        .await?;

    // Pages run backwards from the newest message; seq 1 is the oldest
    let has_more = messages.first().map(|m| m.seq > 1).unwrap_or(false);
    Ok(Json(ListMessagesResponse {
        messages: messages.into_iter().map(MessageResponse::from).collect(),
        has_more,
    }))
}

/// Post a user message; the assistant reply is produced by a background job
#[utoipa::path(
    post,
    path = "/threads/{thread_id}/messages",
    request_body = SendMessageRequest,
    params(
        ("x-user-id" = Uuid, Header, description = "Caller"),
        ("thread_id" = Uuid, Path, description = "Thread ID")
    ),
    responses(
        (status = 202, description = "Turn queued", body = SendMessageResponse),
        (status = 400, description = "Empty or oversized message"),
        (status = 403, description = "Thread belongs to another user"),
        (status = 404, description = "Thread not found")
    ),
    tag = "messages"
)]
pub async fn send_message(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Path(thread_id): Path<Uuid>,
    Json(req): Json<SendMessageRequest>,
) -> ApiResult<(StatusCode, Json<SendMessageResponse>)> {
    let posted = state.engine.chat.post_message(user_id, thread_id, &req.content).await?;
    Ok((StatusCode::ACCEPTED, Json(posted.into())))
}
