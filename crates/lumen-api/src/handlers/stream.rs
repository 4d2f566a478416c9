use axum::{
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
};
use futures::stream::Stream;
use lumen_types::SseMessage;
use std::convert::Infallible;
use uuid::Uuid;

use crate::{
    error::ApiResult,
    state::{AppState, UserId},
};

/// Whether an event on the user channel belongs to `thread_id`
fn for_thread(msg: &SseMessage, thread_id: Uuid) -> bool {
    msg.data
        .get("thread_id")
        .and_then(|v| v.as_str())
        .and_then(|v| Uuid::parse_str(v).ok())
        == Some(thread_id)
}

fn to_event(msg: &SseMessage) -> Option<Event> {
    match Event::default().event(msg.event.as_str()).json_data(&msg.data) {
        Ok(event) => Some(event),
        Err(e) => {
            tracing::warn!(error = %e, event = msg.event.as_str(), "failed to encode sse event");
            None
        }
    }
}

/// Subscribe to the turn events of one thread using Server-Sent Events
///
/// Emits `message_created`, `message_delta`, `message_done` and `message_error`,
/// each carrying `turn_id` and `attempt` so clients can discard stale attempts.
#[utoipa::path(
    get,
    path = "/threads/{thread_id}/stream",
    params(
        ("x-user-id" = Uuid, Header, description = "Caller"),
        ("thread_id" = Uuid, Path, description = "Thread ID")
    ),
    responses(
        (status = 200, description = "Event stream", content_type = "text/event-stream"),
        (status = 403, description = "Thread belongs to another user"),
        (status = 404, description = "Thread not found")
    ),
    tag = "messages"
)]
pub async fn stream_thread(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Path(thread_id): Path<Uuid>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    state.engine.chat.get_thread(user_id, thread_id).await?;

    let mut subscription = state.engine.notifier.subscribe(user_id);
    tracing::debug!(%thread_id, subscriber = subscription.id(), "sse stream opened");

    let events = async_stream::stream! {
        while let Some(msg) = subscription.recv().await {
            if !for_thread(&msg, thread_id) {
                continue;
            }
            if let Some(event) = to_event(&msg) {
                yield Ok::<Event, Infallible>(event);
            }
        }
        tracing::debug!(%thread_id, dropped = subscription.dropped(), "sse stream closed");
    };

    Ok(Sse::new(events).keep_alive(KeepAlive::new().interval(state.keepalive()).text("keepalive")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumen_types::SseEvent;
    use serde_json::json;

    #[test]
    fn test_events_are_filtered_by_thread() {
        let thread_id = Uuid::new_v4();
        let mine = SseMessage::new("user:1", SseEvent::MessageDone, json!({"thread_id": thread_id}));
        let other = SseMessage::new("user:1", SseEvent::MessageDone, json!({"thread_id": Uuid::new_v4()}));
        let untagged = SseMessage::new("user:1", SseEvent::MessageDone, json!({}));
        assert!(for_thread(&mine, thread_id));
        assert!(!for_thread(&other, thread_id));
        assert!(!for_thread(&untagged, thread_id));
    }
}
