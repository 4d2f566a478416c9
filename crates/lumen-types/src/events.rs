use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// SSE event names emitted for a running turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SseEvent {
    MessageCreated,
    MessageDelta,
    MessageDone,
    MessageError,
}

impl SseEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            SseEvent::MessageCreated => "message_created",
            SseEvent::MessageDelta => "message_delta",
            SseEvent::MessageDone => "message_done",
            SseEvent::MessageError => "message_error",
        }
    }

    /// Terminal events are never dropped under backpressure
    pub fn is_sticky(&self) -> bool {
        matches!(self, SseEvent::MessageDone | SseEvent::MessageError)
    }
}

/// Envelope delivered to subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SseMessage {
    pub channel: String,
    pub event: SseEvent,
    pub data: Value,
}

impl SseMessage {
    pub fn new(channel: impl Into<String>, event: SseEvent, data: Value) -> Self {
        Self {
            channel: channel.into(),
            event,
            data,
        }
    }
}

/// Channel carrying a user's notifications
pub fn user_channel(user_id: Uuid) -> String {
    format!("user:{}", user_id)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageDeltaData {
    pub thread_id: Uuid,
    pub message_id: Uuid,
    pub delta: String,
    pub delta_seq: u64,
    pub content_len: usize,
    pub turn_id: Uuid,
    pub attempt: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_serialization() {
        let msg = SseMessage::new("user:1", SseEvent::MessageDelta, serde_json::json!({"delta": "hi"}));
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["event"], "message_delta");
        assert_eq!(value["channel"], "user:1");
        assert_eq!(value["data"]["delta"], "hi");
    }

    #[test]
    fn test_sticky_events() {
        assert!(SseEvent::MessageDone.is_sticky());
        assert!(SseEvent::MessageError.is_sticky());
        assert!(!SseEvent::MessageDelta.is_sticky());
        assert!(!SseEvent::MessageCreated.is_sticky());
    }
}
