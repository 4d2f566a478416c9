//! Turn notifications over SSE
//!
//! [`Notifier`] turns responder state changes into [`SseMessage`] envelopes on
//! the owning user's channel. Delivery goes to the local [`SseHub`] and, when a
//! bus is configured, to a `broadcast` channel that other nodes relay into
//! their own hubs with [`spawn_bus_relay`].

mod hub;

pub use hub::{SseHub, Subscription};

use std::sync::Arc;

use lumen_types::{user_channel, ChatMessage, MessageDeltaData, SseEvent, SseMessage};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::types::NotifierConfig;

/// Turn identity stamped on every event so clients can discard stale attempts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TurnRef {
    pub turn_id: Option<Uuid>,
    pub attempt: u32,
}

impl TurnRef {
    pub fn new(turn_id: Uuid, attempt: u32) -> Self {
        Self {
            turn_id: Some(turn_id),
            attempt,
        }
    }
}

#[derive(Clone)]
pub struct Notifier {
    hub: Arc<SseHub>,
    bus: Option<broadcast::Sender<SseMessage>>,
}

impl Notifier {
    pub fn new(hub: Arc<SseHub>) -> Self {
        Self { hub, bus: None }
    }

    pub fn from_config(config: &NotifierConfig) -> Self {
        let notifier = Self::new(SseHub::new(config.subscriber_buffer));
        if config.bus_capacity > 0 {
            let (tx, _) = broadcast::channel(config.bus_capacity);
            notifier.with_bus(tx)
        } else {
            notifier
        }
    }

    pub fn with_bus(mut self, bus: broadcast::Sender<SseMessage>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn hub(&self) -> &Arc<SseHub> {
        &self.hub
    }

    pub fn bus(&self) -> Option<&broadcast::Sender<SseMessage>> {
        self.bus.as_ref()
    }

    pub fn subscribe(&self, user_id: Uuid) -> Subscription {
        self.hub.subscribe(user_id)
    }

    pub fn publish(&self, msg: SseMessage) {
        if let Some(bus) = &self.bus {
            // no receivers is fine
            let _ = bus.send(msg.clone());
        }
        let delivered = self.hub.publish(&msg);
        debug!(event = msg.event.as_str(), channel = %msg.channel, delivered, "sse published");
    }

    pub fn message_created(&self, user_id: Uuid, message: &ChatMessage, turn: TurnRef) {
        self.publish(SseMessage::new(
            user_channel(user_id),
            SseEvent::MessageCreated,
            json!({
                "thread_id": message.thread_id,
                "message": message,
                "turn_id": turn.turn_id,
                "attempt": turn.attempt,
            }),
        ));
    }

    pub fn message_delta(&self, user_id: Uuid, data: MessageDeltaData) {
        let value = serde_json::to_value(&data).unwrap_or(Value::Null);
        self.publish(SseMessage::new(user_channel(user_id), SseEvent::MessageDelta, value));
    }

    pub fn message_done(
        &self,
        user_id: Uuid,
        thread_id: Uuid,
        message_id: Uuid,
        content: &str,
        metadata: &Value,
        turn: TurnRef,
    ) {
        self.publish(SseMessage::new(
            user_channel(user_id),
            SseEvent::MessageDone,
            json!({
                "thread_id": thread_id,
                "message_id": message_id,
                "content": content,
                "metadata": metadata,
                "turn_id": turn.turn_id,
                "attempt": turn.attempt,
            }),
        ));
    }

    pub fn message_error(
        &self,
        user_id: Uuid,
        thread_id: Uuid,
        message_id: Uuid,
        error: &str,
        turn: TurnRef,
    ) {
        self.publish(SseMessage::new(
            user_channel(user_id),
            SseEvent::MessageError,
            json!({
                "thread_id": thread_id,
                "message_id": message_id,
                "error": error,
                "turn_id": turn.turn_id,
                "attempt": turn.attempt,
            }),
        ));
    }
}

/// Forward every bus message into `hub` until the bus closes
pub fn spawn_bus_relay(mut rx: broadcast::Receiver<SseMessage>, hub: Arc<SseHub>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(msg) => {
                    hub.publish(&msg);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "sse bus relay lagged; messages skipped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn delta(thread_id: Uuid, n: u64) -> MessageDeltaData {
        MessageDeltaData {
            thread_id,
            message_id: Uuid::new_v4(),
            delta: format!("d{}", n),
            delta_seq: n,
            content_len: n as usize * 2,
            turn_id: Uuid::new_v4(),
            attempt: 0,
        }
    }

    #[tokio::test]
    async fn test_delta_payload_shape() {
        let notifier = Notifier::new(SseHub::new(8));
        let user = Uuid::new_v4();
        let mut sub = notifier.subscribe(user);
        notifier.message_delta(user, delta(Uuid::new_v4(), 3));
        let msg = sub.recv().await.unwrap();
        assert_eq!(msg.event, SseEvent::MessageDelta);
        assert_eq!(msg.channel, user_channel(user));
        assert_eq!(msg.data["delta_seq"], 3);
        assert_eq!(msg.data["content_len"], 6);
    }

    #[tokio::test]
    async fn test_bus_relay_feeds_remote_hub() {
        let (tx, _) = broadcast::channel(16);
        let local = Notifier::new(SseHub::new(8)).with_bus(tx.clone());
        let remote = SseHub::new(8);
        let relay = spawn_bus_relay(tx.subscribe(), remote.clone());

        let user = Uuid::new_v4();
        let mut remote_sub = remote.subscribe(user);
        let mut local_sub = local.subscribe(user);
        local.message_error(user, Uuid::new_v4(), Uuid::new_v4(), "boom", TurnRef::default());

        let got = tokio::time::timeout(Duration::from_secs(1), remote_sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.event, SseEvent::MessageError);
        assert_eq!(local_sub.recv().await.unwrap().event, SseEvent::MessageError);

        drop(local);
        drop(tx);
        tokio::time::timeout(Duration::from_secs(1), relay).await.unwrap().unwrap();
    }
}
