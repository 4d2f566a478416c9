use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use lumen_types::{user_channel, SseEvent, SseMessage};
use tokio::sync::Notify;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Default)]
struct QueueState {
    items: VecDeque<SseMessage>,
    closed: bool,
}

/// Bounded FIFO for one subscriber; under pressure the oldest delta is shed first
#[derive(Debug)]
struct SubscriberQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SubscriberQueue {
    fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
        }
    }

    fn push(&self, msg: SseMessage) {
        {
            let mut state = lock(&self.state);
            if state.closed {
                return;
            }
            if state.items.len() >= self.capacity {
                let oldest_delta = state
                    .items
                    .iter()
                    .position(|m| m.event == SseEvent::MessageDelta);
                match oldest_delta {
                    Some(idx) => {
                        state.items.remove(idx);
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                    None if msg.event == SseEvent::MessageDelta => {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        return;
                    }
                    // sticky and lifecycle events are kept past capacity
                    None => {}
                }
            }
            state.items.push_back(msg);
        }
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<SseMessage> {
        lock(&self.state).items.pop_front()
    }

    fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    fn close(&self) {
        lock(&self.state).closed = true;
        self.notify.notify_one();
    }
}

#[derive(Debug)]
struct SubscriberEntry {
    channels: HashSet<String>,
    queue: Arc<SubscriberQueue>,
}

#[derive(Debug, Default)]
struct HubInner {
    next_id: u64,
    subscribers: HashMap<u64, SubscriberEntry>,
}

/// In-process publish/subscribe fan-out for SSE connections
#[derive(Debug)]
pub struct SseHub {
    inner: Mutex<HubInner>,
    buffer: usize,
}

impl SseHub {
    pub fn new(buffer: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(HubInner::default()),
            buffer,
        })
    }

    /// Subscribe to a user's channel
    pub fn subscribe(self: &Arc<Self>, user_id: Uuid) -> Subscription {
        self.subscribe_channels([user_channel(user_id)])
    }

    pub fn subscribe_channels<I, S>(self: &Arc<Self>, channels: I) -> Subscription
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let queue = Arc::new(SubscriberQueue::new(self.buffer));
        let channels: HashSet<String> = channels.into_iter().map(Into::into).collect();
        let mut inner = lock(&self.inner);
        inner.next_id += 1;
        let id = inner.next_id;
        debug!(subscriber = id, channels = ?channels, "sse subscriber added");
        inner.subscribers.insert(
            id,
            SubscriberEntry {
                channels,
                queue: queue.clone(),
            },
        );
        Subscription {
            id,
            queue,
            hub: Arc::downgrade(self),
        }
    }

    pub fn unsubscribe(&self, subscriber_id: u64) {
        let removed = lock(&self.inner).subscribers.remove(&subscriber_id);
        if let Some(entry) = removed {
            entry.queue.close();
            debug!(subscriber = subscriber_id, "sse subscriber removed");
        }
    }

    /// Deliver to every subscriber of `channel`; returns how many received it
    pub fn broadcast(&self, channel: &str, msg: &SseMessage) -> usize {
        let targets: Vec<Arc<SubscriberQueue>> = lock(&self.inner)
            .subscribers
            .values()
            .filter(|s| s.channels.contains(channel))
            .map(|s| s.queue.clone())
            .collect();
        for queue in &targets {
            queue.push(msg.clone());
        }
        targets.len()
    }

    /// Route by the envelope's own channel
    pub fn publish(&self, msg: &SseMessage) -> usize {
        self.broadcast(&msg.channel, msg)
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.inner).subscribers.len()
    }

    /// Close every subscription, ending their streams
    pub fn close_all(&self) {
        let drained: Vec<SubscriberEntry> = lock(&self.inner).subscribers.drain().map(|(_, s)| s).collect();
        for entry in drained {
            entry.queue.close();
        }
    }
}

/// Receiving end of one SSE connection; unsubscribes on drop
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    queue: Arc<SubscriberQueue>,
    hub: Weak<SseHub>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next message in publish order; `None` once the hub closed this subscription
    pub async fn recv(&mut self) -> Option<SseMessage> {
        loop {
            if let Some(msg) = self.queue.pop() {
                return Some(msg);
            }
            if self.queue.is_closed() {
                return None;
            }
            self.queue.notify.notified().await;
        }
    }

    pub fn try_recv(&mut self) -> Option<SseMessage> {
        self.queue.pop()
    }

    /// Deltas shed because this subscriber fell behind
    pub fn dropped(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.unsubscribe(self.id);
        }
    }
}
