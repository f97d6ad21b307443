//! Typed feed-event pub/sub with explicit unsubscribe handles.
//!
//! Subscribers get an id-carrying handle tied to the session lifetime;
//! detaching is an explicit call (or a dropped receiver, swept on the next
//! publish), never a garbage-collection side effect.

use tokio::sync::mpsc;
use tracing::warn;

use athena_protocol::FeedEvent;

const SUBSCRIBER_BUFFER: usize = 256;

/// Handle returned from [`EventBus::subscribe`]; pass it back to
/// [`EventBus::unsubscribe`] to detach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

struct Subscriber {
    id: SubscriptionId,
    tx: mpsc::Sender<FeedEvent>,
}

/// Fan-out of persisted feed events to dashboard collaborators.
#[derive(Default)]
pub struct EventBus {
    next_id: u64,
    subscribers: Vec<Subscriber>,
}

impl EventBus {
    pub fn new() -> Self {
        EventBus::default()
    }

    /// Register a subscriber; events published after this call are delivered.
    pub fn subscribe(&mut self) -> (SubscriptionId, mpsc::Receiver<FeedEvent>) {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.subscribers.push(Subscriber { id, tx });
        (id, rx)
    }

    /// Detach a subscriber. Unknown ids are a no-op.
    pub fn unsubscribe(&mut self, id: SubscriptionId) {
        self.subscribers.retain(|s| s.id != id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Deliver one event to every live subscriber.
    ///
    /// Slow subscribers lose events rather than stalling the pipeline.
    pub fn publish(&mut self, event: &FeedEvent) {
        self.subscribers.retain(|s| !s.tx.is_closed());

        for subscriber in &self.subscribers {
            if subscriber.tx.try_send(event.clone()).is_err() {
                warn!(
                    component = "bus",
                    event = "bus.subscriber_lagged",
                    seq = event.seq,
                    "Subscriber queue full, feed event dropped"
                );
            }
        }
    }
}
