//! Live streaming fan-out for observability events.
//!
//! Subscribers are held in a registry; a failed send prunes the
//! subscriber. Ordering is preserved per subscriber, with no guarantee
//! across subscribers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::sync::mpsc;
use tracing::debug;

use crate::models::CompactEvent;

/// Buffered events per subscriber before it counts as failed.
const SUBSCRIBER_BUFFER: usize = 256;

/// Handle for an active subscription.
pub struct Subscription {
    pub id: u64,
    pub receiver: mpsc::Receiver<CompactEvent>,
}

/// Registry of live event subscribers.
#[derive(Default)]
pub struct LiveStream {
    subscribers: Mutex<HashMap<u64, mpsc::Sender<CompactEvent>>>,
    next_id: AtomicU64,
}

impl LiveStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber and return its receiving end.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().unwrap().insert(id, tx);
        debug!(id, "event subscriber added");
        Subscription { id, receiver: rx }
    }

    pub fn unsubscribe(&self, id: u64) {
        self.subscribers.lock().unwrap().remove(&id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }

    /// Deliver a compact event to every subscriber. Subscribers whose
    /// channel is gone or full are removed.
    pub fn broadcast(&self, event: &CompactEvent) {
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|id, tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(_) => {
                debug!(id, "pruning dead event subscriber");
                false
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Event, EventType};

    fn compact(msg: &str) -> CompactEvent {
        Event::new(EventType::System, msg).compact()
    }

    #[tokio::test]
    async fn subscribers_receive_broadcasts_in_order() {
        let stream = LiveStream::new();
        let mut sub = stream.subscribe();

        stream.broadcast(&compact("first"));
        stream.broadcast(&compact("second"));

        assert_eq!(sub.receiver.recv().await.unwrap().message, "first");
        assert_eq!(sub.receiver.recv().await.unwrap().message, "second");
    }

    #[tokio::test]
    async fn dropped_subscriber_is_pruned_on_send() {
        let stream = LiveStream::new();
        let sub = stream.subscribe();
        assert_eq!(stream.subscriber_count(), 1);

        drop(sub);
        stream.broadcast(&compact("ping"));
        assert_eq!(stream.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn unsubscribe_removes_entry() {
        let stream = LiveStream::new();
        let sub = stream.subscribe();
        stream.unsubscribe(sub.id);
        assert_eq!(stream.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn other_subscribers_unaffected_by_pruning() {
        let stream = LiveStream::new();
        let dead = stream.subscribe();
        let mut live = stream.subscribe();
        drop(dead);

        stream.broadcast(&compact("still here"));
        assert_eq!(stream.subscriber_count(), 1);
        assert_eq!(live.receiver.recv().await.unwrap().message, "still here");
    }
}
