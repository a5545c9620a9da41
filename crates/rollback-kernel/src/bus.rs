//! In-process event bus
//!
//! At-least-once fan-out to every subscriber. The bus assigns each event a
//! strictly increasing sequence number; after a restart numbering resumes
//! above the highest sequence found in the state store.

use parking_lot::RwLock;
use rollback_core::Event;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

/// Publish/subscribe hub connecting monitors, waits, operators and the controller
#[derive(Debug, Default)]
pub struct EventBus {
    subscribers: RwLock<Vec<mpsc::UnboundedSender<Event>>>,
    sequence: AtomicU64,
}

impl EventBus {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bus whose first published event gets `last + 1`
    #[must_use]
    pub fn starting_at(last: u64) -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            sequence: AtomicU64::new(last),
        }
    }

    /// Receive every event published from now on
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Event> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.write().push(tx);
        rx
    }

    /// Assign a sequence and deliver to all live subscribers
    pub fn publish(&self, mut event: Event) -> Event {
        event.sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        self.deliver(&event);
        tracing::debug!(
            correlation_id = %event.correlation_id,
            sequence = event.sequence,
            kind = %event.kind(),
            "event published"
        );
        event
    }

    /// Deliver an already published event again, keeping its sequence
    pub fn redeliver(&self, event: &Event) {
        self.deliver(event);
        tracing::debug!(
            correlation_id = %event.correlation_id,
            sequence = event.sequence,
            kind = %event.kind(),
            "event redelivered"
        );
    }

    fn deliver(&self, event: &Event) {
        let mut closed = false;
        for subscriber in self.subscribers.read().iter() {
            closed |= subscriber.send(event.clone()).is_err();
        }
        if closed {
            self.subscribers.write().retain(|s| !s.is_closed());
        }
    }

    /// Highest sequence assigned so far
    #[inline]
    #[must_use]
    pub fn last_sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    #[inline]
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}
