//! In-process publish/subscribe fan-out.
//!
//! Every subscriber sees every event in publish order or gets disconnected:
//! the broadcast channel reports a lagged receiver as closed, which the
//! subscriber surfaces as a dropped connection.

use tokio::sync::broadcast;
use tracing::trace;

use crate::models::RaceEvent;

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<RaceEvent>,
}

/// Handle owned by one live subscriber.
pub struct Subscription {
    rx: broadcast::Receiver<RaceEvent>,
}

impl Subscription {
    /// Next event in publish order. `None` means the subscription is dead:
    /// either the bus is gone or this subscriber lagged too far behind and
    /// was disconnected rather than shown a gap.
    pub async fn next(&mut self) -> Option<RaceEvent> {
        match self.rx.recv().await {
            Ok(event) => Some(event),
            Err(broadcast::error::RecvError::Closed) => None,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                trace!(skipped, "subscriber lagged, disconnecting");
                None
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
        }
    }

    /// Publish to all current subscribers. A bus with no subscribers drops
    /// the event; publishing is never an error for the caller.
    pub fn publish(&self, event: RaceEvent) {
        trace!(topic = event.topic(), "publish");
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
