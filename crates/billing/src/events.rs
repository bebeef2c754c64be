//! Resilience notifications
//!
//! Interested parties (health dashboards, alerting) subscribe to an [`EventBus`]
//! instead of reaching into the tracker or scheduler. Delivery contract:
//!
//! - events are delivered in emission order to every subscriber that exists at emission time
//! - delivery is at-most-once; a subscriber that falls more than the channel capacity
//!   behind loses the oldest events (`RecvError::Lagged`)
//! - emitting never blocks and never fails when nobody is listening
//!
//! Escalations that must not be lost go through
//! [`EscalationNotifier`](crate::webhooks::EscalationNotifier), not through the bus.

use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::broadcast;

const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResilienceEvent {
    GatewayOpened {
        provider: String,
        consecutive_failures: u32,
        #[serde(with = "time::serde::rfc3339")]
        at: OffsetDateTime,
    },
    GatewayHalfOpen {
        provider: String,
        #[serde(with = "time::serde::rfc3339")]
        at: OffsetDateTime,
    },
    GatewayRecovered {
        provider: String,
        #[serde(with = "time::serde::rfc3339")]
        at: OffsetDateTime,
    },
    /// A half-open trial failed
    GatewayReopened {
        provider: String,
        #[serde(with = "time::serde::rfc3339")]
        at: OffsetDateTime,
    },
    WebhookRetryScheduled {
        provider: String,
        event_id: String,
        attempt: u32,
        delay_ms: u64,
    },
    WebhookRetriesExhausted {
        provider: String,
        event_id: String,
        attempts: u32,
    },
}

/// Broadcast channel for [`ResilienceEvent`]s
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ResilienceEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ResilienceEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: ResilienceEvent) {
        // No receivers is not an error
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
