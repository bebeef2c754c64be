//! Operator escalation for webhook events whose retries ran out

use async_trait::async_trait;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Produced exactly once per event that exhausts its retries
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EscalationNotice {
    pub id: Uuid,
    pub event_id: String,
    pub provider: String,
    pub event_type: String,
    /// Delayed re-attempts made before giving up
    pub attempts: u32,
    pub last_error: String,
    #[serde(with = "time::serde::rfc3339")]
    pub escalated_at: OffsetDateTime,
}

#[async_trait]
pub trait EscalationNotifier: Send + Sync {
    async fn notify(&self, notice: &EscalationNotice);
}

/// Writes escalations to the error log
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingEscalationNotifier;

#[async_trait]
impl EscalationNotifier for LoggingEscalationNotifier {
    async fn notify(&self, notice: &EscalationNotice) {
        tracing::error!(
            escalation_id = %notice.id,
            provider = %notice.provider,
            event_id = %notice.event_id,
            event_type = %notice.event_type,
            attempts = notice.attempts,
            last_error = %notice.last_error,
            "Webhook retries exhausted - manual intervention required"
        );
    }
}

/// Forwards escalations to a channel
#[derive(Debug, Clone)]
pub struct ChannelEscalationNotifier {
    sender: mpsc::UnboundedSender<EscalationNotice>,
}

impl ChannelEscalationNotifier {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<EscalationNotice>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl EscalationNotifier for ChannelEscalationNotifier {
    async fn notify(&self, notice: &EscalationNotice) {
        if self.sender.send(notice.clone()).is_err() {
            tracing::warn!(
                event_id = %notice.event_id,
                "Escalation receiver dropped, notice only logged"
            );
            LoggingEscalationNotifier.notify(notice).await;
        }
    }
}
