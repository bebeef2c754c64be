//! Routes verified events to domain handlers by event type

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::event::WebhookEvent;
use crate::error::HandlerError;

#[async_trait]
pub trait WebhookEventHandler: Send + Sync {
    async fn handle(&self, event: &WebhookEvent) -> Result<(), HandlerError>;
}

/// Adapts an async closure into a [`WebhookEventHandler`]
pub struct FnHandler<F>(F);

pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(WebhookEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> WebhookEventHandler for FnHandler<F>
where
    F: Fn(WebhookEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, event: &WebhookEvent) -> Result<(), HandlerError> {
        (self.0)(event.clone()).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Handled,
    /// No handler registered for the event type
    Ignored,
}

pub struct EventDispatcher {
    handlers: RwLock<HashMap<String, Arc<dyn WebhookEventHandler>>>,
    handler_timeout: Duration,
}

impl EventDispatcher {
    pub fn new(handler_timeout: Duration) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            handler_timeout,
        }
    }

    /// Register `handler` for `event_type`, replacing any previous one
    pub fn register(&self, event_type: impl Into<String>, handler: Arc<dyn WebhookEventHandler>) {
        let event_type = event_type.into();
        if self
            .handlers
            .write()
            .insert(event_type.clone(), handler)
            .is_some()
        {
            tracing::warn!(event_type = %event_type, "Replaced existing webhook handler");
        }
    }

    /// Run the handler for `event`, bounded by the handler timeout
    pub async fn dispatch(&self, event: &WebhookEvent) -> Result<DispatchOutcome, HandlerError> {
        let handler = self.handlers.read().get(&event.event_type).cloned();
        let Some(handler) = handler else {
            tracing::debug!(
                event_type = %event.event_type,
                event_id = %event.id,
                "Unhandled webhook event type"
            );
            return Ok(DispatchOutcome::Ignored);
        };

        match tokio::time::timeout(self.handler_timeout, handler.handle(event)).await {
            Ok(Ok(())) => Ok(DispatchOutcome::Handled),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                let timeout_ms =
                    u64::try_from(self.handler_timeout.as_millis()).unwrap_or(u64::MAX);
                tracing::warn!(
                    event_type = %event.event_type,
                    event_id = %event.id,
                    timeout_ms = timeout_ms,
                    "Webhook handler timed out"
                );
                Err(HandlerError::Timeout(timeout_ms))
            }
        }
    }
}
