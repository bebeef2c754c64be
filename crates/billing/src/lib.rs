// Billing crate clippy configuration
// These are intentional patterns in this crate:
#![allow(clippy::result_large_err)] // BillingError::GatewayOperationFailed carries every attempt
#![allow(clippy::type_complexity)] // Handler and predicate trait objects
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! PayGate Billing Resilience
//!
//! Keeps payment operations and provider webhooks working while a payment
//! provider is degraded.
//!
//! ## Features
//!
//! - **Gateway Failover**: Circuit breaker per provider, primary/secondary selection,
//!   one fallback attempt
//! - **Webhook Verification**: HMAC-SHA256 signatures with a timestamp window
//! - **Deduplication**: Each provider event is handled at most once
//! - **Retries**: Exponential backoff for retryable handler failures, escalation when exhausted
//! - **Replay**: Operators can re-run escalated events
//! - **Billing Profiles**: Subscription and invoice events drive profile status

pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod gateway;
pub mod profile;
pub mod webhooks;

#[cfg(test)]
mod edge_case_tests;

use std::sync::Arc;

// Clock
pub use clock::{Clock, ManualClock, SystemClock};

// Config
pub use config::{GatewayConfig, ResilienceConfig, WebhookConfig};

// Error
pub use error::{BillingError, BillingResult, GatewayFailure, HandlerError};

// Events
pub use events::{EventBus, ResilienceEvent};

// Gateway
pub use gateway::{CircuitState, GatewayManager, GatewayState, GatewayStatus};

// Profile
pub use profile::{
    register_default_handlers, BillingProfileStore, BillingStatus, InMemoryBillingProfileStore,
    InvoicePaymentHandler, StoreError, SubscriptionStatusHandler,
};

// Webhooks
pub use webhooks::{
    sign_payload, ChannelEscalationNotifier, EscalationNotice, EscalationNotifier,
    LoggingEscalationNotifier, ManualTaskScheduler, TaskScheduler, TokioTaskScheduler,
    WebhookEvent, WebhookEventHandler, WebhookOutcome, WebhookPipeline, WebhookReplayResult,
};

/// Collaborators that tests (or embedding services) may want to replace
pub struct ResilienceDeps {
    pub clock: Arc<dyn Clock>,
    pub scheduler: Arc<dyn TaskScheduler>,
    pub notifier: Arc<dyn EscalationNotifier>,
}

impl Default for ResilienceDeps {
    fn default() -> Self {
        Self {
            clock: Arc::new(SystemClock),
            scheduler: Arc::new(TokioTaskScheduler),
            notifier: Arc::new(LoggingEscalationNotifier),
        }
    }
}

/// Main resilience service combining gateway failover and webhook ingestion
#[derive(Clone)]
pub struct BillingResilience {
    pub gateways: GatewayManager,
    pub webhooks: WebhookPipeline,
    pub events: EventBus,
}

impl BillingResilience {
    /// Create the service from `config`.
    ///
    /// `secrets` maps webhook provider name to its signing secret.
    pub fn with_deps<I, K, V>(
        config: ResilienceConfig,
        secrets: I,
        deps: ResilienceDeps,
    ) -> BillingResult<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Vec<u8>>,
    {
        config.validate()?;
        let events = EventBus::default();

        let gateways =
            GatewayManager::new(&config.gateway, Arc::clone(&deps.clock), events.clone());

        let mut builder = WebhookPipeline::builder(config.webhook)
            .clock(deps.clock)
            .scheduler(deps.scheduler)
            .notifier(deps.notifier)
            .events(events.clone());
        for (provider, secret) in secrets {
            builder = builder.provider(provider, secret);
        }
        let webhooks = builder.build()?;

        Ok(Self {
            gateways,
            webhooks,
            events,
        })
    }
}
