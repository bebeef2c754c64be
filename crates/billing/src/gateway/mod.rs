//! Payment gateway failover
//!
//! Two providers (primary and secondary) each sit behind a circuit breaker.
//! Operations go to the primary while its circuit is not open, fall back to
//! the secondary once, and fail fast when both circuits are open.

pub mod executor;
pub mod health;
pub mod selector;

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;

pub use executor::OperationExecutor;
pub use health::{CircuitState, GatewayHealthTracker, GatewayState};
pub use selector::{GatewaySelector, Selection, TrialPermit};

use crate::clock::Clock;
use crate::config::GatewayConfig;
use crate::error::BillingResult;
use crate::events::EventBus;

/// Health of every provider plus the currently preferred one
#[derive(Debug, Clone, Serialize)]
pub struct GatewayStatus {
    pub providers: Vec<GatewayState>,
    pub active_provider: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub checked_at: OffsetDateTime,
}

/// Entry point for provider operations
#[derive(Clone)]
pub struct GatewayManager {
    tracker: Arc<GatewayHealthTracker>,
    selector: Arc<GatewaySelector>,
    executor: Arc<OperationExecutor>,
    clock: Arc<dyn Clock>,
}

impl GatewayManager {
    pub fn new(config: &GatewayConfig, clock: Arc<dyn Clock>, events: EventBus) -> Self {
        let tracker = Arc::new(GatewayHealthTracker::new(config, Arc::clone(&clock), events));
        let selector = Arc::new(GatewaySelector::new(Arc::clone(&tracker), config));
        let executor = Arc::new(OperationExecutor::new(
            Arc::clone(&selector),
            Arc::clone(&tracker),
        ));

        tracing::info!(
            primary = %config.primary,
            secondary = %config.secondary,
            failure_threshold = config.failure_threshold,
            recovery_timeout_secs = config.recovery_timeout.as_secs(),
            "Gateway manager initialized"
        );

        Self {
            tracker,
            selector,
            executor,
            clock,
        }
    }

    /// Run `op` against the active provider with failover
    pub async fn execute<T, E, F, Fut>(&self, op: F) -> BillingResult<T>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        self.executor.execute(op).await
    }

    /// Read-only health report; never claims a half-open trial
    pub fn status(&self) -> GatewayStatus {
        let active_provider = self.selector.select_active().ok();
        GatewayStatus {
            providers: self.tracker.get_states(),
            active_provider,
            checked_at: self.clock.now(),
        }
    }

    pub fn tracker(&self) -> &Arc<GatewayHealthTracker> {
        &self.tracker
    }

    pub fn selector(&self) -> &Arc<GatewaySelector> {
        &self.selector
    }
}
