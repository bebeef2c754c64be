//! Per-provider circuit breaker state
//!
//! ```text
//! Closed --(failure_threshold consecutive failures)--> Open
//! Open --(check_recovery after recovery_timeout)--> HalfOpen
//! HalfOpen --(trial succeeds)--> Closed
//! HalfOpen --(trial fails)--> Open
//! ```
//!
//! State only changes through [`GatewayHealthTracker::record_success`],
//! [`GatewayHealthTracker::record_failure`] and
//! [`GatewayHealthTracker::check_recovery`]. Each of them runs its
//! read-modify-write under a single lock acquisition.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::clock::{to_time_duration, Clock};
use crate::config::GatewayConfig;
use crate::error::{BillingError, BillingResult};
use crate::events::{EventBus, ResilienceEvent};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation
    #[default]
    Closed,
    /// Provider considered unavailable
    Open,
    /// Recovery timeout elapsed, one trial operation allowed
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Health snapshot of one provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GatewayState {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub success_count: u64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_failure_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_success_at: Option<OffsetDateTime>,
    pub last_error: Option<String>,
}

impl GatewayState {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: CircuitState::Closed,
            consecutive_failures: 0,
            total_failures: 0,
            success_count: 0,
            last_failure_at: None,
            last_success_at: None,
            last_error: None,
        }
    }
}

#[derive(Debug)]
pub(crate) struct GatewayEntry {
    pub(crate) health: GatewayState,
    /// A half-open trial has been handed out and not yet reported
    pub(crate) trial_in_flight: bool,
}

/// Tracks circuit state for every configured provider
pub struct GatewayHealthTracker {
    failure_threshold: u32,
    recovery_timeout: time::Duration,
    /// Provider names in precedence order
    order: Vec<String>,
    entries: Mutex<HashMap<String, GatewayEntry>>,
    clock: Arc<dyn Clock>,
    events: EventBus,
}

impl fmt::Debug for GatewayHealthTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayHealthTracker")
            .field("failure_threshold", &self.failure_threshold)
            .field("order", &self.order)
            .finish_non_exhaustive()
    }
}

impl GatewayHealthTracker {
    pub fn new(config: &GatewayConfig, clock: Arc<dyn Clock>, events: EventBus) -> Self {
        let order: Vec<String> = config.providers().iter().map(|p| p.to_string()).collect();
        let entries = order
            .iter()
            .map(|name| {
                (
                    name.clone(),
                    GatewayEntry {
                        health: GatewayState::new(name),
                        trial_in_flight: false,
                    },
                )
            })
            .collect();

        Self {
            failure_threshold: config.failure_threshold.max(1),
            recovery_timeout: to_time_duration(config.recovery_timeout),
            order,
            entries: Mutex::new(entries),
            clock,
            events,
        }
    }

    /// Report a successful operation against `provider`
    pub fn record_success(&self, provider: &str) -> BillingResult<CircuitState> {
        let now = self.clock.now();
        let (state, event) = {
            let mut entries = self.entries.lock();
            let entry = entries
                .get_mut(provider)
                .ok_or_else(|| BillingError::UnknownGateway(provider.to_string()))?;

            entry.health.success_count += 1;
            entry.health.last_success_at = Some(now);
            entry.trial_in_flight = false;

            let event = match entry.health.state {
                CircuitState::Closed => {
                    entry.health.consecutive_failures = 0;
                    None
                }
                CircuitState::HalfOpen => {
                    entry.health.state = CircuitState::Closed;
                    entry.health.consecutive_failures = 0;
                    Some(ResilienceEvent::GatewayRecovered {
                        provider: provider.to_string(),
                        at: now,
                    })
                }
                CircuitState::Open => {
                    // Only the recovery check moves an open circuit
                    tracing::warn!(
                        provider = %provider,
                        "Success reported while gateway circuit is open - state unchanged"
                    );
                    None
                }
            };
            (entry.health.state, event)
        };

        if let Some(event) = event {
            tracing::info!(provider = %provider, "Gateway circuit closed after successful trial");
            self.events.emit(event);
        }
        Ok(state)
    }

    /// Report a failed operation against `provider`
    pub fn record_failure(
        &self,
        provider: &str,
        cause: impl fmt::Display,
    ) -> BillingResult<CircuitState> {
        let now = self.clock.now();
        let cause = cause.to_string();
        let (state, event) = {
            let mut entries = self.entries.lock();
            let entry = entries
                .get_mut(provider)
                .ok_or_else(|| BillingError::UnknownGateway(provider.to_string()))?;

            entry.health.total_failures += 1;
            entry.health.consecutive_failures = entry.health.consecutive_failures.saturating_add(1);
            entry.health.last_error = Some(cause.clone());
            entry.trial_in_flight = false;

            let event = match entry.health.state {
                CircuitState::Closed => {
                    if entry.health.consecutive_failures >= self.failure_threshold {
                        entry.health.state = CircuitState::Open;
                        entry.health.last_failure_at = Some(now);
                        Some(ResilienceEvent::GatewayOpened {
                            provider: provider.to_string(),
                            consecutive_failures: entry.health.consecutive_failures,
                            at: now,
                        })
                    } else {
                        None
                    }
                }
                CircuitState::HalfOpen => {
                    entry.health.state = CircuitState::Open;
                    entry.health.last_failure_at = Some(now);
                    Some(ResilienceEvent::GatewayReopened {
                        provider: provider.to_string(),
                        at: now,
                    })
                }
                // Already open; last_failure_at is left alone so recovery is not postponed
                CircuitState::Open => None,
            };
            (entry.health.state, event)
        };

        match &event {
            Some(ResilienceEvent::GatewayOpened {
                consecutive_failures,
                ..
            }) => {
                tracing::warn!(
                    provider = %provider,
                    consecutive_failures = *consecutive_failures,
                    threshold = self.failure_threshold,
                    error = %cause,
                    "Gateway circuit opened due to consecutive failures"
                );
            }
            Some(_) => {
                tracing::warn!(
                    provider = %provider,
                    error = %cause,
                    "Gateway circuit reopened after failed trial"
                );
            }
            None => {
                tracing::debug!(
                    provider = %provider,
                    state = %state,
                    error = %cause,
                    "Gateway failure recorded"
                );
            }
        }
        if let Some(event) = event {
            self.events.emit(event);
        }
        Ok(state)
    }

    /// Move open circuits whose recovery timeout has elapsed to half-open.
    ///
    /// Idempotent; returns the providers that transitioned on this call.
    pub fn check_recovery(&self) -> Vec<String> {
        let now = self.clock.now();
        let mut recovered = Vec::new();
        {
            let mut entries = self.entries.lock();
            for name in &self.order {
                let Some(entry) = entries.get_mut(name) else {
                    continue;
                };
                if entry.health.state != CircuitState::Open {
                    continue;
                }
                let elapsed_enough = entry
                    .health
                    .last_failure_at
                    .map(|at| now - at >= self.recovery_timeout)
                    .unwrap_or(true);
                if elapsed_enough {
                    entry.health.state = CircuitState::HalfOpen;
                    entry.trial_in_flight = false;
                    recovered.push(name.clone());
                }
            }
        }

        for provider in &recovered {
            tracing::info!(
                provider = %provider,
                "Gateway circuit half-open, next operation is a trial"
            );
            self.events.emit(ResilienceEvent::GatewayHalfOpen {
                provider: provider.clone(),
                at: now,
            });
        }
        recovered
    }

    /// Copy of every provider's state, in precedence order
    pub fn get_states(&self) -> Vec<GatewayState> {
        let entries = self.entries.lock();
        self.order
            .iter()
            .filter_map(|name| entries.get(name).map(|e| e.health.clone()))
            .collect()
    }

    pub fn state_of(&self, provider: &str) -> Option<GatewayState> {
        self.entries.lock().get(provider).map(|e| e.health.clone())
    }

    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }

    /// Run `f` with exclusive access to the entries; used for atomic select-and-claim
    pub(crate) fn with_entries<R>(
        &self,
        f: impl FnOnce(&mut HashMap<String, GatewayEntry>) -> R,
    ) -> R {
        let mut entries = self.entries.lock();
        f(&mut entries)
    }

    /// Give back an unused half-open trial
    pub(crate) fn release_trial(&self, provider: &str) {
        if let Some(entry) = self.entries.lock().get_mut(provider) {
            if entry.trial_in_flight {
                entry.trial_in_flight = false;
                tracing::debug!(provider = %provider, "Half-open trial released without a result");
            }
        }
    }
}
