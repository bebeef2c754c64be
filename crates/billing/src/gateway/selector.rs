//! Active gateway selection
//!
//! Policy: the primary is used whenever its circuit is not open. Otherwise the
//! secondary is used if its circuit is not open. If both are open there is no
//! active gateway.
//!
//! A half-open provider admits exactly one trial operation at a time. Selecting
//! it for an operation claims that trial atomically; the claim is returned
//! through the [`TrialPermit`] when the operation reports or the permit drops.

use std::collections::HashMap;
use std::sync::Arc;

use super::health::{CircuitState, GatewayEntry, GatewayHealthTracker};
use crate::config::GatewayConfig;
use crate::error::{BillingError, BillingResult};

/// Holds a half-open trial claim for one provider
#[derive(Debug)]
pub struct TrialPermit {
    tracker: Arc<GatewayHealthTracker>,
    provider: String,
}

impl Drop for TrialPermit {
    fn drop(&mut self) {
        self.tracker.release_trial(&self.provider);
    }
}

/// A provider chosen for one operation
#[derive(Debug)]
pub struct Selection {
    pub provider: String,
    pub is_primary: bool,
    trial: Option<TrialPermit>,
}

impl Selection {
    /// Whether this operation is the single half-open trial for its provider
    pub fn is_trial(&self) -> bool {
        self.trial.is_some()
    }
}

pub struct GatewaySelector {
    tracker: Arc<GatewayHealthTracker>,
    primary: String,
    secondary: String,
}

impl GatewaySelector {
    pub fn new(tracker: Arc<GatewayHealthTracker>, config: &GatewayConfig) -> Self {
        Self {
            tracker,
            primary: config.primary.clone(),
            secondary: config.secondary.clone(),
        }
    }

    pub fn primary(&self) -> &str {
        &self.primary
    }

    pub fn secondary(&self) -> &str {
        &self.secondary
    }

    /// Provider the policy currently prefers.
    ///
    /// Runs the recovery check first but never claims a half-open trial, so
    /// it is safe to call from status endpoints.
    pub fn select_active(&self) -> BillingResult<String> {
        self.tracker.check_recovery();
        self.tracker
            .with_entries(|entries| {
                let primary = available(entries, &self.primary, false);
                let secondary = available(entries, &self.secondary, false);
                pick(&self.primary, primary, &self.secondary, secondary)
            })
            .map(str::to_string)
            .ok_or(BillingError::AllGatewaysUnavailable)
    }

    /// Select a provider for an operation, claiming the half-open trial if needed
    pub fn select_for_operation(&self) -> BillingResult<Selection> {
        self.tracker.check_recovery();
        let chosen = self.tracker.with_entries(|entries| {
            let primary = available(entries, &self.primary, true);
            let secondary = available(entries, &self.secondary, true);
            let name = pick(&self.primary, primary, &self.secondary, secondary)?;
            let trial = claim_trial(entries, name);
            Some((name.to_string(), trial))
        });

        let (provider, claimed) = chosen.ok_or(BillingError::AllGatewaysUnavailable)?;
        let is_primary = provider == self.primary;
        Ok(self.selection(provider, is_primary, claimed))
    }

    /// The other provider, if it can take a fallback attempt after `failed` failed
    pub fn fallback_for(&self, failed: &str) -> Option<Selection> {
        let other = if failed == self.primary {
            self.secondary.as_str()
        } else {
            self.primary.as_str()
        };

        self.tracker.check_recovery();
        let claimed = self.tracker.with_entries(|entries| {
            if !available(entries, other, true) {
                return None;
            }
            Some(claim_trial(entries, other))
        })?;

        let is_primary = other == self.primary;
        Some(self.selection(other.to_string(), is_primary, claimed))
    }

    fn selection(&self, provider: String, is_primary: bool, claimed: bool) -> Selection {
        let trial = claimed.then(|| TrialPermit {
            tracker: Arc::clone(&self.tracker),
            provider: provider.clone(),
        });
        if trial.is_some() {
            tracing::info!(provider = %provider, "Routing half-open trial operation");
        }
        Selection {
            provider,
            is_primary,
            trial,
        }
    }
}

fn pick<'a>(
    primary: &'a str,
    primary_ok: bool,
    secondary: &'a str,
    secondary_ok: bool,
) -> Option<&'a str> {
    if primary_ok {
        Some(primary)
    } else if secondary_ok {
        Some(secondary)
    } else {
        None
    }
}

/// Closed always admits; half-open admits unless its trial is taken (when trials are honored)
fn available(entries: &HashMap<String, GatewayEntry>, name: &str, honor_trials: bool) -> bool {
    match entries.get(name) {
        Some(entry) => match entry.health.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => !(honor_trials && entry.trial_in_flight),
            CircuitState::Open => false,
        },
        None => false,
    }
}

/// Returns true when a half-open trial was claimed for `name`
fn claim_trial(entries: &mut HashMap<String, GatewayEntry>, name: &str) -> bool {
    match entries.get_mut(name) {
        Some(entry) if entry.health.state == CircuitState::HalfOpen => {
            entry.trial_in_flight = true;
            true
        }
        _ => false,
    }
}
