//! Runs provider operations with health reporting and one fallback attempt

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

use super::health::GatewayHealthTracker;
use super::selector::{GatewaySelector, Selection};
use crate::error::{BillingError, BillingResult, GatewayFailure};

pub struct OperationExecutor {
    selector: Arc<GatewaySelector>,
    tracker: Arc<GatewayHealthTracker>,
}

impl OperationExecutor {
    pub fn new(selector: Arc<GatewaySelector>, tracker: Arc<GatewayHealthTracker>) -> Self {
        Self { selector, tracker }
    }

    /// Invoke `op` with the active provider's name.
    ///
    /// Every outcome is reported to the health tracker. If the first attempt
    /// was on the primary and fails, `op` is invoked once more on the
    /// secondary, provided its circuit is not open. Failures are returned
    /// aggregated in [`BillingError::GatewayOperationFailed`].
    pub async fn execute<T, E, F, Fut>(&self, op: F) -> BillingResult<T>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let selection = self.selector.select_for_operation()?;
        let first_provider = selection.provider.clone();
        let first_was_primary = selection.is_primary;

        let first_failure = match self.attempt(&op, selection).await {
            Ok(value) => return Ok(value),
            Err(failure) => failure,
        };

        if !first_was_primary {
            return Err(BillingError::GatewayOperationFailed {
                failures: vec![first_failure],
            });
        }

        let Some(fallback) = self.selector.fallback_for(&first_provider) else {
            tracing::warn!(
                provider = %first_provider,
                "Gateway operation failed and no fallback gateway is available"
            );
            return Err(BillingError::GatewayOperationFailed {
                failures: vec![first_failure],
            });
        };

        tracing::warn!(
            failed = %first_provider,
            fallback = %fallback.provider,
            error = %first_failure.error,
            "Falling back to secondary gateway"
        );

        match self.attempt(&op, fallback).await {
            Ok(value) => Ok(value),
            Err(second_failure) => Err(BillingError::GatewayOperationFailed {
                failures: vec![first_failure, second_failure],
            }),
        }
    }

    async fn attempt<T, E, F, Fut>(&self, op: &F, selection: Selection) -> Result<T, GatewayFailure>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let provider = selection.provider.clone();
        let result = op(provider.clone()).await;

        // Report before the selection (and any trial permit) is dropped
        let outcome = match result {
            Ok(value) => {
                if let Err(e) = self.tracker.record_success(&provider) {
                    tracing::error!(
                        provider = %provider,
                        error = %e,
                        "Failed to record gateway success"
                    );
                }
                Ok(value)
            }
            Err(e) => {
                let error = e.to_string();
                tracing::warn!(provider = %provider, error = %error, "Gateway operation failed");
                if let Err(e) = self.tracker.record_failure(&provider, &error) {
                    tracing::error!(
                        provider = %provider,
                        error = %e,
                        "Failed to record gateway failure"
                    );
                }
                Err(GatewayFailure { provider, error })
            }
        };
        drop(selection);
        outcome
    }
}
