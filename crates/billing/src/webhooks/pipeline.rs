//! Webhook ingestion pipeline
//!
//! verify -> claim -> dispatch -> mark processed, or release the claim and
//! hand retryable failures to the retry scheduler.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use super::dedup::{DedupStats, WebhookDeduplicator};
use super::dispatcher::{DispatchOutcome, EventDispatcher, WebhookEventHandler};
use super::escalation::{EscalationNotice, EscalationNotifier, LoggingEscalationNotifier};
use super::event::{event_key, WebhookEvent, WebhookOutcome};
use super::retry::{PendingRetry, RetryDecision, RetryPolicy, WebhookRetryScheduler};
use super::scheduler::{ScheduledTask, TaskScheduler, TokioTaskScheduler};
use super::signature::WebhookVerifier;
use crate::clock::{Clock, SystemClock};
use crate::config::WebhookConfig;
use crate::error::{BillingError, BillingResult, HandlerError};
use crate::events::EventBus;

/// Decides whether a handler error is worth a delayed re-attempt
pub type RetryPredicate = Arc<dyn Fn(&HandlerError) -> bool + Send + Sync>;

const DEFAULT_REPLAY_LIMIT: usize = 100;

/// Result of replaying an escalated event
#[derive(Debug, Clone, Serialize)]
pub struct WebhookReplayResult {
    pub escalation_id: Uuid,
    pub provider: String,
    pub event_id: String,
    pub event_type: String,
    pub previous_attempts: u32,
    pub previous_error: String,
    pub outcome: Option<WebhookOutcome>,
    pub new_error: Option<String>,
    pub success: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineStats {
    pub providers: Vec<String>,
    pub dedup: DedupStats,
    pub pending_retries: usize,
    pub escalated: usize,
}

struct PipelineInner {
    verifiers: HashMap<String, WebhookVerifier>,
    dedup: WebhookDeduplicator,
    dispatcher: EventDispatcher,
    retries: WebhookRetryScheduler,
    retry_predicate: RetryPredicate,
    config: WebhookConfig,
}

/// Cheap to clone; clones share state
#[derive(Clone)]
pub struct WebhookPipeline {
    inner: Arc<PipelineInner>,
}

pub struct WebhookPipelineBuilder {
    config: WebhookConfig,
    secrets: Vec<(String, Vec<u8>)>,
    clock: Arc<dyn Clock>,
    scheduler: Arc<dyn TaskScheduler>,
    notifier: Arc<dyn EscalationNotifier>,
    events: EventBus,
    retry_predicate: RetryPredicate,
}

impl WebhookPipelineBuilder {
    pub fn new(config: WebhookConfig) -> Self {
        Self {
            config,
            secrets: Vec::new(),
            clock: Arc::new(SystemClock),
            scheduler: Arc::new(TokioTaskScheduler),
            notifier: Arc::new(LoggingEscalationNotifier),
            events: EventBus::default(),
            retry_predicate: Arc::new(HandlerError::is_retryable),
        }
    }

    /// Accept deliveries for `provider` signed with `secret`
    pub fn provider(mut self, provider: impl Into<String>, secret: impl Into<Vec<u8>>) -> Self {
        self.secrets.push((provider.into(), secret.into()));
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn scheduler(mut self, scheduler: Arc<dyn TaskScheduler>) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn EscalationNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn retry_predicate(
        mut self,
        predicate: impl Fn(&HandlerError) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.retry_predicate = Arc::new(predicate);
        self
    }

    pub fn build(self) -> BillingResult<WebhookPipeline> {
        let mut verifiers = HashMap::new();
        for (provider, secret) in self.secrets {
            if provider.trim().is_empty() {
                return Err(BillingError::Config(
                    "webhook provider name must not be empty".to_string(),
                ));
            }
            if secret.is_empty() {
                return Err(BillingError::Config(format!(
                    "webhook secret for '{}' must not be empty",
                    provider
                )));
            }
            let verifier = WebhookVerifier::new(
                provider.clone(),
                secret,
                self.config.signature_tolerance,
                Arc::clone(&self.clock),
            );
            verifiers.insert(provider, verifier);
        }

        let retries = WebhookRetryScheduler::new(
            RetryPolicy::from_config(&self.config),
            self.scheduler,
            self.notifier,
            Arc::clone(&self.clock),
            self.events,
        );

        let mut providers: Vec<&String> = verifiers.keys().collect();
        providers.sort();
        tracing::info!(
            providers = ?providers,
            max_retry_attempts = self.config.max_retry_attempts,
            retry_base_delay_secs = self.config.retry_base_delay.as_secs(),
            "Webhook pipeline initialized"
        );

        Ok(WebhookPipeline {
            inner: Arc::new(PipelineInner {
                dedup: WebhookDeduplicator::new(self.config.claim_timeout, self.clock),
                dispatcher: EventDispatcher::new(self.config.handler_timeout),
                verifiers,
                retries,
                retry_predicate: self.retry_predicate,
                config: self.config,
            }),
        })
    }
}

impl WebhookPipeline {
    pub fn builder(config: WebhookConfig) -> WebhookPipelineBuilder {
        WebhookPipelineBuilder::new(config)
    }

    pub fn register_handler(
        &self,
        event_type: impl Into<String>,
        handler: Arc<dyn WebhookEventHandler>,
    ) {
        self.inner.dispatcher.register(event_type, handler);
    }

    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.inner.dispatcher
    }

    pub fn deduplicator(&self) -> &WebhookDeduplicator {
        &self.inner.dedup
    }

    pub fn retries(&self) -> &WebhookRetryScheduler {
        &self.inner.retries
    }

    pub fn has_provider(&self, provider: &str) -> bool {
        self.inner.verifiers.contains_key(provider)
    }

    /// Verify a raw delivery and run it through the pipeline
    pub async fn ingest(
        &self,
        provider: &str,
        payload: &[u8],
        signature_header: &str,
    ) -> BillingResult<WebhookOutcome> {
        let verifier = self
            .inner
            .verifiers
            .get(provider)
            .ok_or_else(|| BillingError::NotFound(format!("webhook provider '{}'", provider)))?;

        let event = verifier.verify(payload, signature_header)?;
        self.process_event(event).await
    }

    /// Run an already verified event through dedup, dispatch and retry handling
    pub async fn process_event(&self, event: WebhookEvent) -> BillingResult<WebhookOutcome> {
        let inner = &self.inner;
        let key = event.key();

        let claim = match inner.dedup.claim(&key) {
            Ok(claim) => claim,
            Err(BillingError::DuplicateEvent { in_flight, .. }) => {
                tracing::debug!(
                    provider = %event.provider,
                    event_id = %event.id,
                    in_flight = in_flight,
                    "Duplicate webhook event, skipping"
                );
                return Ok(WebhookOutcome::DuplicateIgnored);
            }
            Err(e) => return Err(e),
        };

        let error = match inner.dispatcher.dispatch(&event).await {
            Ok(dispatched) => {
                claim.commit();
                inner.retries.clear(&key);
                let outcome = match dispatched {
                    DispatchOutcome::Handled => WebhookOutcome::Processed,
                    DispatchOutcome::Ignored => WebhookOutcome::Ignored,
                };
                tracing::info!(
                    provider = %event.provider,
                    event_id = %event.id,
                    event_type = %event.event_type,
                    outcome = outcome.as_str(),
                    "Webhook event processed"
                );
                return Ok(outcome);
            }
            Err(error) => error,
        };

        claim.release();

        if !(inner.retry_predicate)(&error) {
            tracing::error!(
                provider = %event.provider,
                event_id = %event.id,
                event_type = %event.event_type,
                error = %error,
                "Webhook handler failed with non-retryable error"
            );
            inner.retries.clear(&key);
            return Err(BillingError::HandlerFailed {
                event_id: event.id.clone(),
                source: error,
                retryable: false,
            });
        }

        let decision = inner
            .retries
            .schedule_or_escalate(&event, &error, || self.reattempt_task(key.clone()))
            .await;

        match decision {
            RetryDecision::Scheduled { .. } | RetryDecision::AlreadyScheduled => {
                Err(BillingError::HandlerFailed {
                    event_id: event.id.clone(),
                    source: error,
                    retryable: true,
                })
            }
            RetryDecision::Exhausted(notice) => Err(BillingError::RetryExhausted {
                event_id: event.id.clone(),
                attempts: notice.attempts,
            }),
        }
    }

    fn reattempt_task(&self, key: String) -> ScheduledTask {
        let pipeline = self.clone();
        Box::pin(async move {
            if !pipeline.inner.retries.mark_fired(&key) {
                return;
            }
            let Some(event) = pipeline.inner.retries.event_for(&key) else {
                return;
            };
            if let Err(e) = pipeline.process_event(event).await {
                tracing::debug!(key = %key, error = %e, "Scheduled webhook re-attempt failed");
            }
        })
    }

    /// Events whose retries ran out, oldest first
    pub fn escalated(&self) -> Vec<EscalationNotice> {
        self.inner.retries.escalated()
    }

    pub fn pending_retries(&self) -> Vec<PendingRetry> {
        self.inner.retries.pending()
    }

    /// Re-run one escalated event through the pipeline
    pub async fn replay_escalated(
        &self,
        provider: &str,
        event_id: &str,
    ) -> BillingResult<WebhookReplayResult> {
        let key = event_key(provider, event_id);
        let dead_letter = self.inner.retries.take_dead_letter(&key).ok_or_else(|| {
            BillingError::NotFound(format!(
                "escalated webhook event {} for provider '{}'",
                event_id, provider
            ))
        })?;

        tracing::info!(
            provider = %provider,
            event_id = %event_id,
            previous_attempts = dead_letter.notice.attempts,
            "Replaying escalated webhook event"
        );

        let notice = dead_letter.notice.clone();
        let result = self.process_event(dead_letter.event.clone()).await;

        // Non-retryable failures would otherwise vanish; retryable ones are back in the retry cycle
        if let Err(BillingError::HandlerFailed {
            retryable: false, ..
        }) = &result
        {
            self.inner.retries.restore_dead_letter(key, dead_letter);
        }

        let (outcome, new_error) = match &result {
            Ok(outcome) => (Some(*outcome), None),
            Err(e) => (None, Some(e.to_string())),
        };

        tracing::info!(
            provider = %provider,
            event_id = %event_id,
            success = result.is_ok(),
            "Escalated webhook replay completed"
        );

        Ok(WebhookReplayResult {
            escalation_id: notice.id,
            provider: notice.provider,
            event_id: notice.event_id,
            event_type: notice.event_type,
            previous_attempts: notice.attempts,
            previous_error: notice.last_error,
            outcome,
            new_error,
            success: result.is_ok(),
        })
    }

    /// Replay escalated events oldest first, at most `limit` (default 100)
    pub async fn replay_all_escalated(&self, limit: Option<usize>) -> Vec<WebhookReplayResult> {
        let limit = limit.unwrap_or(DEFAULT_REPLAY_LIMIT);
        let targets: Vec<EscalationNotice> = self.escalated().into_iter().take(limit).collect();

        let mut results = Vec::with_capacity(targets.len());
        for notice in targets {
            match self.replay_escalated(&notice.provider, &notice.event_id).await {
                Ok(result) => results.push(result),
                Err(e) => {
                    tracing::error!(
                        provider = %notice.provider,
                        event_id = %notice.event_id,
                        error = %e,
                        "Failed to replay escalated webhook"
                    );
                    results.push(WebhookReplayResult {
                        escalation_id: notice.id,
                        provider: notice.provider,
                        event_id: notice.event_id,
                        event_type: notice.event_type,
                        previous_attempts: notice.attempts,
                        previous_error: notice.last_error,
                        outcome: None,
                        new_error: Some(e.to_string()),
                        success: false,
                    });
                }
            }
        }
        results
    }

    /// Drop a processing claim that is stuck in flight so the event can be redelivered
    pub fn reset_stuck(&self, provider: &str, event_id: &str) -> BillingResult<()> {
        let key = event_key(provider, event_id);
        if !self.inner.dedup.release(&key) {
            return Err(BillingError::NotFound(format!(
                "webhook event {} is not in flight",
                key
            )));
        }
        tracing::info!(provider = %provider, event_id = %event_id, "Webhook claim reset");
        Ok(())
    }

    /// Forget processed ids older than the configured retention
    pub fn evict_expired(&self) -> usize {
        self.inner
            .dedup
            .evict_expired(self.inner.config.dedup_retention)
    }

    pub fn stats(&self) -> PipelineStats {
        let mut providers: Vec<String> = self.inner.verifiers.keys().cloned().collect();
        providers.sort();
        PipelineStats {
            providers,
            dedup: self.inner.dedup.stats(),
            pending_retries: self.inner.retries.pending().len(),
            escalated: self.inner.retries.escalated().len(),
        }
    }
}
