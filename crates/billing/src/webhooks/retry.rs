//! Delayed re-attempts for webhook events that failed with a retryable error
//!
//! Backoff is `base_delay * 2^attempt_count`, optionally capped. Once the next
//! re-attempt would exceed `max_attempts` the record is dropped, the event is
//! dead-lettered and the escalation notifier is called exactly once. A
//! redelivery of an event that is already dead-lettered refreshes the entry
//! without a second notice.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use super::escalation::{EscalationNotice, EscalationNotifier};
use super::event::WebhookEvent;
use super::scheduler::{CancelHandle, ScheduledTask, TaskScheduler};
use crate::clock::{to_time_duration, Clock};
use crate::config::WebhookConfig;
use crate::error::HandlerError;
use crate::events::{EventBus, ResilienceEvent};

/// Oldest dead letters are dropped beyond this many
const DEAD_LETTER_CAPACITY: usize = 1000;

/// Backoff settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Option<Duration>,
}

impl RetryPolicy {
    pub fn from_config(config: &WebhookConfig) -> Self {
        Self {
            max_attempts: config.max_retry_attempts,
            base_delay: config.retry_base_delay,
            max_delay: config.max_retry_delay,
        }
    }

    /// Delay before the re-attempt following `attempt_count` earlier re-attempts
    pub fn delay_for_attempt(&self, attempt_count: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt_count).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        match self.max_delay {
            Some(max) => delay.min(max),
            None => delay,
        }
    }
}

struct RetryRecord {
    event: WebhookEvent,
    attempt_count: u32,
    next_attempt_at: Option<OffsetDateTime>,
    last_error: String,
    /// Set while a timer is pending
    cancel: Option<CancelHandle>,
}

/// Read-only view of a pending retry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingRetry {
    pub provider: String,
    pub event_id: String,
    pub event_type: String,
    pub attempt_count: u32,
    #[serde(with = "time::serde::rfc3339::option")]
    pub next_attempt_at: Option<OffsetDateTime>,
    pub last_error: String,
}

#[derive(Debug, Clone)]
pub(crate) struct DeadLetter {
    pub(crate) notice: EscalationNotice,
    pub(crate) event: WebhookEvent,
}

/// What happened to a retryable failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    Scheduled {
        attempt: u32,
        delay: Duration,
        next_attempt_at: OffsetDateTime,
    },
    /// A timer for this event is already pending
    AlreadyScheduled,
    Exhausted(EscalationNotice),
}

pub struct WebhookRetryScheduler {
    policy: RetryPolicy,
    records: Mutex<HashMap<String, RetryRecord>>,
    dead_letters: Mutex<VecDeque<(String, DeadLetter)>>,
    scheduler: Arc<dyn TaskScheduler>,
    notifier: Arc<dyn EscalationNotifier>,
    clock: Arc<dyn Clock>,
    events: EventBus,
}

impl WebhookRetryScheduler {
    pub fn new(
        policy: RetryPolicy,
        scheduler: Arc<dyn TaskScheduler>,
        notifier: Arc<dyn EscalationNotifier>,
        clock: Arc<dyn Clock>,
        events: EventBus,
    ) -> Self {
        Self {
            policy,
            records: Mutex::new(HashMap::new()),
            dead_letters: Mutex::new(VecDeque::new()),
            scheduler,
            notifier,
            clock,
            events,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn delay_for_attempt(&self, attempt_count: u32) -> Duration {
        self.policy.delay_for_attempt(attempt_count)
    }

    /// Schedule the next re-attempt of `event`, or escalate it.
    ///
    /// `reattempt` builds the task run when the timer fires; it is only called
    /// when a timer is actually scheduled.
    pub async fn schedule_or_escalate<F>(
        &self,
        event: &WebhookEvent,
        error: &HandlerError,
        reattempt: F,
    ) -> RetryDecision
    where
        F: FnOnce() -> ScheduledTask,
    {
        let key = event.key();
        let now = self.clock.now();

        let decision = {
            let mut records = self.records.lock();
            let record = records.entry(key.clone()).or_insert_with(|| RetryRecord {
                event: event.clone(),
                attempt_count: 0,
                next_attempt_at: None,
                last_error: String::new(),
                cancel: None,
            });
            record.last_error = error.to_string();

            if record.cancel.is_some() {
                RetryDecision::AlreadyScheduled
            } else if record.attempt_count >= self.policy.max_attempts {
                let attempts = record.attempt_count;
                let last_error = record.last_error.clone();
                records.remove(&key);
                RetryDecision::Exhausted(EscalationNotice {
                    id: Uuid::new_v4(),
                    event_id: event.id.clone(),
                    provider: event.provider.clone(),
                    event_type: event.event_type.clone(),
                    attempts,
                    last_error,
                    escalated_at: now,
                })
            } else {
                let delay = self.policy.delay_for_attempt(record.attempt_count);
                let next_attempt_at = now + to_time_duration(delay);
                record.attempt_count += 1;
                record.next_attempt_at = Some(next_attempt_at);
                record.cancel = Some(self.scheduler.schedule_after(delay, reattempt()));
                RetryDecision::Scheduled {
                    attempt: record.attempt_count,
                    delay,
                    next_attempt_at,
                }
            }
        };

        let decision = match decision {
            RetryDecision::Exhausted(notice) => self.dead_letter(key, notice, event).await,
            other => other,
        };

        match &decision {
            RetryDecision::Scheduled { attempt, delay, .. } => {
                tracing::warn!(
                    provider = %event.provider,
                    event_id = %event.id,
                    attempt = *attempt,
                    max_attempts = self.policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Webhook handler failed, retry scheduled"
                );
                self.events.emit(ResilienceEvent::WebhookRetryScheduled {
                    provider: event.provider.clone(),
                    event_id: event.id.clone(),
                    attempt: *attempt,
                    delay_ms: delay.as_millis() as u64,
                });
            }
            RetryDecision::AlreadyScheduled => {
                tracing::debug!(
                    provider = %event.provider,
                    event_id = %event.id,
                    "Webhook handler failed while a retry is pending"
                );
            }
            RetryDecision::Exhausted(_) => {}
        }

        decision
    }

    /// Store the dead letter and notify, unless `key` is already dead-lettered
    async fn dead_letter(
        &self,
        key: String,
        notice: EscalationNotice,
        event: &WebhookEvent,
    ) -> RetryDecision {
        let (notice, repeated) = {
            let mut dead_letters = self.dead_letters.lock();
            if let Some((_, existing)) = dead_letters.iter_mut().find(|(k, _)| *k == key) {
                existing.notice.last_error = notice.last_error;
                existing.event = event.clone();
                (existing.notice.clone(), true)
            } else {
                if dead_letters.len() >= DEAD_LETTER_CAPACITY {
                    if let Some((evicted, _)) = dead_letters.pop_front() {
                        tracing::warn!(
                            key = %evicted,
                            capacity = DEAD_LETTER_CAPACITY,
                            "Dead-letter list full, dropping oldest escalated webhook"
                        );
                    }
                }
                dead_letters.push_back((
                    key,
                    DeadLetter {
                        notice: notice.clone(),
                        event: event.clone(),
                    },
                ));
                (notice, false)
            }
        };

        if repeated {
            tracing::warn!(
                provider = %notice.provider,
                event_id = %notice.event_id,
                escalation_id = %notice.id,
                "Webhook event failed again while already escalated"
            );
        } else {
            self.events.emit(ResilienceEvent::WebhookRetriesExhausted {
                provider: notice.provider.clone(),
                event_id: notice.event_id.clone(),
                attempts: notice.attempts,
            });
            self.notifier.notify(&notice).await;
        }
        RetryDecision::Exhausted(notice)
    }

    /// Called by a firing timer before it re-runs the event.
    ///
    /// Returns false if the record was cleared in the meantime.
    pub fn mark_fired(&self, key: &str) -> bool {
        match self.records.lock().get_mut(key) {
            Some(record) => {
                record.cancel = None;
                true
            }
            None => false,
        }
    }

    /// The event a pending record will re-run
    pub fn event_for(&self, key: &str) -> Option<WebhookEvent> {
        self.records.lock().get(key).map(|r| r.event.clone())
    }

    /// Forget `key`: cancel a pending timer and drop any dead letter
    pub fn clear(&self, key: &str) {
        let removed = self.records.lock().remove(key);
        if let Some(record) = removed {
            if let Some(cancel) = record.cancel {
                cancel.cancel();
                tracing::debug!(key = %key, "Cancelled pending webhook retry");
            }
        }
        self.dead_letters.lock().retain(|(k, _)| k != key);
    }

    pub fn pending(&self) -> Vec<PendingRetry> {
        let records = self.records.lock();
        let mut pending: Vec<PendingRetry> = records
            .values()
            .map(|r| PendingRetry {
                provider: r.event.provider.clone(),
                event_id: r.event.id.clone(),
                event_type: r.event.event_type.clone(),
                attempt_count: r.attempt_count,
                next_attempt_at: r.next_attempt_at,
                last_error: r.last_error.clone(),
            })
            .collect();
        pending.sort_by(|a, b| a.next_attempt_at.cmp(&b.next_attempt_at));
        pending
    }

    /// Escalated notices, oldest first
    pub fn escalated(&self) -> Vec<EscalationNotice> {
        self.dead_letters
            .lock()
            .iter()
            .map(|(_, d)| d.notice.clone())
            .collect()
    }

    pub(crate) fn take_dead_letter(&self, key: &str) -> Option<DeadLetter> {
        let mut dead_letters = self.dead_letters.lock();
        let index = dead_letters.iter().position(|(k, _)| k == key)?;
        dead_letters.remove(index).map(|(_, d)| d)
    }

    /// Put back a dead letter taken for replay; a newer entry for `key` wins
    pub(crate) fn restore_dead_letter(&self, key: String, dead_letter: DeadLetter) {
        let mut dead_letters = self.dead_letters.lock();
        if !dead_letters.iter().any(|(k, _)| *k == key) {
            dead_letters.push_back((key, dead_letter));
        }
    }
}
