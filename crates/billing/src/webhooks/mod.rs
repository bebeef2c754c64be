//! Inbound payment provider webhooks
//!
//! Deliveries are verified ([`signature`]), deduplicated ([`dedup`]), routed to
//! a domain handler ([`dispatcher`]) and, on retryable failure, re-attempted
//! with exponential backoff until escalated ([`retry`], [`escalation`]).
//! [`WebhookPipeline`] wires these together.

pub mod dedup;
pub mod dispatcher;
pub mod escalation;
pub mod event;
pub mod pipeline;
pub mod retry;
pub mod scheduler;
pub mod signature;

pub use dedup::{DedupClaim, DedupStats, WebhookDeduplicator};
pub use dispatcher::{handler_fn, DispatchOutcome, EventDispatcher, FnHandler, WebhookEventHandler};
pub use escalation::{
    ChannelEscalationNotifier, EscalationNotice, EscalationNotifier, LoggingEscalationNotifier,
};
pub use event::{event_key, WebhookEvent, WebhookEventType, WebhookOutcome};
pub use pipeline::{
    PipelineStats, RetryPredicate, WebhookPipeline, WebhookPipelineBuilder, WebhookReplayResult,
};
pub use retry::{PendingRetry, RetryDecision, RetryPolicy, WebhookRetryScheduler};
pub use scheduler::{
    CancelHandle, ManualTaskScheduler, ScheduledTask, TaskScheduler, TokioTaskScheduler,
};
pub use signature::{sign_payload, WebhookVerifier, SIGNATURE_HEADER};
