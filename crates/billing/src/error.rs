//! Billing resilience error types

use std::fmt;

use thiserror::Error;

/// Result alias used throughout the billing crate
pub type BillingResult<T> = Result<T, BillingError>;

/// One failed attempt of a provider operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayFailure {
    pub provider: String,
    pub error: String,
}

impl fmt::Display for GatewayFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.provider, self.error)
    }
}

fn join_failures(failures: &[GatewayFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Error)]
pub enum BillingError {
    /// Every configured payment gateway has an open circuit
    #[error("All payment gateways are unavailable")]
    AllGatewaysUnavailable,

    #[error("Unknown payment gateway: {0}")]
    UnknownGateway(String),

    /// The operation failed on the selected gateway and on the fallback (if one was tried)
    #[error("Gateway operation failed ({})", join_failures(.failures))]
    GatewayOperationFailed { failures: Vec<GatewayFailure> },

    #[error("Malformed webhook signature header: {0}")]
    WebhookSignatureFormat(String),

    #[error("Webhook timestamp outside tolerance ({age_seconds}s, tolerance {tolerance_seconds}s)")]
    WebhookTimestampExpired {
        age_seconds: i64,
        tolerance_seconds: u64,
    },

    #[error("Webhook signature verification failed")]
    WebhookSignatureInvalid,

    #[error("Failed to parse webhook payload: {0}")]
    WebhookPayloadParse(String),

    #[error("Duplicate webhook event: {event_id}")]
    DuplicateEvent { event_id: String, in_flight: bool },

    #[error("Webhook handler failed for event {event_id}: {source}")]
    HandlerFailed {
        event_id: String,
        #[source]
        source: HandlerError,
        retryable: bool,
    },

    #[error("Retries exhausted for webhook event {event_id} after {attempts} attempts")]
    RetryExhausted { event_id: String, attempts: u32 },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl BillingError {
    /// Whether the caller (or the provider redelivering) could succeed by trying again later.
    ///
    /// Verification failures, duplicates and exhausted retries are never retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            BillingError::HandlerFailed { retryable, .. } => *retryable,
            _ => false,
        }
    }

    /// Stable machine-readable code for API responses and logs
    pub fn code(&self) -> &'static str {
        match self {
            BillingError::AllGatewaysUnavailable => "all_gateways_unavailable",
            BillingError::UnknownGateway(_) => "unknown_gateway",
            BillingError::GatewayOperationFailed { .. } => "gateway_operation_failed",
            BillingError::WebhookSignatureFormat(_) => "signature_format_error",
            BillingError::WebhookTimestampExpired { .. } => "timestamp_expired",
            BillingError::WebhookSignatureInvalid => "signature_invalid",
            BillingError::WebhookPayloadParse(_) => "payload_parse_error",
            BillingError::DuplicateEvent { .. } => "duplicate_event",
            BillingError::HandlerFailed { .. } => "handler_failed",
            BillingError::RetryExhausted { .. } => "retry_exhausted",
            BillingError::NotFound(_) => "not_found",
            BillingError::Config(_) => "config_error",
        }
    }

    /// True for the four webhook verification rejections
    pub fn is_verification_failure(&self) -> bool {
        matches!(
            self,
            BillingError::WebhookSignatureFormat(_)
                | BillingError::WebhookTimestampExpired { .. }
                | BillingError::WebhookSignatureInvalid
                | BillingError::WebhookPayloadParse(_)
        )
    }
}

/// Error returned by a webhook domain handler
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HandlerError {
    /// Network-level failure talking to a downstream dependency
    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Handler timed out after {0}ms")]
    Timeout(u64),

    #[error("Rate limited by downstream dependency")]
    RateLimited { retry_after_seconds: Option<u64> },

    /// The event payload is missing data the handler needs
    #[error("Invalid event payload: {0}")]
    InvalidPayload(String),

    /// The handler refused the event for a business reason
    #[error("Event rejected: {0}")]
    Rejected(String),
}

impl HandlerError {
    /// Default retryability predicate: network, timeout and rate-limit failures
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            HandlerError::Transient(_) | HandlerError::Timeout(_) | HandlerError::RateLimited { .. }
        )
    }
}
