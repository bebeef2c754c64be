//! Verified webhook events

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// A verified inbound notification. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WebhookEvent {
    /// Provider-assigned id, unique per provider
    pub id: String,
    pub event_type: String,
    /// Ingress the event arrived on
    pub provider: String,
    /// Full payload as received
    pub payload: serde_json::Value,
    #[serde(with = "time::serde::rfc3339")]
    pub received_at: OffsetDateTime,
}

impl WebhookEvent {
    pub fn new(
        provider: impl Into<String>,
        id: impl Into<String>,
        event_type: impl Into<String>,
        payload: serde_json::Value,
        received_at: OffsetDateTime,
    ) -> Self {
        Self {
            id: id.into(),
            event_type: event_type.into(),
            provider: provider.into(),
            payload,
            received_at,
        }
    }

    /// Deduplication and retry key
    pub fn key(&self) -> String {
        event_key(&self.provider, &self.id)
    }

    /// The `data.object` section providers wrap the affected resource in
    pub fn data_object(&self) -> Option<&serde_json::Value> {
        self.payload.get("data").and_then(|d| d.get("object"))
    }

    pub fn known_type(&self) -> WebhookEventType {
        WebhookEventType::parse(&self.event_type)
    }
}

pub fn event_key(provider: &str, event_id: &str) -> String {
    format!("{}:{}", provider, event_id)
}

/// Minimal envelope every provider payload must carry
#[derive(Debug, Deserialize)]
pub(crate) struct EventEnvelope {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
}

/// Event types the built-in billing handlers understand
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WebhookEventType {
    SubscriptionCreated,
    SubscriptionUpdated,
    SubscriptionDeleted,
    InvoicePaid,
    InvoicePaymentSucceeded,
    InvoicePaymentFailed,
    Unknown,
}

impl WebhookEventType {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "customer.subscription.created" => Self::SubscriptionCreated,
            "customer.subscription.updated" => Self::SubscriptionUpdated,
            "customer.subscription.deleted" => Self::SubscriptionDeleted,
            "invoice.paid" => Self::InvoicePaid,
            "invoice.payment_succeeded" => Self::InvoicePaymentSucceeded,
            "invoice.payment_failed" => Self::InvoicePaymentFailed,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SubscriptionCreated => "customer.subscription.created",
            Self::SubscriptionUpdated => "customer.subscription.updated",
            Self::SubscriptionDeleted => "customer.subscription.deleted",
            Self::InvoicePaid => "invoice.paid",
            Self::InvoicePaymentSucceeded => "invoice.payment_succeeded",
            Self::InvoicePaymentFailed => "invoice.payment_failed",
            Self::Unknown => "unknown",
        }
    }
}

/// Result of handling one delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookOutcome {
    Processed,
    DuplicateIgnored,
    /// No handler registered for the event type
    Ignored,
}

impl WebhookOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processed => "processed",
            Self::DuplicateIgnored => "duplicate_ignored",
            Self::Ignored => "ignored",
        }
    }
}
