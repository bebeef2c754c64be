//! Billing profile status transitions driven by subscription and invoice webhooks
//!
//! Handlers only ever move a profile through the external store; exempt
//! profiles are never changed.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::HandlerError;
use crate::webhooks::{WebhookEvent, WebhookEventHandler, WebhookEventType, WebhookPipeline};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingStatus {
    Pending,
    Trialing,
    Active,
    PastDue,
    Cancelled,
    /// Internal accounts; never billed and never transitioned
    Exempt,
}

impl BillingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Trialing => "trialing",
            Self::Active => "active",
            Self::PastDue => "past_due",
            Self::Cancelled => "cancelled",
            Self::Exempt => "exempt",
        }
    }

    /// Map a provider subscription status
    pub fn from_subscription_status(status: &str) -> Option<Self> {
        match status {
            "trialing" => Some(Self::Trialing),
            "active" => Some(Self::Active),
            "past_due" | "unpaid" => Some(Self::PastDue),
            "canceled" | "cancelled" | "incomplete_expired" => Some(Self::Cancelled),
            "incomplete" => Some(Self::Pending),
            _ => None,
        }
    }
}

impl fmt::Display for BillingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Billing profile store error: {0}")]
pub struct StoreError(pub String);

#[async_trait]
pub trait BillingProfileStore: Send + Sync {
    async fn get_status(&self, customer_id: &str) -> Result<Option<BillingStatus>, StoreError>;

    /// Set the status, creating the profile if it does not exist
    async fn set_status(&self, customer_id: &str, status: BillingStatus) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
pub struct InMemoryBillingProfileStore {
    profiles: RwLock<HashMap<String, BillingStatus>>,
    unavailable: AtomicBool,
}

impl InMemoryBillingProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_profile(self, customer_id: impl Into<String>, status: BillingStatus) -> Self {
        self.profiles.write().insert(customer_id.into(), status);
        self
    }

    pub fn status_of(&self, customer_id: &str) -> Option<BillingStatus> {
        self.profiles.read().get(customer_id).copied()
    }

    /// Make every call fail, simulating a database outage
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError("connection refused".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl BillingProfileStore for InMemoryBillingProfileStore {
    async fn get_status(&self, customer_id: &str) -> Result<Option<BillingStatus>, StoreError> {
        self.check_available()?;
        Ok(self.status_of(customer_id))
    }

    async fn set_status(&self, customer_id: &str, status: BillingStatus) -> Result<(), StoreError> {
        self.check_available()?;
        self.profiles.write().insert(customer_id.to_string(), status);
        Ok(())
    }
}

fn customer_id(event: &WebhookEvent) -> Result<&str, HandlerError> {
    event
        .data_object()
        .and_then(|obj| obj.get("customer"))
        .and_then(|c| c.as_str())
        .filter(|c| !c.is_empty())
        .ok_or_else(|| {
            HandlerError::InvalidPayload(format!(
                "event {} has no customer reference",
                event.id
            ))
        })
}

async fn apply_status(
    store: &dyn BillingProfileStore,
    event: &WebhookEvent,
    customer_id: &str,
    target: BillingStatus,
) -> Result<(), HandlerError> {
    let current = store
        .get_status(customer_id)
        .await
        .map_err(|e| HandlerError::Transient(e.to_string()))?;

    if current == Some(BillingStatus::Exempt) {
        tracing::info!(
            customer_id = %customer_id,
            event_id = %event.id,
            "Skipping status change for exempt billing profile"
        );
        return Ok(());
    }
    if current == Some(target) {
        return Ok(());
    }

    store
        .set_status(customer_id, target)
        .await
        .map_err(|e| HandlerError::Transient(e.to_string()))?;

    tracing::info!(
        customer_id = %customer_id,
        event_id = %event.id,
        event_type = %event.event_type,
        from = current.map(|s| s.as_str()).unwrap_or("none"),
        to = %target,
        "Billing profile status updated"
    );
    Ok(())
}

/// `customer.subscription.*` events
pub struct SubscriptionStatusHandler {
    store: Arc<dyn BillingProfileStore>,
}

impl SubscriptionStatusHandler {
    pub fn new(store: Arc<dyn BillingProfileStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl WebhookEventHandler for SubscriptionStatusHandler {
    async fn handle(&self, event: &WebhookEvent) -> Result<(), HandlerError> {
        let customer = customer_id(event)?;

        let target = match event.known_type() {
            WebhookEventType::SubscriptionDeleted => BillingStatus::Cancelled,
            WebhookEventType::SubscriptionCreated | WebhookEventType::SubscriptionUpdated => {
                let status = event
                    .data_object()
                    .and_then(|obj| obj.get("status"))
                    .and_then(|s| s.as_str())
                    .ok_or_else(|| {
                        HandlerError::InvalidPayload(format!(
                            "subscription event {} has no status",
                            event.id
                        ))
                    })?;
                BillingStatus::from_subscription_status(status).ok_or_else(|| {
                    HandlerError::InvalidPayload(format!(
                        "unsupported subscription status '{}'",
                        status
                    ))
                })?
            }
            _ => {
                return Err(HandlerError::Rejected(format!(
                    "not a subscription event: {}",
                    event.event_type
                )))
            }
        };

        apply_status(self.store.as_ref(), event, customer, target).await
    }
}

/// `invoice.*` payment outcome events
pub struct InvoicePaymentHandler {
    store: Arc<dyn BillingProfileStore>,
}

impl InvoicePaymentHandler {
    pub fn new(store: Arc<dyn BillingProfileStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl WebhookEventHandler for InvoicePaymentHandler {
    async fn handle(&self, event: &WebhookEvent) -> Result<(), HandlerError> {
        let customer = customer_id(event)?;
        let target = match event.known_type() {
            WebhookEventType::InvoicePaid | WebhookEventType::InvoicePaymentSucceeded => {
                BillingStatus::Active
            }
            WebhookEventType::InvoicePaymentFailed => BillingStatus::PastDue,
            _ => {
                return Err(HandlerError::Rejected(format!(
                    "not an invoice payment event: {}",
                    event.event_type
                )))
            }
        };
        apply_status(self.store.as_ref(), event, customer, target).await
    }
}

/// Register the subscription and invoice handlers on `pipeline`
pub fn register_default_handlers(pipeline: &WebhookPipeline, store: Arc<dyn BillingProfileStore>) {
    let subscriptions: Arc<dyn WebhookEventHandler> =
        Arc::new(SubscriptionStatusHandler::new(Arc::clone(&store)));
    for event_type in [
        WebhookEventType::SubscriptionCreated,
        WebhookEventType::SubscriptionUpdated,
        WebhookEventType::SubscriptionDeleted,
    ] {
        pipeline.register_handler(event_type.as_str(), Arc::clone(&subscriptions));
    }

    let invoices: Arc<dyn WebhookEventHandler> = Arc::new(InvoicePaymentHandler::new(store));
    for event_type in [
        WebhookEventType::InvoicePaid,
        WebhookEventType::InvoicePaymentSucceeded,
        WebhookEventType::InvoicePaymentFailed,
    ] {
        pipeline.register_handler(event_type.as_str(), Arc::clone(&invoices));
    }
}
