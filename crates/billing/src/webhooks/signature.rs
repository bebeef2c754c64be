//! Webhook signature verification
//!
//! Header format: `t=<unix seconds>,v1=<hex hmac>[,v1=<hex hmac>...]`. The
//! digest is HMAC-SHA256 over `"{t}.{raw body}"` keyed with the provider's
//! webhook secret, where `t` is the header text exactly as sent. Several `v1`
//! entries are accepted so secrets can be rolled.

use std::sync::Arc;
use std::time::Duration;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use super::event::{EventEnvelope, WebhookEvent};
use crate::clock::Clock;
use crate::error::{BillingError, BillingResult};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "webhook-signature";

#[derive(Debug, PartialEq, Eq)]
struct SignatureHeader<'a> {
    timestamp: i64,
    /// `t` as it appeared in the header; this is what was signed
    signed_timestamp: &'a str,
    signatures: Vec<String>,
}

fn parse_header(header: &str) -> BillingResult<SignatureHeader<'_>> {
    let mut timestamp: Option<(i64, &str)> = None;
    let mut signatures = Vec::new();

    for part in header.split(',') {
        let Some((key, value)) = part.split_once('=') else {
            continue;
        };
        match key.trim() {
            "t" => {
                if timestamp.is_some() {
                    return Err(BillingError::WebhookSignatureFormat(
                        "duplicate timestamp".to_string(),
                    ));
                }
                let raw = value.trim();
                let parsed = raw.parse::<i64>().map_err(|_| {
                    BillingError::WebhookSignatureFormat(format!(
                        "timestamp is not an integer: '{}'",
                        raw
                    ))
                })?;
                timestamp = Some((parsed, raw));
            }
            "v1" => signatures.push(value.trim().to_string()),
            _ => {}
        }
    }

    let (timestamp, signed_timestamp) = timestamp
        .ok_or_else(|| BillingError::WebhookSignatureFormat("missing timestamp".to_string()))?;
    if signatures.is_empty() {
        return Err(BillingError::WebhookSignatureFormat(
            "missing v1 signature".to_string(),
        ));
    }

    Ok(SignatureHeader {
        timestamp,
        signed_timestamp,
        signatures,
    })
}

fn compute_signature(secret: &[u8], timestamp: &str, payload: &[u8]) -> BillingResult<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| {
        tracing::error!("Invalid webhook secret key");
        BillingError::WebhookSignatureInvalid
    })?;
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(payload);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Build a valid signature header for `payload`
pub fn sign_payload(secret: &[u8], timestamp: i64, payload: &[u8]) -> BillingResult<String> {
    let digest = compute_signature(secret, &timestamp.to_string(), payload)?;
    Ok(format!("t={},v1={}", timestamp, hex::encode(digest)))
}

/// Verifies deliveries for one provider
pub struct WebhookVerifier {
    provider: String,
    secret: Vec<u8>,
    tolerance: Duration,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for WebhookVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookVerifier")
            .field("provider", &self.provider)
            .field("tolerance", &self.tolerance)
            .finish_non_exhaustive()
    }
}

impl WebhookVerifier {
    pub fn new(
        provider: impl Into<String>,
        secret: impl Into<Vec<u8>>,
        tolerance: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            provider: provider.into(),
            secret: secret.into(),
            tolerance,
            clock,
        }
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Check authenticity and freshness, then parse the payload.
    ///
    /// Steps run in order: header format, timestamp window, digest, payload.
    pub fn verify(&self, payload: &[u8], header: &str) -> BillingResult<WebhookEvent> {
        let header = parse_header(header).inspect_err(|e| {
            tracing::warn!(
                provider = %self.provider,
                error = %e,
                "Malformed webhook signature header"
            );
        })?;

        let now = self.clock.now();
        let age_seconds = now.unix_timestamp().saturating_sub(header.timestamp);
        let tolerance_seconds = self.tolerance.as_secs();
        if age_seconds.unsigned_abs() > tolerance_seconds {
            tracing::warn!(
                provider = %self.provider,
                timestamp = header.timestamp,
                age_seconds = age_seconds,
                tolerance_seconds = tolerance_seconds,
                "Webhook timestamp outside tolerance"
            );
            return Err(BillingError::WebhookTimestampExpired {
                age_seconds,
                tolerance_seconds,
            });
        }

        let expected = compute_signature(&self.secret, header.signed_timestamp, payload)?;
        let matched = header.signatures.iter().any(|candidate| {
            match hex::decode(candidate) {
                Ok(candidate) => bool::from(expected.as_slice().ct_eq(candidate.as_slice())),
                Err(_) => false,
            }
        });
        if !matched {
            tracing::warn!(
                provider = %self.provider,
                candidates = header.signatures.len(),
                "Webhook signature mismatch"
            );
            return Err(BillingError::WebhookSignatureInvalid);
        }

        let payload_json: serde_json::Value = serde_json::from_slice(payload).map_err(|e| {
            tracing::warn!(
                provider = %self.provider,
                parse_error = %e,
                "Failed to parse webhook event JSON"
            );
            BillingError::WebhookPayloadParse(e.to_string())
        })?;
        let envelope: EventEnvelope = serde_json::from_value(payload_json.clone())
            .map_err(|e| BillingError::WebhookPayloadParse(e.to_string()))?;
        if envelope.id.trim().is_empty() || envelope.event_type.trim().is_empty() {
            return Err(BillingError::WebhookPayloadParse(
                "event id and type must not be empty".to_string(),
            ));
        }

        tracing::debug!(
            provider = %self.provider,
            event_id = %envelope.id,
            event_type = %envelope.event_type,
            "Webhook signature verified"
        );

        Ok(WebhookEvent::new(
            self.provider.clone(),
            envelope.id,
            envelope.event_type,
            payload_json,
            now,
        ))
    }
}
