//! Webhook deduplication
//!
//! Each key is either in flight (a delivery holds the claim) or processed.
//! Claiming is atomic, so two concurrent deliveries of one event can never
//! both reach a handler. A [`DedupClaim`] that is dropped without being
//! committed releases the key, so a cancelled delivery never blocks redelivery.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use time::OffsetDateTime;

use crate::clock::{to_time_duration, Clock};
use crate::error::{BillingError, BillingResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DedupEntry {
    Processing { claim_id: u64, claimed_at: OffsetDateTime },
    Processed { processed_at: OffsetDateTime },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DedupStats {
    pub processing: usize,
    pub processed: usize,
}

pub struct WebhookDeduplicator {
    entries: Mutex<HashMap<String, DedupEntry>>,
    next_claim_id: AtomicU64,
    claim_timeout: time::Duration,
    clock: Arc<dyn Clock>,
}

impl WebhookDeduplicator {
    pub fn new(claim_timeout: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next_claim_id: AtomicU64::new(1),
            claim_timeout: to_time_duration(claim_timeout),
            clock,
        }
    }

    /// False once the key has been marked processed
    pub fn should_process(&self, key: &str) -> bool {
        !matches!(
            self.entries.lock().get(key),
            Some(DedupEntry::Processed { .. })
        )
    }

    /// Take exclusive processing rights for `key`.
    ///
    /// Fails with [`BillingError::DuplicateEvent`] when the key is already
    /// processed or another delivery holds a fresh claim. A claim older than
    /// the claim timeout is treated as stuck and taken over.
    pub fn claim(&self, key: &str) -> BillingResult<DedupClaim<'_>> {
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        match entries.get(key).copied() {
            Some(DedupEntry::Processed { .. }) => {
                return Err(BillingError::DuplicateEvent {
                    event_id: key.to_string(),
                    in_flight: false,
                })
            }
            Some(DedupEntry::Processing { claimed_at, .. })
                if now - claimed_at < self.claim_timeout =>
            {
                return Err(BillingError::DuplicateEvent {
                    event_id: key.to_string(),
                    in_flight: true,
                })
            }
            Some(DedupEntry::Processing { claimed_at, .. }) => {
                tracing::warn!(
                    key = %key,
                    claimed_at = %claimed_at,
                    "Reclaiming stuck webhook processing claim"
                );
            }
            None => {}
        }

        let claim_id = self.next_claim_id.fetch_add(1, Ordering::Relaxed);
        entries.insert(
            key.to_string(),
            DedupEntry::Processing {
                claim_id,
                claimed_at: now,
            },
        );
        Ok(DedupClaim {
            dedup: self,
            key: key.to_string(),
            claim_id,
            settled: false,
        })
    }

    /// Drop an in-flight claim after a failed attempt; processed keys are left alone.
    ///
    /// Returns whether a claim was held.
    pub fn release(&self, key: &str) -> bool {
        let mut entries = self.entries.lock();
        if matches!(entries.get(key), Some(DedupEntry::Processing { .. })) {
            entries.remove(key);
            true
        } else {
            false
        }
    }

    /// Release only if `claim_id` still owns the key; a taken-over claim is left alone
    fn release_claim(&self, key: &str, claim_id: u64) -> bool {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(DedupEntry::Processing { claim_id: held, .. }) if *held == claim_id => {
                entries.remove(key);
                true
            }
            _ => false,
        }
    }

    pub fn mark_processed(&self, key: &str) {
        let processed_at = self.clock.now();
        self.entries
            .lock()
            .insert(key.to_string(), DedupEntry::Processed { processed_at });
    }

    /// Drop processed entries older than `retention`; returns how many were removed
    pub fn evict_expired(&self, retention: Duration) -> usize {
        let cutoff = self.clock.now() - to_time_duration(retention);
        self.evict_processed_before(cutoff)
    }

    pub fn evict_processed_before(&self, cutoff: OffsetDateTime) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| match entry {
            DedupEntry::Processed { processed_at } => *processed_at >= cutoff,
            DedupEntry::Processing { .. } => true,
        });
        let evicted = before - entries.len();
        if evicted > 0 {
            tracing::debug!(evicted = evicted, "Evicted expired webhook dedup entries");
        }
        evicted
    }

    pub fn stats(&self) -> DedupStats {
        let entries = self.entries.lock();
        entries.values().fold(DedupStats::default(), |mut stats, entry| {
            match entry {
                DedupEntry::Processing { .. } => stats.processing += 1,
                DedupEntry::Processed { .. } => stats.processed += 1,
            }
            stats
        })
    }
}

/// Processing rights for one key.
///
/// Settle it with [`DedupClaim::commit`] or [`DedupClaim::release`]; dropping
/// it unsettled (for example when the request future is cancelled mid-handler)
/// releases the key.
#[must_use = "dropping a claim releases it"]
pub struct DedupClaim<'a> {
    dedup: &'a WebhookDeduplicator,
    key: String,
    claim_id: u64,
    settled: bool,
}

impl DedupClaim<'_> {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Mark the key processed; later claims are duplicates
    pub fn commit(mut self) {
        self.settled = true;
        self.dedup.mark_processed(&self.key);
    }

    /// Give the key back after a failed attempt
    pub fn release(mut self) {
        self.settled = true;
        self.dedup.release_claim(&self.key, self.claim_id);
    }
}

impl Drop for DedupClaim<'_> {
    fn drop(&mut self) {
        if !self.settled && self.dedup.release_claim(&self.key, self.claim_id) {
            tracing::warn!(
                key = %self.key,
                "Webhook processing abandoned before completion, claim released"
            );
        }
    }
}
