// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for Billing Resilience
//!
//! Tests boundary conditions and race conditions in:
//! - Gateway circuit breaker and failover (BILL-G01 to BILL-G07)
//! - Webhook verification and deduplication (BILL-W01 to BILL-W07)
//! - Webhook retries and escalation (BILL-RT01 to BILL-RT06)

#[cfg(test)]
mod gateway_tests {
    use crate::clock::ManualClock;
    use crate::config::GatewayConfig;
    use crate::error::BillingError;
    use crate::events::{EventBus, ResilienceEvent};
    use crate::gateway::{CircuitState, GatewayManager};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn manager(threshold: u32) -> (GatewayManager, ManualClock, EventBus) {
        let clock = ManualClock::at_unix(1_700_000_000);
        let events = EventBus::default();
        let config = GatewayConfig::new("A", "B")
            .with_failure_threshold(threshold)
            .with_recovery_timeout(Duration::from_secs(300));
        (
            GatewayManager::new(&config, Arc::new(clock.clone()), events.clone()),
            clock,
            events,
        )
    }

    // =========================================================================
    // BILL-G01: Three failures on A with threshold 3 - A opens, B is selected
    // =========================================================================
    #[test]
    fn test_threshold_opens_primary_and_selects_secondary() {
        let (manager, _, _) = manager(3);
        let tracker = manager.tracker();

        tracker.record_failure("A", "timeout").unwrap();
        tracker.record_failure("A", "timeout").unwrap();
        assert_eq!(
            manager.selector().select_active().unwrap(),
            "A",
            "Two failures must not open the circuit"
        );

        tracker.record_failure("A", "timeout").unwrap();
        assert_eq!(tracker.state_of("A").unwrap().state, CircuitState::Open);
        assert_eq!(manager.selector().select_active().unwrap(), "B");
    }

    // =========================================================================
    // BILL-G02: A open at t0; at t0+301 recovery -> half-open -> success closes
    // =========================================================================
    #[test]
    fn test_recovery_after_timeout_then_trial_success() {
        let (manager, clock, _) = manager(3);
        let tracker = manager.tracker();
        for _ in 0..3 {
            tracker.record_failure("A", "503").unwrap();
        }

        clock.advance(Duration::from_secs(301));
        assert_eq!(tracker.check_recovery(), vec!["A".to_string()]);
        assert_eq!(tracker.state_of("A").unwrap().state, CircuitState::HalfOpen);
        assert_eq!(manager.selector().select_active().unwrap(), "A");

        assert_eq!(tracker.record_success("A").unwrap(), CircuitState::Closed);
        let state = tracker.state_of("A").unwrap();
        assert_eq!(state.consecutive_failures, 0);
        assert_eq!(state.success_count, 1);
    }

    // =========================================================================
    // BILL-G03: Both circuits open - no provider, operation never invoked
    // =========================================================================
    #[tokio::test]
    async fn test_both_open_is_all_gateways_unavailable() {
        let (manager, _, _) = manager(1);
        manager.tracker().record_failure("A", "down").unwrap();
        manager.tracker().record_failure("B", "down").unwrap();

        assert!(matches!(
            manager.selector().select_active(),
            Err(BillingError::AllGatewaysUnavailable)
        ));
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result = manager
            .execute(move |_provider| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, String>(())
                }
            })
            .await;

        assert!(matches!(result, Err(BillingError::AllGatewaysUnavailable)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(manager.status().active_provider, None);
    }

    // =========================================================================
    // BILL-G04: Half-open trial fails - reopens even with a high threshold
    // =========================================================================
    #[tokio::test]
    async fn test_failed_trial_reopens_and_routes_to_secondary() {
        let (manager, clock, _) = manager(10);
        for _ in 0..10 {
            manager.tracker().record_failure("A", "down").unwrap();
        }
        clock.advance(Duration::from_secs(300));

        let providers = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen = Arc::clone(&providers);
        let result = manager
            .execute(move |provider| {
                let seen = Arc::clone(&seen);
                async move {
                    seen.lock().push(provider.clone());
                    if provider == "A" {
                        Err("still down")
                    } else {
                        Ok("charged")
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(result, "charged");
        assert_eq!(*providers.lock(), vec!["A".to_string(), "B".to_string()]);
        assert_eq!(
            manager.tracker().state_of("A").unwrap().state,
            CircuitState::Open
        );
    }

    // =========================================================================
    // BILL-G05: Concurrent operations while half-open - only one trial on A
    // =========================================================================
    #[tokio::test]
    async fn test_concurrent_half_open_single_trial() {
        let (manager, clock, _) = manager(1);
        manager.tracker().record_failure("A", "down").unwrap();
        clock.advance(Duration::from_secs(300));

        let on_a = Arc::new(AtomicU32::new(0));
        let (release_tx, release_rx) = tokio::sync::watch::channel(false);

        let mut handles = Vec::new();
        for _ in 0..5 {
            let manager = manager.clone();
            let on_a = Arc::clone(&on_a);
            let release_rx = release_rx.clone();
            handles.push(tokio::spawn(async move {
                manager
                    .execute(move |provider| {
                        let on_a = Arc::clone(&on_a);
                        let mut release_rx = release_rx.clone();
                        async move {
                            if provider == "A" {
                                on_a.fetch_add(1, Ordering::SeqCst);
                                // Hold the trial until every caller has selected
                                let _ = release_rx.wait_for(|released| *released).await;
                            }
                            Ok::<_, String>(provider)
                        }
                    })
                    .await
            }));
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        release_tx.send(true).unwrap();

        let mut used = Vec::new();
        for handle in handles {
            used.push(handle.await.unwrap().unwrap());
        }

        assert_eq!(on_a.load(Ordering::SeqCst), 1, "Exactly one trial on A");
        assert_eq!(used.iter().filter(|p| *p == "B").count(), 4);
        assert_eq!(
            manager.tracker().state_of("A").unwrap().state,
            CircuitState::Closed
        );
    }

    // =========================================================================
    // BILL-G06: Status query never consumes the half-open trial
    // =========================================================================
    #[tokio::test]
    async fn test_status_is_pure_read() {
        let (manager, clock, _) = manager(1);
        manager.tracker().record_failure("A", "down").unwrap();
        clock.advance(Duration::from_secs(300));

        for _ in 0..3 {
            assert_eq!(manager.status().active_provider.as_deref(), Some("A"));
        }
        let selection = manager.selector().select_for_operation().unwrap();
        assert_eq!(selection.provider, "A");
        assert!(selection.is_trial());
    }

    // =========================================================================
    // BILL-G07: Circuit transitions reach subscribers in order
    // =========================================================================
    #[tokio::test]
    async fn test_transitions_broadcast() {
        let (manager, clock, events) = manager(1);
        let mut rx = events.subscribe();

        manager.tracker().record_failure("A", "down").unwrap();
        clock.advance(Duration::from_secs(300));
        manager.status();
        manager.tracker().record_failure("A", "down").unwrap();

        let kinds: Vec<ResilienceEvent> = vec![
            rx.recv().await.unwrap(),
            rx.recv().await.unwrap(),
            rx.recv().await.unwrap(),
        ];
        assert!(matches!(kinds[0], ResilienceEvent::GatewayOpened { .. }));
        assert!(matches!(kinds[1], ResilienceEvent::GatewayHalfOpen { .. }));
        assert!(matches!(kinds[2], ResilienceEvent::GatewayReopened { .. }));
    }
}

#[cfg(test)]
mod webhook_tests {
    use crate::clock::ManualClock;
    use crate::config::WebhookConfig;
    use crate::error::BillingError;
    use crate::profile::{
        register_default_handlers, BillingProfileStore, BillingStatus, InMemoryBillingProfileStore,
    };
    use crate::webhooks::{sign_payload, ManualTaskScheduler, WebhookOutcome, WebhookPipeline};
    use std::sync::Arc;

    const SECRET: &[u8] = b"whsec_edge_cases";
    const NOW: i64 = 1_700_000_000;

    fn pipeline() -> (WebhookPipeline, Arc<InMemoryBillingProfileStore>) {
        let clock = ManualClock::at_unix(NOW);
        let pipeline = WebhookPipeline::builder(WebhookConfig::default())
            .provider("stripe", SECRET)
            .provider("paddle", b"pdl_secret".to_vec())
            .clock(Arc::new(clock))
            .scheduler(Arc::new(ManualTaskScheduler::new()))
            .build()
            .unwrap();
        let store = Arc::new(
            InMemoryBillingProfileStore::new().with_profile("cus_1", BillingStatus::Trialing),
        );
        register_default_handlers(&pipeline, store.clone());
        (pipeline, store)
    }

    fn invoice_paid(id: &str) -> Vec<u8> {
        format!(
            r#"{{"id":"{id}","type":"invoice.paid","data":{{"object":{{"customer":"cus_1"}}}}}}"#
        )
        .into_bytes()
    }

    // =========================================================================
    // BILL-W01: Same event delivered twice - processed, then duplicate_ignored
    // =========================================================================
    #[tokio::test]
    async fn test_duplicate_delivery_processed_once() {
        let (pipeline, store) = pipeline();
        let body = invoice_paid("evt_1");
        let header = sign_payload(SECRET, NOW, &body).unwrap();

        assert_eq!(
            pipeline.ingest("stripe", &body, &header).await.unwrap(),
            WebhookOutcome::Processed
        );
        assert_eq!(store.status_of("cus_1"), Some(BillingStatus::Active));

        // Profile moved elsewhere meanwhile; a duplicate must not touch it
        store
            .set_status("cus_1", BillingStatus::PastDue)
            .await
            .unwrap();
        assert_eq!(
            pipeline.ingest("stripe", &body, &header).await.unwrap(),
            WebhookOutcome::DuplicateIgnored
        );
        assert_eq!(store.status_of("cus_1"), Some(BillingStatus::PastDue));
    }

    // =========================================================================
    // BILL-W02: Correct digest but timestamp 400s old with tolerance 300
    // =========================================================================
    #[tokio::test]
    async fn test_stale_but_correctly_signed_delivery_rejected() {
        let (pipeline, store) = pipeline();
        let body = invoice_paid("evt_2");
        let header = sign_payload(SECRET, NOW - 400, &body).unwrap();

        let err = pipeline.ingest("stripe", &body, &header).await.unwrap_err();
        assert!(matches!(err, BillingError::WebhookTimestampExpired { .. }));
        assert!(!err.is_retryable());
        assert_eq!(store.status_of("cus_1"), Some(BillingStatus::Trialing));
    }

    // =========================================================================
    // BILL-W03: Secret of one provider does not verify another's ingress
    // =========================================================================
    #[tokio::test]
    async fn test_provider_secrets_are_isolated() {
        let (pipeline, _) = pipeline();
        let body = invoice_paid("evt_3");
        let header = sign_payload(SECRET, NOW, &body).unwrap();

        assert!(matches!(
            pipeline.ingest("paddle", &body, &header).await,
            Err(BillingError::WebhookSignatureInvalid)
        ));
    }

    // =========================================================================
    // BILL-W04: Same event id on two providers - both processed
    // =========================================================================
    #[tokio::test]
    async fn test_event_ids_scoped_per_provider() {
        let (pipeline, _) = pipeline();
        let body = invoice_paid("evt_4");

        let stripe_header = sign_payload(SECRET, NOW, &body).unwrap();
        let paddle_header = sign_payload(b"pdl_secret", NOW, &body).unwrap();

        assert_eq!(
            pipeline.ingest("stripe", &body, &stripe_header).await.unwrap(),
            WebhookOutcome::Processed
        );
        assert_eq!(
            pipeline.ingest("paddle", &body, &paddle_header).await.unwrap(),
            WebhookOutcome::Processed
        );
    }

    // =========================================================================
    // BILL-W05: Concurrent deliveries of one event - handler runs once
    // =========================================================================
    #[tokio::test]
    async fn test_concurrent_duplicates_single_handler_run() {
        use crate::webhooks::handler_fn;
        use std::sync::atomic::{AtomicU32, Ordering};
        use std::time::Duration;

        let (pipeline, _) = pipeline();
        let runs = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&runs);
        pipeline.register_handler(
            "invoice.paid",
            Arc::new(handler_fn(move |_event| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok(())
                }
            })),
        );

        let body = invoice_paid("evt_5");
        let header = sign_payload(SECRET, NOW, &body).unwrap();
        let mut handles = Vec::new();
        for _ in 0..8 {
            let pipeline = pipeline.clone();
            let body = body.clone();
            let header = header.clone();
            handles.push(tokio::spawn(async move {
                pipeline.ingest("stripe", &body, &header).await.unwrap()
            }));
        }

        let mut outcomes = Vec::new();
        for handle in handles {
            outcomes.push(handle.await.unwrap());
        }

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(
            outcomes
                .iter()
                .filter(|o| **o == WebhookOutcome::Processed)
                .count(),
            1
        );
        assert!(outcomes
            .iter()
            .all(|o| matches!(o, WebhookOutcome::Processed | WebhookOutcome::DuplicateIgnored)));
    }

    // =========================================================================
    // BILL-W06: Processed ids are forgotten only after the retention window
    // =========================================================================
    #[tokio::test]
    async fn test_dedup_retention() {
        use std::time::Duration;

        let clock = ManualClock::at_unix(NOW);
        let config = WebhookConfig {
            dedup_retention: Duration::from_secs(3600),
            ..WebhookConfig::default()
        };
        let pipeline = WebhookPipeline::builder(config)
            .provider("stripe", SECRET)
            .clock(Arc::new(clock.clone()))
            .scheduler(Arc::new(ManualTaskScheduler::new()))
            .build()
            .unwrap();

        let body = br#"{"id":"evt_6","type":"charge.refunded"}"#;
        let header = sign_payload(SECRET, NOW, body).unwrap();
        assert_eq!(
            pipeline.ingest("stripe", body, &header).await.unwrap(),
            WebhookOutcome::Ignored
        );

        clock.advance(Duration::from_secs(3599));
        assert_eq!(pipeline.evict_expired(), 0);
        clock.advance(Duration::from_secs(2));
        assert_eq!(pipeline.evict_expired(), 1);
        assert!(pipeline.deduplicator().should_process("stripe:evt_6"));
    }

    // =========================================================================
    // BILL-W07: Delivery cancelled mid-handler - redelivery is still processed
    // =========================================================================
    #[tokio::test(start_paused = true)]
    async fn test_cancelled_delivery_does_not_block_redelivery() {
        use crate::webhooks::handler_fn;
        use std::sync::atomic::{AtomicU32, Ordering};
        use std::time::Duration;

        let (pipeline, _) = pipeline();
        let completed = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&completed);
        pipeline.register_handler(
            "invoice.paid",
            Arc::new(handler_fn(move |_event| {
                let counter = Arc::clone(&counter);
                async move {
                    tokio::time::sleep(Duration::from_secs(15)).await;
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })),
        );

        let body = invoice_paid("evt_7");
        let header = sign_payload(SECRET, NOW, &body).unwrap();

        // Provider gives up on the request after 10s and drops the connection
        let abandoned = tokio::time::timeout(
            Duration::from_secs(10),
            pipeline.ingest("stripe", &body, &header),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(completed.load(Ordering::SeqCst), 0);
        assert_eq!(pipeline.stats().dedup.processing, 0);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(
            pipeline.ingest("stripe", &body, &header).await.unwrap(),
            WebhookOutcome::Processed
        );
        assert_eq!(completed.load(Ordering::SeqCst), 1);
        assert!(!pipeline.deduplicator().should_process("stripe:evt_7"));
    }
}

#[cfg(test)]
mod retry_tests {
    use crate::clock::ManualClock;
    use crate::config::WebhookConfig;
    use crate::error::{BillingError, HandlerError};
    use crate::profile::{register_default_handlers, BillingStatus, InMemoryBillingProfileStore};
    use crate::webhooks::{
        handler_fn, sign_payload, ChannelEscalationNotifier, ManualTaskScheduler, WebhookOutcome,
        WebhookPipeline,
    };
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    const SECRET: &[u8] = b"whsec_retry";
    const NOW: i64 = 1_700_000_000;

    // =========================================================================
    // BILL-RT01: Handler keeps timing out - retries at 5s, 10s, 20s, then one escalation
    // =========================================================================
    #[tokio::test(start_paused = true)]
    async fn test_backoff_schedule_then_single_escalation() {
        let clock = ManualClock::at_unix(NOW);
        let tasks = ManualTaskScheduler::new().with_clock(clock.clone());
        let (notifier, mut escalations) = ChannelEscalationNotifier::channel();
        let config = WebhookConfig {
            handler_timeout: Duration::from_millis(100),
            ..WebhookConfig::default()
        };
        let pipeline = WebhookPipeline::builder(config)
            .provider("stripe", SECRET)
            .clock(Arc::new(clock))
            .scheduler(Arc::new(tasks.clone()))
            .notifier(Arc::new(notifier))
            .build()
            .unwrap();

        let runs = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&runs);
        pipeline.register_handler(
            "invoice.paid",
            Arc::new(handler_fn(move |_event| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(())
                }
            })),
        );

        let body =
            br#"{"id":"evt_1","type":"invoice.paid","data":{"object":{"customer":"cus_1"}}}"#;
        let header = sign_payload(SECRET, NOW, body).unwrap();

        let err = pipeline.ingest("stripe", body, &header).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(tasks.pending_delays(), vec![Duration::from_secs(5)]);

        let delays = tasks.run_all().await;
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(5),
                Duration::from_secs(10),
                Duration::from_secs(20)
            ]
        );
        assert_eq!(runs.load(Ordering::SeqCst), 4, "Initial delivery plus three re-attempts");
        assert_eq!(tasks.pending_count(), 0, "No retry after exhaustion");

        let notice = escalations.recv().await.unwrap();
        assert_eq!(notice.event_id, "evt_1");
        assert_eq!(notice.attempts, 3);
        assert!(escalations.try_recv().is_err(), "Escalated exactly once");
        assert!(pipeline.pending_retries().is_empty());
    }

    // =========================================================================
    // BILL-RT02: Transient store outage recovers on the second re-attempt
    // =========================================================================
    #[tokio::test]
    async fn test_retry_succeeds_after_outage() {
        let clock = ManualClock::at_unix(NOW);
        let tasks = ManualTaskScheduler::new().with_clock(clock.clone());
        let (notifier, mut escalations) = ChannelEscalationNotifier::channel();
        let pipeline = WebhookPipeline::builder(WebhookConfig::default())
            .provider("stripe", SECRET)
            .clock(Arc::new(clock))
            .scheduler(Arc::new(tasks.clone()))
            .notifier(Arc::new(notifier))
            .build()
            .unwrap();
        let store = Arc::new(
            InMemoryBillingProfileStore::new().with_profile("cus_1", BillingStatus::Active),
        );
        register_default_handlers(&pipeline, store.clone());
        store.set_unavailable(true);

        let body = concat!(
            r#"{"id":"evt_7","type":"invoice.payment_failed","#,
            r#""data":{"object":{"customer":"cus_1"}}}"#
        )
        .as_bytes();
        let header = sign_payload(SECRET, NOW, body).unwrap();

        let err = pipeline.ingest("stripe", body, &header).await.unwrap_err();
        assert!(matches!(
            err,
            BillingError::HandlerFailed {
                source: HandlerError::Transient(_),
                retryable: true,
                ..
            }
        ));

        assert_eq!(tasks.run_next().await, Some(Duration::from_secs(5)));
        store.set_unavailable(false);
        assert_eq!(tasks.run_next().await, Some(Duration::from_secs(10)));
        assert_eq!(tasks.run_next().await, None);

        assert_eq!(store.status_of("cus_1"), Some(BillingStatus::PastDue));
        assert!(escalations.try_recv().is_err());
        assert_eq!(
            pipeline.ingest("stripe", body, &header).await.unwrap(),
            WebhookOutcome::DuplicateIgnored
        );
    }

    // =========================================================================
    // BILL-RT03: Missing customer - non-retryable, never scheduled
    // =========================================================================
    #[tokio::test]
    async fn test_invalid_payload_not_retried() {
        let tasks = ManualTaskScheduler::new();
        let pipeline = WebhookPipeline::builder(WebhookConfig::default())
            .provider("stripe", SECRET)
            .clock(Arc::new(ManualClock::at_unix(NOW)))
            .scheduler(Arc::new(tasks.clone()))
            .build()
            .unwrap();
        register_default_handlers(&pipeline, Arc::new(InMemoryBillingProfileStore::new()));

        let body = br#"{"id":"evt_8","type":"invoice.paid","data":{"object":{}}}"#;
        let header = sign_payload(SECRET, NOW, body).unwrap();

        let err = pipeline.ingest("stripe", body, &header).await.unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(tasks.pending_count(), 0);
    }

    // =========================================================================
    // BILL-RT04: Redelivery fails while a retry is pending - still one timer
    // =========================================================================
    #[tokio::test]
    async fn test_no_duplicate_timers() {
        let tasks = ManualTaskScheduler::new();
        let pipeline = WebhookPipeline::builder(WebhookConfig::default())
            .provider("stripe", SECRET)
            .clock(Arc::new(ManualClock::at_unix(NOW)))
            .scheduler(Arc::new(tasks.clone()))
            .build()
            .unwrap();
        pipeline.register_handler(
            "invoice.paid",
            Arc::new(handler_fn(|_event| async {
                Err(HandlerError::RateLimited {
                    retry_after_seconds: None,
                })
            })),
        );

        let body = br#"{"id":"evt_9","type":"invoice.paid"}"#;
        let header = sign_payload(SECRET, NOW, body).unwrap();
        for _ in 0..3 {
            assert!(pipeline.ingest("stripe", body, &header).await.is_err());
        }

        assert_eq!(tasks.pending_count(), 1);
        let pending = pipeline.pending_retries();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].attempt_count, 1);
    }

    // =========================================================================
    // BILL-RT05: maxAttempts 0 - first retryable failure escalates immediately
    // =========================================================================
    #[tokio::test]
    async fn test_zero_attempts_escalates_on_first_failure() {
        let (notifier, mut escalations) = ChannelEscalationNotifier::channel();
        let config = WebhookConfig {
            max_retry_attempts: 0,
            ..WebhookConfig::default()
        };
        let pipeline = WebhookPipeline::builder(config)
            .provider("stripe", SECRET)
            .clock(Arc::new(ManualClock::at_unix(NOW)))
            .scheduler(Arc::new(ManualTaskScheduler::new()))
            .notifier(Arc::new(notifier))
            .build()
            .unwrap();
        pipeline.register_handler(
            "invoice.paid",
            Arc::new(handler_fn(|_event| async {
                Err(HandlerError::Transient("connection reset".into()))
            })),
        );

        let body = br#"{"id":"evt_10","type":"invoice.paid"}"#;
        let header = sign_payload(SECRET, NOW, body).unwrap();
        let err = pipeline.ingest("stripe", body, &header).await.unwrap_err();

        assert!(matches!(err, BillingError::RetryExhausted { attempts: 0, .. }));
        assert!(!err.is_retryable());
        assert!(escalations.recv().await.is_some());
        assert_eq!(pipeline.escalated().len(), 1);
    }

    // =========================================================================
    // BILL-RT06: Redelivery of an escalated event - one dead letter, one notice
    // =========================================================================
    #[tokio::test]
    async fn test_redelivery_after_escalation_is_not_dead_lettered_twice() {
        let (notifier, mut escalations) = ChannelEscalationNotifier::channel();
        let config = WebhookConfig {
            max_retry_attempts: 0,
            ..WebhookConfig::default()
        };
        let pipeline = WebhookPipeline::builder(config)
            .provider("stripe", SECRET)
            .clock(Arc::new(ManualClock::at_unix(NOW)))
            .scheduler(Arc::new(ManualTaskScheduler::new()))
            .notifier(Arc::new(notifier))
            .build()
            .unwrap();

        let failing = Arc::new(std::sync::atomic::AtomicBool::new(true));
        let flag = Arc::clone(&failing);
        pipeline.register_handler(
            "invoice.paid",
            Arc::new(handler_fn(move |_event| {
                let flag = Arc::clone(&flag);
                async move {
                    if flag.load(Ordering::SeqCst) {
                        Err(HandlerError::Transient("connection reset".into()))
                    } else {
                        Ok(())
                    }
                }
            })),
        );

        let body = br#"{"id":"evt_11","type":"invoice.paid"}"#;
        let header = sign_payload(SECRET, NOW, body).unwrap();
        for _ in 0..2 {
            assert!(matches!(
                pipeline.ingest("stripe", body, &header).await,
                Err(BillingError::RetryExhausted { .. })
            ));
        }

        assert_eq!(pipeline.escalated().len(), 1);
        assert!(escalations.recv().await.is_some());
        assert!(escalations.try_recv().is_err(), "Operator notified once");

        failing.store(false, Ordering::SeqCst);
        let results = pipeline.replay_all_escalated(None).await;
        assert_eq!(results.len(), 1);
        assert!(results[0].success);
        assert!(pipeline.escalated().is_empty());
    }
}
