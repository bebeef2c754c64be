//! HTTP routes

mod health;
mod webhooks;

use axum::{
    routing::{get, post},
    Router,
};

use crate::state::AppState;

pub use health::{gateway_status, health};
pub use webhooks::{
    list_escalated, list_pending_retries, receive_webhook, replay_all_escalated,
    replay_escalated, reset_stuck, webhook_stats, ReplayAllQuery, ReplayAllResponse,
    WebhookResponse,
};

/// Create the application router
pub fn create_router(state: AppState) -> Router {
    let admin_routes = Router::new()
        .route("/webhooks/escalated", get(list_escalated))
        .route("/webhooks/escalated/replay", post(replay_all_escalated))
        .route(
            "/webhooks/escalated/{provider}/{event_id}/replay",
            post(replay_escalated),
        )
        .route("/webhooks/retries", get(list_pending_retries))
        .route("/webhooks/{provider}/{event_id}/reset", post(reset_stuck));

    Router::new()
        .route("/health", get(health))
        .route("/health/gateways", get(gateway_status))
        .route("/health/webhooks", get(webhook_stats))
        .route("/webhooks/{provider}", post(receive_webhook))
        .nest("/admin", admin_routes)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use paygate_billing::{
        sign_payload, BillingStatus, ChannelEscalationNotifier, InMemoryBillingProfileStore,
        ManualClock, ManualTaskScheduler, ResilienceConfig, ResilienceDeps,
    };
    use serde_json::Value;
    use tower::ServiceExt;

    use crate::config::Config;

    const NOW: i64 = 1_700_000_000;
    const SECRET: &str = "whsec_router_test";

    struct TestApp {
        router: Router,
        state: AppState,
        store: Arc<InMemoryBillingProfileStore>,
        clock: ManualClock,
    }

    fn test_app(max_retry_attempts: u32) -> TestApp {
        let mut resilience = ResilienceConfig::default();
        resilience.webhook.max_retry_attempts = max_retry_attempts;
        let config = Config {
            bind_address: "127.0.0.1:0".to_string(),
            webhook_secrets: vec![("stripe".to_string(), SECRET.to_string())],
            dedup_eviction_interval: Duration::from_secs(300),
            resilience,
        };

        let clock = ManualClock::at_unix(NOW);
        let (notifier, _escalations) = ChannelEscalationNotifier::channel();
        let deps = ResilienceDeps {
            clock: Arc::new(clock.clone()),
            scheduler: Arc::new(ManualTaskScheduler::new().with_clock(clock.clone())),
            notifier: Arc::new(notifier),
        };
        let store = Arc::new(
            InMemoryBillingProfileStore::new().with_profile("cus_1", BillingStatus::PastDue),
        );
        let state = AppState::with_deps(config, store.clone(), deps).unwrap();

        TestApp {
            router: create_router(state.clone()),
            state,
            store,
            clock,
        }
    }

    fn invoice_paid(id: &str) -> String {
        format!(
            r#"{{"id":"{id}","type":"invoice.paid","data":{{"object":{{"customer":"cus_1"}}}}}}"#
        )
    }

    fn webhook_request(provider: &str, body: &str, header: Option<String>) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(format!("/webhooks/{provider}"));
        if let Some(header) = header {
            builder = builder.header("webhook-signature", header);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    fn signed(body: &str, timestamp: i64) -> Option<String> {
        Some(sign_payload(SECRET.as_bytes(), timestamp, body.as_bytes()).unwrap())
    }

    async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = if body.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&body).unwrap()
        };
        (status, json)
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_request(uri: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_webhook_processed_then_duplicate() {
        let app = test_app(3);
        let body = invoice_paid("evt_1");

        let (status, json) = send(
            &app.router,
            webhook_request("stripe", &body, signed(&body, NOW)),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["outcome"], "processed");
        assert_eq!(app.store.status_of("cus_1"), Some(BillingStatus::Active));

        let (status, json) = send(
            &app.router,
            webhook_request("stripe", &body, signed(&body, NOW)),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["outcome"], "duplicate_ignored");
    }

    #[tokio::test]
    async fn test_webhook_verification_rejections() {
        let app = test_app(3);
        let body = invoice_paid("evt_2");

        let (status, json) = send(&app.router, webhook_request("stripe", &body, None)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"], "missing_header");

        let (status, json) = send(
            &app.router,
            webhook_request("stripe", &body, signed(&body, NOW - 400)),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"], "timestamp_expired");
        assert_eq!(json["retryable"], false);

        let forged = sign_payload(b"wrong_secret", NOW, body.as_bytes()).unwrap();
        let (status, json) = send(
            &app.router,
            webhook_request("stripe", &body, Some(forged)),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(json["error"], "signature_invalid");

        let (status, json) = send(
            &app.router,
            webhook_request("stripe", &body, Some("v1=abc".to_string())),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"], "signature_format_error");

        let (status, _) = send(
            &app.router,
            webhook_request("paypal", &body, signed(&body, NOW)),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        // None of the rejected deliveries touched the profile
        assert_eq!(app.store.status_of("cus_1"), Some(BillingStatus::PastDue));
    }

    #[tokio::test]
    async fn test_handler_failures_map_to_status_codes() {
        let app = test_app(3);

        let body = r#"{"id":"evt_3","type":"invoice.paid","data":{"object":{}}}"#;
        let (status, json) = send(
            &app.router,
            webhook_request("stripe", body, signed(body, NOW)),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(json["retryable"], false);

        app.store.set_unavailable(true);
        let body = invoice_paid("evt_4");
        let (status, json) = send(
            &app.router,
            webhook_request("stripe", &body, signed(&body, NOW)),
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json["error"], "handler_failed");
        assert_eq!(json["retryable"], true);

        let (status, json) = send(&app.router, get_request("/admin/webhooks/retries")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json.as_array().unwrap().len(), 1);
        assert_eq!(json[0]["event_id"], "evt_4");
        assert_eq!(json[0]["attempt_count"], 1);
    }

    #[tokio::test]
    async fn test_escalated_event_replay() {
        let app = test_app(0);
        app.store.set_unavailable(true);

        let body = invoice_paid("evt_5");
        let (status, json) = send(
            &app.router,
            webhook_request("stripe", &body, signed(&body, NOW)),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json["error"], "retry_exhausted");

        let (_, json) = send(&app.router, get_request("/admin/webhooks/escalated")).await;
        assert_eq!(json.as_array().unwrap().len(), 1);
        assert_eq!(json[0]["event_id"], "evt_5");

        app.store.set_unavailable(false);
        app.clock.advance(Duration::from_secs(60));
        let (status, json) = send(
            &app.router,
            post_request("/admin/webhooks/escalated/stripe/evt_5/replay"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["success"], true);
        assert_eq!(json["outcome"], "processed");
        assert_eq!(app.store.status_of("cus_1"), Some(BillingStatus::Active));
        assert!(app.state.resilience.webhooks.escalated().is_empty());

        let (status, _) = send(
            &app.router,
            post_request("/admin/webhooks/escalated/stripe/evt_5/replay"),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_replay_all_respects_limit() {
        let app = test_app(0);
        app.store.set_unavailable(true);
        for id in ["evt_a", "evt_b", "evt_c"] {
            let body = invoice_paid(id);
            send(
                &app.router,
                webhook_request("stripe", &body, signed(&body, NOW)),
            )
            .await;
        }
        app.store.set_unavailable(false);

        let (status, json) = send(
            &app.router,
            post_request("/admin/webhooks/escalated/replay?limit=2"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["replayed"], 2);
        assert_eq!(json["succeeded"], 2);
        assert_eq!(app.state.resilience.webhooks.escalated().len(), 1);
    }

    #[tokio::test]
    async fn test_reset_unknown_claim_is_not_found() {
        let app = test_app(3);
        let (status, json) = send(
            &app.router,
            post_request("/admin/webhooks/stripe/evt_missing/reset"),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["error"], "not_found");
    }

    #[tokio::test]
    async fn test_gateway_status_is_read_only() {
        let app = test_app(3);
        let gateways = &app.state.resilience.gateways;
        for _ in 0..3 {
            gateways.tracker().record_failure("stripe", "card network down").unwrap();
        }

        let (status, json) = send(&app.router, get_request("/health/gateways")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["active_provider"], "paddle");
        assert_eq!(json["providers"][0]["name"], "stripe");
        assert_eq!(json["providers"][0]["state"], "open");
        assert_eq!(json["providers"][0]["consecutive_failures"], 3);
        assert_eq!(json["providers"][1]["state"], "closed");

        for _ in 0..3 {
            gateways.tracker().record_failure("paddle", "timeout").unwrap();
        }
        let (_, json) = send(&app.router, get_request("/health/gateways")).await;
        assert!(json["active_provider"].is_null());
    }

    #[tokio::test]
    async fn test_webhook_stats() {
        let app = test_app(3);
        let body = invoice_paid("evt_6");
        send(
            &app.router,
            webhook_request("stripe", &body, signed(&body, NOW)),
        )
        .await;

        let (status, json) = send(&app.router, get_request("/health/webhooks")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["providers"][0], "stripe");
        assert_eq!(json["dedup"]["processed"], 1);
        assert_eq!(json["pending_retries"], 0);
    }
}
