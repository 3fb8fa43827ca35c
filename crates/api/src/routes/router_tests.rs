//! Router tests
//!
//! Tests cover:
//! - Webhook endpoint status mapping (200, 400, 401, 409, 500)
//! - Bearer token enforcement on read and admin routes
//! - Read and admin endpoint responses over in-memory stores

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::{
        body::Body,
        http::{header::AUTHORIZATION, Request, StatusCode},
        Router,
    };
    use serde_json::Value;
    use subsync_billing::testing::{
        notification_body, sign_body, FailingEventStore, FailingSyncStateStore, StubGateway,
        TEST_SECRET,
    };
    use subsync_billing::{
        Clock, GatewayConfig, ManualClock, ReconcileConfig, SubscriptionStatus, SyncConfig,
        SyncService, SyncStores,
    };
    use time::OffsetDateTime;
    use tower::ServiceExt;

    use crate::config::{Config, StoreBackend};
    use crate::routes::create_router;
    use crate::state::AppState;

    const TOKEN: &str = "test-api-token";
    const NOW: i64 = 1_760_000_000;

    struct TestApp {
        router: Router,
        stores: SyncStores,
        clock: Arc<ManualClock>,
        gateway: Arc<StubGateway>,
        state: AppState,
    }

    fn sync_config() -> SyncConfig {
        SyncConfig {
            webhook_secret: TEST_SECRET.to_string(),
            webhook_format: "generic".to_string(),
            webhook_tolerance_secs: 300,
            webhook_reclaim_after: Duration::from_secs(1800),
            gateway: GatewayConfig {
                base_url: "http://gateway.invalid".to_string(),
                api_key: String::new(),
                timeout: Duration::from_secs(1),
            },
            reconcile: ReconcileConfig::default(),
        }
    }

    fn setup(stores: SyncStores) -> TestApp {
        let clock = Arc::new(ManualClock::new(
            OffsetDateTime::from_unix_timestamp(NOW).unwrap(),
        ));
        let gateway = Arc::new(StubGateway::new(Ok(SubscriptionStatus::Active)));
        let sync =
            SyncService::new(stores.clone(), gateway.clone(), clock.clone(), &sync_config())
                .unwrap();
        let config = Config {
            database_url: String::new(),
            database_direct_url: None,
            store_backend: StoreBackend::Memory,
            bind_address: "127.0.0.1:0".to_string(),
            api_token: TOKEN.to_string(),
            reconcile_in_process: false,
        };
        let state = AppState::new(sync, config);
        TestApp {
            router: create_router(state.clone()),
            stores,
            clock,
            gateway,
            state,
        }
    }

    async fn send(app: &TestApp, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    fn webhook(body: String, signature: &str) -> Request<Body> {
        Request::post("/webhooks/gateway")
            .header("x-webhook-signature", signature)
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap()
    }

    fn get(uri: &str, token: Option<&str>) -> Request<Body> {
        let mut builder = Request::get(uri);
        if let Some(token) = token {
            builder = builder.header(AUTHORIZATION, format!("Bearer {}", token));
        }
        builder.body(Body::empty()).unwrap()
    }

    fn post(uri: &str) -> Request<Body> {
        Request::post(uri)
            .header(AUTHORIZATION, format!("Bearer {}", TOKEN))
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_is_public() {
        let app = setup(SyncStores::in_memory());
        let (status, body) = send(&app, get("/health", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_webhook_applied_then_duplicate() {
        let app = setup(SyncStores::in_memory());
        let body = notification_body("evt_1", "activated", "u1", Some(1));
        let signature = sign_body(&body, app.clock.now()).unwrap();

        let (status, json) = send(&app, webhook(body.clone(), &signature)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["outcome"], "applied");
        assert_eq!(json["status"], "active");

        let (status, json) = send(&app, webhook(body, &signature)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["outcome"], "ignored_duplicate");
    }

    #[tokio::test]
    async fn test_webhook_bad_signature_is_401_and_recorded() {
        let app = setup(SyncStores::in_memory());
        let body = notification_body("evt_1", "activated", "u1", Some(1));

        let (status, json) = send(&app, webhook(body, "t=1,v1=deadbeef")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(json["code"], 401);

        let failed = app
            .stores
            .events
            .list(Some(subsync_billing::ProcessingOutcome::Failed), 10, 0)
            .await
            .unwrap();
        assert_eq!(failed.len(), 1);
        assert!(app.stores.states.get("u1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_webhook_undecodable_is_400() {
        let app = setup(SyncStores::in_memory());
        let body = r#"{"hello":"world"}"#.to_string();
        let signature = sign_body(&body, app.clock.now()).unwrap();

        let (status, _) = send(&app, webhook(body, &signature)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_webhook_processing_failure_is_500() {
        let base = SyncStores::in_memory();
        let failing = Arc::new(FailingSyncStateStore::new(base.states.clone()));
        failing.fail_commits(true);
        let app = setup(SyncStores {
            states: failing,
            ..base
        });

        let body = notification_body("evt_1", "cancelled", "u1", Some(1));
        let signature = sign_body(&body, app.clock.now()).unwrap();
        let (status, json) = send(&app, webhook(body, &signature)).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json["error"], "Internal server error");
    }

    #[tokio::test]
    async fn test_webhook_redelivered_while_claimed_is_409() {
        let base = SyncStores::in_memory();
        let events = Arc::new(FailingEventStore::new(base.events.clone()));
        // Outcome and claim release both fail, leaving the claim open
        events.fail_next_finishes(2);
        let app = setup(SyncStores {
            events,
            ..base
        });

        let body = notification_body("evt_1", "cancelled", "u1", Some(1));
        let signature = sign_body(&body, app.clock.now()).unwrap();
        let (status, _) = send(&app, webhook(body.clone(), &signature)).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);

        let (status, json) = send(&app, webhook(body, &signature)).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(json["error"].as_str().unwrap().contains("evt_1"));
    }

    #[tokio::test]
    async fn test_protected_routes_require_token() {
        let app = setup(SyncStores::in_memory());

        let (status, _) = send(&app, get("/api/v1/subscribers/u1/entitlement", None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = send(
            &app,
            get("/api/v1/subscribers/u1/entitlement", Some("wrong-token")),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, json) = send(
            &app,
            get("/api/v1/subscribers/u1/entitlement", Some(TOKEN)),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "unknown");
        assert_eq!(json["entitled"], false);
        assert_eq!(json["soft"], true);
    }

    #[tokio::test]
    async fn test_subscriber_reads() {
        let app = setup(SyncStores::in_memory());
        let (status, _) = send(&app, get("/api/v1/subscribers/u1/sync", Some(TOKEN))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let body = notification_body("evt_1", "payment_failed", "u1", Some(1));
        let signature = sign_body(&body, app.clock.now()).unwrap();
        send(&app, webhook(body, &signature)).await;

        let (status, json) = send(&app, get("/api/v1/subscribers/u1/sync", Some(TOKEN))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "payment_failed");
        assert_eq!(json["status_source_event_id"], "evt_1");

        let (status, json) = send(
            &app,
            get("/api/v1/subscribers/u1/events?limit=5", Some(TOKEN)),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_admin_state_listing_validates_filter() {
        let app = setup(SyncStores::in_memory());
        let (status, json) = send(
            &app,
            get("/api/v1/admin/sync/states?status=past_due", Some(TOKEN)),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["code"], 400);

        let (status, json) = send(
            &app,
            get("/api/v1/admin/sync/states?status=active&errors_only=true", Some(TOKEN)),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(json.as_array().unwrap().is_empty());

        let (status, json) = send(&app, get("/api/v1/admin/sync/summary", Some(TOKEN))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["total"], 0);
    }

    #[tokio::test]
    async fn test_admin_run_job() {
        let app = setup(SyncStores::in_memory());
        let (status, _) = send(&app, post("/api/v1/admin/jobs/not_a_job/run")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, json) = send(&app, post("/api/v1/admin/jobs/subscription_reconcile/run")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["state"], "completed");
        assert_eq!(json["outcome"], "success");

        let (status, json) = send(
            &app,
            get("/api/v1/admin/jobs/subscription_reconcile", Some(TOKEN)),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["last_outcome"], "success");
    }

    #[tokio::test]
    async fn test_admin_run_job_survives_dropped_request() {
        let app = setup(SyncStores::in_memory());
        let body = notification_body("evt_1", "activated", "u1", Some(1));
        let signature = sign_body(&body, app.clock.now()).unwrap();
        send(&app, webhook(body, &signature)).await;
        app.clock.advance(Duration::from_secs(2 * 3600));
        app.gateway.delay("u1", Duration::from_millis(200));

        let request = send(&app, post("/api/v1/admin/jobs/subscription_reconcile/run"));
        assert!(tokio::time::timeout(Duration::from_millis(20), request)
            .await
            .is_err());

        app.state.tasks.close();
        app.state.tasks.wait().await;
        let run = app
            .stores
            .jobs
            .get("subscription_reconcile")
            .await
            .unwrap()
            .expect("pass recorded after the request was dropped");
        assert_eq!(run.records_repaired, 1);
        assert!(app.stores.jobs.list_leases().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_admin_reconcile_and_invariants() {
        let app = setup(SyncStores::in_memory());
        let (status, json) = send(&app, post("/api/v1/admin/subscribers/u9/reconcile")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["result"], "repaired");
        assert_eq!(json["status"], "active");

        let (status, json) = send(&app, get("/api/v1/admin/invariants", Some(TOKEN))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["healthy"], true);
    }

    #[tokio::test]
    async fn test_admin_replay_rejects_missing_event() {
        let app = setup(SyncStores::in_memory());
        let (status, _) = send(&app, post("/api/v1/admin/webhooks/evt_missing/replay")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, json) = send(&app, post("/api/v1/admin/webhooks/replay-failed")).await;
        assert_eq!(status, StatusCode::OK);
        assert!(json.as_array().unwrap().is_empty());
    }
}
