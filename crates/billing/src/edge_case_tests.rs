// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for the Sync Engine
//!
//! Tests delivery, ordering and failure behaviour across components:
//! - Idempotence and redelivery (SYNC-I01 to SYNC-I04)
//! - Ordering safety (SYNC-O01 to SYNC-O04)
//! - State machine determinism (SYNC-D01)
//! - Reconciliation (SYNC-R01 to SYNC-R06)
//! - Concurrency (SYNC-C01 to SYNC-C02)
//! - End-to-end (SYNC-E01)

use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

use crate::clock::{Clock, ManualClock};
use crate::config::SyncConfig;
use crate::error::{BillingError, GatewayError};
use crate::gateway::GatewayConfig;
use crate::model::{
    EventType, JobOutcome, OrderingSource, ProcessingOutcome, SubscriberSyncState,
    SubscriptionStatus, WebhookEvent,
};
use crate::reconcile::{PassReport, PassSummary, ReconcileConfig, SubscriberOutcome};
use crate::state_machine::next_status;
use crate::store::{InMemorySyncStateStore, SyncStores};
use crate::testing::{
    notification_body, sign_body, timestamped_body, FailingSyncStateStore, StubGateway,
    TEST_SECRET,
};
use crate::webhooks::IngestOutcome;
use crate::SyncService;

const NOW: i64 = 1_760_000_000;

fn at(secs: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp(secs).unwrap()
}

fn config(reconcile: ReconcileConfig) -> SyncConfig {
    SyncConfig {
        webhook_secret: TEST_SECRET.to_string(),
        webhook_format: "generic".to_string(),
        webhook_tolerance_secs: 300,
        webhook_reclaim_after: Duration::from_secs(30 * 60),
        gateway: GatewayConfig {
            base_url: "http://gateway.invalid".to_string(),
            api_key: String::new(),
            timeout: reconcile.gateway_timeout,
        },
        reconcile,
    }
}

struct Harness {
    service: SyncService,
    stores: SyncStores,
    gateway: Arc<StubGateway>,
    clock: Arc<ManualClock>,
}

impl Harness {
    fn with(stores: SyncStores, start: OffsetDateTime, reconcile: ReconcileConfig) -> Self {
        let gateway = Arc::new(StubGateway::new(Ok(SubscriptionStatus::Active)));
        let clock = Arc::new(ManualClock::new(start));
        let service = SyncService::new(
            stores.clone(),
            gateway.clone(),
            clock.clone(),
            &config(reconcile),
        )
        .unwrap();
        Self {
            service,
            stores,
            gateway,
            clock,
        }
    }

    fn new() -> Self {
        Self::with(SyncStores::in_memory(), at(NOW), ReconcileConfig::default())
    }

    async fn deliver(
        &self,
        event_id: &str,
        event_type: &str,
        subscriber_id: &str,
        key: i64,
    ) -> IngestOutcome {
        self.deliver_body(&notification_body(event_id, event_type, subscriber_id, Some(key)))
            .await
    }

    async fn deliver_body(&self, body: &str) -> IngestOutcome {
        let signature = sign_body(body, self.clock.now()).unwrap();
        self.service.webhooks.ingest(body, &signature).await.unwrap()
    }

    async fn state(&self, subscriber_id: &str) -> SubscriberSyncState {
        self.stores.states.get(subscriber_id).await.unwrap().unwrap()
    }

    async fn event(&self, event_id: &str) -> WebhookEvent {
        self.stores.events.get(event_id).await.unwrap().unwrap()
    }

    async fn pass(&self) -> PassSummary {
        match self
            .service
            .reconciler
            .run_pass(&CancellationToken::new())
            .await
            .unwrap()
        {
            PassReport::Completed(summary) => summary,
            PassReport::Skipped { job_key } => panic!("pass for {} skipped", job_key),
        }
    }
}

fn stale(subscriber_id: &str, status: SubscriptionStatus) -> SubscriberSyncState {
    SubscriberSyncState {
        subscriber_id: subscriber_id.to_string(),
        status,
        status_source_event_id: Some(format!("evt_{}_old", subscriber_id)),
        status_ordering_key: Some(1),
        status_observed_ms: Some((NOW - 7200) * 1000),
        last_synced_at: at(NOW - 7200),
        error_count: 0,
        last_error: None,
    }
}

async fn seeded_stores(states: Vec<SubscriberSyncState>) -> SyncStores {
    let store = Arc::new(InMemorySyncStateStore::new());
    for state in states {
        store.insert(state).await;
    }
    SyncStores {
        states: store,
        ..SyncStores::in_memory()
    }
}

mod idempotence_tests {
    use super::*;

    // =========================================================================
    // SYNC-I01: Same event delivered twice - second is ignored_duplicate
    // =========================================================================
    #[tokio::test]
    async fn test_duplicate_delivery_is_noop() {
        let h = Harness::new();
        let first = h.deliver("evt_1", "activated", "u1", 1).await;
        assert_eq!(first.outcome, ProcessingOutcome::Applied);
        let before = h.state("u1").await;

        h.clock.advance(Duration::from_secs(5));
        let second = h.deliver("evt_1", "activated", "u1", 1).await;
        assert_eq!(second.outcome, ProcessingOutcome::IgnoredDuplicate);
        assert_eq!(second.status, Some(SubscriptionStatus::Active));

        assert_eq!(h.state("u1").await, before, "sync state unchanged");
        let event = h.event("evt_1").await;
        assert_eq!(event.processing_outcome, Some(ProcessingOutcome::Applied));
        assert_eq!(event.attempts, 1);
    }

    // =========================================================================
    // SYNC-I02: Failed delivery redelivered by the gateway - processed again
    // =========================================================================
    #[tokio::test]
    async fn test_failed_event_is_reclaimed_on_redelivery() {
        let base = SyncStores::in_memory();
        let failing = Arc::new(FailingSyncStateStore::new(base.states.clone()));
        let stores = SyncStores {
            states: failing.clone(),
            ..base.clone()
        };
        let h = Harness::with(stores, at(NOW), ReconcileConfig::default());

        failing.fail_commits(true);
        let first = h.deliver("evt_1", "cancelled", "u1", 5).await;
        assert_eq!(first.outcome, ProcessingOutcome::Failed);
        assert_eq!(h.state("u1").await.error_count, 1);

        failing.fail_commits(false);
        let retry = h.deliver("evt_1", "cancelled", "u1", 5).await;
        assert_eq!(retry.outcome, ProcessingOutcome::Applied);

        let state = h.state("u1").await;
        assert_eq!(state.status, SubscriptionStatus::Cancelled);
        assert_eq!(state.error_count, 0);
        assert!(state.last_error.is_none());

        let event = h.event("evt_1").await;
        assert_eq!(event.attempts, 2);
        assert!(event.error_message.is_none());
    }

    // =========================================================================
    // SYNC-I03: In-flight claim - duplicate inside window, reclaimed after 30m
    // =========================================================================
    #[tokio::test]
    async fn test_stuck_claim_reclaimed_after_window() {
        let h = Harness::new();
        let body = notification_body("evt_1", "activated", "u1", Some(1));
        let stuck = WebhookEvent {
            event_id: "evt_1".to_string(),
            subscriber_id: "u1".to_string(),
            event_type: EventType::Activated,
            ordering_key: 1,
            ordering_source: OrderingSource::Sequence,
            received_at: h.clock.now(),
            payload: serde_json::from_str(&body).unwrap(),
            processing_outcome: None,
            attempts: 0,
            claimed_at: h.clock.now(),
            processed_at: None,
            error_message: None,
        };
        h.stores
            .events
            .claim(&stuck, h.clock.now(), Duration::from_secs(1800))
            .await
            .unwrap();

        h.clock.advance(Duration::from_secs(29 * 60));
        let during = h.deliver("evt_1", "activated", "u1", 1).await;
        assert_eq!(during.outcome, ProcessingOutcome::IgnoredDuplicate);
        assert!(h.stores.states.get("u1").await.unwrap().is_none());

        h.clock.advance(Duration::from_secs(2 * 60));
        let after = h.deliver("evt_1", "activated", "u1", 1).await;
        assert_eq!(after.outcome, ProcessingOutcome::Applied);
        assert_eq!(h.event("evt_1").await.attempts, 2);
    }

    // =========================================================================
    // SYNC-I04: Validly signed but replayed 10 minutes later - rejected
    // =========================================================================
    #[tokio::test]
    async fn test_replayed_signature_outside_tolerance_rejected() {
        let h = Harness::new();
        let body = notification_body("evt_1", "activated", "u1", Some(1));
        let signature = sign_body(&body, h.clock.now()).unwrap();

        h.clock.advance(Duration::from_secs(600));
        let result = h.service.webhooks.ingest(&body, &signature).await;
        assert!(matches!(result, Err(BillingError::WebhookSignatureInvalid(_))));
        assert!(h.stores.states.get("u1").await.unwrap().is_none());
        assert!(h.stores.events.get("evt_1").await.unwrap().is_none());

        let failed = h.service.webhooks.list_failed_webhooks(10, 0).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].event_type, EventType::Unknown);
    }
}

mod ordering_tests {
    use super::*;

    // =========================================================================
    // SYNC-O01: E2 (key 2, cancelled) then E1 (key 1, activated) - cancelled wins
    // =========================================================================
    #[tokio::test]
    async fn test_out_of_order_delivery_keeps_newest() {
        let h = Harness::new();
        let e2 = h.deliver("evt_2", "cancelled", "u1", 2).await;
        assert_eq!(e2.outcome, ProcessingOutcome::Applied);

        let e1 = h.deliver("evt_1", "activated", "u1", 1).await;
        assert_eq!(e1.outcome, ProcessingOutcome::IgnoredStale);
        assert_eq!(e1.status, Some(SubscriptionStatus::Cancelled));

        let state = h.state("u1").await;
        assert_eq!(state.status, SubscriptionStatus::Cancelled);
        assert_eq!(state.status_source_event_id.as_deref(), Some("evt_2"));
        assert_eq!(
            h.event("evt_1").await.processing_outcome,
            Some(ProcessingOutcome::IgnoredStale),
            "stale event is still recorded"
        );
    }

    // =========================================================================
    // SYNC-O02: Equal ordering key - treated as stale
    // =========================================================================
    #[tokio::test]
    async fn test_equal_key_is_stale() {
        let h = Harness::new();
        h.deliver("evt_a", "activated", "u1", 7).await;
        let tie = h.deliver("evt_b", "expired", "u1", 7).await;
        assert_eq!(tie.outcome, ProcessingOutcome::IgnoredStale);
        assert_eq!(h.state("u1").await.status, SubscriptionStatus::Active);
    }

    // =========================================================================
    // SYNC-O03: Unknown event type - recorded applied, ordering key not consumed
    // =========================================================================
    #[tokio::test]
    async fn test_unknown_event_does_not_advance_key() {
        let h = Harness::new();
        h.deliver("evt_1", "activated", "u1", 1).await;
        let unknown = h.deliver("evt_2", "invoice.voided", "u1", 5).await;
        assert_eq!(unknown.outcome, ProcessingOutcome::Applied);
        assert_eq!(unknown.status, Some(SubscriptionStatus::Active));

        let later = h.deliver("evt_3", "cancelled", "u1", 3).await;
        assert_eq!(later.outcome, ProcessingOutcome::Applied);
        assert_eq!(h.state("u1").await.status_ordering_key, Some(3));
    }

    // =========================================================================
    // SYNC-O04: Sequence keys stay comparable after a wall-clock reconciliation
    // =========================================================================
    #[tokio::test]
    async fn test_sequence_after_reconcile_still_applies() {
        let mut seeded = stale("u1", SubscriptionStatus::Active);
        seeded.status_ordering_key = Some(5);
        let stores = seeded_stores(vec![seeded]).await;
        let h = Harness::with(stores, at(NOW), ReconcileConfig::default());
        h.gateway.set_default(Ok(SubscriptionStatus::PaymentFailed));

        let summary = h.pass().await;
        assert_eq!(summary.records_repaired, 1);
        let state = h.state("u1").await;
        assert_eq!(state.status, SubscriptionStatus::PaymentFailed);
        assert_eq!(state.status_ordering_key, Some(5));

        h.clock.advance(Duration::from_secs(1));
        let next = h.deliver("evt_6", "renewed", "u1", 6).await;
        assert_eq!(next.outcome, ProcessingOutcome::Applied);
        assert_eq!(h.state("u1").await.status, SubscriptionStatus::Active);

        let replay = h.deliver("evt_5", "cancelled", "u1", 5).await;
        assert_eq!(replay.outcome, ProcessingOutcome::IgnoredStale);
        assert_eq!(h.state("u1").await.status_ordering_key, Some(6));
    }
}

mod determinism_tests {
    use super::*;

    // =========================================================================
    // SYNC-D01: Every event type from every prior status follows the table
    // =========================================================================
    #[tokio::test]
    async fn test_ingestion_follows_transition_table() {
        let mut seeds = Vec::new();
        for prior in SubscriptionStatus::ALL {
            for event_type in EventType::ALL {
                let mut state = stale(&format!("{}_{}", prior, event_type), prior);
                state.last_synced_at = at(NOW - 10);
                seeds.push(state);
            }
        }
        let h = Harness::with(seeded_stores(seeds).await, at(NOW), ReconcileConfig::default());

        for prior in SubscriptionStatus::ALL {
            for event_type in EventType::ALL {
                let subscriber = format!("{}_{}", prior, event_type);
                let outcome = h
                    .deliver(&format!("evt_{}", subscriber), event_type.as_str(), &subscriber, 2)
                    .await;
                assert_eq!(outcome.outcome, ProcessingOutcome::Applied);
                assert_eq!(
                    h.state(&subscriber).await.status,
                    next_status(prior, event_type),
                    "{} applied to {}",
                    event_type,
                    prior
                );
            }
        }
    }
}

mod reconcile_tests {
    use super::*;

    // =========================================================================
    // SYNC-R01: Stale record with no webhook - repaired from the gateway
    // =========================================================================
    #[tokio::test]
    async fn test_pass_repairs_stale_record() {
        let stores = seeded_stores(vec![stale("u1", SubscriptionStatus::Active)]).await;
        let h = Harness::with(stores, at(NOW), ReconcileConfig::default());
        h.gateway.set_default(Ok(SubscriptionStatus::Expired));

        let summary = h.pass().await;
        assert_eq!(summary.outcome, JobOutcome::Success);
        assert_eq!(summary.records_repaired, 1);

        let state = h.state("u1").await;
        assert_eq!(state.status, SubscriptionStatus::Expired);
        assert_eq!(state.last_synced_at, at(NOW));
        assert_eq!(state.status_ordering_key, Some(1), "provider key is kept");
        assert_eq!(state.status_observed_ms, Some(NOW * 1000));
    }

    // =========================================================================
    // SYNC-R02: 10 subscribers, 1 gateway failure - partial_failure, 9 repaired
    // =========================================================================
    #[tokio::test]
    async fn test_one_failure_does_not_abort_pass() {
        let ids: Vec<String> = (0..10).map(|i| format!("u{}", i)).collect();
        let stores = seeded_stores(
            ids.iter()
                .map(|id| stale(id, SubscriptionStatus::PaymentFailed))
                .collect(),
        )
        .await;
        let h = Harness::with(stores, at(NOW), ReconcileConfig::default());
        h.gateway
            .respond("u4", Err(GatewayError::Unavailable("connection refused".to_string())));

        let summary = h.pass().await;
        assert_eq!(summary.outcome, JobOutcome::PartialFailure);
        assert_eq!(summary.records_examined, 10);
        assert_eq!(summary.records_repaired, 9);
        assert_eq!(summary.records_failed, 1);

        for id in &ids {
            let state = h.state(id).await;
            if id == "u4" {
                assert_eq!(state.status, SubscriptionStatus::PaymentFailed, "never guesses");
                assert_eq!(state.error_count, 1);
                assert!(state.last_error.unwrap().contains("connection refused"));
            } else {
                assert_eq!(state.status, SubscriptionStatus::Active);
                assert_eq!(state.error_count, 0);
            }
        }

        let run = h.service.reader.get_job_run(&summary.job_key).await.unwrap().unwrap();
        assert_eq!(run.last_outcome, JobOutcome::PartialFailure);
        assert_eq!(run.records_repaired, 9);
        assert!(run.last_success_at.is_none());
    }

    // =========================================================================
    // SYNC-R03: Lease held by another instance - pass skipped, nothing written
    // =========================================================================
    #[tokio::test]
    async fn test_overlapping_pass_skips() {
        let stores = seeded_stores(vec![stale("u1", SubscriptionStatus::Active)]).await;
        let h = Harness::with(stores, at(NOW), ReconcileConfig::default());
        let key = h.service.reconciler.config().job_key.clone();
        let ttl = h.service.reconciler.config().lease_ttl;

        assert!(h
            .stores
            .jobs
            .try_acquire_lease(&key, "other-instance", h.clock.now(), ttl)
            .await
            .unwrap());

        let report = h
            .service
            .reconciler
            .run_pass(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report, PassReport::Skipped { job_key: key.clone() });
        assert!(h.stores.jobs.get(&key).await.unwrap().is_none());
        assert_eq!(h.gateway.calls(), 0);

        // The leftover lease expires and the next pass proceeds
        h.clock.advance(ttl + Duration::from_secs(1));
        let summary = h.pass().await;
        assert_eq!(summary.records_examined, 1);
        assert!(h.stores.jobs.list_leases().await.unwrap().is_empty());
    }

    // =========================================================================
    // SYNC-R04: Cancelled mid-scan - partial_failure with completed counts
    // =========================================================================
    #[tokio::test]
    async fn test_cancelled_pass_records_partial_failure() {
        let ids: Vec<String> = (0..5).map(|i| format!("u{}", i)).collect();
        let stores = seeded_stores(
            ids.iter()
                .map(|id| stale(id, SubscriptionStatus::Cancelled))
                .collect(),
        )
        .await;
        let reconcile = ReconcileConfig {
            concurrency: 1,
            ..ReconcileConfig::default()
        };
        let h = Harness::with(stores, at(NOW), reconcile);

        let token = CancellationToken::new();
        h.gateway.cancel_after(2, token.clone());

        let report = h.service.reconciler.run_pass(&token).await.unwrap();
        let PassReport::Completed(summary) = report else {
            panic!("pass skipped");
        };
        assert!(summary.cancelled);
        assert_eq!(summary.outcome, JobOutcome::PartialFailure);
        assert_eq!(summary.records_selected, 5);
        assert_eq!(summary.records_examined, 2);
        assert_eq!(summary.records_repaired, 2);
        assert_eq!(h.gateway.calls(), 2);

        let run = h.stores.jobs.get(&summary.job_key).await.unwrap().unwrap();
        assert_eq!(run.last_outcome, JobOutcome::PartialFailure);
        assert_eq!(run.records_examined, 2);
        assert!(run.last_error.unwrap().contains("cancelled"));

        let untouched = futures::future::join_all(ids.iter().map(|id| h.state(id))).await;
        let still_stale = untouched
            .iter()
            .filter(|s| s.status == SubscriptionStatus::Cancelled)
            .count();
        assert_eq!(still_stale, 3);
    }

    // =========================================================================
    // SYNC-R05: Slow gateway - query times out, error recorded, status kept
    // =========================================================================
    #[tokio::test]
    async fn test_gateway_timeout_is_bounded() {
        let stores = seeded_stores(vec![
            stale("slow", SubscriptionStatus::Active),
            stale("fast", SubscriptionStatus::Active),
        ])
        .await;
        let reconcile = ReconcileConfig {
            gateway_timeout: Duration::from_millis(50),
            ..ReconcileConfig::default()
        };
        let h = Harness::with(stores, at(NOW), reconcile);
        h.gateway.set_default(Ok(SubscriptionStatus::Cancelled));
        h.gateway.delay("slow", Duration::from_secs(5));

        let started = std::time::Instant::now();
        let summary = h.pass().await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(summary.records_failed, 1);

        let slow = h.state("slow").await;
        assert_eq!(slow.status, SubscriptionStatus::Active);
        assert_eq!(
            slow.last_error,
            Some(GatewayError::Timeout.to_string())
        );
        assert_eq!(h.state("fast").await.status, SubscriptionStatus::Cancelled);
    }

    // =========================================================================
    // SYNC-R06: Failing record is retried on the next pass and cleared
    // =========================================================================
    #[tokio::test]
    async fn test_error_count_cleared_by_later_pass() {
        let stores = seeded_stores(vec![stale("u1", SubscriptionStatus::Active)]).await;
        let h = Harness::with(stores, at(NOW), ReconcileConfig::default());
        h.gateway.set_default(Err(GatewayError::Malformed("bad json".to_string())));

        h.pass().await;
        h.pass().await;
        assert_eq!(h.state("u1").await.error_count, 2);

        h.gateway.set_default(Ok(SubscriptionStatus::Active));
        let summary = h.pass().await;
        assert_eq!(summary.outcome, JobOutcome::Success);
        let state = h.state("u1").await;
        assert_eq!(state.error_count, 0);
        assert!(state.last_error.is_none());

        let run = h.service.reader.get_job_run(&summary.job_key).await.unwrap().unwrap();
        assert_eq!(run.last_success_at, Some(at(NOW)));
    }
}

mod concurrency_tests {
    use super::*;

    // =========================================================================
    // SYNC-C01: 100 concurrent deliveries, shuffled - highest key wins
    // =========================================================================
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_ingestion_keeps_highest_key() {
        let h = Arc::new(Harness::new());
        const TYPES: [&str; 5] = ["activated", "cancelled", "payment_failed", "renewed", "expired"];

        // 37 is coprime with 100, so this visits every key once in scrambled order
        let handles: Vec<_> = (0..100i64)
            .map(|i| {
                let key = (i * 37) % 100 + 1;
                let h = h.clone();
                tokio::spawn(async move {
                    let event_type = TYPES[(key as usize) % TYPES.len()];
                    h.deliver(&format!("evt_{}", key), event_type, "u1", key)
                        .await
                })
            })
            .collect();

        for handle in handles {
            let outcome = handle.await.unwrap();
            assert_ne!(outcome.outcome, ProcessingOutcome::Failed);
        }

        let state = h.state("u1").await;
        assert_eq!(state.status_source_event_id.as_deref(), Some("evt_100"));
        assert_eq!(state.status_ordering_key, Some(100));
        assert_eq!(state.status, SubscriptionStatus::Active);

        let events = h.service.reader.recent_events("u1", 200).await.unwrap();
        assert_eq!(events.len(), 100);
    }

    // =========================================================================
    // SYNC-C02: Webhook created while the gateway query is in flight - webhook wins
    // =========================================================================
    #[tokio::test]
    async fn test_webhook_during_gateway_query_wins() {
        let stores = seeded_stores(vec![stale("u1", SubscriptionStatus::Active)]).await;
        let h = Arc::new(Harness::with(stores, at(NOW), ReconcileConfig::default()));
        h.gateway.set_default(Ok(SubscriptionStatus::Active));
        h.gateway.delay("u1", Duration::from_millis(100));

        let reconcile = {
            let h = h.clone();
            tokio::spawn(async move { h.service.reconciler.reconcile_subscriber("u1").await })
        };

        // The provider emits the event one second into the query and it
        // arrives a second later, before the query returns
        tokio::time::sleep(Duration::from_millis(20)).await;
        h.clock.advance(Duration::from_secs(2));
        let body = timestamped_body("evt_late", "cancelled", "u1", at(NOW + 1));
        let webhook = h.deliver_body(&body).await;
        assert_eq!(
            webhook.outcome,
            ProcessingOutcome::Applied,
            "lock is not held during the gateway query"
        );

        let outcome = reconcile.await.unwrap().unwrap();
        assert_eq!(
            outcome,
            SubscriberOutcome::Superseded {
                current_key: Some((NOW + 1) * 1000)
            }
        );
        let state = h.state("u1").await;
        assert_eq!(state.status, SubscriptionStatus::Cancelled);
        assert_eq!(state.status_source_event_id.as_deref(), Some("evt_late"));
    }
}

mod end_to_end_tests {
    use super::*;

    // =========================================================================
    // SYNC-E01: u1 unknown -> active (1) -> payment_failed (2) -> active
    // (reconciled) -> cancelled (3)
    // =========================================================================
    #[tokio::test]
    async fn test_subscriber_lifecycle() {
        let reconcile = ReconcileConfig {
            staleness_threshold: Duration::ZERO,
            ..ReconcileConfig::default()
        };
        let h = Harness::with(SyncStores::in_memory(), at(NOW), reconcile);

        let entitlement = h.service.reader.entitlement("u1").await.unwrap();
        assert_eq!(entitlement.status, SubscriptionStatus::Unknown);

        let activated = h.deliver("evt_1", "activated", "u1", 1).await;
        assert_eq!(activated.status, Some(SubscriptionStatus::Active));

        h.clock.advance(Duration::from_secs(1));
        let failed = h.deliver("evt_2", "payment_failed", "u1", 2).await;
        assert_eq!(failed.status, Some(SubscriptionStatus::PaymentFailed));
        let state = h.state("u1").await;
        assert_eq!(state.error_count, 0);
        assert!(!h.service.reader.entitlement("u1").await.unwrap().entitled);

        h.clock.advance(Duration::from_secs(1));
        h.gateway.set_default(Ok(SubscriptionStatus::Active));
        let summary = h.pass().await;
        assert_eq!(summary.records_repaired, 1);

        let state = h.state("u1").await;
        assert_eq!(state.status, SubscriptionStatus::Active);
        assert_eq!(state.status_ordering_key, Some(2));
        assert_eq!(state.status_observed_ms, Some((NOW + 2) * 1000));
        assert!(state
            .status_source_event_id
            .unwrap()
            .starts_with(crate::reconcile::RECONCILE_PREFIX));
        assert!(h.service.reader.entitlement("u1").await.unwrap().entitled);

        h.clock.advance(Duration::from_secs(1));
        let cancelled = h.deliver("evt_3", "cancelled", "u1", 3).await;
        assert_eq!(cancelled.outcome, ProcessingOutcome::Applied);
        let state = h.state("u1").await;
        assert_eq!(state.status, SubscriptionStatus::Cancelled);
        assert_eq!(state.status_ordering_key, Some(3));
        assert_eq!(state.status_source_event_id.as_deref(), Some("evt_3"));

        let checks = h.service.invariants.run_all_checks().await.unwrap();
        assert!(checks.healthy, "violations: {:?}", checks.violations);
    }
}
