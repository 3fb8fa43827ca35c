//! Test doubles for the sync engine
//!
//! Used by this crate's tests and by the API crate's router tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

use crate::error::{BillingError, BillingResult, GatewayError};
use crate::gateway::SubscriptionGateway;
use crate::model::{
    ProcessingOutcome, StatusUpdate, SubscriberSyncState, SubscriptionStatus, WebhookEvent,
};
use crate::signature::SignatureVerifier;
use crate::store::{
    ClaimResult, CommitResult, EventStore, StateFilter, StatusSummary, SyncStateStore,
};

/// Webhook secret shared by test handlers and signed bodies
pub const TEST_SECRET: &str = "whsec_subsync_test_secret";

/// Generic-format notification body
pub fn notification_body(
    event_id: &str,
    event_type: &str,
    subscriber_id: &str,
    sequence: Option<i64>,
) -> String {
    let mut body = serde_json::json!({
        "id": event_id,
        "type": event_type,
        "subscriber_id": subscriber_id,
    });
    if let Some(sequence) = sequence {
        body["sequence"] = serde_json::json!(sequence);
    }
    body.to_string()
}

/// Generic-format notification carrying a provider `created` timestamp
pub fn timestamped_body(
    event_id: &str,
    event_type: &str,
    subscriber_id: &str,
    created: OffsetDateTime,
) -> String {
    serde_json::json!({
        "id": event_id,
        "type": event_type,
        "subscriber_id": subscriber_id,
        "created": created.unix_timestamp(),
    })
    .to_string()
}

/// Signature header for `body` under [`TEST_SECRET`]
pub fn sign_body(body: &str, at: OffsetDateTime) -> BillingResult<String> {
    SignatureVerifier::new(TEST_SECRET, 300).sign(body, at.unix_timestamp())
}

type Scripted = Result<SubscriptionStatus, GatewayError>;

/// Scripted gateway: a default response plus per-subscriber overrides
pub struct StubGateway {
    default: Mutex<Scripted>,
    responses: Mutex<HashMap<String, Scripted>>,
    delays: Mutex<HashMap<String, Duration>>,
    calls: AtomicUsize,
    cancel_after: Mutex<Option<(usize, CancellationToken)>>,
}

impl StubGateway {
    pub fn new(default: Scripted) -> Self {
        Self {
            default: Mutex::new(default),
            responses: Mutex::new(HashMap::new()),
            delays: Mutex::new(HashMap::new()),
            calls: AtomicUsize::new(0),
            cancel_after: Mutex::new(None),
        }
    }

    pub fn set_default(&self, response: Scripted) {
        *self.default.lock().unwrap_or_else(PoisonError::into_inner) = response;
    }

    pub fn respond(&self, subscriber_id: &str, response: Scripted) {
        self.responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(subscriber_id.to_string(), response);
    }

    /// Delay the answer for `subscriber_id`
    pub fn delay(&self, subscriber_id: &str, by: Duration) {
        self.delays
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(subscriber_id.to_string(), by);
    }

    /// Cancel `token` once `calls` queries have been answered
    pub fn cancel_after(&self, calls: usize, token: CancellationToken) {
        *self
            .cancel_after
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some((calls, token));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SubscriptionGateway for StubGateway {
    async fn fetch_status(&self, subscriber_id: &str) -> Result<SubscriptionStatus, GatewayError> {
        let delay = self
            .delays
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(subscriber_id)
            .copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let response = self
            .responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(subscriber_id)
            .cloned()
            .unwrap_or_else(|| {
                self.default
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone()
            });

        let calls = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((after, token)) = self
            .cancel_after
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            if calls >= *after {
                token.cancel();
            }
        }

        response
    }
}

/// Sync state store wrapper that fails selected operations on demand
pub struct FailingSyncStateStore {
    inner: Arc<dyn SyncStateStore>,
    fail_commits: AtomicBool,
    fail_selection: AtomicBool,
}

impl FailingSyncStateStore {
    pub fn new(inner: Arc<dyn SyncStateStore>) -> Self {
        Self {
            inner,
            fail_commits: AtomicBool::new(false),
            fail_selection: AtomicBool::new(false),
        }
    }

    pub fn fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }

    pub fn fail_selection(&self, fail: bool) {
        self.fail_selection.store(fail, Ordering::SeqCst);
    }

    fn injected(op: &str) -> BillingError {
        BillingError::Database(format!("injected {} failure", op))
    }
}

#[async_trait]
impl SyncStateStore for FailingSyncStateStore {
    async fn get(&self, subscriber_id: &str) -> BillingResult<Option<SubscriberSyncState>> {
        self.inner.get(subscriber_id).await
    }

    async fn commit(&self, update: &StatusUpdate) -> BillingResult<CommitResult> {
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(Self::injected("commit"));
        }
        self.inner.commit(update).await
    }

    async fn mark_synced(
        &self,
        subscriber_id: &str,
        at: OffsetDateTime,
    ) -> BillingResult<SubscriberSyncState> {
        self.inner.mark_synced(subscriber_id, at).await
    }

    async fn record_error(
        &self,
        subscriber_id: &str,
        error: &str,
    ) -> BillingResult<SubscriberSyncState> {
        self.inner.record_error(subscriber_id, error).await
    }

    async fn select_for_reconciliation(
        &self,
        stale_before: OffsetDateTime,
        error_threshold: u32,
        limit: usize,
    ) -> BillingResult<Vec<SubscriberSyncState>> {
        if self.fail_selection.load(Ordering::SeqCst) {
            return Err(Self::injected("selection"));
        }
        self.inner
            .select_for_reconciliation(stale_before, error_threshold, limit)
            .await
    }

    async fn list(
        &self,
        filter: &StateFilter,
        limit: usize,
        offset: usize,
    ) -> BillingResult<Vec<SubscriberSyncState>> {
        self.inner.list(filter, limit, offset).await
    }

    async fn summary(&self) -> BillingResult<StatusSummary> {
        self.inner.summary().await
    }
}

/// Event store wrapper that fails the next N `finish` calls
pub struct FailingEventStore {
    inner: Arc<dyn EventStore>,
    failing_finishes: AtomicUsize,
}

impl FailingEventStore {
    pub fn new(inner: Arc<dyn EventStore>) -> Self {
        Self {
            inner,
            failing_finishes: AtomicUsize::new(0),
        }
    }

    pub fn fail_next_finishes(&self, count: usize) {
        self.failing_finishes.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl EventStore for FailingEventStore {
    async fn claim(
        &self,
        event: &WebhookEvent,
        now: OffsetDateTime,
        reclaim_after: Duration,
    ) -> BillingResult<ClaimResult> {
        self.inner.claim(event, now, reclaim_after).await
    }

    async fn record_rejected(&self, event: &WebhookEvent) -> BillingResult<()> {
        self.inner.record_rejected(event).await
    }

    async fn finish(
        &self,
        event_id: &str,
        outcome: ProcessingOutcome,
        error_message: Option<&str>,
        processed_at: OffsetDateTime,
    ) -> BillingResult<()> {
        let failing = self
            .failing_finishes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(BillingError::Database("injected finish failure".to_string()));
        }
        self.inner
            .finish(event_id, outcome, error_message, processed_at)
            .await
    }

    async fn get(&self, event_id: &str) -> BillingResult<Option<WebhookEvent>> {
        self.inner.get(event_id).await
    }

    async fn list_for_subscriber(
        &self,
        subscriber_id: &str,
        limit: usize,
    ) -> BillingResult<Vec<WebhookEvent>> {
        self.inner.list_for_subscriber(subscriber_id, limit).await
    }

    async fn list(
        &self,
        outcome: Option<ProcessingOutcome>,
        limit: usize,
        offset: usize,
    ) -> BillingResult<Vec<WebhookEvent>> {
        self.inner.list(outcome, limit, offset).await
    }
}
