//! Storage seams for the sync engine
//!
//! Each store has an in-memory implementation (tests, local development) and a
//! Postgres implementation. Writers:
//! - [`EventStore`]: ingestion only
//! - [`SyncStateStore`]: ingestion and reconciliation
//! - [`JobStore`]: the reconciliation scheduler only

pub mod memory;
pub mod postgres;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use sqlx::PgPool;
use time::OffsetDateTime;

use crate::error::BillingResult;
use crate::model::{
    JobLease, JobRun, ProcessingOutcome, StatusUpdate, SubscriberSyncState, SubscriptionStatus,
    WebhookEvent,
};

pub use memory::{InMemoryEventStore, InMemoryJobStore, InMemorySyncStateStore};
pub use postgres::{PgEventStore, PgJobStore, PgSyncStateStore};

/// Result of trying to claim an event for processing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimResult {
    /// This caller owns the delivery attempt
    Claimed { attempt: u32 },
    /// Already handled, or in flight elsewhere (`outcome` is `None`)
    Duplicate { outcome: Option<ProcessingOutcome> },
}

/// Result of a compare-and-swap status commit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitResult {
    Applied(SubscriberSyncState),
    /// The stored ordering key was not older than the update's
    Stale { current_key: Option<i64> },
}

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Insert `event`, or re-claim an existing row that previously failed or
    /// whose in-flight claim is older than `reclaim_after`
    async fn claim(
        &self,
        event: &WebhookEvent,
        now: OffsetDateTime,
        reclaim_after: Duration,
    ) -> BillingResult<ClaimResult>;

    /// Insert a row that is already finished (authenticity failures)
    async fn record_rejected(&self, event: &WebhookEvent) -> BillingResult<()>;

    /// Set the outcome of the current delivery attempt
    async fn finish(
        &self,
        event_id: &str,
        outcome: ProcessingOutcome,
        error_message: Option<&str>,
        processed_at: OffsetDateTime,
    ) -> BillingResult<()>;

    async fn get(&self, event_id: &str) -> BillingResult<Option<WebhookEvent>>;

    /// Newest first
    async fn list_for_subscriber(
        &self,
        subscriber_id: &str,
        limit: usize,
    ) -> BillingResult<Vec<WebhookEvent>>;

    /// Newest first, optionally filtered by outcome
    async fn list(
        &self,
        outcome: Option<ProcessingOutcome>,
        limit: usize,
        offset: usize,
    ) -> BillingResult<Vec<WebhookEvent>>;
}

/// Filter for listing sync states
#[derive(Debug, Clone, Default)]
pub struct StateFilter {
    pub status: Option<SubscriptionStatus>,
    pub errors_only: bool,
}

/// Aggregate counts for admin monitoring
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusSummary {
    pub total: u64,
    pub by_status: HashMap<SubscriptionStatus, u64>,
    pub with_errors: u64,
}

#[async_trait]
pub trait SyncStateStore: Send + Sync {
    async fn get(&self, subscriber_id: &str) -> BillingResult<Option<SubscriberSyncState>>;

    /// Apply `update` only if its ordering key is strictly newer than the
    /// stored one. On success `error_count` is reset, `last_error` cleared and
    /// `last_synced_at` advanced monotonically.
    async fn commit(&self, update: &StatusUpdate) -> BillingResult<CommitResult>;

    /// Successful sync that leaves status untouched
    async fn mark_synced(
        &self,
        subscriber_id: &str,
        at: OffsetDateTime,
    ) -> BillingResult<SubscriberSyncState>;

    /// Increment `error_count` and set `last_error`, creating the record if needed
    async fn record_error(
        &self,
        subscriber_id: &str,
        error: &str,
    ) -> BillingResult<SubscriberSyncState>;

    /// Records synced before `stale_before` or with `error_count > error_threshold`,
    /// least recently synced first
    async fn select_for_reconciliation(
        &self,
        stale_before: OffsetDateTime,
        error_threshold: u32,
        limit: usize,
    ) -> BillingResult<Vec<SubscriberSyncState>>;

    async fn list(
        &self,
        filter: &StateFilter,
        limit: usize,
        offset: usize,
    ) -> BillingResult<Vec<SubscriberSyncState>>;

    async fn summary(&self) -> BillingResult<StatusSummary>;
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Take the run lease for `job_key` if it is free or expired
    async fn try_acquire_lease(
        &self,
        job_key: &str,
        holder: &str,
        now: OffsetDateTime,
        ttl: Duration,
    ) -> BillingResult<bool>;

    /// Extend the lease to `now + ttl` if `holder` still owns it and it has
    /// not expired; `false` means the lease was lost
    async fn renew_lease(
        &self,
        job_key: &str,
        holder: &str,
        now: OffsetDateTime,
        ttl: Duration,
    ) -> BillingResult<bool>;

    /// Release the lease if `holder` still owns it
    async fn release_lease(&self, job_key: &str, holder: &str) -> BillingResult<()>;

    async fn list_leases(&self) -> BillingResult<Vec<JobLease>>;

    /// Upsert the run record; `last_success_at` is kept when `run` has none
    async fn record_run(&self, run: &JobRun) -> BillingResult<()>;

    async fn get(&self, job_key: &str) -> BillingResult<Option<JobRun>>;

    async fn list(&self) -> BillingResult<Vec<JobRun>>;
}

/// The three stores behind one engine instance
#[derive(Clone)]
pub struct SyncStores {
    pub events: Arc<dyn EventStore>,
    pub states: Arc<dyn SyncStateStore>,
    pub jobs: Arc<dyn JobStore>,
}

impl SyncStores {
    pub fn in_memory() -> Self {
        Self {
            events: Arc::new(InMemoryEventStore::new()),
            states: Arc::new(InMemorySyncStateStore::new()),
            jobs: Arc::new(InMemoryJobStore::new()),
        }
    }

    pub fn postgres(pool: PgPool) -> Self {
        Self {
            events: Arc::new(PgEventStore::new(pool.clone())),
            states: Arc::new(PgSyncStateStore::new(pool.clone())),
            jobs: Arc::new(PgJobStore::new(pool)),
        }
    }
}
