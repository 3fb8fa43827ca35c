//! Postgres store implementations
//!
//! - event claims use INSERT...ON CONFLICT...RETURNING so only one concurrent
//!   delivery of an event id wins the claim
//! - status commits are a conditional upsert on `status_ordering_key` and
//!   `status_observed_ms`, which keeps the staleness guard race-free across
//!   API instances
//! - job leases are taken with a conditional upsert on `expires_at`

use std::time::Duration;

use async_trait::async_trait;
use sqlx::{FromRow, PgPool};
use time::OffsetDateTime;

use super::{
    ClaimResult, CommitResult, EventStore, JobStore, StateFilter, StatusSummary, SyncStateStore,
};
use crate::error::{BillingError, BillingResult};
use crate::model::{
    JobLease, JobRun, ProcessingOutcome, StatusUpdate, SubscriberSyncState, SubscriptionStatus,
    WebhookEvent,
};

fn as_i64(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn as_u64(n: i64) -> u64 {
    u64::try_from(n).unwrap_or(0)
}

fn as_u32(n: i32) -> u32 {
    u32::try_from(n).unwrap_or(0)
}

// ============================================================================
// Row types
// ============================================================================

#[derive(Debug, FromRow)]
struct WebhookEventRow {
    event_id: String,
    subscriber_id: String,
    event_type: String,
    ordering_key: i64,
    ordering_source: String,
    received_at: OffsetDateTime,
    payload: serde_json::Value,
    processing_outcome: Option<String>,
    attempts: i32,
    claimed_at: OffsetDateTime,
    processed_at: Option<OffsetDateTime>,
    error_message: Option<String>,
}

impl TryFrom<WebhookEventRow> for WebhookEvent {
    type Error = BillingError;

    fn try_from(row: WebhookEventRow) -> Result<Self, Self::Error> {
        Ok(WebhookEvent {
            event_id: row.event_id,
            subscriber_id: row.subscriber_id,
            event_type: row.event_type.parse()?,
            ordering_key: row.ordering_key,
            ordering_source: row.ordering_source.parse()?,
            received_at: row.received_at,
            payload: row.payload,
            processing_outcome: row
                .processing_outcome
                .as_deref()
                .map(str::parse)
                .transpose()?,
            attempts: as_u32(row.attempts),
            claimed_at: row.claimed_at,
            processed_at: row.processed_at,
            error_message: row.error_message,
        })
    }
}

#[derive(Debug, FromRow)]
struct SyncStateRow {
    subscriber_id: String,
    status: String,
    status_source_event_id: Option<String>,
    status_ordering_key: Option<i64>,
    status_observed_ms: Option<i64>,
    last_synced_at: OffsetDateTime,
    error_count: i32,
    last_error: Option<String>,
}

impl TryFrom<SyncStateRow> for SubscriberSyncState {
    type Error = BillingError;

    fn try_from(row: SyncStateRow) -> Result<Self, Self::Error> {
        Ok(SubscriberSyncState {
            subscriber_id: row.subscriber_id,
            status: row.status.parse()?,
            status_source_event_id: row.status_source_event_id,
            status_ordering_key: row.status_ordering_key,
            status_observed_ms: row.status_observed_ms,
            last_synced_at: row.last_synced_at,
            error_count: as_u32(row.error_count),
            last_error: row.last_error,
        })
    }
}

#[derive(Debug, FromRow)]
struct JobRunRow {
    job_key: String,
    last_run_at: Option<OffsetDateTime>,
    last_success_at: Option<OffsetDateTime>,
    last_outcome: String,
    records_examined: i64,
    records_repaired: i64,
    records_failed: i64,
    next_due_at: Option<OffsetDateTime>,
    last_error: Option<String>,
    last_duration_ms: i64,
}

impl TryFrom<JobRunRow> for JobRun {
    type Error = BillingError;

    fn try_from(row: JobRunRow) -> Result<Self, Self::Error> {
        Ok(JobRun {
            job_key: row.job_key,
            last_run_at: row.last_run_at,
            last_success_at: row.last_success_at,
            last_outcome: row.last_outcome.parse()?,
            records_examined: as_u64(row.records_examined),
            records_repaired: as_u64(row.records_repaired),
            records_failed: as_u64(row.records_failed),
            next_due_at: row.next_due_at,
            last_error: row.last_error,
            last_duration_ms: as_u64(row.last_duration_ms),
        })
    }
}

#[derive(Debug, FromRow)]
struct JobLeaseRow {
    job_key: String,
    holder: String,
    acquired_at: OffsetDateTime,
    expires_at: OffsetDateTime,
}

const EVENT_COLUMNS: &str = "event_id, subscriber_id, event_type, ordering_key, ordering_source, \
     received_at, payload, processing_outcome, attempts, claimed_at, processed_at, error_message";

const STATE_COLUMNS: &str = "subscriber_id, status, status_source_event_id, status_ordering_key, \
     status_observed_ms, last_synced_at, error_count, last_error";

// ============================================================================
// PgEventStore
// ============================================================================

pub struct PgEventStore {
    pool: PgPool,
}

impl PgEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn claim(
        &self,
        event: &WebhookEvent,
        now: OffsetDateTime,
        reclaim_after: Duration,
    ) -> BillingResult<ClaimResult> {
        let stuck_before = now - reclaim_after;

        let claimed: Option<(i32,)> = sqlx::query_as(
            r#"
            INSERT INTO webhook_events
                (event_id, subscriber_id, event_type, ordering_key, ordering_source,
                 received_at, payload, processing_outcome, attempts, claimed_at)
            VALUES ($1, $2, $3, $4, $9, $5, $6, NULL, 1, $7)
            ON CONFLICT (event_id) DO UPDATE SET
                processing_outcome = NULL,
                attempts = webhook_events.attempts + 1,
                claimed_at = EXCLUDED.claimed_at,
                processed_at = NULL
            WHERE webhook_events.processing_outcome = 'failed'
               OR (webhook_events.processing_outcome IS NULL
                   AND webhook_events.claimed_at < $8)
            RETURNING attempts
            "#,
        )
        .bind(&event.event_id)
        .bind(&event.subscriber_id)
        .bind(event.event_type.as_str())
        .bind(event.ordering_key)
        .bind(event.received_at)
        .bind(&event.payload)
        .bind(now)
        .bind(stuck_before)
        .bind(event.ordering_source.as_str())
        .fetch_optional(&self.pool)
        .await?;

        if let Some((attempts,)) = claimed {
            return Ok(ClaimResult::Claimed {
                attempt: as_u32(attempts),
            });
        }

        let existing: Option<(Option<String>,)> =
            sqlx::query_as("SELECT processing_outcome FROM webhook_events WHERE event_id = $1")
                .bind(&event.event_id)
                .fetch_optional(&self.pool)
                .await?;

        let outcome = existing
            .and_then(|(outcome,)| outcome)
            .map(|o| o.parse::<ProcessingOutcome>())
            .transpose()?;

        Ok(ClaimResult::Duplicate { outcome })
    }

    async fn record_rejected(&self, event: &WebhookEvent) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO webhook_events
                (event_id, subscriber_id, event_type, ordering_key, received_at, payload,
                 processing_outcome, attempts, claimed_at, processed_at, error_message,
                 ordering_source)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(&event.event_id)
        .bind(&event.subscriber_id)
        .bind(event.event_type.as_str())
        .bind(event.ordering_key)
        .bind(event.received_at)
        .bind(&event.payload)
        .bind(event.processing_outcome.map(|o| o.as_str()))
        .bind(i32::try_from(event.attempts).unwrap_or(i32::MAX))
        .bind(event.claimed_at)
        .bind(event.processed_at)
        .bind(&event.error_message)
        .bind(event.ordering_source.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn finish(
        &self,
        event_id: &str,
        outcome: ProcessingOutcome,
        error_message: Option<&str>,
        processed_at: OffsetDateTime,
    ) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE webhook_events
            SET processing_outcome = $2, error_message = $3, processed_at = $4
            WHERE event_id = $1
            "#,
        )
        .bind(event_id)
        .bind(outcome.as_str())
        .bind(error_message)
        .bind(processed_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::NotFound(format!("webhook event {}", event_id)));
        }
        Ok(())
    }

    async fn get(&self, event_id: &str) -> BillingResult<Option<WebhookEvent>> {
        let row: Option<WebhookEventRow> = sqlx::query_as(&format!(
            "SELECT {} FROM webhook_events WHERE event_id = $1",
            EVENT_COLUMNS
        ))
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(WebhookEvent::try_from).transpose()
    }

    async fn list_for_subscriber(
        &self,
        subscriber_id: &str,
        limit: usize,
    ) -> BillingResult<Vec<WebhookEvent>> {
        let rows: Vec<WebhookEventRow> = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM webhook_events
            WHERE subscriber_id = $1
            ORDER BY received_at DESC, event_id DESC
            LIMIT $2
            "#,
            EVENT_COLUMNS
        ))
        .bind(subscriber_id)
        .bind(as_i64(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(WebhookEvent::try_from).collect()
    }

    async fn list(
        &self,
        outcome: Option<ProcessingOutcome>,
        limit: usize,
        offset: usize,
    ) -> BillingResult<Vec<WebhookEvent>> {
        let rows: Vec<WebhookEventRow> = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM webhook_events
            WHERE ($1::TEXT IS NULL OR processing_outcome = $1)
            ORDER BY received_at DESC, event_id DESC
            LIMIT $2 OFFSET $3
            "#,
            EVENT_COLUMNS
        ))
        .bind(outcome.map(|o| o.as_str()))
        .bind(as_i64(limit))
        .bind(as_i64(offset))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(WebhookEvent::try_from).collect()
    }
}

// ============================================================================
// PgSyncStateStore
// ============================================================================

pub struct PgSyncStateStore {
    pool: PgPool,
}

impl PgSyncStateStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SyncStateStore for PgSyncStateStore {
    async fn get(&self, subscriber_id: &str) -> BillingResult<Option<SubscriberSyncState>> {
        let row: Option<SyncStateRow> = sqlx::query_as(&format!(
            "SELECT {} FROM subscriber_sync_state WHERE subscriber_id = $1",
            STATE_COLUMNS
        ))
        .bind(subscriber_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(SubscriberSyncState::try_from).transpose()
    }

    async fn commit(&self, update: &StatusUpdate) -> BillingResult<CommitResult> {
        // Same guard as state_machine::is_newer, evaluated against the locked row
        let row: Option<SyncStateRow> = sqlx::query_as(&format!(
            r#"
            INSERT INTO subscriber_sync_state
                (subscriber_id, status, status_source_event_id, status_ordering_key,
                 status_observed_ms, last_synced_at, error_count, last_error)
            VALUES ($1, $2, $3, $4, $5, $6, 0, NULL)
            ON CONFLICT (subscriber_id) DO UPDATE SET
                status = EXCLUDED.status,
                status_source_event_id = EXCLUDED.status_source_event_id,
                status_ordering_key = COALESCE(EXCLUDED.status_ordering_key, subscriber_sync_state.status_ordering_key),
                status_observed_ms = GREATEST(subscriber_sync_state.status_observed_ms, EXCLUDED.status_observed_ms),
                last_synced_at = GREATEST(subscriber_sync_state.last_synced_at, EXCLUDED.last_synced_at),
                error_count = 0,
                last_error = NULL
            WHERE CASE $7::TEXT
                WHEN 'sequence' THEN
                    subscriber_sync_state.status_ordering_key IS NULL
                    OR subscriber_sync_state.status_ordering_key < EXCLUDED.status_ordering_key
                WHEN 'timestamp' THEN
                    (subscriber_sync_state.status_ordering_key IS NULL
                     OR subscriber_sync_state.status_ordering_key < EXCLUDED.status_ordering_key)
                    AND (subscriber_sync_state.status_observed_ms IS NULL
                         OR subscriber_sync_state.status_observed_ms < EXCLUDED.status_observed_ms)
                ELSE
                    subscriber_sync_state.status_observed_ms IS NULL
                    OR subscriber_sync_state.status_observed_ms < EXCLUDED.status_observed_ms
            END
            RETURNING {}
            "#,
            STATE_COLUMNS
        ))
        .bind(&update.subscriber_id)
        .bind(update.status.as_str())
        .bind(&update.source_event_id)
        .bind(update.order.key())
        .bind(update.order.observed_ms())
        .bind(update.synced_at)
        .bind(update.order.kind())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(CommitResult::Applied(row.try_into()?)),
            None => {
                let current_key = self
                    .get(&update.subscriber_id)
                    .await?
                    .and_then(|s| s.status_ordering_key);
                Ok(CommitResult::Stale { current_key })
            }
        }
    }

    async fn mark_synced(
        &self,
        subscriber_id: &str,
        at: OffsetDateTime,
    ) -> BillingResult<SubscriberSyncState> {
        let row: SyncStateRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO subscriber_sync_state (subscriber_id, status, last_synced_at, error_count)
            VALUES ($1, 'unknown', $2, 0)
            ON CONFLICT (subscriber_id) DO UPDATE SET
                last_synced_at = GREATEST(subscriber_sync_state.last_synced_at, EXCLUDED.last_synced_at),
                error_count = 0,
                last_error = NULL
            RETURNING {}
            "#,
            STATE_COLUMNS
        ))
        .bind(subscriber_id)
        .bind(at)
        .fetch_one(&self.pool)
        .await?;

        row.try_into()
    }

    async fn record_error(
        &self,
        subscriber_id: &str,
        error: &str,
    ) -> BillingResult<SubscriberSyncState> {
        let row: SyncStateRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO subscriber_sync_state
                (subscriber_id, status, last_synced_at, error_count, last_error)
            VALUES ($1, 'unknown', $2, 1, $3)
            ON CONFLICT (subscriber_id) DO UPDATE SET
                error_count = subscriber_sync_state.error_count + 1,
                last_error = EXCLUDED.last_error
            RETURNING {}
            "#,
            STATE_COLUMNS
        ))
        .bind(subscriber_id)
        .bind(OffsetDateTime::UNIX_EPOCH)
        .bind(error)
        .fetch_one(&self.pool)
        .await?;

        row.try_into()
    }

    async fn select_for_reconciliation(
        &self,
        stale_before: OffsetDateTime,
        error_threshold: u32,
        limit: usize,
    ) -> BillingResult<Vec<SubscriberSyncState>> {
        let rows: Vec<SyncStateRow> = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM subscriber_sync_state
            WHERE last_synced_at < $1 OR error_count > $2
            ORDER BY last_synced_at ASC, subscriber_id ASC
            LIMIT $3
            "#,
            STATE_COLUMNS
        ))
        .bind(stale_before)
        .bind(i32::try_from(error_threshold).unwrap_or(i32::MAX))
        .bind(as_i64(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(SubscriberSyncState::try_from).collect()
    }

    async fn list(
        &self,
        filter: &StateFilter,
        limit: usize,
        offset: usize,
    ) -> BillingResult<Vec<SubscriberSyncState>> {
        let rows: Vec<SyncStateRow> = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM subscriber_sync_state
            WHERE ($1::TEXT IS NULL OR status = $1)
              AND (NOT $2 OR error_count > 0)
            ORDER BY subscriber_id ASC
            LIMIT $3 OFFSET $4
            "#,
            STATE_COLUMNS
        ))
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.errors_only)
        .bind(as_i64(limit))
        .bind(as_i64(offset))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(SubscriberSyncState::try_from).collect()
    }

    async fn summary(&self) -> BillingResult<StatusSummary> {
        let rows: Vec<(String, i64, i64)> = sqlx::query_as(
            r#"
            SELECT status,
                   COUNT(*)::BIGINT AS count,
                   COUNT(*) FILTER (WHERE error_count > 0)::BIGINT AS with_errors
            FROM subscriber_sync_state
            GROUP BY status
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut summary = StatusSummary::default();
        for (status, count, with_errors) in rows {
            let status: SubscriptionStatus = status.parse()?;
            summary.total += as_u64(count);
            summary.with_errors += as_u64(with_errors);
            summary.by_status.insert(status, as_u64(count));
        }
        Ok(summary)
    }
}

// ============================================================================
// PgJobStore
// ============================================================================

pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn try_acquire_lease(
        &self,
        job_key: &str,
        holder: &str,
        now: OffsetDateTime,
        ttl: Duration,
    ) -> BillingResult<bool> {
        let acquired: Option<(String,)> = sqlx::query_as(
            r#"
            INSERT INTO job_leases (job_key, holder, acquired_at, expires_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (job_key) DO UPDATE SET
                holder = EXCLUDED.holder,
                acquired_at = EXCLUDED.acquired_at,
                expires_at = EXCLUDED.expires_at
            WHERE job_leases.expires_at <= EXCLUDED.acquired_at
            RETURNING job_key
            "#,
        )
        .bind(job_key)
        .bind(holder)
        .bind(now)
        .bind(now + ttl)
        .fetch_optional(&self.pool)
        .await?;

        Ok(acquired.is_some())
    }

    async fn renew_lease(
        &self,
        job_key: &str,
        holder: &str,
        now: OffsetDateTime,
        ttl: Duration,
    ) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE job_leases
            SET expires_at = $4
            WHERE job_key = $1 AND holder = $2 AND expires_at > $3
            "#,
        )
        .bind(job_key)
        .bind(holder)
        .bind(now)
        .bind(now + ttl)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn release_lease(&self, job_key: &str, holder: &str) -> BillingResult<()> {
        sqlx::query("DELETE FROM job_leases WHERE job_key = $1 AND holder = $2")
            .bind(job_key)
            .bind(holder)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_leases(&self) -> BillingResult<Vec<JobLease>> {
        let rows: Vec<JobLeaseRow> = sqlx::query_as(
            "SELECT job_key, holder, acquired_at, expires_at FROM job_leases ORDER BY job_key",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| JobLease {
                job_key: row.job_key,
                holder: row.holder,
                acquired_at: row.acquired_at,
                expires_at: row.expires_at,
            })
            .collect())
    }

    async fn record_run(&self, run: &JobRun) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO job_runs
                (job_key, last_run_at, last_success_at, last_outcome, records_examined,
                 records_repaired, records_failed, next_due_at, last_error, last_duration_ms)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (job_key) DO UPDATE SET
                last_run_at = EXCLUDED.last_run_at,
                last_success_at = COALESCE(EXCLUDED.last_success_at, job_runs.last_success_at),
                last_outcome = EXCLUDED.last_outcome,
                records_examined = EXCLUDED.records_examined,
                records_repaired = EXCLUDED.records_repaired,
                records_failed = EXCLUDED.records_failed,
                next_due_at = EXCLUDED.next_due_at,
                last_error = EXCLUDED.last_error,
                last_duration_ms = EXCLUDED.last_duration_ms
            "#,
        )
        .bind(&run.job_key)
        .bind(run.last_run_at)
        .bind(run.last_success_at)
        .bind(run.last_outcome.as_str())
        .bind(i64::try_from(run.records_examined).unwrap_or(i64::MAX))
        .bind(i64::try_from(run.records_repaired).unwrap_or(i64::MAX))
        .bind(i64::try_from(run.records_failed).unwrap_or(i64::MAX))
        .bind(run.next_due_at)
        .bind(&run.last_error)
        .bind(i64::try_from(run.last_duration_ms).unwrap_or(i64::MAX))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, job_key: &str) -> BillingResult<Option<JobRun>> {
        let row: Option<JobRunRow> = sqlx::query_as(
            r#"
            SELECT job_key, last_run_at, last_success_at, last_outcome, records_examined,
                   records_repaired, records_failed, next_due_at, last_error, last_duration_ms
            FROM job_runs
            WHERE job_key = $1
            "#,
        )
        .bind(job_key)
        .fetch_optional(&self.pool)
        .await?;

        row.map(JobRun::try_from).transpose()
    }

    async fn list(&self) -> BillingResult<Vec<JobRun>> {
        let rows: Vec<JobRunRow> = sqlx::query_as(
            r#"
            SELECT job_key, last_run_at, last_success_at, last_outcome, records_examined,
                   records_repaired, records_failed, next_due_at, last_error, last_duration_ms
            FROM job_runs
            ORDER BY job_key
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(JobRun::try_from).collect()
    }
}
