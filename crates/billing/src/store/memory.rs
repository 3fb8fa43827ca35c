//! In-memory store implementations

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use super::{
    ClaimResult, CommitResult, EventStore, JobStore, StateFilter, StatusSummary, SyncStateStore,
};
use crate::error::{BillingError, BillingResult};
use crate::model::{
    JobLease, JobRun, ProcessingOutcome, StatusUpdate, SubscriberSyncState, WebhookEvent,
};
use crate::state_machine::is_newer;

// ============================================================================
// InMemoryEventStore
// ============================================================================

#[derive(Default)]
pub struct InMemoryEventStore {
    events: RwLock<HashMap<String, WebhookEvent>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn newest_first(mut events: Vec<WebhookEvent>) -> Vec<WebhookEvent> {
        events.sort_by(|a, b| {
            b.received_at
                .cmp(&a.received_at)
                .then_with(|| b.event_id.cmp(&a.event_id))
        });
        events
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn claim(
        &self,
        event: &WebhookEvent,
        now: OffsetDateTime,
        reclaim_after: Duration,
    ) -> BillingResult<ClaimResult> {
        let mut events = self.events.write().await;

        let existing = match events.entry(event.event_id.clone()) {
            Entry::Vacant(slot) => {
                let mut claimed = event.clone();
                claimed.processing_outcome = None;
                claimed.attempts = 1;
                claimed.claimed_at = now;
                claimed.processed_at = None;
                slot.insert(claimed);
                return Ok(ClaimResult::Claimed { attempt: 1 });
            }
            Entry::Occupied(slot) => slot.into_mut(),
        };

        let reclaimable = match existing.processing_outcome {
            Some(ProcessingOutcome::Failed) => true,
            None => existing.claimed_at + reclaim_after < now,
            Some(_) => false,
        };

        if !reclaimable {
            return Ok(ClaimResult::Duplicate {
                outcome: existing.processing_outcome,
            });
        }

        existing.attempts = existing.attempts.saturating_add(1);
        existing.processing_outcome = None;
        existing.claimed_at = now;
        existing.processed_at = None;
        Ok(ClaimResult::Claimed {
            attempt: existing.attempts,
        })
    }

    async fn record_rejected(&self, event: &WebhookEvent) -> BillingResult<()> {
        let mut events = self.events.write().await;
        if events.contains_key(&event.event_id) {
            return Err(BillingError::Database(format!(
                "duplicate event id {}",
                event.event_id
            )));
        }
        events.insert(event.event_id.clone(), event.clone());
        Ok(())
    }

    async fn finish(
        &self,
        event_id: &str,
        outcome: ProcessingOutcome,
        error_message: Option<&str>,
        processed_at: OffsetDateTime,
    ) -> BillingResult<()> {
        let mut events = self.events.write().await;
        let event = events
            .get_mut(event_id)
            .ok_or_else(|| BillingError::NotFound(format!("webhook event {}", event_id)))?;
        event.processing_outcome = Some(outcome);
        event.error_message = error_message.map(str::to_string);
        event.processed_at = Some(processed_at);
        Ok(())
    }

    async fn get(&self, event_id: &str) -> BillingResult<Option<WebhookEvent>> {
        Ok(self.events.read().await.get(event_id).cloned())
    }

    async fn list_for_subscriber(
        &self,
        subscriber_id: &str,
        limit: usize,
    ) -> BillingResult<Vec<WebhookEvent>> {
        let events = self.events.read().await;
        let matching = events
            .values()
            .filter(|e| e.subscriber_id == subscriber_id)
            .cloned()
            .collect();
        Ok(Self::newest_first(matching).into_iter().take(limit).collect())
    }

    async fn list(
        &self,
        outcome: Option<ProcessingOutcome>,
        limit: usize,
        offset: usize,
    ) -> BillingResult<Vec<WebhookEvent>> {
        let events = self.events.read().await;
        let matching = events
            .values()
            .filter(|e| outcome.is_none() || e.processing_outcome == outcome)
            .cloned()
            .collect();
        Ok(Self::newest_first(matching)
            .into_iter()
            .skip(offset)
            .take(limit)
            .collect())
    }
}

// ============================================================================
// InMemorySyncStateStore
// ============================================================================

#[derive(Default)]
pub struct InMemorySyncStateStore {
    states: RwLock<HashMap<String, SubscriberSyncState>>,
}

impl InMemorySyncStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed records directly (tests and fixtures)
    pub async fn insert(&self, state: SubscriberSyncState) {
        self.states
            .write()
            .await
            .insert(state.subscriber_id.clone(), state);
    }
}

#[async_trait]
impl SyncStateStore for InMemorySyncStateStore {
    async fn get(&self, subscriber_id: &str) -> BillingResult<Option<SubscriberSyncState>> {
        Ok(self.states.read().await.get(subscriber_id).cloned())
    }

    async fn commit(&self, update: &StatusUpdate) -> BillingResult<CommitResult> {
        let mut states = self.states.write().await;
        let state = states
            .entry(update.subscriber_id.clone())
            .or_insert_with(|| SubscriberSyncState::unsynced(update.subscriber_id.clone()));

        if !is_newer(state.status_ordering_key, state.status_observed_ms, update.order) {
            return Ok(CommitResult::Stale {
                current_key: state.status_ordering_key,
            });
        }

        state.status = update.status;
        state.status_source_event_id = Some(update.source_event_id.clone());
        state.status_ordering_key = update.order.key().or(state.status_ordering_key);
        state.status_observed_ms = Some(
            state
                .status_observed_ms
                .map_or(update.order.observed_ms(), |ms| ms.max(update.order.observed_ms())),
        );
        state.last_synced_at = state.last_synced_at.max(update.synced_at);
        state.error_count = 0;
        state.last_error = None;

        Ok(CommitResult::Applied(state.clone()))
    }

    async fn mark_synced(
        &self,
        subscriber_id: &str,
        at: OffsetDateTime,
    ) -> BillingResult<SubscriberSyncState> {
        let mut states = self.states.write().await;
        let state = states
            .entry(subscriber_id.to_string())
            .or_insert_with(|| SubscriberSyncState::unsynced(subscriber_id));
        state.last_synced_at = state.last_synced_at.max(at);
        state.error_count = 0;
        state.last_error = None;
        Ok(state.clone())
    }

    async fn record_error(
        &self,
        subscriber_id: &str,
        error: &str,
    ) -> BillingResult<SubscriberSyncState> {
        let mut states = self.states.write().await;
        let state = states
            .entry(subscriber_id.to_string())
            .or_insert_with(|| SubscriberSyncState::unsynced(subscriber_id));
        state.error_count = state.error_count.saturating_add(1);
        state.last_error = Some(error.to_string());
        Ok(state.clone())
    }

    async fn select_for_reconciliation(
        &self,
        stale_before: OffsetDateTime,
        error_threshold: u32,
        limit: usize,
    ) -> BillingResult<Vec<SubscriberSyncState>> {
        let states = self.states.read().await;
        let mut selected: Vec<SubscriberSyncState> = states
            .values()
            .filter(|s| s.last_synced_at < stale_before || s.error_count > error_threshold)
            .cloned()
            .collect();
        selected.sort_by(|a, b| {
            a.last_synced_at
                .cmp(&b.last_synced_at)
                .then_with(|| a.subscriber_id.cmp(&b.subscriber_id))
        });
        selected.truncate(limit);
        Ok(selected)
    }

    async fn list(
        &self,
        filter: &StateFilter,
        limit: usize,
        offset: usize,
    ) -> BillingResult<Vec<SubscriberSyncState>> {
        let states = self.states.read().await;
        let mut matching: Vec<SubscriberSyncState> = states
            .values()
            .filter(|s| filter.status.map_or(true, |status| s.status == status))
            .filter(|s| !filter.errors_only || s.error_count > 0)
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.subscriber_id.cmp(&b.subscriber_id));
        Ok(matching.into_iter().skip(offset).take(limit).collect())
    }

    async fn summary(&self) -> BillingResult<StatusSummary> {
        let states = self.states.read().await;
        let mut summary = StatusSummary::default();
        for state in states.values() {
            summary.total += 1;
            *summary.by_status.entry(state.status).or_insert(0) += 1;
            if state.error_count > 0 {
                summary.with_errors += 1;
            }
        }
        Ok(summary)
    }
}

// ============================================================================
// InMemoryJobStore
// ============================================================================

#[derive(Default)]
pub struct InMemoryJobStore {
    runs: RwLock<HashMap<String, JobRun>>,
    leases: RwLock<HashMap<String, JobLease>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn try_acquire_lease(
        &self,
        job_key: &str,
        holder: &str,
        now: OffsetDateTime,
        ttl: Duration,
    ) -> BillingResult<bool> {
        let mut leases = self.leases.write().await;
        if let Some(lease) = leases.get(job_key) {
            if lease.expires_at > now {
                return Ok(false);
            }
        }
        leases.insert(
            job_key.to_string(),
            JobLease {
                job_key: job_key.to_string(),
                holder: holder.to_string(),
                acquired_at: now,
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn renew_lease(
        &self,
        job_key: &str,
        holder: &str,
        now: OffsetDateTime,
        ttl: Duration,
    ) -> BillingResult<bool> {
        let mut leases = self.leases.write().await;
        match leases.get_mut(job_key) {
            Some(lease) if lease.holder == holder && lease.expires_at > now => {
                lease.expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_lease(&self, job_key: &str, holder: &str) -> BillingResult<()> {
        let mut leases = self.leases.write().await;
        if leases.get(job_key).is_some_and(|l| l.holder == holder) {
            leases.remove(job_key);
        }
        Ok(())
    }

    async fn list_leases(&self) -> BillingResult<Vec<JobLease>> {
        let mut leases: Vec<JobLease> = self.leases.read().await.values().cloned().collect();
        leases.sort_by(|a, b| a.job_key.cmp(&b.job_key));
        Ok(leases)
    }

    async fn record_run(&self, run: &JobRun) -> BillingResult<()> {
        let mut runs = self.runs.write().await;
        let mut updated = run.clone();
        if updated.last_success_at.is_none() {
            updated.last_success_at = runs.get(&run.job_key).and_then(|r| r.last_success_at);
        }
        runs.insert(run.job_key.clone(), updated);
        Ok(())
    }

    async fn get(&self, job_key: &str) -> BillingResult<Option<JobRun>> {
        Ok(self.runs.read().await.get(job_key).cloned())
    }

    async fn list(&self) -> BillingResult<Vec<JobRun>> {
        let mut runs: Vec<JobRun> = self.runs.read().await.values().cloned().collect();
        runs.sort_by(|a, b| a.job_key.cmp(&b.job_key));
        Ok(runs)
    }
}
