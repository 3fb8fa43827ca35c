//! Read-only projections over the sync stores
//!
//! Used for feature gating and operational monitoring. Nothing here mutates state.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::clock::Clock;
use crate::error::BillingResult;
use crate::model::{JobRun, SubscriberSyncState, SubscriptionStatus, WebhookEvent};
use crate::store::{StateFilter, StatusSummary, SyncStores};

/// Entitlement view of one subscriber
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Entitlement {
    pub subscriber_id: String,
    pub status: SubscriptionStatus,
    pub entitled: bool,
    /// Sync has lagged: callers gating high-stakes features may want to
    /// confirm with the gateway directly
    pub soft: bool,
}

#[derive(Clone)]
pub struct SyncReader {
    stores: SyncStores,
    clock: Arc<dyn Clock>,
    staleness_threshold: Duration,
}

impl SyncReader {
    pub fn new(stores: SyncStores, clock: Arc<dyn Clock>, staleness_threshold: Duration) -> Self {
        Self {
            stores,
            clock,
            staleness_threshold,
        }
    }

    pub async fn get_state(&self, subscriber_id: &str) -> BillingResult<Option<SubscriberSyncState>> {
        self.stores.states.get(subscriber_id).await
    }

    /// Newest first
    pub async fn recent_events(
        &self,
        subscriber_id: &str,
        limit: usize,
    ) -> BillingResult<Vec<WebhookEvent>> {
        self.stores
            .events
            .list_for_subscriber(subscriber_id, limit)
            .await
    }

    pub async fn status_summary(&self) -> BillingResult<StatusSummary> {
        self.stores.states.summary().await
    }

    pub async fn list_states(
        &self,
        filter: &StateFilter,
        limit: usize,
        offset: usize,
    ) -> BillingResult<Vec<SubscriberSyncState>> {
        self.stores.states.list(filter, limit, offset).await
    }

    pub async fn get_job_run(&self, job_key: &str) -> BillingResult<Option<JobRun>> {
        self.stores.jobs.get(job_key).await
    }

    pub async fn list_job_runs(&self) -> BillingResult<Vec<JobRun>> {
        self.stores.jobs.list().await
    }

    /// Entitlement from the last synced status; an unseen subscriber is
    /// `unknown`, not entitled, and soft
    pub async fn entitlement(&self, subscriber_id: &str) -> BillingResult<Entitlement> {
        let state = self.stores.states.get(subscriber_id).await?;

        let Some(state) = state else {
            return Ok(Entitlement {
                subscriber_id: subscriber_id.to_string(),
                status: SubscriptionStatus::Unknown,
                entitled: false,
                soft: true,
            });
        };

        let stale_before = self.clock.now() - self.staleness_threshold;
        let soft = state.error_count > 0 || state.last_synced_at < stale_before;

        Ok(Entitlement {
            subscriber_id: state.subscriber_id,
            status: state.status,
            entitled: state.status.is_entitled(),
            soft,
        })
    }
}
