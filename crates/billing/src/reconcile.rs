//! Reconciliation scheduler
//!
//! A pass selects subscribers whose sync state is stale or error-laden, asks
//! the gateway for their authoritative status and commits it through the same
//! state machine ingestion uses. Passes are mutually exclusive per job key via
//! a lease in the Job Metadata Store; a pass that finds the lease held skips.
//!
//! The gateway query runs with an explicit timeout and without the subscriber
//! lock. The lock is taken only to commit the already-fetched result, which is
//! ordered by the time the query was issued: anything the subscriber received
//! after that point wins over the snapshot.
//!
//! The lease is renewed every third of its TTL while the pass runs. A pass
//! that loses its lease stops early.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::clock::{epoch_millis, Clock};
use crate::error::{BillingResult, GatewayError};
use crate::gateway::SubscriptionGateway;
use crate::locks::SubscriberLocks;
use crate::model::{JobOutcome, JobRun, StatusUpdate, SubscriptionStatus, UpdateOrder};
use crate::state_machine::{event_for_status, transition};
use crate::store::{CommitResult, SyncStores};

/// Default job key of the reconciliation pass
pub const DEFAULT_JOB_KEY: &str = "subscription_reconcile";

/// Prefix of synthetic event ids written by reconciliation
pub const RECONCILE_PREFIX: &str = "reconcile-";

#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    pub job_key: String,
    /// Time between scheduled passes, used for `next_due_at`
    pub interval: Duration,
    /// Records synced longer ago than this are selected
    pub staleness_threshold: Duration,
    /// Records with `error_count` above this are selected
    pub error_threshold: u32,
    pub batch_limit: usize,
    /// Concurrent gateway queries within one pass
    pub concurrency: usize,
    pub gateway_timeout: Duration,
    pub lease_ttl: Duration,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            job_key: DEFAULT_JOB_KEY.to_string(),
            interval: Duration::from_secs(300),
            staleness_threshold: Duration::from_secs(3600),
            error_threshold: 0,
            batch_limit: 500,
            concurrency: 8,
            gateway_timeout: Duration::from_secs(10),
            lease_ttl: Duration::from_secs(900),
        }
    }
}

/// What reconciliation did for one subscriber
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum SubscriberOutcome {
    /// Gateway status committed, error bookkeeping reset
    Repaired {
        status: SubscriptionStatus,
        event_id: String,
    },
    /// The subscriber's status was updated after the query was issued
    Superseded { current_key: Option<i64> },
    /// Gateway or store failure, recorded on the subscriber
    Failed { error: String },
}

/// Counts for one completed pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PassSummary {
    pub job_key: String,
    pub outcome: JobOutcome,
    pub records_selected: u64,
    pub records_examined: u64,
    pub records_repaired: u64,
    pub records_failed: u64,
    pub cancelled: bool,
    pub duration_ms: u64,
}

/// Result of a pass trigger
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PassReport {
    /// Another holder owns the run lease; nothing was written
    Skipped { job_key: String },
    Completed(PassSummary),
}

/// Reconciliation scheduler for one job key
#[derive(Clone)]
pub struct Reconciler {
    stores: SyncStores,
    gateway: Arc<dyn SubscriptionGateway>,
    locks: SubscriberLocks,
    clock: Arc<dyn Clock>,
    config: ReconcileConfig,
    holder: String,
}

impl Reconciler {
    pub fn new(
        stores: SyncStores,
        gateway: Arc<dyn SubscriptionGateway>,
        locks: SubscriberLocks,
        clock: Arc<dyn Clock>,
        config: ReconcileConfig,
    ) -> Self {
        Self {
            stores,
            gateway,
            locks,
            clock,
            config,
            holder: Uuid::new_v4().to_string(),
        }
    }

    pub fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    /// Lease holder id of this instance
    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Run one pass unless another holder currently owns the lease
    pub async fn run_pass(&self, cancel: &CancellationToken) -> BillingResult<PassReport> {
        let job_key = self.config.job_key.clone();
        let acquired = self
            .stores
            .jobs
            .try_acquire_lease(&job_key, &self.holder, self.clock.now(), self.config.lease_ttl)
            .await?;

        if !acquired {
            tracing::info!(job_key = %job_key, "Reconciliation lease held elsewhere, skipping pass");
            return Ok(PassReport::Skipped { job_key });
        }

        let result = self.run_leased(cancel).await;

        if let Err(e) = self.stores.jobs.release_lease(&job_key, &self.holder).await {
            tracing::error!(job_key = %job_key, error = %e, "Failed to release reconciliation lease");
        }

        result.map(PassReport::Completed)
    }

    async fn run_leased(&self, cancel: &CancellationToken) -> BillingResult<PassSummary> {
        let started_at = self.clock.now();
        let timer = Instant::now();
        let stale_before = started_at - self.config.staleness_threshold;

        let selected = match self
            .stores
            .states
            .select_for_reconciliation(
                stale_before,
                self.config.error_threshold,
                self.config.batch_limit,
            )
            .await
        {
            Ok(selected) => selected,
            Err(e) => {
                tracing::error!(
                    job_key = %self.config.job_key,
                    error = %e,
                    "Reconciliation selection failed"
                );
                let summary = PassSummary {
                    job_key: self.config.job_key.clone(),
                    outcome: JobOutcome::Failure,
                    records_selected: 0,
                    records_examined: 0,
                    records_repaired: 0,
                    records_failed: 0,
                    cancelled: false,
                    duration_ms: elapsed_ms(timer),
                };
                self.record_run(&summary, started_at, Some(e.to_string()))
                    .await?;
                return Ok(summary);
            }
        };

        let total = selected.len();
        tracing::info!(
            job_key = %self.config.job_key,
            selected = total,
            "Starting reconciliation pass"
        );

        let mut examined: u64 = 0;
        let mut repaired: u64 = 0;
        let mut failed: u64 = 0;
        let mut last_error: Option<String> = None;

        let results = futures::stream::iter(selected)
            .map(|state| async move {
                let outcome = self.reconcile_subscriber(&state.subscriber_id).await;
                (state.subscriber_id, outcome)
            })
            .buffer_unordered(self.config.concurrency.max(1))
            .take_until(cancel.cancelled());
        let mut results = std::pin::pin!(results);

        let mut renewal = tokio::time::interval(
            (self.config.lease_ttl / 3).max(Duration::from_millis(1)),
        );
        renewal.set_missed_tick_behavior(MissedTickBehavior::Delay);
        renewal.tick().await;
        let mut lease_lost = false;

        loop {
            let (subscriber_id, outcome) = tokio::select! {
                next = results.next() => match next {
                    Some(next) => next,
                    None => break,
                },
                _ = renewal.tick() => {
                    if !self.renew_lease().await {
                        lease_lost = true;
                        break;
                    }
                    continue;
                }
            };

            examined += 1;
            match outcome {
                Ok(SubscriberOutcome::Repaired { .. }) => repaired += 1,
                Ok(SubscriberOutcome::Superseded { .. }) => {}
                Ok(SubscriberOutcome::Failed { error }) => {
                    failed += 1;
                    last_error = Some(format!("{}: {}", subscriber_id, error));
                }
                Err(e) => {
                    tracing::error!(
                        subscriber_id = %subscriber_id,
                        error = %e,
                        "Failed to record reconciliation result"
                    );
                    failed += 1;
                    last_error = Some(format!("{}: {}", subscriber_id, e));
                }
            }
        }

        let cancelled = (lease_lost || cancel.is_cancelled()) && examined < total as u64;
        if lease_lost {
            last_error = Some(format!(
                "lease lost after {} of {} subscribers",
                examined, total
            ));
        } else if cancelled && last_error.is_none() {
            last_error = Some(format!(
                "pass cancelled after {} of {} subscribers",
                examined, total
            ));
        }

        let outcome = if failed > 0 || cancelled {
            JobOutcome::PartialFailure
        } else {
            JobOutcome::Success
        };

        let summary = PassSummary {
            job_key: self.config.job_key.clone(),
            outcome,
            records_selected: total as u64,
            records_examined: examined,
            records_repaired: repaired,
            records_failed: failed,
            cancelled,
            duration_ms: elapsed_ms(timer),
        };
        self.record_run(&summary, started_at, last_error).await?;

        tracing::info!(
            job_key = %summary.job_key,
            outcome = %summary.outcome,
            examined = summary.records_examined,
            repaired = summary.records_repaired,
            failed = summary.records_failed,
            cancelled = summary.cancelled,
            "Reconciliation pass complete"
        );

        Ok(summary)
    }

    /// `false` once another holder owns the lease
    async fn renew_lease(&self) -> bool {
        match self
            .stores
            .jobs
            .renew_lease(
                &self.config.job_key,
                &self.holder,
                self.clock.now(),
                self.config.lease_ttl,
            )
            .await
        {
            Ok(true) => {
                tracing::debug!(job_key = %self.config.job_key, "Reconciliation lease renewed");
                true
            }
            Ok(false) => {
                tracing::warn!(
                    job_key = %self.config.job_key,
                    holder = %self.holder,
                    "Reconciliation lease lost, stopping pass"
                );
                false
            }
            // The lease is still valid until its expiry; retry on the next tick
            Err(e) => {
                tracing::warn!(
                    job_key = %self.config.job_key,
                    error = %e,
                    "Failed to renew reconciliation lease"
                );
                true
            }
        }
    }

    async fn record_run(
        &self,
        summary: &PassSummary,
        started_at: time::OffsetDateTime,
        last_error: Option<String>,
    ) -> BillingResult<()> {
        let finished_at = self.clock.now();
        let run = JobRun {
            job_key: summary.job_key.clone(),
            last_run_at: Some(started_at),
            last_success_at: (summary.outcome == JobOutcome::Success).then_some(finished_at),
            last_outcome: summary.outcome,
            records_examined: summary.records_examined,
            records_repaired: summary.records_repaired,
            records_failed: summary.records_failed,
            next_due_at: Some(finished_at + self.config.interval),
            last_error,
            last_duration_ms: summary.duration_ms,
        };
        self.stores.jobs.record_run(&run).await
    }

    /// Reconcile one subscriber against the gateway
    ///
    /// Gateway failures are recorded on the subscriber and returned as
    /// [`SubscriberOutcome::Failed`]; `Err` means the store itself failed.
    pub async fn reconcile_subscriber(
        &self,
        subscriber_id: &str,
    ) -> BillingResult<SubscriberOutcome> {
        // Taken before the query: updates received while it runs must win
        let observed_at = self.clock.now();

        // `unknown` from the gateway has no transition and is never applied
        let fetched = match tokio::time::timeout(
            self.config.gateway_timeout,
            self.gateway.fetch_status(subscriber_id),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Timeout),
        }
        .and_then(|status| transition(event_for_status(status)).ok_or(GatewayError::Indeterminate));

        let _guard = self.locks.lock(subscriber_id).await;

        let status = match fetched {
            Ok(status) => status,
            Err(e) => {
                tracing::warn!(
                    subscriber_id = %subscriber_id,
                    error = %e,
                    "Gateway query failed during reconciliation"
                );
                let error = e.to_string();
                self.stores.states.record_error(subscriber_id, &error).await?;
                return Ok(SubscriberOutcome::Failed { error });
            }
        };

        let event_id = format!("{}{}", RECONCILE_PREFIX, Uuid::new_v4());
        let update = StatusUpdate {
            subscriber_id: subscriber_id.to_string(),
            status,
            source_event_id: event_id.clone(),
            order: UpdateOrder::Snapshot(epoch_millis(observed_at)),
            synced_at: self.clock.now(),
        };

        match self.stores.states.commit(&update).await? {
            CommitResult::Applied(state) => {
                tracing::debug!(
                    subscriber_id = %subscriber_id,
                    status = %state.status,
                    event_id = %event_id,
                    "Subscriber reconciled"
                );
                Ok(SubscriberOutcome::Repaired {
                    status: state.status,
                    event_id,
                })
            }
            CommitResult::Stale { current_key } => {
                tracing::info!(
                    subscriber_id = %subscriber_id,
                    current_key = ?current_key,
                    "Reconciliation superseded by a newer update"
                );
                Ok(SubscriberOutcome::Superseded { current_key })
            }
        }
    }
}

fn elapsed_ms(timer: Instant) -> u64 {
    u64::try_from(timer.elapsed().as_millis()).unwrap_or(u64::MAX)
}
