//! Sync engine invariants
//!
//! Runnable consistency checks over the sync stores. They only read and can be
//! run after a replay or a reconciliation pass to confirm the stores are sane.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::clock::Clock;
use crate::error::BillingResult;
use crate::model::{JobOutcome, SubscriberSyncState, SubscriptionStatus};
use crate::store::{StateFilter, SyncStores};

const PAGE_SIZE: usize = 1000;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Subscriber or job key the violation is about
    pub subject: String,
    pub description: String,
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Entitlement reads may be wrong
    Critical,
    /// Data inconsistency that needs attention
    High,
    /// Potential issue, should investigate
    Medium,
    /// Informational
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    #[serde(with = "time::serde::rfc3339")]
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

#[derive(Clone)]
pub struct InvariantChecker {
    stores: SyncStores,
    clock: Arc<dyn Clock>,
}

impl InvariantChecker {
    pub fn new(stores: SyncStores, clock: Arc<dyn Clock>) -> Self {
        Self { stores, clock }
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = self.clock.now();
        let mut violations = Vec::new();

        for name in Self::available_checks() {
            violations.extend(self.run_check(name).await?);
        }

        let checks_run = Self::available_checks().len();
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();

        if !violations.is_empty() {
            tracing::warn!(
                violations = violations.len(),
                checks_failed = checks_failed,
                "Sync invariant violations found"
            );
        }

        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run,
            checks_passed: checks_run - checks_failed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    async fn all_states(&self) -> BillingResult<Vec<SubscriberSyncState>> {
        let filter = StateFilter::default();
        let mut states = Vec::new();
        loop {
            let page = self
                .stores
                .states
                .list(&filter, PAGE_SIZE, states.len())
                .await?;
            let done = page.len() < PAGE_SIZE;
            states.extend(page);
            if done {
                return Ok(states);
            }
        }
    }

    /// Invariant 1: `error_count == 0` exactly when `last_error` is empty
    async fn check_error_bookkeeping(&self) -> BillingResult<Vec<InvariantViolation>> {
        Ok(self
            .all_states()
            .await?
            .into_iter()
            .filter(|s| (s.error_count == 0) != s.last_error.is_none())
            .map(|s| InvariantViolation {
                invariant: "error_bookkeeping_consistent".to_string(),
                description: format!(
                    "error_count is {} but last_error is {}",
                    s.error_count,
                    if s.last_error.is_some() { "set" } else { "empty" }
                ),
                context: serde_json::json!({
                    "error_count": s.error_count,
                    "last_error": s.last_error,
                }),
                subject: s.subscriber_id,
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 2: a resolved status names the event that set it
    async fn check_status_has_source(&self) -> BillingResult<Vec<InvariantViolation>> {
        Ok(self
            .all_states()
            .await?
            .into_iter()
            .filter(|s| {
                s.status != SubscriptionStatus::Unknown
                    && (s.status_source_event_id.is_none() || s.status_observed_ms.is_none())
            })
            .map(|s| InvariantViolation {
                invariant: "status_has_source_event".to_string(),
                description: format!(
                    "Status {} has no source event or observation time",
                    s.status
                ),
                context: serde_json::json!({
                    "status": s.status,
                    "status_source_event_id": s.status_source_event_id,
                    "status_ordering_key": s.status_ordering_key,
                    "status_observed_ms": s.status_observed_ms,
                }),
                subject: s.subscriber_id,
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 3: no run lease outlives its expiry
    ///
    /// An expired lease means a pass died without releasing it; the next pass
    /// takes it over, so this is informational.
    async fn check_expired_leases(&self) -> BillingResult<Vec<InvariantViolation>> {
        let now = self.clock.now();
        Ok(self
            .stores
            .jobs
            .list_leases()
            .await?
            .into_iter()
            .filter(|lease| lease.expires_at <= now)
            .map(|lease| InvariantViolation {
                invariant: "no_expired_leases".to_string(),
                description: format!("Lease held by {} has expired", lease.holder),
                context: serde_json::json!({
                    "holder": lease.holder,
                    "expires_at": lease.expires_at.unix_timestamp(),
                }),
                subject: lease.job_key,
                severity: ViolationSeverity::Low,
            })
            .collect())
    }

    /// Invariant 4: a `success` run recorded no failed records
    async fn check_success_runs_clean(&self) -> BillingResult<Vec<InvariantViolation>> {
        Ok(self
            .stores
            .jobs
            .list()
            .await?
            .into_iter()
            .filter(|run| run.last_outcome == JobOutcome::Success && run.records_failed > 0)
            .map(|run| InvariantViolation {
                invariant: "success_runs_have_no_failures".to_string(),
                description: format!(
                    "Run marked success with {} failed records",
                    run.records_failed
                ),
                context: serde_json::json!({
                    "records_examined": run.records_examined,
                    "records_failed": run.records_failed,
                }),
                subject: run.job_key,
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "error_bookkeeping_consistent" => self.check_error_bookkeeping().await,
            "status_has_source_event" => self.check_status_has_source().await,
            "no_expired_leases" => self.check_expired_leases().await,
            "success_runs_have_no_failures" => self.check_success_runs_clean().await,
            _ => Ok(vec![]),
        }
    }

    /// Get list of all available invariant checks
    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "error_bookkeeping_consistent",
            "status_has_source_event",
            "no_expired_leases",
            "success_runs_have_no_failures",
        ]
    }
}
