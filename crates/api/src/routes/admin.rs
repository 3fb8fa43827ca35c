//! Admin routes
//!
//! Monitoring and repair operations over the sync engine. Protected by the
//! API bearer token.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;
use subsync_billing::{
    InvariantCheckSummary, JobRun, PassReport, ProcessingOutcome, StateFilter, StatusSummary,
    SubscriberOutcome, SubscriberSyncState, SubscriptionStatus, WebhookEvent,
    WebhookReplayResult,
};

use crate::{
    error::{ApiError, ApiResult},
    routes::page_limit,
    state::AppState,
};

// =============================================================================
// Request Types
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct ListStatesQuery {
    pub status: Option<String>,
    pub errors_only: Option<bool>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct ListWebhooksQuery {
    pub outcome: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct ReplayFailedQuery {
    pub max: Option<usize>,
}

// =============================================================================
// Sync State
// =============================================================================

pub async fn sync_summary(State(state): State<AppState>) -> ApiResult<Json<StatusSummary>> {
    Ok(Json(state.sync.reader.status_summary().await?))
}

pub async fn list_states(
    State(state): State<AppState>,
    Query(query): Query<ListStatesQuery>,
) -> ApiResult<Json<Vec<SubscriberSyncState>>> {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<SubscriptionStatus>)
        .transpose()?;
    let filter = StateFilter {
        status,
        errors_only: query.errors_only.unwrap_or(false),
    };

    let states = state
        .sync
        .reader
        .list_states(&filter, page_limit(query.limit), query.offset.unwrap_or(0))
        .await?;
    Ok(Json(states))
}

/// Reconcile one subscriber now, outside the scheduled pass
pub async fn reconcile_subscriber(
    State(state): State<AppState>,
    Path(subscriber_id): Path<String>,
) -> ApiResult<Json<SubscriberOutcome>> {
    tracing::info!(subscriber_id = %subscriber_id, "Admin triggered reconciliation");
    let outcome = state
        .sync
        .reconciler
        .reconcile_subscriber(&subscriber_id)
        .await?;
    Ok(Json(outcome))
}

// =============================================================================
// Jobs
// =============================================================================

pub async fn list_jobs(State(state): State<AppState>) -> ApiResult<Json<Vec<JobRun>>> {
    Ok(Json(state.sync.reader.list_job_runs().await?))
}

pub async fn get_job(
    State(state): State<AppState>,
    Path(job_key): Path<String>,
) -> ApiResult<Json<JobRun>> {
    state
        .sync
        .reader
        .get_job_run(&job_key)
        .await?
        .map(Json)
        .ok_or(ApiError::NotFound)
}

/// Run a reconciliation pass now; `skipped` when another instance holds the lease
pub async fn run_job(
    State(state): State<AppState>,
    Path(job_key): Path<String>,
) -> ApiResult<Json<PassReport>> {
    if job_key != state.sync.reconciler.config().job_key {
        return Err(ApiError::NotFound);
    }

    tracing::info!(job_key = %job_key, "Admin triggered reconciliation pass");
    // Detached from the request future; only server shutdown cancels it
    let reconciler = state.sync.reconciler.clone();
    let token = state.shutdown.child_token();
    let report = state
        .tasks
        .spawn(async move { reconciler.run_pass(&token).await })
        .await
        .map_err(|e| ApiError::Internal(format!("reconciliation pass aborted: {}", e)))??;
    Ok(Json(report))
}

// =============================================================================
// Webhooks
// =============================================================================

pub async fn list_webhooks(
    State(state): State<AppState>,
    Query(query): Query<ListWebhooksQuery>,
) -> ApiResult<Json<Vec<WebhookEvent>>> {
    let outcome = query
        .outcome
        .as_deref()
        .map(str::parse::<ProcessingOutcome>)
        .transpose()?;

    let events = state
        .sync
        .webhooks
        .list_webhooks(outcome, page_limit(query.limit), query.offset.unwrap_or(0))
        .await?;
    Ok(Json(events))
}

pub async fn replay_webhook(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
) -> ApiResult<Json<WebhookReplayResult>> {
    Ok(Json(state.sync.webhooks.replay_webhook(&event_id).await?))
}

pub async fn replay_failed_webhooks(
    State(state): State<AppState>,
    Query(query): Query<ReplayFailedQuery>,
) -> ApiResult<Json<Vec<WebhookReplayResult>>> {
    let results = state
        .sync
        .webhooks
        .replay_all_failed(query.max.map(|m| m.min(crate::routes::MAX_LIMIT)))
        .await?;

    let replayed = results.iter().filter(|r| r.success).count();
    tracing::info!(
        attempted = results.len(),
        replayed = replayed,
        "Admin replayed failed webhooks"
    );
    Ok(Json(results))
}

// =============================================================================
// Invariants
// =============================================================================

pub async fn run_invariants(
    State(state): State<AppState>,
) -> ApiResult<Json<InvariantCheckSummary>> {
    Ok(Json(state.sync.invariants.run_all_checks().await?))
}
