//! Inbound gateway webhook endpoint

use axum::{extract::State, http::HeaderMap, Json};
use subsync_billing::{IngestOutcome, ProcessingOutcome};

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

/// Receive one gateway notification
///
/// Only a 2xx tells the gateway to stop redelivering, so a `failed` outcome is
/// answered with 500 and a duplicate of an unfinished attempt with 409.
pub async fn receive_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Json<IngestOutcome>> {
    let header = state.sync.webhooks.signature_header();
    // A missing header still goes through ingestion so the rejection is recorded
    let signature = headers
        .get(header)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    let outcome = state.sync.webhooks.ingest(&body, signature).await?;

    if outcome.outcome == ProcessingOutcome::Failed {
        return Err(ApiError::Internal(format!(
            "webhook event {} failed",
            outcome.event_id
        )));
    }

    if outcome.in_flight {
        return Err(ApiError::Conflict(format!(
            "webhook event {} is still being processed",
            outcome.event_id
        )));
    }

    Ok(Json(outcome))
}
