//! Subscriber read endpoints

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;
use subsync_billing::{Entitlement, SubscriberSyncState, WebhookEvent};

use crate::{
    error::{ApiError, ApiResult},
    routes::page_limit,
    state::AppState,
};

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub limit: Option<usize>,
}

pub async fn get_sync_state(
    State(state): State<AppState>,
    Path(subscriber_id): Path<String>,
) -> ApiResult<Json<SubscriberSyncState>> {
    state
        .sync
        .reader
        .get_state(&subscriber_id)
        .await?
        .map(Json)
        .ok_or(ApiError::NotFound)
}

/// Unseen subscribers answer `unknown`, not 404
pub async fn get_entitlement(
    State(state): State<AppState>,
    Path(subscriber_id): Path<String>,
) -> ApiResult<Json<Entitlement>> {
    Ok(Json(state.sync.reader.entitlement(&subscriber_id).await?))
}

/// Most recent events first
pub async fn list_subscriber_events(
    State(state): State<AppState>,
    Path(subscriber_id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> ApiResult<Json<Vec<WebhookEvent>>> {
    let events = state
        .sync
        .reader
        .recent_events(&subscriber_id, page_limit(query.limit))
        .await?;
    Ok(Json(events))
}
