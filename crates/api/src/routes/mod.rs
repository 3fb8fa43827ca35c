//! HTTP routes

pub mod admin;
pub mod sync;
pub mod webhooks;

#[cfg(test)]
mod router_tests;

use axum::{
    middleware,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;

use crate::{auth::require_api_token, state::AppState};

/// Default and maximum page sizes for list endpoints
pub(crate) const DEFAULT_LIMIT: usize = 50;
pub(crate) const MAX_LIMIT: usize = 500;

pub(crate) fn page_limit(limit: Option<usize>) -> usize {
    limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
}

/// Create the application router
pub fn create_router(state: AppState) -> Router {
    let protected = Router::new()
        // Subscriber reads
        .route("/api/v1/subscribers/{id}/sync", get(sync::get_sync_state))
        .route(
            "/api/v1/subscribers/{id}/entitlement",
            get(sync::get_entitlement),
        )
        .route(
            "/api/v1/subscribers/{id}/events",
            get(sync::list_subscriber_events),
        )
        // Admin: sync state
        .route("/api/v1/admin/sync/summary", get(admin::sync_summary))
        .route("/api/v1/admin/sync/states", get(admin::list_states))
        .route(
            "/api/v1/admin/subscribers/{id}/reconcile",
            post(admin::reconcile_subscriber),
        )
        // Admin: jobs
        .route("/api/v1/admin/jobs", get(admin::list_jobs))
        .route("/api/v1/admin/jobs/{key}", get(admin::get_job))
        .route("/api/v1/admin/jobs/{key}/run", post(admin::run_job))
        // Admin: webhooks
        .route("/api/v1/admin/webhooks", get(admin::list_webhooks))
        .route(
            "/api/v1/admin/webhooks/replay-failed",
            post(admin::replay_failed_webhooks),
        )
        .route(
            "/api/v1/admin/webhooks/{event_id}/replay",
            post(admin::replay_webhook),
        )
        .route("/api/v1/admin/invariants", get(admin::run_invariants))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_token,
        ));

    Router::new()
        .route("/health", get(health))
        .route("/webhooks/gateway", post(webhooks::receive_webhook))
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
