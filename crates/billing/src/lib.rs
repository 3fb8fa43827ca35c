// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Subscription Sync Engine
//!
//! Keeps each subscriber's billing status in step with the payment gateway.
//!
//! ## Features
//!
//! - **Webhook Ingestion**: Verify, deduplicate and apply gateway notifications
//! - **Ordering Guard**: Out-of-order deliveries never regress a status
//! - **Reconciliation**: Scheduled passes repair stale or failing records from the gateway
//! - **Run Leases**: At most one pass per job key across instances
//! - **Read Interface**: Sync state, entitlement and job monitoring projections
//! - **Invariants**: Runnable consistency checks over the stores

pub mod clock;
pub mod config;
pub mod decoder;
pub mod error;
pub mod gateway;
pub mod invariants;
pub mod locks;
pub mod model;
pub mod queries;
pub mod reconcile;
pub mod signature;
pub mod state_machine;
pub mod store;
pub mod testing;
pub mod webhooks;

#[cfg(test)]
mod edge_case_tests;

use std::sync::Arc;

// Clock
pub use clock::{Clock, ManualClock, SystemClock};

// Config
pub use config::SyncConfig;

// Decoder
pub use decoder::{
    decoder_for_format, JsonNotificationDecoder, Notification, NotificationDecoder,
    StripeNotificationDecoder,
};

// Error
pub use error::{BillingError, BillingResult, GatewayError};

// Gateway
pub use gateway::{GatewayConfig, HttpGateway, SubscriptionGateway};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Locks
pub use locks::SubscriberLocks;

// Model
pub use model::{
    EventType, JobLease, JobOutcome, JobRun, OrderingSource, ProcessingOutcome, StatusUpdate,
    SubscriberSyncState, SubscriptionStatus, UpdateOrder, WebhookEvent,
};

// Queries
pub use queries::{Entitlement, SyncReader};

// Reconciliation
pub use reconcile::{PassReport, PassSummary, ReconcileConfig, Reconciler, SubscriberOutcome};

// Signature
pub use signature::SignatureVerifier;

// Store
pub use store::{StateFilter, StatusSummary, SyncStores};

// Webhooks
pub use webhooks::{IngestOutcome, WebhookHandler, WebhookReplayResult};

/// Main sync service that combines all engine functionality
///
/// Every component shares one set of stores, one clock and one
/// [`SubscriberLocks`] so ingestion and reconciliation serialize on the same
/// subscriber.
#[derive(Clone)]
pub struct SyncService {
    pub stores: SyncStores,
    pub webhooks: WebhookHandler,
    pub reconciler: Reconciler,
    pub reader: SyncReader,
    pub invariants: InvariantChecker,
}

impl SyncService {
    /// Create a sync service from environment variables, querying the gateway over HTTP
    pub fn from_env(stores: SyncStores) -> BillingResult<Self> {
        let config = SyncConfig::from_env()?;
        let gateway = HttpGateway::new(config.gateway.clone())?;
        Self::new(stores, Arc::new(gateway), Arc::new(SystemClock), &config)
    }

    /// Create a sync service with explicit collaborators
    pub fn new(
        stores: SyncStores,
        gateway: Arc<dyn SubscriptionGateway>,
        clock: Arc<dyn Clock>,
        config: &SyncConfig,
    ) -> BillingResult<Self> {
        let decoder: Arc<dyn NotificationDecoder> =
            Arc::from(decoder_for_format(&config.webhook_format)?);
        let locks = SubscriberLocks::new();

        let webhooks = WebhookHandler::new(
            stores.clone(),
            decoder,
            SignatureVerifier::new(config.webhook_secret.clone(), config.webhook_tolerance_secs),
            locks.clone(),
            clock.clone(),
        )
        .with_reclaim_after(config.webhook_reclaim_after);

        let reconciler = Reconciler::new(
            stores.clone(),
            gateway,
            locks,
            clock.clone(),
            config.reconcile.clone(),
        );

        Ok(Self {
            reader: SyncReader::new(
                stores.clone(),
                clock.clone(),
                config.reconcile.staleness_threshold,
            ),
            invariants: InvariantChecker::new(stores.clone(), clock),
            stores,
            webhooks,
            reconciler,
        })
    }
}
