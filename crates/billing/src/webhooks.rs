//! Webhook ingestion pipeline
//!
//! One notification at a time: verify, decode, claim, then apply under the
//! subscriber's lock. The claim is the idempotency gate; the status commit is a
//! compare-and-swap on the ordering key so out-of-order delivery can never
//! regress a subscriber's status.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::clock::{epoch_millis, Clock};
use crate::decoder::NotificationDecoder;
use crate::error::{BillingError, BillingResult};
use crate::locks::SubscriberLocks;
use crate::model::{
    EventType, OrderingSource, ProcessingOutcome, StatusUpdate, SubscriptionStatus, UpdateOrder,
    WebhookEvent,
};
use crate::signature::SignatureVerifier;
use crate::state_machine::{is_newer, transition};
use crate::store::{ClaimResult, CommitResult, SyncStores};

/// Default window after which an in-flight claim may be taken over
pub const DEFAULT_RECLAIM_AFTER: Duration = Duration::from_secs(30 * 60);

/// Prefix of synthetic ids for notifications that failed authenticity
pub const UNVERIFIED_PREFIX: &str = "unverified-";

/// Prefix of synthetic ids for verified bodies that could not be decoded
pub const UNDECODABLE_PREFIX: &str = "undecodable-";

/// Result of ingesting one notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestOutcome {
    pub event_id: String,
    pub outcome: ProcessingOutcome,
    /// Subscriber status after ingestion, when it is known
    pub status: Option<SubscriptionStatus>,
    /// Duplicate of a delivery attempt that has not recorded an outcome yet
    pub in_flight: bool,
}

/// Result of a webhook replay operation
#[derive(Debug, Clone, Serialize)]
pub struct WebhookReplayResult {
    pub event_id: String,
    pub event_type: EventType,
    pub previous_outcome: Option<ProcessingOutcome>,
    pub previous_error: Option<String>,
    pub new_outcome: ProcessingOutcome,
    pub new_error: Option<String>,
    pub success: bool,
}

/// Outcome of the staleness check and transition for a claimed event
struct ApplyResult {
    outcome: ProcessingOutcome,
    status: Option<SubscriptionStatus>,
    error: Option<String>,
}

/// Webhook handler for gateway notifications
#[derive(Clone)]
pub struct WebhookHandler {
    stores: SyncStores,
    decoder: Arc<dyn NotificationDecoder>,
    verifier: SignatureVerifier,
    locks: SubscriberLocks,
    clock: Arc<dyn Clock>,
    reclaim_after: Duration,
}

impl WebhookHandler {
    pub fn new(
        stores: SyncStores,
        decoder: Arc<dyn NotificationDecoder>,
        verifier: SignatureVerifier,
        locks: SubscriberLocks,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            stores,
            decoder,
            verifier,
            locks,
            clock,
            reclaim_after: DEFAULT_RECLAIM_AFTER,
        }
    }

    pub fn with_reclaim_after(mut self, reclaim_after: Duration) -> Self {
        self.reclaim_after = reclaim_after;
        self
    }

    /// HTTP header the configured decoder expects the signature in
    pub fn signature_header(&self) -> &'static str {
        self.decoder.signature_header()
    }

    /// Ingest one raw notification
    ///
    /// Returns `Err(WebhookSignatureInvalid)` after recording an authenticity
    /// failure, `Err(InvalidPayload)` for a verified body that cannot be
    /// decoded, and `Err(Database)` when the Event Store itself is unavailable.
    /// Processing failures are reported as an `Ok` outcome of `failed`.
    pub async fn ingest(&self, body: &str, signature: &str) -> BillingResult<IngestOutcome> {
        let now = self.clock.now();

        if let Err(e) = self.verifier.verify(body, signature, now.unix_timestamp()) {
            let event_id = self
                .record_rejected(UNVERIFIED_PREFIX, body, &e, now)
                .await?;
            tracing::warn!(
                event_id = %event_id,
                error = %e,
                "Rejected webhook with invalid signature"
            );
            return Err(e);
        }

        let notification = match self.decoder.decode(body) {
            Ok(notification) => notification,
            Err(e) => {
                let event_id = self
                    .record_rejected(UNDECODABLE_PREFIX, body, &e, now)
                    .await?;
                tracing::warn!(
                    event_id = %event_id,
                    error = %e,
                    "Verified webhook could not be decoded"
                );
                return Err(e);
            }
        };

        let (ordering_key, ordering_source) = match notification.ordering_key {
            Some(key) => (key, notification.ordering_source),
            None => {
                tracing::warn!(
                    event_id = %notification.event_id,
                    subscriber_id = %notification.subscriber_id,
                    ordering_source = ?notification.ordering_source,
                    "Notification has no provider ordering key, falling back to arrival time"
                );
                (epoch_millis(now), OrderingSource::Arrival)
            }
        };

        let event = WebhookEvent {
            event_id: notification.event_id,
            subscriber_id: notification.subscriber_id,
            event_type: notification.event_type,
            ordering_key,
            ordering_source,
            received_at: now,
            payload: notification.payload,
            processing_outcome: None,
            attempts: 0,
            claimed_at: now,
            processed_at: None,
            error_message: None,
        };

        match self.stores.events.claim(&event, now, self.reclaim_after).await? {
            ClaimResult::Duplicate { outcome } => {
                tracing::info!(
                    event_id = %event.event_id,
                    subscriber_id = %event.subscriber_id,
                    previous_outcome = ?outcome,
                    "Duplicate webhook event"
                );
                let status = self
                    .stores
                    .states
                    .get(&event.subscriber_id)
                    .await?
                    .map(|s| s.status);
                Ok(IngestOutcome {
                    event_id: event.event_id,
                    outcome: ProcessingOutcome::IgnoredDuplicate,
                    status,
                    in_flight: outcome.is_none(),
                })
            }
            ClaimResult::Claimed { attempt } => {
                tracing::info!(
                    event_id = %event.event_id,
                    subscriber_id = %event.subscriber_id,
                    event_type = %event.event_type,
                    ordering_key = event.ordering_key,
                    attempt = attempt,
                    "Processing webhook event"
                );
                let applied = self.process_claimed(&event).await?;
                Ok(IngestOutcome {
                    event_id: event.event_id,
                    outcome: applied.outcome,
                    status: applied.status,
                    in_flight: false,
                })
            }
        }
    }

    /// Apply a claimed event and record its outcome
    async fn process_claimed(&self, event: &WebhookEvent) -> BillingResult<ApplyResult> {
        let applied = match self.apply(event).await {
            Ok(applied) => applied,
            Err(e) => {
                tracing::error!(
                    event_id = %event.event_id,
                    subscriber_id = %event.subscriber_id,
                    error = %e,
                    "Failed to apply webhook event"
                );
                let message = e.to_string();
                if let Err(record_err) = self
                    .stores
                    .states
                    .record_error(&event.subscriber_id, &message)
                    .await
                {
                    tracing::error!(
                        subscriber_id = %event.subscriber_id,
                        error = %record_err,
                        "Failed to record sync error"
                    );
                }
                ApplyResult {
                    outcome: ProcessingOutcome::Failed,
                    status: None,
                    error: Some(message),
                }
            }
        };

        if let Err(e) = self
            .stores
            .events
            .finish(
                &event.event_id,
                applied.outcome,
                applied.error.as_deref(),
                self.clock.now(),
            )
            .await
        {
            tracing::error!(
                event_id = %event.event_id,
                outcome = %applied.outcome,
                error = %e,
                "Failed to record webhook outcome"
            );
            self.release_claim(event, applied.outcome, &e).await;
            return Err(e);
        }

        tracing::info!(
            event_id = %event.event_id,
            subscriber_id = %event.subscriber_id,
            outcome = %applied.outcome,
            status = ?applied.status,
            "Webhook event processed"
        );

        Ok(applied)
    }

    /// Mark an unfinished claim `failed` so the next redelivery can take it
    ///
    /// Without this the row stays in flight and redeliveries are answered as
    /// duplicates until the reclaim window passes.
    async fn release_claim(
        &self,
        event: &WebhookEvent,
        outcome: ProcessingOutcome,
        cause: &BillingError,
    ) {
        let message = format!("outcome {} not recorded: {}", outcome, cause);
        if let Err(e) = self
            .stores
            .events
            .finish(
                &event.event_id,
                ProcessingOutcome::Failed,
                Some(&message),
                self.clock.now(),
            )
            .await
        {
            tracing::error!(
                event_id = %event.event_id,
                error = %e,
                "Failed to release webhook claim, it stays in flight until reclaimed"
            );
        }
    }

    /// Staleness check and state transition, serialized per subscriber
    async fn apply(&self, event: &WebhookEvent) -> BillingResult<ApplyResult> {
        let _guard = self.locks.lock(&event.subscriber_id).await;
        let current = self.stores.states.get(&event.subscriber_id).await?;

        let Some(status) = transition(event.event_type) else {
            return Ok(ApplyResult {
                outcome: ProcessingOutcome::Applied,
                status: current.map(|s| s.status),
                error: None,
            });
        };

        let order = UpdateOrder::for_event(event);
        let current_key = current.as_ref().and_then(|s| s.status_ordering_key);
        let current_observed = current.as_ref().and_then(|s| s.status_observed_ms);
        if !is_newer(current_key, current_observed, order) {
            tracing::info!(
                event_id = %event.event_id,
                subscriber_id = %event.subscriber_id,
                ordering_key = event.ordering_key,
                ordering_source = %event.ordering_source,
                current_key = ?current_key,
                current_observed_ms = ?current_observed,
                "Ignoring stale webhook event"
            );
            return Ok(ApplyResult {
                outcome: ProcessingOutcome::IgnoredStale,
                status: current.map(|s| s.status),
                error: None,
            });
        }

        let update = StatusUpdate {
            subscriber_id: event.subscriber_id.clone(),
            status,
            source_event_id: event.event_id.clone(),
            order,
            synced_at: self.clock.now(),
        };

        match self.stores.states.commit(&update).await? {
            CommitResult::Applied(state) => Ok(ApplyResult {
                outcome: ProcessingOutcome::Applied,
                status: Some(state.status),
                error: None,
            }),
            CommitResult::Stale { current_key } => {
                tracing::info!(
                    event_id = %event.event_id,
                    subscriber_id = %event.subscriber_id,
                    current_key = ?current_key,
                    "Status commit lost to a newer update"
                );
                let status = self
                    .stores
                    .states
                    .get(&event.subscriber_id)
                    .await?
                    .map(|s| s.status);
                Ok(ApplyResult {
                    outcome: ProcessingOutcome::IgnoredStale,
                    status,
                    error: None,
                })
            }
        }
    }

    /// Store a notification that never reached the claim step
    async fn record_rejected(
        &self,
        prefix: &str,
        body: &str,
        error: &BillingError,
        now: OffsetDateTime,
    ) -> BillingResult<String> {
        let event_id = format!("{}{}", prefix, Uuid::new_v4());
        let payload = serde_json::from_str::<Value>(body)
            .unwrap_or_else(|_| Value::String(body.to_string()));
        let subscriber_id = self
            .decoder
            .decode(body)
            .map(|n| n.subscriber_id)
            .unwrap_or_else(|_| "unknown".to_string());

        let event = WebhookEvent {
            event_id: event_id.clone(),
            subscriber_id,
            event_type: EventType::Unknown,
            ordering_key: epoch_millis(now),
            ordering_source: OrderingSource::Arrival,
            received_at: now,
            payload,
            processing_outcome: Some(ProcessingOutcome::Failed),
            attempts: 1,
            claimed_at: now,
            processed_at: Some(now),
            error_message: Some(error.to_string()),
        };

        self.stores.events.record_rejected(&event).await?;
        Ok(event_id)
    }

    // ============ WEBHOOK REPLAY FUNCTIONALITY ============

    /// List failed webhook events
    pub async fn list_failed_webhooks(
        &self,
        limit: usize,
        offset: usize,
    ) -> BillingResult<Vec<WebhookEvent>> {
        self.stores
            .events
            .list(Some(ProcessingOutcome::Failed), limit, offset)
            .await
    }

    /// List all webhook events with optional outcome filter
    pub async fn list_webhooks(
        &self,
        outcome: Option<ProcessingOutcome>,
        limit: usize,
        offset: usize,
    ) -> BillingResult<Vec<WebhookEvent>> {
        self.stores.events.list(outcome, limit, offset).await
    }

    /// Re-run a failed event from its stored payload
    ///
    /// Only verified events can be replayed; rejected notifications are kept
    /// for forensics only.
    pub async fn replay_webhook(&self, event_id: &str) -> BillingResult<WebhookReplayResult> {
        tracing::info!(event_id = %event_id, "Attempting to replay webhook event");

        let event = self.stores.events.get(event_id).await?.ok_or_else(|| {
            BillingError::NotFound(format!("Webhook event {} not found", event_id))
        })?;

        if event_id.starts_with(UNVERIFIED_PREFIX) || event_id.starts_with(UNDECODABLE_PREFIX) {
            return Err(BillingError::InvalidInput(format!(
                "Webhook event {} was never verified and cannot be replayed",
                event_id
            )));
        }
        if event.processing_outcome != Some(ProcessingOutcome::Failed) {
            return Err(BillingError::InvalidInput(format!(
                "Webhook event {} is not in failed state",
                event_id
            )));
        }

        let previous_outcome = event.processing_outcome;
        let previous_error = event.error_message.clone();
        let now = self.clock.now();

        let attempt = match self.stores.events.claim(&event, now, self.reclaim_after).await? {
            ClaimResult::Claimed { attempt } => attempt,
            ClaimResult::Duplicate { outcome } => {
                return Err(BillingError::InvalidInput(format!(
                    "Webhook event {} was claimed concurrently (outcome {:?})",
                    event_id, outcome
                )));
            }
        };

        let applied = self.process_claimed(&event).await?;

        tracing::info!(
            event_id = %event_id,
            attempt = attempt,
            new_outcome = %applied.outcome,
            "Webhook replay completed"
        );

        Ok(WebhookReplayResult {
            event_id: event.event_id,
            event_type: event.event_type,
            previous_outcome,
            previous_error,
            new_outcome: applied.outcome,
            success: applied.outcome != ProcessingOutcome::Failed,
            new_error: applied.error,
        })
    }

    /// Replay failed events, oldest first within the page
    pub async fn replay_all_failed(
        &self,
        max_events: Option<usize>,
    ) -> BillingResult<Vec<WebhookReplayResult>> {
        let limit = max_events.unwrap_or(100);
        let mut failed = self.list_failed_webhooks(limit, 0).await?;
        failed.reverse();

        let mut results = Vec::with_capacity(failed.len());
        for event in failed {
            if event.event_id.starts_with(UNVERIFIED_PREFIX)
                || event.event_id.starts_with(UNDECODABLE_PREFIX)
            {
                continue;
            }

            match self.replay_webhook(&event.event_id).await {
                Ok(result) => results.push(result),
                Err(e) => {
                    tracing::error!(
                        event_id = %event.event_id,
                        error = %e,
                        "Failed to replay webhook"
                    );
                    results.push(WebhookReplayResult {
                        event_id: event.event_id,
                        event_type: event.event_type,
                        previous_outcome: event.processing_outcome,
                        previous_error: event.error_message,
                        new_outcome: ProcessingOutcome::Failed,
                        new_error: Some(e.to_string()),
                        success: false,
                    });
                }
            }
        }

        Ok(results)
    }
}
