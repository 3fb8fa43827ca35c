//! Sync engine records
//!
//! - [`WebhookEvent`]: Event Store row, one per inbound notification
//! - [`SubscriberSyncState`]: Sync State Store row, one per subscriber
//! - [`JobRun`] / [`JobLease`]: Job Metadata Store rows, one per job key

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::clock::epoch_millis;
use crate::error::BillingError;

/// Event type as seen by the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Activated,
    Cancelled,
    Expired,
    PaymentFailed,
    Renewed,
    Unknown,
}

impl EventType {
    pub const ALL: [EventType; 6] = [
        EventType::Activated,
        EventType::Cancelled,
        EventType::Expired,
        EventType::PaymentFailed,
        EventType::Renewed,
        EventType::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Activated => "activated",
            EventType::Cancelled => "cancelled",
            EventType::Expired => "expired",
            EventType::PaymentFailed => "payment_failed",
            EventType::Renewed => "renewed",
            EventType::Unknown => "unknown",
        }
    }

    /// Lenient parse used by decoders: anything unrecognised is `Unknown`
    pub fn parse_lenient(s: &str) -> Self {
        s.parse().unwrap_or(EventType::Unknown)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "activated" => Ok(EventType::Activated),
            "cancelled" => Ok(EventType::Cancelled),
            "expired" => Ok(EventType::Expired),
            "payment_failed" => Ok(EventType::PaymentFailed),
            "renewed" => Ok(EventType::Renewed),
            "unknown" => Ok(EventType::Unknown),
            other => Err(BillingError::InvalidInput(format!(
                "unknown event type: {}",
                other
            ))),
        }
    }
}

/// Authoritative entitlement status of a subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Cancelled,
    Expired,
    PaymentFailed,
    #[default]
    Unknown,
}

impl SubscriptionStatus {
    pub const ALL: [SubscriptionStatus; 5] = [
        SubscriptionStatus::Active,
        SubscriptionStatus::Cancelled,
        SubscriptionStatus::Expired,
        SubscriptionStatus::PaymentFailed,
        SubscriptionStatus::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Cancelled => "cancelled",
            SubscriptionStatus::Expired => "expired",
            SubscriptionStatus::PaymentFailed => "payment_failed",
            SubscriptionStatus::Unknown => "unknown",
        }
    }

    /// Whether paid features are unlocked
    pub fn is_entitled(&self) -> bool {
        matches!(self, SubscriptionStatus::Active)
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriptionStatus {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(SubscriptionStatus::Active),
            "cancelled" => Ok(SubscriptionStatus::Cancelled),
            "expired" => Ok(SubscriptionStatus::Expired),
            "payment_failed" => Ok(SubscriptionStatus::PaymentFailed),
            "unknown" => Ok(SubscriptionStatus::Unknown),
            other => Err(BillingError::InvalidInput(format!(
                "unknown subscription status: {}",
                other
            ))),
        }
    }
}

/// How ingestion finished handling one delivery of an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingOutcome {
    Applied,
    IgnoredDuplicate,
    IgnoredStale,
    Failed,
}

impl ProcessingOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingOutcome::Applied => "applied",
            ProcessingOutcome::IgnoredDuplicate => "ignored_duplicate",
            ProcessingOutcome::IgnoredStale => "ignored_stale",
            ProcessingOutcome::Failed => "failed",
        }
    }
}

impl fmt::Display for ProcessingOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessingOutcome {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "applied" => Ok(ProcessingOutcome::Applied),
            "ignored_duplicate" => Ok(ProcessingOutcome::IgnoredDuplicate),
            "ignored_stale" => Ok(ProcessingOutcome::IgnoredStale),
            "failed" => Ok(ProcessingOutcome::Failed),
            other => Err(BillingError::InvalidInput(format!(
                "unknown processing outcome: {}",
                other
            ))),
        }
    }
}

/// Where a notification's ordering key came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderingSource {
    /// Provider-assigned monotonic sequence, not comparable to wall-clock time
    Sequence,
    /// Provider creation timestamp, epoch milliseconds
    ProviderTimestamp,
    /// No provider key; arrival time in epoch milliseconds is used instead
    Arrival,
}

impl OrderingSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderingSource::Sequence => "sequence",
            OrderingSource::ProviderTimestamp => "provider_timestamp",
            OrderingSource::Arrival => "arrival",
        }
    }
}

impl fmt::Display for OrderingSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderingSource {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sequence" => Ok(OrderingSource::Sequence),
            "provider_timestamp" => Ok(OrderingSource::ProviderTimestamp),
            "arrival" => Ok(OrderingSource::Arrival),
            other => Err(BillingError::InvalidInput(format!(
                "unknown ordering source: {}",
                other
            ))),
        }
    }
}

/// Stored webhook notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub event_id: String,
    pub subscriber_id: String,
    pub event_type: EventType,
    pub ordering_key: i64,
    pub ordering_source: OrderingSource,
    #[serde(with = "time::serde::rfc3339")]
    pub received_at: OffsetDateTime,
    pub payload: serde_json::Value,
    /// `None` while a delivery attempt is in flight
    pub processing_outcome: Option<ProcessingOutcome>,
    pub attempts: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub claimed_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub processed_at: Option<OffsetDateTime>,
    pub error_message: Option<String>,
}

/// Latest-known subscription status of one subscriber
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriberSyncState {
    pub subscriber_id: String,
    pub status: SubscriptionStatus,
    pub status_source_event_id: Option<String>,
    /// Provider ordering key of the newest applied notification
    pub status_ordering_key: Option<i64>,
    /// Epoch millis at which `status` was last known to be true
    pub status_observed_ms: Option<i64>,
    #[serde(with = "time::serde::rfc3339")]
    pub last_synced_at: OffsetDateTime,
    pub error_count: u32,
    pub last_error: Option<String>,
}

impl SubscriberSyncState {
    /// A record that has never been synced
    pub fn unsynced(subscriber_id: impl Into<String>) -> Self {
        Self {
            subscriber_id: subscriber_id.into(),
            status: SubscriptionStatus::Unknown,
            status_source_event_id: None,
            status_ordering_key: None,
            status_observed_ms: None,
            last_synced_at: OffsetDateTime::UNIX_EPOCH,
            error_count: 0,
            last_error: None,
        }
    }
}

/// How a status update is ordered against the stored status
///
/// Provider sequences only order notifications among themselves, so the
/// store tracks two marks: the provider key of the newest applied
/// notification and the wall-clock time the status was last known true.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOrder {
    /// Provider sequence; `received_ms` advances the observation mark
    Sequence { key: i64, received_ms: i64 },
    /// Provider timestamp or arrival time, epoch millis
    Timestamp(i64),
    /// Gateway snapshot requested at this epoch millis
    Snapshot(i64),
}

impl UpdateOrder {
    /// Ordering of a stored notification
    pub fn for_event(event: &WebhookEvent) -> Self {
        match event.ordering_source {
            OrderingSource::Sequence => UpdateOrder::Sequence {
                key: event.ordering_key,
                received_ms: epoch_millis(event.received_at),
            },
            OrderingSource::ProviderTimestamp | OrderingSource::Arrival => {
                UpdateOrder::Timestamp(event.ordering_key)
            }
        }
    }

    /// Provider key stored with the status; snapshots keep the current one
    pub fn key(&self) -> Option<i64> {
        match self {
            UpdateOrder::Sequence { key, .. } => Some(*key),
            UpdateOrder::Timestamp(key) => Some(*key),
            UpdateOrder::Snapshot(_) => None,
        }
    }

    pub fn observed_ms(&self) -> i64 {
        match self {
            UpdateOrder::Sequence { received_ms, .. } => *received_ms,
            UpdateOrder::Timestamp(ms) | UpdateOrder::Snapshot(ms) => *ms,
        }
    }

    /// Storage tag used by the Postgres commit
    pub fn kind(&self) -> &'static str {
        match self {
            UpdateOrder::Sequence { .. } => "sequence",
            UpdateOrder::Timestamp(_) => "timestamp",
            UpdateOrder::Snapshot(_) => "snapshot",
        }
    }
}

/// A status change ready to be committed to the Sync State Store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub subscriber_id: String,
    pub status: SubscriptionStatus,
    pub source_event_id: String,
    pub order: UpdateOrder,
    pub synced_at: OffsetDateTime,
}

/// Overall result of one scheduled job run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcome {
    Success,
    PartialFailure,
    Failure,
}

impl JobOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobOutcome::Success => "success",
            JobOutcome::PartialFailure => "partial_failure",
            JobOutcome::Failure => "failure",
        }
    }
}

impl fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobOutcome {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(JobOutcome::Success),
            "partial_failure" => Ok(JobOutcome::PartialFailure),
            "failure" => Ok(JobOutcome::Failure),
            other => Err(BillingError::InvalidInput(format!(
                "unknown job outcome: {}",
                other
            ))),
        }
    }
}

/// Bookkeeping for one scheduled job key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRun {
    pub job_key: String,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_run_at: Option<OffsetDateTime>,
    /// Preserved by the store when a later run is not a success
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_success_at: Option<OffsetDateTime>,
    pub last_outcome: JobOutcome,
    pub records_examined: u64,
    pub records_repaired: u64,
    pub records_failed: u64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub next_due_at: Option<OffsetDateTime>,
    pub last_error: Option<String>,
    pub last_duration_ms: u64,
}

/// Run lock for a job key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobLease {
    pub job_key: String,
    pub holder: String,
    #[serde(with = "time::serde::rfc3339")]
    pub acquired_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
}
