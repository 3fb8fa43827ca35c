//! Subscription status state machine
//!
//! Every status is reachable from every other status: a cancelled or expired
//! subscriber returns to `active` on a later `activated`/`renewed` event. The
//! resulting status depends only on the event type; the prior status only
//! matters through the ordering guard in [`is_newer`].

use crate::model::{EventType, SubscriptionStatus, UpdateOrder};

/// Status an event moves a subscriber to, or `None` for "no change"
pub fn transition(event_type: EventType) -> Option<SubscriptionStatus> {
    match event_type {
        EventType::Activated | EventType::Renewed => Some(SubscriptionStatus::Active),
        EventType::Cancelled => Some(SubscriptionStatus::Cancelled),
        EventType::Expired => Some(SubscriptionStatus::Expired),
        EventType::PaymentFailed => Some(SubscriptionStatus::PaymentFailed),
        EventType::Unknown => None,
    }
}

/// Apply `event_type` to `current`
pub fn next_status(current: SubscriptionStatus, event_type: EventType) -> SubscriptionStatus {
    transition(event_type).unwrap_or(current)
}

fn strictly_after(current: Option<i64>, candidate: i64) -> bool {
    current.map_or(true, |current| candidate > current)
}

/// Whether an update ordered by `order` may overwrite a status stored with
/// provider key `current_key`, last known true at `current_observed_ms`
///
/// Keys must be strictly newer; an equal key is treated as already seen.
/// Provider sequences are compared only with each other. Timestamps and
/// gateway snapshots must also be newer than the observation mark, so a
/// snapshot never overwrites a notification that arrived while it was
/// being fetched.
pub fn is_newer(
    current_key: Option<i64>,
    current_observed_ms: Option<i64>,
    order: UpdateOrder,
) -> bool {
    match order {
        UpdateOrder::Sequence { key, .. } => strictly_after(current_key, key),
        UpdateOrder::Timestamp(at) => {
            strictly_after(current_key, at) && strictly_after(current_observed_ms, at)
        }
        UpdateOrder::Snapshot(at) => strictly_after(current_observed_ms, at),
    }
}

/// Synthetic event type a gateway-reported status is replayed as
pub fn event_for_status(status: SubscriptionStatus) -> EventType {
    match status {
        SubscriptionStatus::Active => EventType::Activated,
        SubscriptionStatus::Cancelled => EventType::Cancelled,
        SubscriptionStatus::Expired => EventType::Expired,
        SubscriptionStatus::PaymentFailed => EventType::PaymentFailed,
        SubscriptionStatus::Unknown => EventType::Unknown,
    }
}
