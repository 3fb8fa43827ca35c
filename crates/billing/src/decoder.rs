//! Webhook payload decoding
//!
//! Ingestion is gateway-agnostic: a [`NotificationDecoder`] turns a verified
//! body into a [`Notification`]. Two wire formats ship with the crate:
//!
//! - generic: `{"id", "type", "subscriber_id", "sequence"?, "created"?, "data"?}`
//!   where `type` is one of the engine's event types
//! - stripe: Stripe event envelopes, mapped from subscription/invoice events

use serde::Deserialize;
use serde_json::Value;

use crate::error::{BillingError, BillingResult};
use crate::model::{EventType, OrderingSource};

/// A decoded, not yet applied notification
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub event_id: String,
    pub subscriber_id: String,
    pub event_type: EventType,
    /// `None` when the provider supplied no ordering information
    pub ordering_key: Option<i64>,
    pub ordering_source: OrderingSource,
    pub payload: Value,
}

pub trait NotificationDecoder: Send + Sync {
    /// HTTP header carrying the signature for this format
    fn signature_header(&self) -> &'static str;

    fn decode(&self, body: &str) -> BillingResult<Notification>;
}

/// Pick a decoder by its `WEBHOOK_FORMAT` name
pub fn decoder_for_format(format: &str) -> BillingResult<Box<dyn NotificationDecoder>> {
    match format {
        "generic" => Ok(Box::new(JsonNotificationDecoder)),
        "stripe" => Ok(Box::new(StripeNotificationDecoder)),
        other => Err(BillingError::Config(format!(
            "unsupported WEBHOOK_FORMAT: {}",
            other
        ))),
    }
}

fn parse_body(body: &str) -> BillingResult<Value> {
    serde_json::from_str(body).map_err(|e| BillingError::InvalidPayload(e.to_string()))
}

/// Generic JSON notification format
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonNotificationDecoder;

#[derive(Debug, Deserialize)]
struct GenericEnvelope {
    id: String,
    #[serde(rename = "type")]
    type_: String,
    subscriber_id: String,
    sequence: Option<i64>,
    /// Unix seconds
    created: Option<i64>,
}

impl NotificationDecoder for JsonNotificationDecoder {
    fn signature_header(&self) -> &'static str {
        "x-webhook-signature"
    }

    fn decode(&self, body: &str) -> BillingResult<Notification> {
        let payload = parse_body(body)?;
        let envelope: GenericEnvelope = serde_json::from_value(payload.clone())
            .map_err(|e| BillingError::InvalidPayload(e.to_string()))?;

        if envelope.id.is_empty() || envelope.subscriber_id.is_empty() {
            return Err(BillingError::InvalidPayload(
                "id and subscriber_id must be non-empty".to_string(),
            ));
        }

        let (ordering_key, ordering_source) = match (envelope.sequence, envelope.created) {
            (Some(seq), _) => (Some(seq), OrderingSource::Sequence),
            (None, Some(created)) => (
                Some(created.saturating_mul(1000)),
                OrderingSource::ProviderTimestamp,
            ),
            (None, None) => (None, OrderingSource::Arrival),
        };

        Ok(Notification {
            event_id: envelope.id,
            subscriber_id: envelope.subscriber_id,
            event_type: EventType::parse_lenient(&envelope.type_),
            ordering_key,
            ordering_source,
            payload,
        })
    }
}

/// Stripe event envelopes
#[derive(Debug, Default, Clone, Copy)]
pub struct StripeNotificationDecoder;

impl StripeNotificationDecoder {
    fn map_subscription_status(status: Option<&str>) -> EventType {
        match status {
            Some("active") | Some("trialing") => EventType::Activated,
            Some("canceled") => EventType::Cancelled,
            Some("past_due") | Some("unpaid") => EventType::PaymentFailed,
            Some("incomplete_expired") => EventType::Expired,
            _ => EventType::Unknown,
        }
    }

    fn map_event_type(stripe_type: &str, object: &Value) -> EventType {
        let status = object.get("status").and_then(Value::as_str);
        match stripe_type {
            "customer.subscription.created" | "customer.subscription.resumed" => {
                EventType::Activated
            }
            "customer.subscription.updated" => Self::map_subscription_status(status),
            "customer.subscription.deleted" => EventType::Expired,
            "invoice.paid" | "invoice.payment_succeeded" => EventType::Renewed,
            "invoice.payment_failed" => EventType::PaymentFailed,
            _ => EventType::Unknown,
        }
    }

    /// `metadata.subscriber_id` wins over the Stripe customer id
    fn subscriber_id(object: &Value) -> Option<String> {
        object
            .get("metadata")
            .and_then(|m| m.get("subscriber_id"))
            .and_then(Value::as_str)
            .or_else(|| object.get("customer").and_then(Value::as_str))
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    }
}

impl NotificationDecoder for StripeNotificationDecoder {
    fn signature_header(&self) -> &'static str {
        "stripe-signature"
    }

    fn decode(&self, body: &str) -> BillingResult<Notification> {
        let payload = parse_body(body)?;

        let event_id = payload
            .get("id")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| BillingError::InvalidPayload("missing event id".to_string()))?
            .to_string();
        let stripe_type = payload
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| BillingError::InvalidPayload("missing event type".to_string()))?;
        let object = payload
            .get("data")
            .and_then(|d| d.get("object"))
            .cloned()
            .unwrap_or(Value::Null);

        let subscriber_id = Self::subscriber_id(&object).ok_or_else(|| {
            BillingError::InvalidPayload("no subscriber_id metadata or customer".to_string())
        })?;

        let event_type = Self::map_event_type(stripe_type, &object);
        let created = payload.get("created").and_then(Value::as_i64);

        Ok(Notification {
            event_id,
            subscriber_id,
            event_type,
            ordering_key: created.map(|c| c.saturating_mul(1000)),
            ordering_source: if created.is_some() {
                OrderingSource::ProviderTimestamp
            } else {
                OrderingSource::Arrival
            },
            payload,
        })
    }
}
