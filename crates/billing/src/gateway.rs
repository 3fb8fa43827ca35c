//! Payment gateway status queries
//!
//! Reconciliation asks the gateway for a subscriber's authoritative status
//! through [`SubscriptionGateway`]. The HTTP implementation expects
//! `GET {base_url}/subscriptions/{subscriber_id}` to answer `{"status": "..."}`,
//! with the subscriber id percent-encoded as a single path segment.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio_retry::strategy::ExponentialBackoff;
use tokio_retry::RetryIf;

use crate::error::{BillingError, BillingResult, GatewayError};
use crate::model::SubscriptionStatus;

#[async_trait]
pub trait SubscriptionGateway: Send + Sync {
    /// Current status of `subscriber_id`; never a guessed value
    async fn fetch_status(&self, subscriber_id: &str) -> Result<SubscriptionStatus, GatewayError>;
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub base_url: String,
    pub api_key: String,
    pub timeout: Duration,
}

/// Map a gateway status string onto the engine's statuses
///
/// Accepts both the engine's own names and Stripe subscription statuses.
pub fn parse_gateway_status(raw: &str) -> Result<SubscriptionStatus, GatewayError> {
    match raw {
        "active" | "trialing" => Ok(SubscriptionStatus::Active),
        "cancelled" | "canceled" => Ok(SubscriptionStatus::Cancelled),
        "expired" | "incomplete_expired" => Ok(SubscriptionStatus::Expired),
        "payment_failed" | "past_due" | "unpaid" => Ok(SubscriptionStatus::PaymentFailed),
        "unknown" | "incomplete" => Err(GatewayError::Indeterminate),
        other => Err(GatewayError::Malformed(format!("unrecognised status '{}'", other))),
    }
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    status: String,
}

/// reqwest-backed gateway client
#[derive(Debug, Clone)]
pub struct HttpGateway {
    client: reqwest::Client,
    config: GatewayConfig,
    base_url: reqwest::Url,
}

impl HttpGateway {
    pub fn new(config: GatewayConfig) -> BillingResult<Self> {
        if config.base_url.is_empty() {
            return Err(BillingError::Config("GATEWAY_BASE_URL is empty".to_string()));
        }
        let base_url = reqwest::Url::parse(&config.base_url)
            .map_err(|e| BillingError::Config(format!("invalid GATEWAY_BASE_URL: {}", e)))?;
        if base_url.cannot_be_a_base() {
            return Err(BillingError::Config(format!(
                "GATEWAY_BASE_URL '{}' cannot carry a path",
                config.base_url
            )));
        }

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| BillingError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            config,
            base_url,
        })
    }

    fn endpoint(&self, subscriber_id: &str) -> Result<reqwest::Url, GatewayError> {
        // Dot segments are dropped by `push` and would address another resource
        if matches!(subscriber_id, "" | "." | "..") {
            return Err(GatewayError::Malformed(format!(
                "subscriber id '{}' is not a valid path segment",
                subscriber_id
            )));
        }

        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| {
                GatewayError::Malformed("gateway base URL cannot carry a path".to_string())
            })?
            .pop_if_empty()
            .push("subscriptions")
            .push(subscriber_id);
        Ok(url)
    }

    async fn request(&self, subscriber_id: &str) -> Result<SubscriptionStatus, GatewayError> {
        let response = self
            .client
            .get(self.endpoint(subscriber_id)?)
            .bearer_auth(&self.config.api_key)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    GatewayError::Timeout
                } else {
                    GatewayError::Unavailable(e.to_string())
                }
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(GatewayError::NotFound(subscriber_id.to_string()));
        }
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(GatewayError::Unavailable(format!("gateway returned {}", status)));
        }
        if !status.is_success() {
            return Err(GatewayError::Malformed(format!("gateway returned {}", status)));
        }

        let body: StatusResponse = response.json().await.map_err(|e| {
            if e.is_timeout() {
                GatewayError::Timeout
            } else {
                GatewayError::Malformed(e.to_string())
            }
        })?;

        parse_gateway_status(&body.status)
    }
}

#[async_trait]
impl SubscriptionGateway for HttpGateway {
    async fn fetch_status(&self, subscriber_id: &str) -> Result<SubscriptionStatus, GatewayError> {
        // Two quick retries for transport hiccups; timeouts are left to the caller
        let strategy = ExponentialBackoff::from_millis(10)
            .max_delay(Duration::from_millis(500))
            .take(2);

        let result = RetryIf::start(
            strategy,
            || self.request(subscriber_id),
            |e: &GatewayError| matches!(e, GatewayError::Unavailable(_)),
        )
        .await;

        if let Err(e) = &result {
            tracing::debug!(subscriber_id = %subscriber_id, error = %e, "Gateway status query failed");
        }
        result
    }
}
