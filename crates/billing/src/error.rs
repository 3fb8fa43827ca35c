//! Sync engine error types

/// Failure of a single gateway status query
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    #[error("Gateway query timed out")]
    Timeout,
    #[error("Gateway unavailable: {0}")]
    Unavailable(String),
    #[error("Malformed gateway response: {0}")]
    Malformed(String),
    #[error("Subscriber not known to gateway: {0}")]
    NotFound(String),
    #[error("Gateway reported no definitive status")]
    Indeterminate,
}

#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    #[error("Webhook signature invalid: {0}")]
    WebhookSignatureInvalid(String),

    #[error("Invalid webhook payload: {0}")]
    InvalidPayload(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BillingError {
    /// Errors the gateway's redelivery (or the next scheduled pass) may clear
    pub fn is_transient(&self) -> bool {
        matches!(self, BillingError::Database(_) | BillingError::Gateway(_))
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        BillingError::Database(e.to_string())
    }
}

pub type BillingResult<T> = Result<T, BillingError>;
