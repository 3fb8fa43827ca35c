//! Sync engine configuration from environment variables

use std::str::FromStr;
use std::time::Duration;

use crate::error::{BillingError, BillingResult};
use crate::gateway::GatewayConfig;
use crate::reconcile::{ReconcileConfig, DEFAULT_JOB_KEY};
use crate::signature::DEFAULT_TOLERANCE_SECS;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub webhook_secret: String,
    /// Decoder name, see [`crate::decoder::decoder_for_format`]
    pub webhook_format: String,
    pub webhook_tolerance_secs: i64,
    pub webhook_reclaim_after: Duration,
    pub gateway: GatewayConfig,
    pub reconcile: ReconcileConfig,
}

impl std::fmt::Display for SyncConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "format={} gateway={} job_key={} interval={}s stale_after={}s",
            self.webhook_format,
            self.gateway.base_url,
            self.reconcile.job_key,
            self.reconcile.interval.as_secs(),
            self.reconcile.staleness_threshold.as_secs()
        )
    }
}

fn parsed<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> BillingResult<T> {
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|_| BillingError::Config(format!("{} has invalid value '{}'", key, raw))),
        _ => Ok(default),
    }
}

fn secs(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: u64) -> BillingResult<Duration> {
    parsed(lookup, key, default).map(Duration::from_secs)
}

impl SyncConfig {
    /// Load from the process environment
    pub fn from_env() -> BillingResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> BillingResult<Self> {
        let webhook_secret = lookup("WEBHOOK_SECRET").unwrap_or_default();
        if webhook_secret.is_empty() {
            return Err(BillingError::Config("WEBHOOK_SECRET must be set".to_string()));
        }

        let webhook_format = lookup("WEBHOOK_FORMAT").unwrap_or_else(|| "generic".to_string());
        let reclaim_minutes: u64 = parsed(&lookup, "WEBHOOK_RECLAIM_MINUTES", 30)?;

        let gateway = GatewayConfig {
            base_url: lookup("GATEWAY_BASE_URL").unwrap_or_default(),
            api_key: lookup("GATEWAY_API_KEY").unwrap_or_default(),
            timeout: secs(&lookup, "GATEWAY_TIMEOUT_SECS", 10)?,
        };

        let reconcile = ReconcileConfig {
            job_key: lookup("RECONCILE_JOB_KEY")
                .filter(|k| !k.is_empty())
                .unwrap_or_else(|| DEFAULT_JOB_KEY.to_string()),
            interval: secs(&lookup, "RECONCILE_INTERVAL_SECS", 300)?,
            staleness_threshold: secs(&lookup, "RECONCILE_STALE_AFTER_SECS", 3600)?,
            error_threshold: parsed(&lookup, "RECONCILE_ERROR_THRESHOLD", 0)?,
            batch_limit: parsed(&lookup, "RECONCILE_BATCH_LIMIT", 500)?,
            concurrency: parsed(&lookup, "RECONCILE_CONCURRENCY", 8)?,
            gateway_timeout: gateway.timeout,
            lease_ttl: secs(&lookup, "RECONCILE_LEASE_SECS", 900)?,
        };

        if reconcile.interval.is_zero() {
            return Err(BillingError::Config(
                "RECONCILE_INTERVAL_SECS must be positive".to_string(),
            ));
        }
        // The lease is renewed every third of its TTL while a pass runs
        if reconcile.lease_ttl < reconcile.gateway_timeout.saturating_mul(2) {
            return Err(BillingError::Config(
                "RECONCILE_LEASE_SECS must be at least twice GATEWAY_TIMEOUT_SECS".to_string(),
            ));
        }

        Ok(Self {
            webhook_secret,
            webhook_format,
            webhook_tolerance_secs: parsed(&lookup, "WEBHOOK_TOLERANCE_SECS", DEFAULT_TOLERANCE_SECS)?,
            webhook_reclaim_after: Duration::from_secs(reclaim_minutes.saturating_mul(60)),
            gateway,
            reconcile,
        })
    }
}
