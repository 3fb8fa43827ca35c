//! API server configuration

use std::str::FromStr;

/// Where the sync stores live
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    /// Process-local stores, lost on restart
    Memory,
}

impl FromStr for StoreBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(StoreBackend::Postgres),
            "memory" => Ok(StoreBackend::Memory),
            other => Err(ConfigError::Invalid {
                key: "STORE_BACKEND",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{key} has invalid value '{value}'")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    /// Direct (non-pooled) URL used for migrations when set
    pub database_direct_url: Option<String>,
    pub store_backend: StoreBackend,
    pub bind_address: String,
    /// Bearer token for the read and admin endpoints
    pub api_token: String,
    /// Run reconciliation passes inside the API process instead of the worker
    pub reconcile_in_process: bool,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let store_backend = match lookup("STORE_BACKEND") {
            Some(raw) => raw.parse()?,
            None => StoreBackend::Postgres,
        };

        let database_url = lookup("DATABASE_URL").unwrap_or_default();
        if store_backend == StoreBackend::Postgres && database_url.is_empty() {
            return Err(ConfigError::Missing("DATABASE_URL"));
        }

        let api_token = lookup("API_TOKEN").unwrap_or_default();
        if api_token.is_empty() {
            return Err(ConfigError::Missing("API_TOKEN"));
        }

        let reconcile_in_process = match lookup("RECONCILE_IN_PROCESS") {
            None => false,
            Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => true,
                "" | "0" | "false" | "no" => false,
                _ => {
                    return Err(ConfigError::Invalid {
                        key: "RECONCILE_IN_PROCESS",
                        value: raw,
                    })
                }
            },
        };

        Ok(Self {
            database_url,
            database_direct_url: lookup("DATABASE_DIRECT_URL").filter(|u| !u.is_empty()),
            store_backend,
            bind_address: lookup("BIND_ADDRESS").unwrap_or_else(|| "0.0.0.0:8080".to_string()),
            api_token,
            reconcile_in_process,
        })
    }
}
