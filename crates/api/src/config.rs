//! API server configuration

use std::fmt;
use std::time::Duration;

use paygate_billing::{BillingError, ResilienceConfig};
use thiserror::Error;

const SECRET_PREFIX: &str = "WEBHOOK_SECRET_";
const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8080";
const DEFAULT_EVICTION_INTERVAL_SECS: u64 = 300;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },

    #[error(transparent)]
    Resilience(#[from] BillingError),
}

#[derive(Clone)]
pub struct Config {
    pub bind_address: String,
    /// Webhook signing secrets keyed by lowercase provider name
    pub webhook_secrets: Vec<(String, String)>,
    pub dedup_eviction_interval: Duration,
    pub resilience: ResilienceConfig,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let providers: Vec<&str> = self
            .webhook_secrets
            .iter()
            .map(|(provider, _)| provider.as_str())
            .collect();
        f.debug_struct("Config")
            .field("bind_address", &self.bind_address)
            .field("webhook_providers", &providers)
            .field("dedup_eviction_interval", &self.dedup_eviction_interval)
            .field("resilience", &self.resilience)
            .finish()
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let bind_address =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| DEFAULT_BIND_ADDRESS.to_string());

        let dedup_eviction_interval = match std::env::var("DEDUP_EVICTION_INTERVAL_SECS") {
            Ok(raw) => {
                let secs = raw
                    .trim()
                    .parse::<u64>()
                    .ok()
                    .filter(|secs| *secs > 0)
                    .ok_or(ConfigError::InvalidValue {
                        name: "DEDUP_EVICTION_INTERVAL_SECS",
                        value: raw.clone(),
                    })?;
                Duration::from_secs(secs)
            }
            Err(_) => Duration::from_secs(DEFAULT_EVICTION_INTERVAL_SECS),
        };

        Ok(Self {
            bind_address,
            webhook_secrets: webhook_secrets_from(std::env::vars()),
            dedup_eviction_interval,
            resilience: ResilienceConfig::from_env()?,
        })
    }
}

/// Collect `WEBHOOK_SECRET_<PROVIDER>` entries, sorted by provider
fn webhook_secrets_from(vars: impl Iterator<Item = (String, String)>) -> Vec<(String, String)> {
    let mut secrets: Vec<(String, String)> = vars
        .filter_map(|(key, value)| {
            let provider = key.strip_prefix(SECRET_PREFIX)?.to_ascii_lowercase();
            if provider.is_empty() || value.is_empty() {
                return None;
            }
            Some((provider, value))
        })
        .collect();
    secrets.sort();
    secrets
}
