//! Resilience configuration
//!
//! All values have defaults and can be overridden from the environment.

use std::str::FromStr;
use std::time::Duration;

use crate::error::{BillingError, BillingResult};

pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;
pub const DEFAULT_RECOVERY_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_SIGNATURE_TOLERANCE_SECS: u64 = 300;
pub const DEFAULT_MAX_RETRY_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_BASE_DELAY_SECS: u64 = 5;
pub const DEFAULT_HANDLER_TIMEOUT_SECS: u64 = 30;
/// Providers keep redelivering for up to three days, so processed ids are kept that long
pub const DEFAULT_DEDUP_RETENTION_SECS: u64 = 72 * 60 * 60;
pub const DEFAULT_CLAIM_TIMEOUT_SECS: u64 = 30 * 60;

/// Circuit breaker and failover settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayConfig {
    /// Preferred provider, used whenever its circuit is not open
    pub primary: String,
    /// Fallback provider
    pub secondary: String,
    /// Consecutive failures that open a closed circuit
    pub failure_threshold: u32,
    /// Time an open circuit waits before allowing a half-open trial
    pub recovery_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            primary: "stripe".to_string(),
            secondary: "paddle".to_string(),
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            recovery_timeout: Duration::from_secs(DEFAULT_RECOVERY_TIMEOUT_SECS),
        }
    }
}

impl GatewayConfig {
    pub fn new(primary: impl Into<String>, secondary: impl Into<String>) -> Self {
        Self {
            primary: primary.into(),
            secondary: secondary.into(),
            ..Self::default()
        }
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout = timeout;
        self
    }

    /// Providers in precedence order
    pub fn providers(&self) -> [&str; 2] {
        [self.primary.as_str(), self.secondary.as_str()]
    }
}

/// Webhook ingestion settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookConfig {
    /// Maximum allowed distance between the signed timestamp and now
    pub signature_tolerance: Duration,
    /// Delayed re-attempts before an event is escalated
    pub max_retry_attempts: u32,
    /// Delay before the first re-attempt; doubles for each following one
    pub retry_base_delay: Duration,
    /// Upper bound for a single backoff delay
    pub max_retry_delay: Option<Duration>,
    /// Upper bound for one handler invocation
    pub handler_timeout: Duration,
    /// How long processed event ids are remembered
    pub dedup_retention: Duration,
    /// After this long an in-flight claim is considered stuck and can be re-claimed
    pub claim_timeout: Duration,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            signature_tolerance: Duration::from_secs(DEFAULT_SIGNATURE_TOLERANCE_SECS),
            max_retry_attempts: DEFAULT_MAX_RETRY_ATTEMPTS,
            retry_base_delay: Duration::from_secs(DEFAULT_RETRY_BASE_DELAY_SECS),
            max_retry_delay: None,
            handler_timeout: Duration::from_secs(DEFAULT_HANDLER_TIMEOUT_SECS),
            dedup_retention: Duration::from_secs(DEFAULT_DEDUP_RETENTION_SECS),
            claim_timeout: Duration::from_secs(DEFAULT_CLAIM_TIMEOUT_SECS),
        }
    }
}

/// Full configuration for the gateway manager and the webhook pipeline
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResilienceConfig {
    pub gateway: GatewayConfig,
    pub webhook: WebhookConfig,
}

impl ResilienceConfig {
    /// Load configuration from environment variables, falling back to defaults
    pub fn from_env() -> BillingResult<Self> {
        let gateway_defaults = GatewayConfig::default();
        let webhook_defaults = WebhookConfig::default();

        let gateway = GatewayConfig {
            primary: env_or("GATEWAY_PRIMARY", gateway_defaults.primary),
            secondary: env_or("GATEWAY_SECONDARY", gateway_defaults.secondary),
            failure_threshold: env_parse(
                "GATEWAY_FAILURE_THRESHOLD",
                gateway_defaults.failure_threshold,
            )?,
            recovery_timeout: env_secs(
                "GATEWAY_RECOVERY_TIMEOUT_SECS",
                gateway_defaults.recovery_timeout,
            )?,
        };

        let max_retry_delay = match std::env::var("WEBHOOK_MAX_RETRY_DELAY_SECS") {
            Ok(raw) => Some(Duration::from_secs(parse_value(
                "WEBHOOK_MAX_RETRY_DELAY_SECS",
                &raw,
            )?)),
            Err(_) => webhook_defaults.max_retry_delay,
        };

        let webhook = WebhookConfig {
            signature_tolerance: env_secs(
                "WEBHOOK_SIGNATURE_TOLERANCE_SECS",
                webhook_defaults.signature_tolerance,
            )?,
            max_retry_attempts: env_parse(
                "WEBHOOK_MAX_RETRY_ATTEMPTS",
                webhook_defaults.max_retry_attempts,
            )?,
            retry_base_delay: env_secs(
                "WEBHOOK_RETRY_BASE_DELAY_SECS",
                webhook_defaults.retry_base_delay,
            )?,
            max_retry_delay,
            handler_timeout: env_secs(
                "WEBHOOK_HANDLER_TIMEOUT_SECS",
                webhook_defaults.handler_timeout,
            )?,
            dedup_retention: env_secs(
                "WEBHOOK_DEDUP_RETENTION_SECS",
                webhook_defaults.dedup_retention,
            )?,
            claim_timeout: env_secs("WEBHOOK_CLAIM_TIMEOUT_SECS", webhook_defaults.claim_timeout)?,
        };

        let config = Self { gateway, webhook };
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the state machines cannot run with
    pub fn validate(&self) -> BillingResult<()> {
        let gateway = &self.gateway;
        if gateway.primary.trim().is_empty() || gateway.secondary.trim().is_empty() {
            return Err(BillingError::Config(
                "gateway provider names must not be empty".to_string(),
            ));
        }
        if gateway.primary == gateway.secondary {
            return Err(BillingError::Config(format!(
                "primary and secondary gateway must differ (both are '{}')",
                gateway.primary
            )));
        }
        if gateway.failure_threshold == 0 {
            return Err(BillingError::Config(
                "GATEWAY_FAILURE_THRESHOLD must be at least 1".to_string(),
            ));
        }
        if self.webhook.handler_timeout.is_zero() {
            return Err(BillingError::Config(
                "WEBHOOK_HANDLER_TIMEOUT_SECS must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn env_or(key: &str, default: String) -> String {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or(default)
}

fn env_parse<T: FromStr>(key: &str, default: T) -> BillingResult<T> {
    match std::env::var(key) {
        Ok(raw) => parse_value(key, &raw),
        Err(_) => Ok(default),
    }
}

fn env_secs(key: &str, default: Duration) -> BillingResult<Duration> {
    match std::env::var(key) {
        Ok(raw) => parse_value(key, &raw).map(Duration::from_secs),
        Err(_) => Ok(default),
    }
}

fn parse_value<T: FromStr>(key: &str, raw: &str) -> BillingResult<T> {
    raw.trim()
        .parse()
        .map_err(|_| BillingError::Config(format!("{} has an invalid value: '{}'", key, raw)))
}
