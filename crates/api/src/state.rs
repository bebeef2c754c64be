//! Application state

use std::sync::Arc;

use paygate_billing::{
    register_default_handlers, BillingProfileStore, BillingResilience, BillingResult,
    ResilienceDeps,
};

use crate::config::Config;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    /// Gateway failover and webhook pipeline
    pub resilience: BillingResilience,
}

impl AppState {
    /// Build the resilience services and wire the billing profile handlers to `store`
    pub fn new(config: Config, store: Arc<dyn BillingProfileStore>) -> BillingResult<Self> {
        Self::with_deps(config, store, ResilienceDeps::default())
    }

    pub fn with_deps(
        config: Config,
        store: Arc<dyn BillingProfileStore>,
        deps: ResilienceDeps,
    ) -> BillingResult<Self> {
        let resilience = BillingResilience::with_deps(
            config.resilience.clone(),
            config.webhook_secrets.clone(),
            deps,
        )?;
        register_default_handlers(&resilience.webhooks, store);

        Ok(Self { config, resilience })
    }
}
