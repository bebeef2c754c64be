//! PayGate API Server
//!
//! Receives payment provider webhooks and reports gateway health.

use std::net::SocketAddr;
use std::sync::Arc;

use paygate_api::{create_router, AppState, Config};
use paygate_billing::InMemoryBillingProfileStore;
use tokio::time::interval;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,paygate_api=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting PayGate API Server v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    tracing::info!(
        primary = %config.resilience.gateway.primary,
        secondary = %config.resilience.gateway.secondary,
        webhook_providers = config.webhook_secrets.len(),
        "Configuration loaded"
    );
    if config.webhook_secrets.is_empty() {
        tracing::warn!("No WEBHOOK_SECRET_<PROVIDER> configured - every webhook will be rejected");
    }

    // Profiles live in memory until a persistent BillingProfileStore is wired in
    let store = Arc::new(InMemoryBillingProfileStore::new());
    let state = AppState::new(config.clone(), store)?;

    // Forget processed webhook ids past their retention
    let webhooks = state.resilience.webhooks.clone();
    let eviction_interval = config.dedup_eviction_interval;
    tokio::spawn(async move {
        let mut ticker = interval(eviction_interval);
        ticker.tick().await; // Skip first tick, nothing to evict at startup

        loop {
            ticker.tick().await;
            let evicted = webhooks.evict_expired();
            if evicted > 0 {
                tracing::debug!(evicted = evicted, "Evicted expired webhook dedup entries");
            }
        }
    });
    tracing::info!("Webhook dedup eviction task started");

    let app = create_router(state).layer(TraceLayer::new_for_http());

    let addr: SocketAddr = config.bind_address.parse()?;
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
