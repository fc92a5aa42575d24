//! Checkout relay server binary

use anyhow::{Context, Result};
use relay::api::{create_router, ApiState};
use relay::provider::{FingerprintProvider, IdentificationProvider};
use relay::{RelayConfig, API_KEY_VARS};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    // Optional config file; everything has a default
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = RelayConfig::load(config_path.as_deref()).context("Failed to load configuration")?;

    let level = config.log_level.parse::<Level>().unwrap_or(Level::INFO);
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting checkout relay v{}", env!("CARGO_PKG_VERSION"));
    info!(
        config_path = ?config_path,
        port = config.port,
        vendor_url = config.vendor_url,
        public_key_set = config.public_api_key.is_some(),
        "Loaded configuration"
    );

    let provider: Option<Arc<dyn IdentificationProvider>> = match &config.api_key {
        Some(key) => {
            let provider = FingerprintProvider::with_base_url(&config.vendor_url, key)
                .context("Failed to build Fingerprint client")?;
            info!(vendor_url = provider.base_url(), "Fingerprint provider ready");
            Some(Arc::new(provider))
        }
        None => {
            warn!(
                "No Fingerprint API key found (set {}); identification requests will fail",
                API_KEY_VARS.join(" or ")
            );
            None
        }
    };

    let app = create_router(Arc::new(ApiState::new(provider)));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Relay stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
