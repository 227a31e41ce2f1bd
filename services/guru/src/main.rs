use anyhow::{Context, Result};
use clap::Parser;
use guru::config::ServerConfig;
use guru::installations::Installations;
use guru::webhook::{self, AppState};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let config = ServerConfig::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if config.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let credentials = &config.credentials;
    let app = credentials
        .app_token_source()
        .context("Failed to load GitHub App credentials")?;
    let api_url = credentials.api_url()?;
    info!(app_id = %app.app_id(), api_url = %api_url, "Loaded GitHub App credentials");

    let installations = Arc::new(
        Installations::builder(Arc::new(app))
            .api_url(api_url)
            .exchange_timeout(Some(credentials.exchange_timeout()))
            .build(),
    );

    if let Some(idle) = config.client_idle_ttl()? {
        info!(idle_secs = idle.as_secs(), "Evicting idle installation clients");
        installations.spawn_idle_sweeper(idle);
    }

    if config.webhook_secret.as_deref().map_or(true, str::is_empty) {
        warn!("GITHUB_WEBHOOK_SECRET not set; signature verification disabled.");
    }

    let state = AppState::new(installations, config.webhook_secret.as_deref());
    let app = webhook::router(state);

    let address = format!("0.0.0.0:{}", config.port);
    info!("guru listening on {address}");
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .with_context(|| format!("Failed to bind {address}"))?;
    axum::serve(listener, app).await?;
    Ok(())
}
