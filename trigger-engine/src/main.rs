use anyhow::{Context, Result};
use lattice::config::CoreConfig;
use lattice::credentials::CredentialStore;
use lattice::oauth::{run_state_pruner, OAuthCoordinator};
use std::sync::Arc;
use tracing::info;
use trigger_engine::dispatch::HttpDispatcher;
use trigger_engine::engine::PollingEngine;
use trigger_engine::registry::TriggerRegistry;
use trigger_engine::source::GoogleCalendarSource;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "trigger_engine=info,lattice=info".into()),
        )
        .init();

    info!("Trigger engine starting...");

    // Read configuration from environment
    let encryption_key = std::env::var("LATTICE_ENCRYPTION_KEY")
        .context("LATTICE_ENCRYPTION_KEY is required (base64-encoded 32-byte key)")?;

    let credentials_db = std::env::var("LATTICE_CREDENTIALS_DB")
        .unwrap_or_else(|_| "credentials.db".to_string());

    let dispatcher_url = std::env::var("LATTICE_DISPATCHER_URL")
        .unwrap_or_else(|_| "http://localhost:3000".to_string());

    let config = CoreConfig::load().context("Failed to load configuration")?;

    info!(
        credentials_db = %credentials_db,
        dispatcher_url = %dispatcher_url,
        poll_interval_secs = config.polling.interval_seconds,
        "Configuration loaded"
    );

    // Credential store, shared by the coordinator and the engine
    let store = Arc::new(
        CredentialStore::new(&credentials_db, &encryption_key)
            .context("Failed to initialize credential store")?,
    );
    info!("Credential store initialized");

    let oauth = Arc::new(
        OAuthCoordinator::new(Arc::clone(&store), &config.oauth)
            .context("Failed to initialize OAuth coordinator")?,
    );

    // Expired state tokens are swept in the background; consume() also
    // rejects them on its own, so this only bounds memory
    let pruner_handle = tokio::spawn(run_state_pruner(oauth.state_store(), 60));

    let registry = Arc::new(TriggerRegistry::new());
    let source = Arc::new(
        GoogleCalendarSource::new(
            config.polling.page_size,
            config.polling.request_timeout_seconds,
        )
        .context("Failed to initialize provider client")?,
    );
    let dispatcher = Arc::new(
        HttpDispatcher::new(dispatcher_url, config.polling.request_timeout_seconds)
            .context("Failed to initialize dispatcher client")?,
    );

    let engine = Arc::new(PollingEngine::new(
        Arc::clone(&registry),
        Arc::clone(&store),
        Arc::clone(&oauth),
        source,
        dispatcher,
        &config.polling,
    ));
    let engine_handle = engine.start(config.polling.interval_seconds);
    info!("Polling engine started");

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl_c signal")?;
    info!("Shutdown signal received");

    engine_handle.abort();
    pruner_handle.abort();
    info!("Trigger engine stopped");

    Ok(())
}
