use anyhow::{Context, Result};
use lessonlink::api::{create_integrations_router, IntegrationsAppState};
use lessonlink::config::{load_config, LessonlinkConfig};
use lessonlink::credentials::CredentialStore;
use lessonlink::oauth::{run_state_cleanup, OAuthService};
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lessonlink=info".into()),
        )
        .init();

    info!("Lessonlink starting...");

    let mut config = match std::env::var("LESSONLINK_CONFIG") {
        Ok(path) => load_config(&path)?,
        Err(_) => LessonlinkConfig::default(),
    };
    config
        .apply_env()
        .context("Invalid environment configuration")?;

    let envelope = config
        .build_envelope()
        .context("LESSONLINK_ENCRYPTION_KEY is required (base64-encoded 32-byte key)")?;
    let providers = config.provider_configs()?;

    info!(
        bind_addr = %config.server.bind_addr,
        database_path = %config.storage.database_path,
        active_key_version = envelope.active_version(),
        providers = providers.len(),
        "Configuration loaded"
    );

    let store = Arc::new(
        CredentialStore::new(&config.storage.database_path, envelope)
            .context("Failed to initialize credential store")?,
    );
    info!("Credential store initialized");

    let service = Arc::new(OAuthService::new(store, providers, &config.oauth)?);

    let cleanup = tokio::spawn(run_state_cleanup(
        service.ledger().clone(),
        config.oauth.state_cleanup_interval_seconds,
    ));

    let router = create_integrations_router(IntegrationsAppState {
        service: Arc::clone(&service),
    });
    let listener = tokio::net::TcpListener::bind(&config.server.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind_addr))?;
    info!(bind_addr = %config.server.bind_addr, "Integrations API listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for ctrl_c signal");
            }
            info!("Shutdown signal received");
        })
        .await
        .context("Integrations API server error")?;

    cleanup.abort();
    info!("Lessonlink stopped");

    Ok(())
}
