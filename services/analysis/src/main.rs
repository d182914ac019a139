use analysis_service::api::{start_api_server, AppState};
use analysis_service::config::Config;
use analysis_service::credentials::{CredentialResolver, SecretsManagerSource};
use analysis_service::deletion::DeletionCoordinator;
use analysis_service::document_store::{DocumentStore, SodaClient};
use analysis_service::object_store::{ObjectStore, S3ObjectStore};
use analysis_service::pipeline::{AnalysisHandler, HandlerSettings};
use analysis_service::view::ResultViewComposer;
use analysis_service::VisionClient;
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        "Starting Analysis Service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    // Initialize components
    let secrets = Arc::new(SecretsManagerSource::new(&config.object_store.region).await);
    let resolver = Arc::new(CredentialResolver::from_config(&config.credentials, secrets));

    let store: Arc<dyn DocumentStore> = Arc::new(
        SodaClient::new(&config.document_store)
            .context("Failed to initialize document store client")?,
    );

    let objects: Arc<dyn ObjectStore> = Arc::new(S3ObjectStore::new(&config.object_store).await);

    let vision = Arc::new(
        VisionClient::new(&config.analysis).context("Failed to initialize vision client")?,
    );

    let collection = config.document_store.collection.clone();
    let bucket = config.object_store.bucket.clone();

    // Prime the credential cache; failures only degrade analysis persistence
    match resolver.resolve().await {
        Ok(credential) => info!(
            kind = credential.kind.as_str(),
            priority = credential.priority,
            "Document store credential resolved"
        ),
        Err(e) => warn!(error = %e, "No document store credential, analysis results will not be persisted"),
    }

    let handler = Arc::new(AnalysisHandler::new(
        resolver.clone(),
        store.clone(),
        objects.clone(),
        vision,
        HandlerSettings {
            collection: collection.clone(),
            bucket: bucket.clone(),
            namespace: config.analysis.namespace.clone(),
            analysis_timeout: config.analysis_timeout(),
            inline_image_bytes: config.analysis.inline_image_bytes,
        },
    ));

    let deletion = Arc::new(DeletionCoordinator::new(
        resolver.clone(),
        store.clone(),
        objects.clone(),
        collection.clone(),
        bucket.clone(),
    ));

    let views = Arc::new(ResultViewComposer::new(
        resolver.clone(),
        store.clone(),
        objects.clone(),
        collection.clone(),
        bucket,
        config.presigned_url_expiry(),
        config.api.list_concurrency,
    ));

    // Create API state
    let api_state = AppState {
        handler,
        deletion,
        views,
        objects,
        store,
        resolver,
        collection,
    };

    // Spawn API server task
    let api_config = config.api.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(api_state, &api_config).await {
            error!(error = %e, "API server error");
        }
    });

    info!("Analysis service started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down analysis service");

    api_handle.abort();

    info!("Analysis service stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
