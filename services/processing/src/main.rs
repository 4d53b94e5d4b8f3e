use anyhow::{Context, Result};
use pikit_processing::api::{start_api_server, AppState};
use pikit_processing::config::{Config, StoreBackend};
use pikit_processing::document_store::{DocumentStore, InMemoryDocumentStore, PostgresDocumentStore};
use pikit_processing::gemini_client::GeminiClient;
use pikit_processing::model_service::ModelService;
use pikit_processing::processor::ImageProcessor;
use pikit_processing::records::Repository;
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
        "Starting Pikit processing service"
    );

    if config.service.metrics_enabled {
        init_metrics(config.service.metrics_port)?;
    }

    // Initialize components
    let store = init_store(&config).await?;

    let model = Arc::new(GeminiClient::new(&config.model));
    let model_service = ModelService::new(model, config.model.model_name.clone());

    let processor = Arc::new(ImageProcessor::new(
        model_service,
        Repository::new(store.clone()),
    ));

    let api_state = AppState {
        processor,
        store,
        upload_dir: config.api.upload_dir.clone(),
    };

    let api_config = config.api.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(api_state, &api_config).await {
            error!(error = %e, "API server error");
        }
    });

    info!("Processing service started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down processing service");

    api_handle.abort();

    info!("Processing service stopped");

    Ok(())
}

/// Build the configured document store
async fn init_store(config: &Config) -> Result<Arc<dyn DocumentStore>> {
    match config.database.backend {
        StoreBackend::Postgres => {
            let store = PostgresDocumentStore::new(&config.database)
                .await
                .context("Failed to initialize document store")?;

            if config.database.run_migrations {
                store
                    .run_migrations()
                    .await
                    .context("Failed to run database migrations")?;
            }

            Ok(Arc::new(store))
        }
        StoreBackend::Memory => {
            warn!("Using in-memory document store; records are lost on restart");
            Ok(Arc::new(InMemoryDocumentStore::new()))
        }
    }
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

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
