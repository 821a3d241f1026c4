//! SAM Inference Service - Main Entry Point
//!
//! Resolves the registered segmentation model, loads it, then serves
//! `/invocations` over HTTP.

use anyhow::{anyhow, Context, Result};
use sam_inference_service::{
    config::{AppConfig, LoggingConfig},
    metrics::{MetricsReporter, ServiceMetrics},
    models::{ModelLoader, ModelSlot},
    server::{self, AppState},
};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = AppConfig::load()?;

    init_tracing(&config.logging)?;
    info!("Starting SAM Inference Service");
    info!(
        registry = %config.registry.tracking_uri,
        model = %config.registry.model_name,
        device = ?config.model.device,
        "Configuration loaded successfully"
    );

    let metrics = Arc::new(ServiceMetrics::new());
    let slot = Arc::new(ModelSlot::new());

    // Load the model before accepting traffic; any failure aborts startup
    let model = ModelLoader::new(&config)
        .load()
        .await
        .context("Failed to load model")?;
    info!(
        version = %model.version.version,
        device = %model.device,
        "Model {} v{} loaded",
        model.version.name,
        model.version.version
    );
    slot.publish(Arc::new(model))
        .map_err(|_| anyhow!("Model slot already populated"))?;

    if config.metrics.report_interval_secs > 0 {
        let reporter = MetricsReporter::new(metrics.clone(), config.metrics.report_interval_secs);
        tokio::spawn(reporter.start());
    }

    let state = AppState::new(
        slot,
        metrics.clone(),
        &config.server,
        &config.registry.model_name,
    );
    server::serve(&config.server, state).await?;

    // Print final summary
    info!("Service shutting down...");
    metrics.print_summary();

    Ok(())
}

fn init_tracing(logging: &LoggingConfig) -> Result<()> {
    // RUST_LOG wins over the configured level
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&logging.level)
            .with_context(|| format!("Invalid log level '{}'", logging.level))?,
    };

    match logging.format.as_str() {
        "json" => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
        _ => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
    Ok(())
}
