//! Model Registration Tool
//!
//! Uploads an exported SAM ONNX graph (and optional processor.json) to the
//! MLflow tracking server and registers it as a new model version.
//!
//! Usage: register-model <model.onnx> [processor.json] [experiment_id]

use anyhow::{bail, Context};
use sam_inference_service::config::AppConfig;
use sam_inference_service::registration::{register, Registration};
use sam_inference_service::registry::MlflowRegistry;
use std::path::PathBuf;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("register_model=info".parse()?)
                .add_directive("sam_inference_service=info".parse()?),
        )
        .init();

    // Parse arguments
    let args: Vec<String> = std::env::args().collect();
    let Some(model_file) = args.get(1).map(PathBuf::from) else {
        bail!("usage: register-model <model.onnx> [processor.json] [experiment_id]");
    };
    let processor_file = args
        .get(2)
        .filter(|s| !s.is_empty() && s.as_str() != "-")
        .map(PathBuf::from);
    let experiment_id = args.get(3).cloned().unwrap_or_else(|| "0".to_string());

    // Same registry settings (and MLFLOW_* variables) as the service
    let config = AppConfig::load().context("Failed to load configuration")?;

    info!("{}", "=".repeat(80));
    info!("SAM Model Registration");
    info!("{}", "=".repeat(80));
    info!("Tracking URI: {}", config.registry.tracking_uri);
    info!("Registered model: {}", config.registry.model_name);
    info!("Model file: {}", model_file.display());
    info!(
        "Processor config: {}",
        processor_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "none (service defaults)".to_string())
    );
    info!("{}", "=".repeat(80));

    let mut registration = Registration::new(config.registry.model_name.clone(), model_file);
    registration.processor_file = processor_file;
    registration.experiment_id = experiment_id;

    let registry = MlflowRegistry::new(&config.registry);
    let version = register(&registry, &registration)
        .await
        .context("Registration failed")?;

    info!("{}", "=".repeat(80));
    info!("Registered Model: {}", version.name);
    info!("Version: {}", version.version);
    if let Some(run_id) = &version.run_id {
        info!("Run ID: {}", run_id);
    }
    if let Some(source) = &version.source {
        info!("Source: {}", source);
    }
    info!("{}", "=".repeat(80));

    Ok(())
}
