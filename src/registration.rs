//! Publishing an exported model into the registry

use crate::error::LoadError;
use crate::models::loader::{MODEL_FILE, PROCESSOR_FILE};
use crate::registry::{ArtifactLocation, MlflowRegistry, ModelVersion};
use std::path::PathBuf;
use tracing::{error, info};

/// What to register and where
#[derive(Debug, Clone)]
pub struct Registration {
    pub model_name: String,
    pub experiment_id: String,
    pub run_name: String,
    /// Directory inside the run's artifacts holding the model files
    pub artifact_path: String,
    pub model_file: PathBuf,
    pub processor_file: Option<PathBuf>,
}

impl Registration {
    pub fn new(model_name: impl Into<String>, model_file: impl Into<PathBuf>) -> Self {
        Self {
            model_name: model_name.into(),
            experiment_id: "0".to_string(),
            run_name: "sam3-inference-service".to_string(),
            artifact_path: "sam3_model".to_string(),
            model_file: model_file.into(),
            processor_file: None,
        }
    }
}

/// Create a run, upload the model files into it, and register them as a
/// new version of `registration.model_name`.
///
/// The run is ended `FAILED` when any step after its creation fails.
pub async fn register(
    registry: &MlflowRegistry,
    registration: &Registration,
) -> Result<ModelVersion, LoadError> {
    for path in std::iter::once(&registration.model_file).chain(&registration.processor_file) {
        if !tokio::fs::try_exists(path).await? {
            return Err(LoadError::artifact(format!(
                "'{}' does not exist",
                path.display()
            )));
        }
    }

    let run = registry
        .create_run(&registration.experiment_id, &registration.run_name)
        .await?;

    match publish(registry, registration, &run.run_id, &run.artifact_uri).await {
        Ok(version) => {
            registry.end_run(&run.run_id, "FINISHED").await?;
            info!(
                model = %version.name,
                version = %version.version,
                run_id = %run.run_id,
                "Registration complete"
            );
            Ok(version)
        }
        Err(e) => {
            if let Err(end) = registry.end_run(&run.run_id, "FAILED").await {
                error!(run_id = %run.run_id, error = %end, "Failed to mark run as failed");
            }
            Err(e)
        }
    }
}

async fn publish(
    registry: &MlflowRegistry,
    registration: &Registration,
    run_id: &str,
    artifact_uri: &str,
) -> Result<ModelVersion, LoadError> {
    let location = ArtifactLocation::parse(artifact_uri)?.join(&registration.artifact_path);

    if let Some(processor) = &registration.processor_file {
        registry.upload_file(&location, PROCESSOR_FILE, processor).await?;
    }
    registry
        .upload_file(&location, MODEL_FILE, &registration.model_file)
        .await?;

    let source = format!(
        "{}/{}",
        artifact_uri.trim_end_matches('/'),
        registration.artifact_path
    );
    registry
        .ensure_registered_model(&registration.model_name)
        .await?;
    registry
        .create_model_version(&registration.model_name, &source, run_id)
        .await
}
