//! Startup model resolution and instantiation

use crate::adapter::InferenceAdapter;
use crate::config::{AppConfig, HubConfig, ModelConfig, RegistryConfig};
use crate::error::LoadError;
use crate::hub::HubClient;
use crate::models::device::{select_device, Device};
use crate::models::inference::OnnxSegmentationModel;
use crate::models::processor::{ProcessorConfig, SamProcessor};
use crate::registry::{ArtifactLocation, MlflowRegistry, ModelVersion};
use anyhow::anyhow;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Instant;
use tracing::{info, warn};

/// ONNX graph file inside a registered artifact
pub const MODEL_FILE: &str = "model.onnx";
/// Optional processor constants inside a registered artifact
pub const PROCESSOR_FILE: &str = "processor.json";

/// Ready-to-call model with the metadata reported by the service
pub struct LoadedModel {
    pub adapter: InferenceAdapter,
    pub version: ModelVersion,
    pub device: Device,
    pub loaded_at: DateTime<Utc>,
}

/// Publish-once cell for the loaded model.
///
/// Readers observe either nothing or a fully built model.
#[derive(Default)]
pub struct ModelSlot {
    inner: OnceLock<Arc<LoadedModel>>,
}

impl ModelSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish the model. A second publish is rejected and hands the
    /// model back.
    pub fn publish(&self, model: Arc<LoadedModel>) -> Result<(), Arc<LoadedModel>> {
        self.inner.set(model)
    }

    pub fn get(&self) -> Option<Arc<LoadedModel>> {
        self.inner.get().cloned()
    }

    pub fn is_loaded(&self) -> bool {
        self.inner.get().is_some()
    }
}

/// Artifact files materialised in the local cache
#[derive(Debug, Clone)]
pub struct ResolvedArtifact {
    pub version: ModelVersion,
    pub model_path: PathBuf,
    pub processor: ProcessorConfig,
}

/// Resolves the registered model and builds it
pub struct ModelLoader {
    registry: MlflowRegistry,
    hub: HubClient,
    registry_config: RegistryConfig,
    hub_config: HubConfig,
    model_config: ModelConfig,
}

impl ModelLoader {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            registry: MlflowRegistry::new(&config.registry),
            hub: HubClient::new(&config.hub),
            registry_config: config.registry.clone(),
            hub_config: config.hub.clone(),
            model_config: config.model.clone(),
        }
    }

    /// Resolve, fetch and instantiate the model. Runs once; not retried.
    pub async fn load(&self) -> Result<LoadedModel, LoadError> {
        let start = Instant::now();
        let artifact = self.resolve().await?;
        let device = select_device(self.model_config.device)?;

        let model_path = artifact.model_path.clone();
        let threads = self.model_config.intra_threads;
        let tensors = artifact.processor.tensors.clone();
        let model = tokio::task::spawn_blocking(move || -> anyhow::Result<OnnxSegmentationModel> {
            ort::init().commit()?;
            OnnxSegmentationModel::from_file(&model_path, device, threads, tensors)
        })
        .await
        .map_err(|e| LoadError::Instantiate(anyhow!("model build task failed: {}", e)))?
        .map_err(LoadError::Instantiate)?;

        let adapter = InferenceAdapter::new(Arc::new(model), SamProcessor::new(artifact.processor));

        info!(
            model = %artifact.version.name,
            version = %artifact.version.version,
            run_id = ?artifact.version.run_id,
            device = %device,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Model ready"
        );

        Ok(LoadedModel {
            adapter,
            version: artifact.version,
            device,
            loaded_at: Utc::now(),
        })
    }

    /// Resolve the latest registered version and materialise its files in
    /// `<cache_dir>/<name>/<version>/`.
    pub async fn resolve(&self) -> Result<ResolvedArtifact, LoadError> {
        let name = &self.registry_config.model_name;
        info!(model = %name, registry = %self.registry_config.tracking_uri, "Resolving model version");

        let version = self.registry.latest_version(name).await?;
        info!(
            model = %name,
            version = %version.version,
            run_id = ?version.run_id,
            "Found model version"
        );

        self.authenticate_hub().await;

        let dir = Path::new(&self.model_config.cache_dir)
            .join(&version.name)
            .join(&version.version);
        tokio::fs::create_dir_all(&dir).await?;

        let model_path = dir.join(MODEL_FILE);
        let processor_path = dir.join(PROCESSOR_FILE);

        // The graph is written last and marks a complete cache entry
        if tokio::fs::try_exists(&model_path).await? {
            info!(path = %model_path.display(), "Reusing cached model artifact");
        } else {
            let location = self.registry.artifact_location(&version).await?;
            self.registry
                .fetch_file(&location, PROCESSOR_FILE, &processor_path)
                .await?;
            self.fetch_model(&location, &model_path).await?;
        }

        let processor = self.processor_config(&processor_path).await?;

        Ok(ResolvedArtifact {
            version,
            model_path,
            processor,
        })
    }

    async fn authenticate_hub(&self) {
        if !self.hub.has_token() {
            warn!("No hub token configured; gated model downloads may fail");
            return;
        }
        match self.hub.authenticate().await {
            Ok(account) => info!(account = %account, "Authenticated with model hub"),
            Err(e) => warn!(error = %e, "Hub authentication failed; continuing without it"),
        }
    }

    async fn fetch_model(&self, location: &ArtifactLocation, dest: &Path) -> Result<(), LoadError> {
        if self.registry.fetch_file(location, MODEL_FILE, dest).await? {
            return Ok(());
        }
        if self.hub_config.repo.is_empty() {
            return Err(LoadError::artifact(format!(
                "artifact has no '{}' and no hub repository is configured",
                MODEL_FILE
            )));
        }

        warn!(
            repo = %self.hub_config.repo,
            "Artifact has no ONNX graph, falling back to the model hub"
        );
        self.hub
            .download(
                &self.hub_config.repo,
                &self.hub_config.revision,
                &self.hub_config.onnx_file,
                dest,
            )
            .await
    }

    async fn processor_config(&self, path: &Path) -> Result<ProcessorConfig, LoadError> {
        if !tokio::fs::try_exists(path).await? {
            let config = ProcessorConfig {
                target_size: self.model_config.target_size,
                ..Default::default()
            };
            config
                .validate()
                .map_err(|e| LoadError::artifact(format!("invalid model settings: {}", e)))?;
            return Ok(config);
        }
        let bytes = tokio::fs::read(path).await?;
        let config: ProcessorConfig = serde_json::from_slice(&bytes)
            .map_err(|e| LoadError::artifact(format!("invalid {}: {}", PROCESSOR_FILE, e)))?;
        config
            .validate()
            .map_err(|e| LoadError::artifact(format!("invalid {}: {}", PROCESSOR_FILE, e)))?;
        info!(target_size = config.target_size, "Loaded processor configuration");
        Ok(config)
    }
}
