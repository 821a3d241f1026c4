//! Configuration management for the inference service

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::Path;

/// Compute device preference for the ONNX session
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DevicePreference {
    /// Accelerator when available, otherwise CPU
    #[default]
    Auto,
    Cpu,
    /// Accelerator required; loading fails without one
    Cuda,
}

/// Main application configuration
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub registry: RegistryConfig,
    pub hub: HubConfig,
    pub model: ModelConfig,
    pub metrics: MetricsConfig,
    pub logging: LoggingConfig,
}

/// HTTP listener configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Name reported by `GET /`
    pub service_name: String,
    /// Largest accepted request body; encoded images are large
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5001,
            service_name: "SAM3 Inference API".to_string(),
            max_body_bytes: 64 * 1024 * 1024,
        }
    }
}

/// Model registry (MLflow tracking server) configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub tracking_uri: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Registered model name to resolve at startup
    pub model_name: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            tracking_uri: "http://localhost:5000".to_string(),
            username: None,
            password: None,
            model_name: "sam3-inference".to_string(),
        }
    }
}

/// Gated model hub configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub endpoint: String,
    /// Repository used when the registry artifact carries no ONNX graph
    pub repo: String,
    pub revision: String,
    /// Bearer token for gated repositories
    pub token: Option<String>,
    pub onnx_file: String,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://huggingface.co".to_string(),
            repo: "facebook/sam3".to_string(),
            revision: "main".to_string(),
            token: None,
            onnx_file: "model.onnx".to_string(),
        }
    }
}

/// Model instantiation configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Local directory where fetched artifacts are cached per version
    pub cache_dir: String,
    pub device: DevicePreference,
    /// Intra-op threads for ONNX Runtime
    pub intra_threads: usize,
    /// Longest-side resize target, overridden by a shipped processor.json
    pub target_size: u32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            cache_dir: "/tmp/sam-inference/models".to_string(),
            device: DevicePreference::Auto,
            intra_threads: 1,
            target_size: 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Seconds between summary log lines; 0 disables the reporter
    pub report_interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            report_interval_secs: 60,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (json, pretty)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

/// Well-known environment variables mapped onto config keys.
const ENV_OVERRIDES: &[(&str, &str)] = &[
    ("MLFLOW_TRACKING_URI", "registry.tracking_uri"),
    ("MLFLOW_TRACKING_USERNAME", "registry.username"),
    ("MLFLOW_TRACKING_PASSWORD", "registry.password"),
    ("HF_TOKEN", "hub.token"),
    ("SAM_MODEL_NAME", "hub.repo"),
];

impl AppConfig {
    /// Load configuration from file and environment
    pub fn load() -> Result<Self> {
        Self::load_from_path("config/config.toml")
    }

    /// Load configuration from a specific path. The file is optional.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let env: Vec<(String, Option<String>)> = ENV_OVERRIDES
            .iter()
            .map(|(var, key)| {
                (
                    key.to_string(),
                    std::env::var(var).ok().filter(|v| !v.is_empty()),
                )
            })
            .collect();
        Self::load_with_overrides(path, env)
    }

    fn load_with_overrides<P: AsRef<Path>>(
        path: P,
        overrides: Vec<(String, Option<String>)>,
    ) -> Result<Self> {
        let mut builder = Config::builder()
            .add_source(File::from(path.as_ref()).required(false))
            .add_source(
                Environment::with_prefix("SAM")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            );

        for (key, value) in overrides {
            builder = builder
                .set_override_option(key.as_str(), value)
                .context("Failed to apply environment override")?;
        }

        builder
            .build()
            .context("Failed to build configuration")?
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }
}
