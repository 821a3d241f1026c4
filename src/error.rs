//! Error types for model loading and request handling

use thiserror::Error;

/// Startup-fatal failures raised while resolving and instantiating the model.
///
/// None of these are retried. The process exits and the operator restarts it
/// once the registry or configuration has been fixed.
#[derive(Debug, Error)]
pub enum LoadError {
    /// Registry or hub unreachable, or returned an unexpected status
    #[error("registry request failed: {0}")]
    Registry(#[from] reqwest::Error),

    /// No version registered under the configured name
    #[error("model '{name}' not found in registry")]
    NotFound { name: String },

    /// Artifact location could not be resolved or fetched
    #[error("artifact error: {0}")]
    Artifact(String),

    /// Requested compute device is not usable
    #[error("device error: {0}")]
    Device(String),

    /// ONNX session could not be built from the artifact
    #[error("failed to instantiate model: {0:#}")]
    Instantiate(anyhow::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl LoadError {
    pub fn artifact(msg: impl Into<String>) -> Self {
        Self::Artifact(msg.into())
    }

    pub fn device(msg: impl Into<String>) -> Self {
        Self::Device(msg.into())
    }
}

/// Per-request failures. Always recovered into a failure response; the
/// display text is what the caller sees in `error`.
#[derive(Debug, Error)]
pub enum InferenceError {
    /// Body is not JSON or not one of the accepted payload shapes
    #[error("invalid payload: {0}")]
    Payload(String),

    /// Fields present but out of bounds
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("invalid base64 image: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("invalid image: {0}")]
    Image(#[from] image::ImageError),

    /// Pre- or post-processing around the model call failed
    #[error("processing failed: {0:#}")]
    Processing(anyhow::Error),

    /// The model call or its output tensors failed
    #[error("model inference failed: {0:#}")]
    Model(anyhow::Error),

    #[error("failed to encode mask: {0}")]
    Encode(String),
}

impl InferenceError {
    pub fn payload(msg: impl Into<String>) -> Self {
        Self::Payload(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}
