//! SAM Inference Service Library
//!
//! Serves a promptable image segmentation model resolved from an MLflow
//! model registry: box prompts in, binary masks out, over HTTP.

pub mod adapter;
pub mod config;
pub mod error;
pub mod hub;
pub mod metrics;
pub mod models;
pub mod registration;
pub mod registry;
pub mod server;
pub mod types;

pub use adapter::InferenceAdapter;
pub use config::AppConfig;
pub use error::{InferenceError, LoadError};
pub use models::{LoadedModel, ModelLoader, ModelSlot};
pub use types::{InferenceRequest, InferenceResponse, PredictionOutcome};
