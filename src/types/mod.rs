//! Type definitions for the inference service

pub mod request;
pub mod response;

pub use request::{BoundingBox, InferenceRequest};
pub use response::{EncodedMask, InferenceResponse, PredictionOutcome};
