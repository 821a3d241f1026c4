//! Inference response structures

use serde::{Deserialize, Serialize};

/// One retained detection, transport-encoded
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedMask {
    /// Base64 PNG, single channel, pixels in {0, 255}
    pub mask: String,
    pub score: f32,
}

/// Result of the adapter's core function
#[derive(Debug, Clone, PartialEq)]
pub enum PredictionOutcome {
    Success(Vec<EncodedMask>),
    Failure { message: String },
}

impl PredictionOutcome {
    pub fn failure(message: impl Into<String>) -> Self {
        Self::Failure {
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

/// Wire response for `POST /invocations`.
///
/// Callers must check `success` before reading `masks` and `scores`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceResponse {
    pub masks: Vec<String>,
    pub scores: Vec<f32>,
    pub num_masks: usize,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<PredictionOutcome> for InferenceResponse {
    fn from(outcome: PredictionOutcome) -> Self {
        match outcome {
            PredictionOutcome::Success(detections) => {
                let (masks, scores): (Vec<String>, Vec<f32>) = detections
                    .into_iter()
                    .map(|d| (d.mask, d.score))
                    .unzip();
                Self {
                    num_masks: masks.len(),
                    masks,
                    scores,
                    success: true,
                    error: None,
                }
            }
            PredictionOutcome::Failure { message } => {
                let message = if message.trim().is_empty() {
                    "unknown inference error".to_string()
                } else {
                    message
                };
                Self {
                    masks: Vec::new(),
                    scores: Vec::new(),
                    num_masks: 0,
                    success: false,
                    error: Some(message),
                }
            }
        }
    }
}
