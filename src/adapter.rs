//! Request/response adapter around the segmentation model.
//!
//! Turns an untyped JSON body into a validated request, runs the model, and
//! turns its tensors into transport-safe masks. Every failure becomes a
//! structured failure response; nothing propagates to the caller.

use crate::error::InferenceError;
use crate::models::device::Device;
use crate::models::inference::SegmentationModel;
use crate::models::processor::{decode_image, encode_mask, SamProcessor};
use crate::types::{EncodedMask, InferenceRequest, InferenceResponse, PredictionOutcome};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, info_span};
use uuid::Uuid;

pub struct InferenceAdapter {
    model: Arc<dyn SegmentationModel>,
    processor: SamProcessor,
}

impl InferenceAdapter {
    pub fn new(model: Arc<dyn SegmentationModel>, processor: SamProcessor) -> Self {
        Self { model, processor }
    }

    pub fn device(&self) -> Device {
        self.model.device()
    }

    /// Handle one raw request body. Always returns a well-formed response.
    pub fn predict(&self, body: &[u8]) -> InferenceResponse {
        let request_id = Uuid::new_v4();
        let span = info_span!("predict", request_id = %request_id);
        let _enter = span.enter();
        let start = Instant::now();

        let response = InferenceResponse::from(self.outcome(body));
        debug!(
            success = response.success,
            num_masks = response.num_masks,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Prediction finished"
        );
        response
    }

    /// Core function: parse, validate, segment.
    pub fn outcome(&self, body: &[u8]) -> PredictionOutcome {
        match InferenceRequest::from_json(body).and_then(|request| self.segment(&request)) {
            Ok(masks) => PredictionOutcome::Success(masks),
            Err(e) => {
                error!(error = %e, details = ?e, "Prediction error");
                PredictionOutcome::failure(e.to_string())
            }
        }
    }

    /// Segment a validated request.
    pub fn segment(&self, request: &InferenceRequest) -> Result<Vec<EncodedMask>, InferenceError> {
        let image = decode_image(&request.image)?;
        let (width, height) = image.dimensions();
        info!(
            boxes = request.boxes.len(),
            width = width,
            height = height,
            device = %self.device(),
            "Processing {} boxes on image {}x{}",
            request.boxes.len(),
            width,
            height
        );

        if request.boxes.is_empty() {
            return Ok(Vec::new());
        }

        let inputs = self
            .processor
            .preprocess(&image, &request.boxes)
            .map_err(InferenceError::Processing)?;
        let raw = self.model.segment(&inputs).map_err(InferenceError::Model)?;
        let detections = self
            .processor
            .postprocess(&raw, &inputs, request.threshold, request.mask_threshold)
            .map_err(InferenceError::Processing)?;

        detections
            .iter()
            .map(|d| {
                Ok(EncodedMask {
                    mask: encode_mask(&d.mask)?,
                    score: d.score,
                })
            })
            .collect()
    }
}
