//! Segmentation model abstraction and its ONNX Runtime implementation

use crate::models::device::Device;
use crate::models::processor::{ModelInputs, RawSegmentation, TensorNames};
use anyhow::{anyhow, bail, Context, Result};
use ndarray::{Array1, Array3};
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info};

/// An opaque promptable segmentation capability: image and box prompts in,
/// candidate mask logits and scores out.
pub trait SegmentationModel: Send + Sync {
    /// Device the model's tensors live on
    fn device(&self) -> Device;

    /// Run one forward pass
    fn segment(&self, inputs: &ModelInputs) -> Result<RawSegmentation>;
}

/// SAM graph exported to ONNX
pub struct OnnxSegmentationModel {
    /// ONNX Runtime needs exclusive access to run a session
    session: Mutex<Session>,
    tensors: TensorNames,
    device: Device,
}

impl OnnxSegmentationModel {
    /// Build a session for the graph at `path` on `device`.
    pub fn from_file<P: AsRef<Path>>(
        path: P,
        device: Device,
        intra_threads: usize,
        tensors: TensorNames,
    ) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), device = %device, threads = intra_threads, "Loading ONNX model");

        let builder = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(intra_threads)?;
        let builder = match device {
            Device::Cpu => builder,
            #[cfg(feature = "cuda")]
            Device::Cuda { device_id } => {
                use ort::execution_providers::CUDAExecutionProvider;
                builder.with_execution_providers([CUDAExecutionProvider::default()
                    .with_device_id(device_id)
                    .build()
                    .error_on_failure()])?
            }
            #[cfg(not(feature = "cuda"))]
            Device::Cuda { .. } => bail!("built without CUDA support"),
        };
        let session = builder
            .commit_from_file(path)
            .with_context(|| format!("Failed to load model from {:?}", path))?;

        for name in [
            &tensors.pixel_values,
            &tensors.input_boxes,
            &tensors.input_boxes_labels,
        ] {
            if !session.inputs.iter().any(|i| &i.name == name) {
                bail!("model has no input named '{}'", name);
            }
        }
        for name in [&tensors.pred_masks, &tensors.pred_scores] {
            if !session.outputs.iter().any(|o| &o.name == name) {
                bail!("model has no output named '{}'", name);
            }
        }

        info!(
            inputs = ?session.inputs.iter().map(|i| i.name.as_str()).collect::<Vec<_>>(),
            outputs = ?session.outputs.iter().map(|o| o.name.as_str()).collect::<Vec<_>>(),
            "Model loaded successfully"
        );

        Ok(Self {
            session: Mutex::new(session),
            tensors,
            device,
        })
    }
}

impl SegmentationModel for OnnxSegmentationModel {
    fn device(&self) -> Device {
        self.device
    }

    fn segment(&self, inputs: &ModelInputs) -> Result<RawSegmentation> {
        let size = inputs.input_size as i64;
        let boxes = inputs.num_boxes as i64;

        let pixel_values = Tensor::from_array((vec![1, 3, size, size], inputs.pixel_values.clone()))
            .context("Failed to create pixel tensor")?;
        let input_boxes = Tensor::from_array((vec![1, boxes, 4], inputs.input_boxes.clone()))
            .context("Failed to create box tensor")?;
        let input_labels =
            Tensor::from_array((vec![1, boxes], inputs.input_boxes_labels.clone()))
                .context("Failed to create label tensor")?;

        let mut session = self
            .session
            .lock()
            .map_err(|e| anyhow!("Lock error: {}", e))?;

        let outputs = session.run(ort::inputs![
            self.tensors.pixel_values.as_str() => pixel_values,
            self.tensors.input_boxes.as_str() => input_boxes,
            self.tensors.input_boxes_labels.as_str() => input_labels,
        ])?;

        let masks = outputs
            .get(self.tensors.pred_masks.as_str())
            .with_context(|| format!("missing output '{}'", self.tensors.pred_masks))?;
        let scores = outputs
            .get(self.tensors.pred_scores.as_str())
            .with_context(|| format!("missing output '{}'", self.tensors.pred_scores))?;

        let (mask_shape, mask_data) = masks.try_extract_tensor::<f32>()?;
        let (_, score_data) = scores.try_extract_tensor::<f32>()?;
        let mask_dims: Vec<i64> = mask_shape.iter().copied().collect();

        debug!(mask_shape = ?mask_dims, scores = score_data.len(), "Model forward pass complete");

        raw_from_tensors(&mask_dims, mask_data, score_data)
    }
}

/// Flatten graph outputs into candidates.
///
/// Masks may carry any leading dimensions (`[1, N, h, w]`,
/// `[1, B, K, h, w]`); every leading position is one candidate and the
/// score tensor must hold exactly one value per candidate.
pub fn raw_from_tensors(
    mask_dims: &[i64],
    mask_data: &[f32],
    score_data: &[f32],
) -> Result<RawSegmentation> {
    if mask_dims.len() < 2 {
        bail!("mask output must have at least 2 dimensions, got {:?}", mask_dims);
    }
    let dims = mask_dims
        .iter()
        .map(|&d| usize::try_from(d).map_err(|_| anyhow!("negative mask dimension {}", d)))
        .collect::<Result<Vec<_>>>()?;

    let (leading, spatial) = dims.split_at(dims.len() - 2);
    let (h, w) = (spatial[0], spatial[1]);
    let candidates: usize = leading.iter().product();

    if score_data.len() != candidates {
        bail!(
            "score output has {} values for {} mask candidates",
            score_data.len(),
            candidates
        );
    }

    let mask_logits = Array3::from_shape_vec((candidates, h, w), mask_data.to_vec())
        .context("mask output does not match its shape")?;

    Ok(RawSegmentation {
        mask_logits,
        scores: Array1::from(score_data.to_vec()),
    })
}
