//! Image preprocessing and mask post-processing for SAM-style models.
//!
//! The processor turns a decoded RGB image plus region prompts into the
//! tensors the ONNX graph expects, and turns the graph's low-resolution mask
//! logits back into binary masks aligned with the source image.

use crate::error::InferenceError;
use crate::types::BoundingBox;
use anyhow::{bail, Context, Result};
use base64::{engine::general_purpose, Engine as _};
use image::imageops::{self, FilterType};
use image::{GrayImage, ImageBuffer, ImageFormat, Luma, RgbImage};
use ndarray::{Array1, Array3, Axis};
use serde::{Deserialize, Serialize};
use std::io::Cursor;

/// Label attached to every box prompt: a positive region
pub const POSITIVE_BOX_LABEL: i64 = 1;

/// Tensor names of the exported graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TensorNames {
    pub pixel_values: String,
    pub input_boxes: String,
    pub input_boxes_labels: String,
    pub pred_masks: String,
    pub pred_scores: String,
}

impl Default for TensorNames {
    fn default() -> Self {
        Self {
            pixel_values: "pixel_values".to_string(),
            input_boxes: "input_boxes".to_string(),
            input_boxes_labels: "input_boxes_labels".to_string(),
            pred_masks: "pred_masks".to_string(),
            pred_scores: "pred_logits".to_string(),
        }
    }
}

/// Processor constants, optionally shipped as `processor.json` beside the
/// ONNX graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    /// Longest side after resize; inputs are padded to a square of this size
    pub target_size: u32,
    pub image_mean: [f32; 3],
    pub image_std: [f32; 3],
    /// Whether the score output holds logits rather than probabilities
    pub scores_are_logits: bool,
    pub tensors: TensorNames,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            target_size: 1024,
            image_mean: [0.485, 0.456, 0.406],
            image_std: [0.229, 0.224, 0.225],
            scores_are_logits: true,
            tensors: TensorNames::default(),
        }
    }
}

impl ProcessorConfig {
    /// Reject constants that would make preprocessing panic or emit
    /// non-finite tensors.
    pub fn validate(&self) -> Result<()> {
        if self.target_size == 0 {
            bail!("target_size must be positive");
        }
        for (c, std) in self.image_std.iter().enumerate() {
            if !std.is_finite() || *std == 0.0 {
                bail!("image_std[{}] must be finite and non-zero, got {}", c, std);
            }
        }
        if let Some(mean) = self.image_mean.iter().find(|m| !m.is_finite()) {
            bail!("image_mean must be finite, got {}", mean);
        }
        Ok(())
    }
}

/// Model-ready tensors for one request, flattened row-major
#[derive(Debug, Clone)]
pub struct ModelInputs {
    /// Shape `[1, 3, input_size, input_size]`
    pub pixel_values: Vec<f32>,
    pub input_size: u32,
    /// Shape `[1, num_boxes, 4]`, in resized-image coordinates
    pub input_boxes: Vec<f32>,
    /// Shape `[1, num_boxes]`
    pub input_boxes_labels: Vec<i64>,
    pub num_boxes: usize,
    /// Source image (width, height)
    pub original_size: (u32, u32),
    /// Resized image (width, height) before padding
    pub resized_size: (u32, u32),
}

/// Raw graph output, candidates along the first axis
#[derive(Debug, Clone)]
pub struct RawSegmentation {
    /// Shape `[candidates, h, w]`
    pub mask_logits: Array3<f32>,
    /// Shape `[candidates]`
    pub scores: Array1<f32>,
}

/// A retained detection at source resolution
#[derive(Debug, Clone)]
pub struct Detection {
    /// Pixels in {0, 255}
    pub mask: GrayImage,
    pub score: f32,
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

#[derive(Debug, Clone, Default)]
pub struct SamProcessor {
    config: ProcessorConfig,
}

impl SamProcessor {
    pub fn new(config: ProcessorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    /// Resize, normalize and pad the image; rescale and label the boxes.
    pub fn preprocess(&self, image: &RgbImage, boxes: &[BoundingBox]) -> Result<ModelInputs> {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            bail!("image has zero size ({}x{})", width, height);
        }

        let size = self.config.target_size;
        if size == 0 {
            bail!("processor target size is zero");
        }
        let scale = size as f32 / width.max(height) as f32;
        let new_w = ((width as f32 * scale).round() as u32).clamp(1, size);
        let new_h = ((height as f32 * scale).round() as u32).clamp(1, size);
        let resized = imageops::resize(image, new_w, new_h, FilterType::Triangle);

        let plane = (size * size) as usize;
        let mut pixel_values = vec![0.0f32; 3 * plane];
        for (x, y, pixel) in resized.enumerate_pixels() {
            let offset = (y * size + x) as usize;
            for c in 0..3 {
                let value = pixel[c] as f32 / 255.0;
                pixel_values[c * plane + offset] =
                    (value - self.config.image_mean[c]) / self.config.image_std[c];
            }
        }

        let sx = new_w as f32 / width as f32;
        let sy = new_h as f32 / height as f32;
        let input_boxes = boxes
            .iter()
            .flat_map(|b| b.scaled(sx, sy).to_array())
            .collect();

        Ok(ModelInputs {
            pixel_values,
            input_size: size,
            input_boxes,
            input_boxes_labels: vec![POSITIVE_BOX_LABEL; boxes.len()],
            num_boxes: boxes.len(),
            original_size: (width, height),
            resized_size: (new_w, new_h),
        })
    }

    /// Filter candidates by score and binarize their masks at source size.
    ///
    /// A candidate is kept when its score exceeds `threshold`; a threshold
    /// of 0 keeps every candidate.
    pub fn postprocess(
        &self,
        raw: &RawSegmentation,
        inputs: &ModelInputs,
        threshold: f32,
        mask_threshold: f32,
    ) -> Result<Vec<Detection>> {
        let candidates = raw.mask_logits.len_of(Axis(0));
        if candidates != raw.scores.len() {
            bail!(
                "model returned {} masks but {} scores",
                candidates,
                raw.scores.len()
            );
        }

        let mut detections = Vec::new();
        for (i, &raw_score) in raw.scores.iter().enumerate() {
            let score = if self.config.scores_are_logits {
                sigmoid(raw_score)
            } else {
                raw_score
            };
            if threshold > 0.0 && score <= threshold {
                continue;
            }

            let logits = raw.mask_logits.index_axis(Axis(0), i);
            let mask = self
                .resize_mask(logits.iter().map(|&l| sigmoid(l)).collect(), logits.dim(), inputs)
                .with_context(|| format!("failed to resize mask {}", i))?;
            let mask = binarize(&mask, mask_threshold);

            detections.push(Detection { mask, score });
        }

        Ok(detections)
    }

    /// Low-res probabilities → padded input size → crop padding → source
    /// size. Float resizing clamps to [0, 1], so this must run on
    /// probabilities, not logits.
    fn resize_mask(
        &self,
        probs: Vec<f32>,
        (h, w): (usize, usize),
        inputs: &ModelInputs,
    ) -> Result<ImageBuffer<Luma<f32>, Vec<f32>>> {
        if w == 0 || h == 0 {
            bail!("model returned an empty mask");
        }
        let low_res: ImageBuffer<Luma<f32>, Vec<f32>> =
            ImageBuffer::from_raw(w as u32, h as u32, probs)
                .context("mask data does not match its shape")?;

        let padded = imageops::resize(
            &low_res,
            inputs.input_size,
            inputs.input_size,
            FilterType::Triangle,
        );
        let (rw, rh) = inputs.resized_size;
        let cropped = imageops::crop_imm(&padded, 0, 0, rw, rh).to_image();
        let (ow, oh) = inputs.original_size;
        Ok(imageops::resize(&cropped, ow, oh, FilterType::Triangle))
    }
}

fn binarize(probs: &ImageBuffer<Luma<f32>, Vec<f32>>, mask_threshold: f32) -> GrayImage {
    let (w, h) = probs.dimensions();
    GrayImage::from_fn(w, h, |x, y| {
        if probs.get_pixel(x, y)[0] > mask_threshold {
            Luma([255u8])
        } else {
            Luma([0u8])
        }
    })
}

/// Decode a base64 raster into a three-channel image, whatever its source
/// channel layout.
pub fn decode_image(encoded: &str) -> Result<RgbImage, InferenceError> {
    let bytes = general_purpose::STANDARD.decode(encoded)?;
    Ok(image::load_from_memory(&bytes)?.to_rgb8())
}

/// Encode a mask as a single-channel PNG, then base64.
pub fn encode_mask(mask: &GrayImage) -> Result<String, InferenceError> {
    let mut buffer = Cursor::new(Vec::new());
    mask.write_to(&mut buffer, ImageFormat::Png)
        .map_err(|e| InferenceError::Encode(e.to_string()))?;
    Ok(general_purpose::STANDARD.encode(buffer.into_inner()))
}
