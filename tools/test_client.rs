//! Test Inference Client
//!
//! Generates synthetic images with random box prompts and posts them to a
//! running inference service, checking the returned masks.

use anyhow::{bail, Context};
use base64::{engine::general_purpose, Engine as _};
use image::{ImageFormat, Rgb, RgbImage};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Request body matching the service's `/invocations` contract
#[derive(Debug, Clone, Serialize)]
struct InvocationRequest {
    image: String,
    boxes: Vec<[f32; 4]>,
    threshold: f32,
    mask_threshold: f32,
}

#[derive(Debug, Deserialize)]
struct InvocationResponse {
    masks: Vec<String>,
    scores: Vec<f32>,
    num_masks: usize,
    success: bool,
    #[serde(default)]
    error: Option<String>,
}

/// Synthetic scene: flat background with a few solid rectangles, each
/// rectangle's bounds used as a box prompt
struct SceneGenerator {
    rng: rand::rngs::ThreadRng,
}

impl SceneGenerator {
    fn new() -> Self {
        Self {
            rng: rand::thread_rng(),
        }
    }

    fn random_color(&mut self) -> Rgb<u8> {
        Rgb([self.rng.gen(), self.rng.gen(), self.rng.gen()])
    }

    fn generate(&mut self) -> anyhow::Result<(InvocationRequest, (u32, u32))> {
        let width = self.rng.gen_range(64..640);
        let height = self.rng.gen_range(64..480);
        let background = self.random_color();
        let mut image = RgbImage::from_pixel(width, height, background);

        let shapes = self.rng.gen_range(0..4);
        let mut boxes = Vec::with_capacity(shapes);
        for _ in 0..shapes {
            let x1 = self.rng.gen_range(0..width / 2);
            let y1 = self.rng.gen_range(0..height / 2);
            let x2 = self.rng.gen_range(x1 + 8..width);
            let y2 = self.rng.gen_range(y1 + 8..height);
            let color = self.random_color();
            for y in y1..y2 {
                for x in x1..x2 {
                    image.put_pixel(x, y, color);
                }
            }
            boxes.push([x1 as f32, y1 as f32, x2 as f32, y2 as f32]);
        }

        let mut buffer = Cursor::new(Vec::new());
        image.write_to(&mut buffer, ImageFormat::Png)?;

        let request = InvocationRequest {
            image: general_purpose::STANDARD.encode(buffer.into_inner()),
            boxes,
            threshold: self.rng.gen_range(0.0..0.9),
            mask_threshold: 0.5,
        };
        Ok((request, (width, height)))
    }
}

/// Every mask must be a single-channel image of the source size holding
/// only 0 and 255.
fn check_response(response: &InvocationResponse, size: (u32, u32)) -> anyhow::Result<()> {
    if response.masks.len() != response.num_masks || response.scores.len() != response.num_masks
    {
        bail!(
            "length mismatch: {} masks, {} scores, num_masks {}",
            response.masks.len(),
            response.scores.len(),
            response.num_masks
        );
    }
    for (i, encoded) in response.masks.iter().enumerate() {
        let bytes = general_purpose::STANDARD
            .decode(encoded)
            .with_context(|| format!("mask {} is not base64", i))?;
        let decoded = image::load_from_memory(&bytes)
            .with_context(|| format!("mask {} is not an image", i))?;
        if decoded.color().channel_count() != 1 {
            bail!("mask {} has {} channels", i, decoded.color().channel_count());
        }
        let mask = decoded.to_luma8();
        if mask.dimensions() != size {
            bail!("mask {} is {:?}, expected {:?}", i, mask.dimensions(), size);
        }
        if !mask.pixels().all(|p| p[0] == 0 || p[0] == 255) {
            bail!("mask {} is not binary", i);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("test_client=info".parse()?),
        )
        .init();

    info!("Starting Test Inference Client");

    // Parse arguments
    let args: Vec<String> = std::env::args().collect();
    let base_url = args
        .get(1)
        .map(|s| s.trim_end_matches('/').to_string())
        .unwrap_or_else(|| "http://localhost:5001".to_string());
    let count: u64 = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(10);
    let delay_ms: u64 = args.get(3).and_then(|s| s.parse().ok()).unwrap_or(100);

    info!(
        url = %base_url,
        count = count,
        delay_ms = delay_ms,
        "Configuration loaded"
    );

    let client = reqwest::Client::new();
    match client.get(format!("{}/health", base_url)).send().await {
        Ok(response) => {
            let health: serde_json::Value = response.json().await?;
            info!(health = %health, "Service reachable");
        }
        Err(e) => {
            warn!(error = %e, "Service unreachable. Running in dry-run mode.");
            return run_dry_mode(count, delay_ms).await;
        }
    }

    let mut generator = SceneGenerator::new();
    let mut succeeded = 0u64;
    let mut failed = 0u64;
    let mut total_masks = 0usize;

    for i in 0..count {
        let (request, size) = generator.generate()?;
        let start = Instant::now();
        let response: InvocationResponse = client
            .post(format!("{}/invocations", base_url))
            .json(&request)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let latency = start.elapsed();

        if !response.success {
            failed += 1;
            error!(
                request = i + 1,
                error = ?response.error,
                "Service reported failure"
            );
        } else if let Err(e) = check_response(&response, size) {
            failed += 1;
            error!(request = i + 1, error = %e, "Invalid masks");
        } else {
            succeeded += 1;
            total_masks += response.num_masks;
            info!(
                request = i + 1,
                boxes = request.boxes.len(),
                masks = response.num_masks,
                latency_ms = latency.as_millis() as u64,
                "Invocation ok"
            );
        }

        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
    }

    info!(
        "Completed! {} requests ({} ok, {} failed), {} masks",
        count, succeeded, failed, total_masks
    );

    if failed > 0 {
        bail!("{} requests failed", failed);
    }
    Ok(())
}

async fn run_dry_mode(count: u64, delay_ms: u64) -> anyhow::Result<()> {
    info!("Running in dry-run mode (no service connection)");

    let mut generator = SceneGenerator::new();

    for i in 0..count {
        let (request, (width, height)) = generator.generate()?;

        if (i + 1) % 10 == 0 || i == 0 {
            let preview = serde_json::json!({
                "image": format!("<{} base64 chars>", request.image.len()),
                "size": [width, height],
                "boxes": request.boxes,
                "threshold": request.threshold,
                "mask_threshold": request.mask_threshold,
            });
            info!("Sample request {}:\n{}", i + 1, serde_json::to_string_pretty(&preview)?);
        }

        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
    }

    Ok(())
}
