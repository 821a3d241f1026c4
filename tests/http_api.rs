//! HTTP surface tests driving the router in-process

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use base64::{engine::general_purpose, Engine as _};
use chrono::Utc;
use image::{ImageFormat, Rgb, RgbImage};
use ndarray::{Array1, Array3};
use sam_inference_service::config::ServerConfig;
use sam_inference_service::metrics::ServiceMetrics;
use sam_inference_service::models::processor::{ModelInputs, ProcessorConfig, RawSegmentation};
use sam_inference_service::models::{Device, LoadedModel, ModelSlot, SamProcessor, SegmentationModel};
use sam_inference_service::registry::ModelVersion;
use sam_inference_service::server::{build_router, AppState};
use sam_inference_service::InferenceAdapter;
use serde_json::{json, Value};
use std::io::Cursor;
use std::sync::Arc;
use tower::ServiceExt;

/// Two candidates with a filled centre square
struct SquareModel;

impl SegmentationModel for SquareModel {
    fn device(&self) -> Device {
        Device::Cpu
    }

    fn segment(&self, _inputs: &ModelInputs) -> anyhow::Result<RawSegmentation> {
        let mask_logits = Array3::from_shape_fn((2, 8, 8), |(_, y, x)| {
            if (2..6).contains(&x) && (2..6).contains(&y) {
                5.0
            } else {
                -5.0
            }
        });
        Ok(RawSegmentation {
            mask_logits,
            scores: Array1::from(vec![3.0, -3.0]),
        })
    }
}

/// Aborts inside the forward pass
struct AbortingModel;

impl SegmentationModel for AbortingModel {
    fn device(&self) -> Device {
        Device::Cpu
    }

    fn segment(&self, _inputs: &ModelInputs) -> anyhow::Result<RawSegmentation> {
        panic!("native runtime aborted");
    }
}

fn loaded_model() -> Arc<LoadedModel> {
    loaded_with(Arc::new(SquareModel))
}

fn loaded_with(model: Arc<dyn SegmentationModel>) -> Arc<LoadedModel> {
    let processor = SamProcessor::new(ProcessorConfig {
        target_size: 64,
        ..Default::default()
    });
    Arc::new(LoadedModel {
        adapter: InferenceAdapter::new(model, processor),
        version: ModelVersion {
            name: "sam3-inference".to_string(),
            version: "7".to_string(),
            run_id: Some("run-7".to_string()),
            source: None,
            status: Some("READY".to_string()),
        },
        device: Device::Cpu,
        loaded_at: Utc::now(),
    })
}

fn app(slot: Arc<ModelSlot>) -> (Router, Arc<ServiceMetrics>) {
    let metrics = Arc::new(ServiceMetrics::new());
    let state = AppState::new(
        slot,
        metrics.clone(),
        &ServerConfig::default(),
        "sam3-inference",
    );
    (build_router(state), metrics)
}

fn png_base64(width: u32, height: u32) -> String {
    let image = RgbImage::from_pixel(width, height, Rgb([120, 80, 40]));
    let mut buffer = Cursor::new(Vec::new());
    image.write_to(&mut buffer, ImageFormat::Png).unwrap();
    general_purpose::STANDARD.encode(buffer.into_inner())
}

async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn invoke(payload: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/invocations")
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(&payload).unwrap()))
        .unwrap()
}

#[tokio::test]
async fn test_invocations_before_load_is_503() {
    let (app, metrics) = app(Arc::new(ModelSlot::new()));

    let (status, body) = send(
        app,
        invoke(json!({"image": png_base64(4, 4), "boxes": []})),
    )
    .await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["detail"], "Model not loaded");
    assert_eq!(metrics.snapshot().requests_rejected, 1);
}

#[tokio::test]
async fn test_health_flips_only_after_publish() {
    let slot = Arc::new(ModelSlot::new());
    let (app, _) = app(slot.clone());

    let (status, body) = send(app.clone(), get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "unhealthy");
    assert!(body["model_version"].is_null());

    let (status, _) = send(app.clone(), get("/ping")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    assert!(slot.publish(loaded_model()).is_ok());

    let (_, body) = send(app.clone(), get("/health")).await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["model_version"], "7");

    let (status, _) = send(app, get("/ping")).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_root_reports_service_and_version() {
    let slot = Arc::new(ModelSlot::new());
    let (app, _) = app(slot.clone());

    let (_, before) = send(app.clone(), get("/")).await;
    assert_eq!(before["service"], "SAM3 Inference API");
    assert_eq!(before["model"], "sam3-inference");
    assert!(before["version"].is_null());
    assert_eq!(before["status"], "running");

    assert!(slot.publish(loaded_model()).is_ok());
    let (_, after) = send(app, get("/")).await;
    assert_eq!(after["version"], "7");
}

#[tokio::test]
async fn test_invocation_returns_aligned_masks() {
    let slot = Arc::new(ModelSlot::new());
    assert!(slot.publish(loaded_model()).is_ok());
    let (app, metrics) = app(slot);

    let (status, body) = send(
        app,
        invoke(json!({
            "image": png_base64(48, 32),
            "boxes": [[4, 4, 40, 28]],
            "threshold": 0.5
        })),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert!(body.get("error").is_none());
    // sigmoid(3) passes, sigmoid(-3) does not
    assert_eq!(body["num_masks"], 1);
    assert_eq!(body["scores"].as_array().unwrap().len(), 1);

    let encoded = body["masks"][0].as_str().unwrap();
    let mask = image::load_from_memory(&general_purpose::STANDARD.decode(encoded).unwrap())
        .unwrap()
        .to_luma8();
    assert_eq!(mask.dimensions(), (48, 32));
    assert!(mask.pixels().all(|p| p[0] == 0 || p[0] == 255));
    assert!(mask.pixels().any(|p| p[0] == 255));

    let stats = metrics.snapshot();
    assert_eq!(stats.requests_succeeded, 1);
    assert_eq!(stats.masks_returned, 1);
}

#[tokio::test]
async fn test_dataframe_records_payload() {
    let slot = Arc::new(ModelSlot::new());
    assert!(slot.publish(loaded_model()).is_ok());
    let (app, _) = app(slot);

    let (status, body) = send(
        app,
        invoke(json!({"dataframe_records": [
            {"image": png_base64(16, 16), "boxes": [[0, 0, 8, 8]], "threshold": 0.0}
        ]})),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["num_masks"], 2);
}

#[tokio::test]
async fn test_bad_request_is_failure_body_not_http_error() {
    let slot = Arc::new(ModelSlot::new());
    assert!(slot.publish(loaded_model()).is_ok());
    let (app, metrics) = app(slot);

    let (status, body) = send(
        app.clone(),
        invoke(json!({"image": "%%%", "boxes": [[0, 0, 1, 1]]})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], false);
    assert!(!body["error"].as_str().unwrap().is_empty());
    assert_eq!(body["num_masks"], 0);
    assert_eq!(body["masks"], json!([]));
    assert_eq!(body["scores"], json!([]));

    // Served normally afterwards
    let (_, body) = send(app.clone(), invoke(json!({"image": png_base64(8, 8), "boxes": []}))).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["num_masks"], 0);

    let (_, stats) = send(app, get("/stats")).await;
    assert_eq!(stats["requests_total"], 2);
    assert_eq!(stats["requests_failed"], 1);
    assert_eq!(metrics.snapshot().requests_succeeded, 1);
}

#[tokio::test]
async fn test_crashed_inference_task_is_500() {
    let slot = Arc::new(ModelSlot::new());
    assert!(slot.publish(loaded_with(Arc::new(AbortingModel))).is_ok());
    let (app, _) = app(slot);

    let (status, body) = send(
        app.clone(),
        invoke(json!({"image": png_base64(8, 8), "boxes": [[0, 0, 4, 4]]})),
    )
    .await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(!body["detail"].as_str().unwrap().is_empty());

    // The service keeps answering
    let (status, body) = send(app, invoke(json!({"image": png_base64(8, 8), "boxes": []}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
}
