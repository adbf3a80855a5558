//! End-to-end tests with the real segmentation network.
//!
//! The network is built with freshly initialized weights at a small input
//! size, saved as safetensors and loaded back through the checkpoint path
//! the server uses.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};
use http_body_util::BodyExt;
use tower::ServiceExt;
use uuid::Uuid;

use diabretina::analysis::{PREDICTED_DIR, PREPROCESSED_DIR};
use diabretina::{
    create_router, AnalysisService, AppState, ArtifactStore, FsArtifactStore, InferenceEngine,
    LesionNet, NetworkConfig, RouterConfig, Segmenter,
};

use super::test_utils::{
    fundus_jpeg, fundus_png, is_valid_jpeg, multipart_body, multipart_content_type,
};

const SIZE: usize = 64;

fn scratch_dir(label: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("diabretina-{}-{}", label, Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

/// Save a freshly initialized network and return the checkpoint path.
fn write_checkpoint(dir: &Path) -> PathBuf {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    LesionNet::new(NetworkConfig::with_image_size(SIZE), vb).unwrap();

    let path = dir.join("weights.safetensors");
    varmap.save(&path).unwrap();
    path
}

fn load_engine(dir: &Path) -> InferenceEngine {
    let path = write_checkpoint(dir);
    InferenceEngine::load(&path, NetworkConfig::with_image_size(SIZE), Device::Cpu).unwrap()
}

#[test]
fn test_checkpoint_loads_with_digest() {
    let dir = scratch_dir("digest");
    let engine = load_engine(&dir);

    let digest = engine.model_digest().unwrap();
    assert_eq!(digest.len(), 64);
    assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
    assert_eq!(engine.input_size(), SIZE);

    std::fs::remove_dir_all(dir).ok();
}

#[test]
fn test_real_network_pipeline() {
    let dir = scratch_dir("pipeline");
    let service = AnalysisService::new(Arc::new(load_engine(&dir)));

    let output = service.analyze_bytes(&fundus_png(100, 80)).unwrap();
    assert!(is_valid_jpeg(&output.preprocessed_jpeg));
    assert!(is_valid_jpeg(&output.overlay_jpeg));

    let decoded = image::load_from_memory(&output.overlay_jpeg).unwrap();
    assert_eq!((decoded.width(), decoded.height()), (SIZE as u32, SIZE as u32));

    // Untrained weights give arbitrary masks, but every counted lesion
    // covers at least the minimum area.
    assert!(output.counts.total() as usize <= SIZE * SIZE / 10);

    std::fs::remove_dir_all(dir).ok();
}

#[test]
fn test_real_network_is_deterministic() {
    let dir = scratch_dir("determinism");
    let service = AnalysisService::new(Arc::new(load_engine(&dir)));
    let upload = fundus_jpeg(90, 120);

    let first = service.analyze_bytes(&upload).unwrap();
    let second = service.analyze_bytes(&upload).unwrap();
    assert_eq!(first, second);

    std::fs::remove_dir_all(dir).ok();
}

#[tokio::test]
async fn test_filesystem_store_commit() {
    let dir = scratch_dir("store");
    let service = AnalysisService::new(Arc::new(load_engine(&dir)));
    let output = service.analyze_bytes(&fundus_png(64, 64)).unwrap();

    let store = FsArtifactStore::new(dir.join("out"));
    store.ensure_dirs().await.unwrap();

    let request_id = Uuid::new_v4();
    store.commit(request_id, &output.artifacts()).await.unwrap();

    let preprocessed = std::fs::read(store.preprocessed_path(request_id)).unwrap();
    let predicted = std::fs::read(store.predicted_path(request_id)).unwrap();
    assert_eq!(preprocessed, output.preprocessed_jpeg.as_ref());
    assert_eq!(predicted, output.overlay_jpeg.as_ref());

    std::fs::remove_dir_all(dir).ok();
}

#[tokio::test]
async fn test_http_predict_with_real_network() {
    let dir = scratch_dir("http");
    let store = FsArtifactStore::new(dir.join("out"));
    store.ensure_dirs().await.unwrap();

    let service = AnalysisService::new(Arc::new(load_engine(&dir)));
    let state = AppState::new(service).with_store(Arc::new(store));
    let app = create_router(state, RouterConfig::new().with_tracing(false));

    let request = Request::builder()
        .method("POST")
        .uri("/predict")
        .header(header::CONTENT_TYPE, multipart_content_type())
        .body(Body::from(multipart_body("file", "eye.png", &fundus_png(72, 72))))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    let request_id = json["uuid"].as_str().unwrap();

    let out = dir.join("out");
    assert!(out.join(PREPROCESSED_DIR).join(format!("{}.jpg", request_id)).exists());
    assert!(out.join(PREDICTED_DIR).join(format!("{}.jpg", request_id)).exists());

    std::fs::remove_dir_all(dir).ok();
}
