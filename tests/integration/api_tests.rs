//! API integration tests for the HTTP endpoints.
//!
//! Tests verify:
//! - Upload analysis with a mock segmenter
//! - Error cases (missing upload, undecodable bytes, busy server, failures)
//! - Result caching and artifact persistence
//! - Narrative generation and its placeholder fallback

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use base64::Engine;
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;
use uuid::Uuid;

use diabretina::narrative::PLACEHOLDER_NARRATIVE;
use diabretina::{create_router, AnalysisService, AppState, LesionType, ResultCache, RouterConfig};

use super::test_utils::{
    diagnosis_json, fundus_jpeg, fundus_png, is_valid_jpeg, multipart_body,
    multipart_content_type, MemoryArtifactStore, MockNarrative, MockSegmenter,
};

const SIZE: usize = 64;

fn ex() -> usize {
    LesionType::EX.class_index() as usize
}

fn he() -> usize {
    LesionType::HE.class_index() as usize
}

/// One exudate block large enough to count and one hemorrhage speck that the
/// opening removes.
fn lesion_segmenter() -> MockSegmenter {
    MockSegmenter::new(SIZE)
        .with_region(ex(), 8..20, 8..20)
        .with_region(he(), 40..42, 40..42)
}

fn state(segmenter: MockSegmenter) -> AppState<MockSegmenter> {
    AppState::new(AnalysisService::new(Arc::new(segmenter)))
}

fn router(state: AppState<MockSegmenter>) -> Router {
    create_router(state, RouterConfig::new().with_tracing(false))
}

fn predict_request(field: &str, data: &[u8]) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/predict")
        .header(header::CONTENT_TYPE, multipart_content_type())
        .body(Body::from(multipart_body(field, "fundus.png", data)))
        .unwrap()
}

fn diagnosis_request(body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/diagnosis")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(serde_json::to_vec(body).unwrap()))
        .unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    let body = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&body).unwrap()
}

fn decode_b64(value: &Value) -> Vec<u8> {
    base64::engine::general_purpose::STANDARD
        .decode(value.as_str().unwrap())
        .unwrap()
}

// =============================================================================
// Health and Lookup Tables
// =============================================================================

#[tokio::test]
async fn test_health_reports_model_and_load() {
    let app = router(state(MockSegmenter::new(SIZE)).with_max_concurrent(3));

    let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = json_body(response).await;
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["model_digest"], "mock");
    assert_eq!(json["device"], "cpu");
    assert_eq!(json["active_inferences"], 0);
    assert_eq!(json["available_permits"], 3);
    assert_eq!(json["max_concurrent"], 3);
}

#[tokio::test]
async fn test_lesion_lookup_tables() {
    let app = router(state(MockSegmenter::new(SIZE)));

    let request = Request::builder().uri("/lesions").body(Body::empty()).unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = json_body(response).await;
    let lesions = json["lesions"].as_array().unwrap();
    assert_eq!(lesions.len(), 4);
    assert_eq!(lesions[0]["code"], "EX");
    assert_eq!(lesions[0]["class_index"], 1);
    assert_eq!(lesions[0]["color"], serde_json::json!([255, 0, 96]));

    let grades = json["grades"].as_array().unwrap();
    assert_eq!(grades.len(), 5);
    assert_eq!(grades[0]["code"], "0");
    assert_eq!(grades[0]["description"], "Healthy");
    assert_eq!(grades[4]["description"], "Proliferative DR (PDR)");
}

// =============================================================================
// Prediction
// =============================================================================

#[tokio::test]
async fn test_predict_success() {
    let app = router(state(lesion_segmenter()));

    let response = app
        .oneshot(predict_request("file", &fundus_png(90, 70)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = json_body(response).await;
    assert!(Uuid::parse_str(json["uuid"].as_str().unwrap()).is_ok());
    assert_eq!(json["lesion_counts"]["EX"], 1);
    assert_eq!(json["lesion_counts"]["HE"], 0);
    assert_eq!(json["lesion_counts"]["MA"], 0);
    assert_eq!(json["lesion_counts"]["SE"], 0);

    assert!(is_valid_jpeg(&decode_b64(&json["preprocessed_image"])));
    assert!(is_valid_jpeg(&decode_b64(&json["predicted_image"])));
}

#[tokio::test]
async fn test_predict_accepts_jpeg() {
    let app = router(state(lesion_segmenter()));

    let response = app
        .oneshot(predict_request("file", &fundus_jpeg(120, 96)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = json_body(response).await;
    assert_eq!(json["lesion_counts"]["EX"], 1);
}

#[tokio::test]
async fn test_predict_background_only() {
    let app = router(state(MockSegmenter::new(SIZE)));

    let response = app
        .oneshot(predict_request("file", &fundus_png(64, 64)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = json_body(response).await;
    for code in ["EX", "HE", "MA", "SE"] {
        assert_eq!(json["lesion_counts"][code], 0, "{} should be zero", code);
    }
}

#[tokio::test]
async fn test_predict_missing_file_field() {
    let app = router(state(lesion_segmenter()));

    let response = app
        .oneshot(predict_request("image", &fundus_png(64, 64)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let json = json_body(response).await;
    assert_eq!(json["error"], "invalid_request");
}

#[tokio::test]
async fn test_predict_empty_upload() {
    let app = router(state(lesion_segmenter()));

    let response = app.oneshot(predict_request("file", &[])).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_predict_undecodable_bytes() {
    let state = state(lesion_segmenter());
    let app = router(state.clone());

    let response = app
        .oneshot(predict_request("file", b"definitely not an image"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let json = json_body(response).await;
    assert_eq!(json["error"], "invalid_image");
    assert_eq!(json["status"], 400);
    assert_eq!(state.analysis.segmenter().call_count(), 0);
}

#[tokio::test]
async fn test_predict_busy_when_permits_exhausted() {
    let state = state(lesion_segmenter()).with_max_concurrent(1);
    let _held = Arc::clone(&state.permits).try_acquire_owned().unwrap();
    let app = router(state.clone());

    let response = app
        .oneshot(predict_request("file", &fundus_png(64, 64)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    let json = json_body(response).await;
    assert_eq!(json["error"], "busy");
    assert_eq!(state.analysis.segmenter().call_count(), 0);
}

#[tokio::test]
async fn test_predict_releases_permit() {
    let state = state(lesion_segmenter()).with_max_concurrent(1);

    for _ in 0..2 {
        let response = router(state.clone())
            .oneshot(predict_request("file", &fundus_png(64, 64)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
    assert_eq!(state.permits.available_permits(), 1);
}

#[tokio::test]
async fn test_predict_inference_failure() {
    let app = router(state(MockSegmenter::new(SIZE).failing()));

    let response = app
        .oneshot(predict_request("file", &fundus_png(64, 64)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

    let json = json_body(response).await;
    assert_eq!(json["error"], "inference_failure");
}

#[tokio::test]
async fn test_predict_oversized_upload_rejected() {
    let app = create_router(
        state(lesion_segmenter()),
        RouterConfig::new()
            .with_tracing(false)
            .with_max_upload_bytes(1024),
    );

    let response = app
        .oneshot(predict_request("file", &vec![0u8; 8 * 1024]))
        .await
        .unwrap();
    assert!(response.status().is_client_error());
}

// =============================================================================
// Caching and Persistence
// =============================================================================

#[tokio::test]
async fn test_predict_cache_hit_skips_inference() {
    let state = state(lesion_segmenter()).with_cache(ResultCache::new());
    let upload = fundus_png(80, 80);

    let first = json_body(
        router(state.clone())
            .oneshot(predict_request("file", &upload))
            .await
            .unwrap(),
    )
    .await;
    let second = json_body(
        router(state.clone())
            .oneshot(predict_request("file", &upload))
            .await
            .unwrap(),
    )
    .await;

    assert_eq!(state.analysis.segmenter().call_count(), 1);
    assert_ne!(first["uuid"], second["uuid"]);
    assert_eq!(first["lesion_counts"], second["lesion_counts"]);
    assert_eq!(first["predicted_image"], second["predicted_image"]);
}

#[tokio::test]
async fn test_predict_without_cache_runs_every_time() {
    let state = state(lesion_segmenter());
    let upload = fundus_png(80, 80);

    for _ in 0..2 {
        router(state.clone())
            .oneshot(predict_request("file", &upload))
            .await
            .unwrap();
    }
    assert_eq!(state.analysis.segmenter().call_count(), 2);
}

#[tokio::test]
async fn test_predict_commits_artifacts() {
    let store = Arc::new(MemoryArtifactStore::new());
    let app = router(state(lesion_segmenter()).with_store(store.clone()));

    let response = app
        .oneshot(predict_request("file", &fundus_png(64, 64)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = json_body(response).await;
    let request_id = Uuid::parse_str(json["uuid"].as_str().unwrap()).unwrap();
    let artifacts = store.get(request_id).expect("artifacts committed");

    assert_eq!(
        artifacts.preprocessed_jpeg.as_ref(),
        decode_b64(&json["preprocessed_image"]).as_slice()
    );
    assert_eq!(
        artifacts.overlay_jpeg.as_ref(),
        decode_b64(&json["predicted_image"]).as_slice()
    );
}

#[tokio::test]
async fn test_failed_analysis_commits_nothing() {
    let store = Arc::new(MemoryArtifactStore::new());
    let app = router(state(lesion_segmenter()).with_store(store.clone()));

    let response = app
        .oneshot(predict_request("file", b"\x89PNG broken"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(store.len(), 0);
}

#[tokio::test]
async fn test_store_failure_is_server_error() {
    let app = router(state(lesion_segmenter()).with_store(Arc::new(MemoryArtifactStore::failing())));

    let response = app
        .oneshot(predict_request("file", &fundus_png(64, 64)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

    let json = json_body(response).await;
    assert_eq!(json["error"], "io_failure");
}

// =============================================================================
// Diagnosis
// =============================================================================

#[tokio::test]
async fn test_diagnosis_placeholder_without_generator() {
    let app = router(state(MockSegmenter::new(SIZE)));

    let response = app.oneshot(diagnosis_request(&diagnosis_json())).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = json_body(response).await;
    assert_eq!(json["ai_response"], PLACEHOLDER_NARRATIVE);
    assert_eq!(json["generated"], false);
}

#[tokio::test]
async fn test_diagnosis_with_generator() {
    let narrative = Arc::new(MockNarrative::replying("Findings consistent with severe NPDR."));
    let app = router(state(MockSegmenter::new(SIZE)).with_narrative(narrative.clone()));

    let response = app.oneshot(diagnosis_request(&diagnosis_json())).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = json_body(response).await;
    assert_eq!(json["ai_response"], "Findings consistent with severe NPDR.");
    assert_eq!(json["generated"], true);

    let prompts = narrative.prompts();
    assert_eq!(prompts.len(), 1);
    assert!(prompts[0].contains("Zhang Min"));
    assert!(prompts[0].contains("Severe non-proliferative DR"));
}

#[tokio::test]
async fn test_diagnosis_generator_failure_degrades() {
    let narrative = Arc::new(MockNarrative::failing_with(502));
    let app = router(state(MockSegmenter::new(SIZE)).with_narrative(narrative));

    let response = app.oneshot(diagnosis_request(&diagnosis_json())).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = json_body(response).await;
    assert_eq!(json["ai_response"], PLACEHOLDER_NARRATIVE);
    assert_eq!(json["generated"], false);
}

#[tokio::test]
async fn test_diagnosis_missing_field() {
    let narrative = Arc::new(MockNarrative::replying("unused"));
    let app = router(state(MockSegmenter::new(SIZE)).with_narrative(narrative.clone()));

    let mut body = diagnosis_json();
    body.as_object_mut().unwrap().remove("treatment_plan");

    let response = app.oneshot(diagnosis_request(&body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let json = json_body(response).await;
    assert_eq!(json["error"], "invalid_request");
    assert!(narrative.prompts().is_empty());
}
