//! HTTP request handlers for the lesion analysis API.
//!
//! # Endpoints
//!
//! - `POST /predict` - Analyze an uploaded fundus photograph
//! - `POST /diagnosis` - Generate a narrative diagnostic opinion
//! - `GET /lesions` - Fixed lookup tables
//! - `GET /health` - Health and load report

use std::sync::Arc;

use axum::{
    extract::{multipart::MultipartError, rejection::JsonRejection, Multipart, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use base64::Engine;
use bytes::Bytes;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::analysis::{AnalysisOutput, AnalysisService, ArtifactStore, ResultCache, UploadDigest};
use crate::error::AnalysisError;
use crate::inference::Segmenter;
use crate::narrative::{generate_or_placeholder, DiagnosisRequest, NarrativeGenerator};
use crate::quantify::{DrGrade, LesionCounts, LesionType};

/// Name of the multipart field carrying the image.
pub const UPLOAD_FIELD: &str = "file";

/// Default number of analyses allowed to run at once.
pub const DEFAULT_MAX_CONCURRENT: usize = 4;

// =============================================================================
// Application State
// =============================================================================

/// Shared application state.
///
/// This is passed to all handlers via Axum's State extractor.
pub struct AppState<S: Segmenter> {
    /// The analysis pipeline
    pub analysis: Arc<AnalysisService<S>>,

    /// Cache of encoded results keyed by upload digest
    pub cache: Option<Arc<ResultCache>>,

    /// Where completed results are persisted, if anywhere
    pub store: Option<Arc<dyn ArtifactStore>>,

    /// Narrative-generation collaborator, if configured
    pub narrative: Option<Arc<dyn NarrativeGenerator>>,

    /// Bounds concurrent analyses
    pub permits: Arc<Semaphore>,

    /// Total number of permits
    pub max_concurrent: usize,
}

impl<S: Segmenter> AppState<S> {
    /// Create state with no cache, store or narrative generator.
    pub fn new(analysis: AnalysisService<S>) -> Self {
        Self {
            analysis: Arc::new(analysis),
            cache: None,
            store: None,
            narrative: None,
            permits: Arc::new(Semaphore::new(DEFAULT_MAX_CONCURRENT)),
            max_concurrent: DEFAULT_MAX_CONCURRENT,
        }
    }

    pub fn with_cache(mut self, cache: ResultCache) -> Self {
        self.cache = Some(Arc::new(cache));
        self
    }

    pub fn with_store(mut self, store: Arc<dyn ArtifactStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_narrative(mut self, narrative: Arc<dyn NarrativeGenerator>) -> Self {
        self.narrative = Some(narrative);
        self
    }

    /// Set the number of analyses allowed to run at once (at least one).
    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        self.permits = Arc::new(Semaphore::new(max_concurrent));
        self.max_concurrent = max_concurrent;
        self
    }
}

impl<S: Segmenter> Clone for AppState<S> {
    fn clone(&self) -> Self {
        Self {
            analysis: Arc::clone(&self.analysis),
            cache: self.cache.clone(),
            store: self.store.clone(),
            narrative: self.narrative.clone(),
            permits: Arc::clone(&self.permits),
            max_concurrent: self.max_concurrent,
        }
    }
}

// =============================================================================
// Response Types
// =============================================================================

/// JSON error response returned for all error conditions.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error type identifier (e.g., "invalid_image", "busy")
    pub error: String,

    /// Human-readable error message
    pub message: String,

    /// HTTP status code (included for convenience)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
            status: None,
        }
    }

    pub fn with_status(
        error: impl Into<String>,
        message: impl Into<String>,
        status: StatusCode,
    ) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
            status: Some(status.as_u16()),
        }
    }
}

/// Result of `POST /predict`.
#[derive(Debug, Serialize)]
pub struct PredictResponse {
    /// Request identifier, also the artifact file stem
    pub uuid: String,

    /// Base64 JPEG of the equalized display image
    pub preprocessed_image: String,

    /// Base64 JPEG of the lesion overlay
    pub predicted_image: String,

    pub lesion_counts: LesionCounts,
}

impl PredictResponse {
    pub fn new(request_id: Uuid, output: &AnalysisOutput) -> Self {
        let b64 = base64::engine::general_purpose::STANDARD;
        Self {
            uuid: request_id.to_string(),
            preprocessed_image: b64.encode(&output.preprocessed_jpeg),
            predicted_image: b64.encode(&output.overlay_jpeg),
            lesion_counts: output.counts,
        }
    }
}

/// Result of `POST /diagnosis`.
#[derive(Debug, Serialize)]
pub struct DiagnosisResponse {
    pub ai_response: String,

    /// `false` when `ai_response` is the placeholder text
    pub generated: bool,
}

/// One lesion class in the lookup tables.
#[derive(Debug, Serialize)]
pub struct LesionEntry {
    pub code: &'static str,
    pub label: &'static str,
    pub class_index: u8,
    pub color: [u8; 3],
}

/// One DR grade in the lookup tables.
#[derive(Debug, Serialize)]
pub struct GradeEntry {
    pub code: String,
    pub description: &'static str,
}

/// Result of `GET /lesions`.
#[derive(Debug, Serialize)]
pub struct LookupTablesResponse {
    pub lesions: Vec<LesionEntry>,
    pub grades: Vec<GradeEntry>,
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Service status
    pub status: String,

    /// Service version
    pub version: String,

    /// SHA-256 of the loaded checkpoint
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_digest: Option<String>,

    /// Compute device of the network
    pub device: String,

    /// Forward passes currently running
    pub active_inferences: usize,

    /// Analyses that may still start without being rejected
    pub available_permits: usize,

    pub max_concurrent: usize,
}

// =============================================================================
// Error Mapping
// =============================================================================

/// Errors surfaced by the handlers.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Analysis(#[from] AnalysisError),

    /// Every analysis permit is taken
    #[error("Server is busy: {max_concurrent} analyses already running")]
    Busy { max_concurrent: usize },

    /// Malformed request outside the pipeline (missing upload, bad JSON)
    #[error("{0}")]
    BadRequest(String),

    /// A worker task panicked or was cancelled
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<MultipartError> for ApiError {
    fn from(err: MultipartError) -> Self {
        ApiError::BadRequest(format!("Malformed upload: {}", err.body_text()))
    }
}

/// Convert ApiError to HTTP response.
///
/// Server errors are logged at ERROR, rejected uploads at WARN and
/// backpressure at DEBUG.
impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type) = match &self {
            ApiError::Analysis(AnalysisError::InvalidImage { .. }) => {
                (StatusCode::BAD_REQUEST, "invalid_image")
            }
            ApiError::Analysis(AnalysisError::InferenceFailure { .. }) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "inference_failure")
            }
            ApiError::Analysis(AnalysisError::EncodeFailure { .. }) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "encode_failure")
            }
            ApiError::Analysis(AnalysisError::IoFailure { .. }) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "io_failure")
            }
            ApiError::Analysis(AnalysisError::ModelLoadFailure(_)) => {
                (StatusCode::SERVICE_UNAVAILABLE, "model_unavailable")
            }
            ApiError::Busy { .. } => (StatusCode::SERVICE_UNAVAILABLE, "busy"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };
        let message = self.to_string();

        if status.is_server_error() && !matches!(self, ApiError::Busy { .. }) {
            error!(
                error_type = error_type,
                status = status.as_u16(),
                "Server error: {}",
                message
            );
        } else if matches!(self, ApiError::Busy { .. }) {
            debug!(status = status.as_u16(), "Rejected: {}", message);
        } else {
            warn!(
                error_type = error_type,
                status = status.as_u16(),
                "Client error: {}",
                message
            );
        }

        let error_response = ErrorResponse::with_status(error_type, message, status);
        (status, Json(error_response)).into_response()
    }
}

// =============================================================================
// Handlers
// =============================================================================

/// Analyze an uploaded image.
///
/// # Endpoint
///
/// `POST /predict` with a multipart body whose `file` field holds the image.
///
/// Results are served from the cache when the same bytes were analyzed
/// before; the request identifier is always fresh. Artifacts are committed
/// only after the whole pipeline succeeded.
pub async fn predict_handler<S: Segmenter>(
    State(state): State<AppState<S>>,
    mut multipart: Multipart,
) -> Result<Json<PredictResponse>, ApiError> {
    let upload = read_upload(&mut multipart).await?;
    let request_id = Uuid::new_v4();
    let digest = UploadDigest::of(&upload);

    let cached = match &state.cache {
        Some(cache) => cache.get(&digest).await,
        None => None,
    };

    let output = match cached {
        Some(output) => {
            debug!(request_id = %request_id, digest = %digest, "Result cache hit");
            output
        }
        None => {
            let permit = Arc::clone(&state.permits)
                .try_acquire_owned()
                .map_err(|_| ApiError::Busy {
                    max_concurrent: state.max_concurrent,
                })?;

            let service = Arc::clone(&state.analysis);
            let output = tokio::task::spawn_blocking(move || {
                let _permit = permit;
                service.analyze_bytes(&upload)
            })
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))??;

            if let Some(cache) = &state.cache {
                cache.put(digest, output.clone()).await;
            }
            output
        }
    };

    if let Some(store) = &state.store {
        store.commit(request_id, &output.artifacts()).await?;
    }

    info!(
        request_id = %request_id,
        ex = output.counts.ex,
        he = output.counts.he,
        ma = output.counts.ma,
        se = output.counts.se,
        "Prediction complete"
    );

    Ok(Json(PredictResponse::new(request_id, &output)))
}

/// Pull the image bytes out of the multipart body.
async fn read_upload(multipart: &mut Multipart) -> Result<Bytes, ApiError> {
    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some(UPLOAD_FIELD) {
            continue;
        }
        if field.file_name() == Some("") {
            return Err(ApiError::BadRequest("No selected file".to_string()));
        }
        let data = field.bytes().await?;
        if data.is_empty() {
            return Err(ApiError::BadRequest("Uploaded file is empty".to_string()));
        }
        return Ok(data);
    }
    Err(ApiError::BadRequest("No file uploaded".to_string()))
}

/// Generate a narrative diagnostic opinion.
///
/// # Endpoint
///
/// `POST /diagnosis` with a JSON body of patient fields, lesion counts and
/// grade codes. Missing fields are rejected with 400; generation failures
/// degrade to a placeholder text with 200.
pub async fn diagnosis_handler<S: Segmenter>(
    State(state): State<AppState<S>>,
    payload: Result<Json<DiagnosisRequest>, JsonRejection>,
) -> Result<Json<DiagnosisResponse>, ApiError> {
    let Json(request) = payload.map_err(|rejection| ApiError::BadRequest(rejection.body_text()))?;

    let narrative = generate_or_placeholder(state.narrative.as_deref(), &request).await;
    Ok(Json(DiagnosisResponse {
        ai_response: narrative.text,
        generated: narrative.generated,
    }))
}

/// Fixed lookup tables for report and narrative collaborators.
///
/// # Endpoint
///
/// `GET /lesions`
pub async fn lesions_handler() -> Json<LookupTablesResponse> {
    Json(LookupTablesResponse {
        lesions: LesionType::ALL
            .iter()
            .map(|&lesion| LesionEntry {
                code: lesion.code(),
                label: lesion.label(),
                class_index: lesion.class_index(),
                color: lesion.color(),
            })
            .collect(),
        grades: DrGrade::ALL
            .iter()
            .map(|&grade| GradeEntry {
                code: grade.code().to_string(),
                description: grade.description(),
            })
            .collect(),
    })
}

/// Health check with load report.
///
/// # Endpoint
///
/// `GET /health`
pub async fn health_handler<S: Segmenter>(State(state): State<AppState<S>>) -> Json<HealthResponse> {
    let segmenter = state.analysis.segmenter();
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        model_digest: segmenter.model_digest().map(str::to_string),
        device: segmenter.device_label(),
        active_inferences: segmenter.active_inferences(),
        available_permits: state.permits.available_permits(),
        max_concurrent: state.max_concurrent,
    })
}

// =============================================================================
// Tests
// =============================================================================
