//! HTTP server layer.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         HTTP Layer                              │
//! │        POST /predict   POST /diagnosis   GET /lesions           │
//! │                                                                 │
//! │  ┌──────────────────────────┐  ┌─────────────────────────────┐  │
//! │  │        handlers          │  │           routes            │  │
//! │  │ (multipart, backpressure)│  │ (CORS, body limit, tracing) │  │
//! │  └──────────────────────────┘  └─────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//!                AnalysisService (blocking worker pool)
//! ```

pub mod handlers;
pub mod routes;

pub use handlers::{
    diagnosis_handler, health_handler, lesions_handler, predict_handler, ApiError, AppState,
    DiagnosisResponse, ErrorResponse, GradeEntry, HealthResponse, LesionEntry,
    LookupTablesResponse, PredictResponse, DEFAULT_MAX_CONCURRENT, UPLOAD_FIELD,
};
pub use routes::{create_router, RouterConfig, DEFAULT_MAX_UPLOAD_BYTES};
