//! Router configuration.
//!
//! # Route Structure
//!
//! ```text
//! /health      GET   - Health and load report
//! /lesions     GET   - Lookup tables
//! /predict     POST  - Multipart upload, runs the analysis pipeline
//! /diagnosis   POST  - Narrative generation
//! ```
//!
//! # Example
//!
//! ```ignore
//! use diabretina::server::{create_router, AppState, RouterConfig};
//!
//! let state = AppState::new(service).with_max_concurrent(2);
//! let config = RouterConfig::new()
//!     .with_cors_origins(vec!["https://clinic.example".to_string()]);
//!
//! let router = create_router(state, config);
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:8005").await?;
//! axum::serve(listener, router).await?;
//! ```

use std::time::Duration;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use http::header::{AUTHORIZATION, CONTENT_TYPE};
use http::{HeaderValue, Method};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

use super::handlers::{diagnosis_handler, health_handler, lesions_handler, predict_handler, AppState};
use crate::inference::Segmenter;

/// Default maximum upload size: 32MB
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 32 * 1024 * 1024;

// =============================================================================
// Router Configuration
// =============================================================================

/// Layers applied around the analysis routes.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Browser origins allowed to call the API; `None` admits every origin
    pub cors_origins: Option<Vec<String>>,

    /// Wrap the router in a `TraceLayer`
    pub enable_tracing: bool,

    /// Maximum accepted request body in bytes
    pub max_upload_bytes: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl RouterConfig {
    /// Create a configuration that allows any origin, traces requests and
    /// accepts uploads up to 32MB.
    pub fn new() -> Self {
        Self {
            cors_origins: None,
            enable_tracing: true,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
        }
    }

    /// Restrict cross-origin access to `origins`. An empty list blocks every
    /// cross-origin caller.
    pub fn with_cors_origins(mut self, origins: Vec<String>) -> Self {
        self.cors_origins = Some(origins);
        self
    }

    /// Admit requests from every origin.
    pub fn with_cors_any_origin(mut self) -> Self {
        self.cors_origins = None;
        self
    }

    pub fn with_tracing(mut self, enabled: bool) -> Self {
        self.enable_tracing = enabled;
        self
    }

    pub fn with_max_upload_bytes(mut self, bytes: usize) -> Self {
        self.max_upload_bytes = bytes;
        self
    }
}

// =============================================================================
// Router Builder
// =============================================================================

/// Create the application router.
pub fn create_router<S>(state: AppState<S>, config: RouterConfig) -> Router
where
    S: Segmenter,
{
    let cors = cors_layer(&config);

    let app = Router::new()
        .route("/health", get(health_handler::<S>))
        .route("/lesions", get(lesions_handler))
        .route("/predict", post(predict_handler::<S>))
        .route("/diagnosis", post(diagnosis_handler::<S>))
        .with_state(state)
        .layer(DefaultBodyLimit::max(config.max_upload_bytes))
        .layer(cors);

    if !config.enable_tracing {
        return app;
    }
    app.layer(TraceLayer::new_for_http())
}

/// CORS for the upload form: GET and POST with JSON or multipart bodies.
fn cors_layer(config: &RouterConfig) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([AUTHORIZATION, CONTENT_TYPE])
        .max_age(Duration::from_secs(86400));

    match &config.cors_origins {
        None => cors.allow_origin(Any),
        Some(origins) if origins.is_empty() => cors,
        Some(origins) => {
            let allowed: Vec<HeaderValue> = origins
                .iter()
                .filter_map(|origin| match origin.parse() {
                    Ok(value) => Some(value),
                    Err(_) => {
                        warn!(origin = %origin, "Ignoring malformed CORS origin");
                        None
                    }
                })
                .collect();
            cors.allow_origin(allowed)
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
