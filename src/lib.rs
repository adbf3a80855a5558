//! # diabretina
//!
//! Lesion segmentation and quantification for color fundus photographs.
//!
//! An uploaded photograph is normalized, segmented into five classes
//! (background, hard exudates, hemorrhages, microaneurysms, soft exudates),
//! and turned into a color-coded overlay plus per-class lesion counts. The
//! counts feed an optional narrative-generation step that produces a
//! free-text diagnostic opinion.
//!
//! ## Features
//!
//! - **Pure-Rust inference**: the attention U-Net runs on candle, loading
//!   safetensors or PyTorch checkpoints
//! - **Deterministic preprocessing**: center crop, resize, CLAHE
//! - **Lesion counting**: morphological opening and connected components
//!   with a minimum-area filter
//! - **HTTP API**: multipart upload, bounded concurrency, result caching
//!
//! ## Architecture
//!
//! - [`preprocess`] - Decoding and normalization
//! - [`model`] - Network graph and checkpoint binding
//! - [`inference`] - Forward pass to per-pixel probabilities
//! - [`quantify`] - Class mask, overlay and lesion counts
//! - [`analysis`] - End-to-end pipeline, encoding, cache and persistence
//! - [`narrative`] - Diagnostic narrative client
//! - [`server`] - Axum-based HTTP server and routes
//! - [`config`] - CLI and configuration types
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! use diabretina::{select_device, AnalysisService, InferenceEngine, NetworkConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let device = select_device(false)?;
//! let engine = InferenceEngine::load(
//!     Path::new("weights/best.safetensors"),
//!     NetworkConfig::default(),
//!     device,
//! )?;
//!
//! let service = AnalysisService::new(Arc::new(engine));
//! let output = service.analyze_bytes(&std::fs::read("fundus.jpg")?)?;
//! println!("hard exudates: {}", output.counts.ex);
//! # Ok(())
//! # }
//! ```

pub mod analysis;
pub mod config;
pub mod error;
pub mod inference;
pub mod model;
pub mod narrative;
pub mod preprocess;
pub mod quantify;
pub mod server;

// Re-export commonly used types
pub use analysis::{
    AnalysisOutput, AnalysisService, ArtifactStore, FsArtifactStore, JpegImageEncoder,
    ResultCache, UploadDigest,
};
pub use config::{AnalyzeConfig, CheckConfig, Cli, Command, ServeConfig};
pub use error::{AnalysisError, ModelError, NarrativeError};
pub use inference::{select_device, InferenceEngine, ProbabilityMap, Segmenter};
pub use model::{Checkpoint, LesionNet, NetworkConfig, NUM_CLASSES};
pub use narrative::{ChatCompletionClient, DiagnosisRequest, NarrativeConfig, NarrativeGenerator};
pub use preprocess::{DisplayImage, ModelTensor, Normalizer};
pub use quantify::{
    CountingParams, DrGrade, LesionConnectivity, LesionCounts, LesionType, Quantification,
    Quantifier,
};
pub use server::{create_router, AppState, RouterConfig};
