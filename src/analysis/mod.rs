//! Request-level analysis: pipeline, result encoding, caching and
//! persistence.

mod cache;
mod encoder;
mod service;
mod store;

pub use cache::{ResultCache, UploadDigest, DEFAULT_RESULT_CACHE_CAPACITY};
pub use encoder::{
    clamp_quality, is_valid_quality, JpegImageEncoder, DEFAULT_JPEG_QUALITY, MAX_JPEG_QUALITY,
    MIN_JPEG_QUALITY,
};
pub use service::{Analysis, AnalysisOutput, AnalysisService};
pub use store::{ArtifactStore, Artifacts, FsArtifactStore, PREDICTED_DIR, PREPROCESSED_DIR};
