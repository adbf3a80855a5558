use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while binding a checkpoint to the segmentation network.
///
/// Every variant is fatal to process startup: a server that cannot build its
/// network never accepts a request.
#[derive(Debug, Error)]
pub enum ModelError {
    /// Checkpoint file could not be read
    #[error("Failed to read checkpoint {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Checkpoint container could not be parsed
    #[error("Failed to parse checkpoint {path}: {message}")]
    Parse { path: PathBuf, message: String },

    /// A parameter slot of the network has no tensor, or the tensor has the wrong shape
    #[error("Failed to bind parameters: {0}")]
    Binding(String),

    /// Network configuration cannot produce a valid graph
    #[error("Invalid network configuration: {0}")]
    InvalidConfig(String),
}

impl From<candle_core::Error> for ModelError {
    fn from(err: candle_core::Error) -> Self {
        ModelError::Binding(err.to_string())
    }
}

/// Errors produced by the analysis pipeline.
///
/// `InvalidImage` and `InferenceFailure` are per-request and reported to the
/// caller; `ModelLoadFailure` only occurs at startup.
#[derive(Debug, Error)]
pub enum AnalysisError {
    /// Bytes could not be decoded, or the decoded image is not usable RGB
    #[error("Invalid image: {reason}")]
    InvalidImage { reason: String },

    /// Network weights could not be loaded
    #[error("Model load failure: {0}")]
    ModelLoadFailure(#[from] ModelError),

    /// Shape or numeric fault during a forward pass
    #[error("Inference failure: {message}")]
    InferenceFailure { message: String },

    /// Result image could not be encoded
    #[error("Encode failure: {source}")]
    EncodeFailure {
        #[source]
        source: image::ImageError,
    },

    /// Artifact could not be persisted
    #[error("I/O failure at {path}: {source}")]
    IoFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl AnalysisError {
    /// Shorthand for an `InvalidImage` error.
    pub fn invalid_image(reason: impl Into<String>) -> Self {
        AnalysisError::InvalidImage {
            reason: reason.into(),
        }
    }

    /// Shorthand for an `InferenceFailure` error.
    pub fn inference(message: impl Into<String>) -> Self {
        AnalysisError::InferenceFailure {
            message: message.into(),
        }
    }
}

/// Errors from the narrative-generation collaborator.
///
/// These never abort a request: callers substitute a placeholder text.
#[derive(Debug, Error)]
pub enum NarrativeError {
    /// No narrative endpoint is configured
    #[error("Narrative generation is not configured")]
    Disabled,

    /// Request could not be sent or timed out
    #[error("Narrative request failed: {0}")]
    Transport(String),

    /// Endpoint answered with a non-success status
    #[error("Narrative endpoint returned HTTP {status}")]
    Status { status: u16 },

    /// Response body did not contain a completion
    #[error("Malformed narrative response: {0}")]
    MalformedResponse(String),
}
