//! The analysis pipeline.
//!
//! ```text
//! upload bytes ─► decode ─► Normalizer ─► Segmenter ─► Quantifier ─► JPEG
//! ```
//!
//! Every stage is synchronous and runs to completion on the calling thread.
//! Nothing is persisted here; callers commit the returned output once the
//! whole pipeline has succeeded.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use image::DynamicImage;
use tracing::debug;

use crate::error::AnalysisError;
use crate::inference::{ProbabilityMap, Segmenter};
use crate::preprocess::{decode_upload, Clahe, DisplayImage, Normalizer};
use crate::quantify::{LesionCounts, Quantification, Quantifier};

use super::encoder::JpegImageEncoder;
use super::store::Artifacts;

/// In-memory result of one analysis.
#[derive(Debug, Clone)]
pub struct Analysis {
    pub display: DisplayImage,
    pub probabilities: ProbabilityMap,
    pub quantification: Quantification,
}

/// Encoded result returned to callers and cached.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisOutput {
    pub preprocessed_jpeg: Bytes,
    pub overlay_jpeg: Bytes,
    pub counts: LesionCounts,
}

impl AnalysisOutput {
    /// Combined size of both JPEG streams.
    pub fn encoded_size(&self) -> usize {
        self.preprocessed_jpeg.len() + self.overlay_jpeg.len()
    }

    pub fn artifacts(&self) -> Artifacts {
        Artifacts {
            preprocessed_jpeg: self.preprocessed_jpeg.clone(),
            overlay_jpeg: self.overlay_jpeg.clone(),
        }
    }
}

/// Runs normalization, inference and quantification with one segmenter.
pub struct AnalysisService<S> {
    segmenter: Arc<S>,
    normalizer: Normalizer,
    quantifier: Quantifier,
    encoder: JpegImageEncoder,
}

impl<S: Segmenter> AnalysisService<S> {
    /// Create a service whose normalizer matches the segmenter's input size.
    pub fn new(segmenter: Arc<S>) -> Self {
        let normalizer = Normalizer::new(segmenter.input_size() as u32);
        Self {
            segmenter,
            normalizer,
            quantifier: Quantifier::default(),
            encoder: JpegImageEncoder::default(),
        }
    }

    pub fn with_quantifier(mut self, quantifier: Quantifier) -> Self {
        self.quantifier = quantifier;
        self
    }

    pub fn with_encoder(mut self, encoder: JpegImageEncoder) -> Self {
        self.encoder = encoder;
        self
    }

    pub fn with_clahe(mut self, clahe: Clahe) -> Self {
        self.normalizer = self.normalizer.with_clahe(clahe);
        self
    }

    pub fn segmenter(&self) -> &Arc<S> {
        &self.segmenter
    }

    pub fn quantifier(&self) -> &Quantifier {
        &self.quantifier
    }

    /// Analyze a decoded image without encoding the results.
    pub fn analyze_image(&self, image: &DynamicImage) -> Result<Analysis, AnalysisError> {
        let start = Instant::now();

        let (display, tensor) = self.normalizer.normalize(image)?;
        let normalized_at = start.elapsed();

        let probabilities = self.segmenter.segment(&tensor)?;
        let inferred_at = start.elapsed();

        let quantification = self.quantifier.quantify(&probabilities, &display)?;

        debug!(
            normalize_ms = normalized_at.as_millis() as u64,
            inference_ms = (inferred_at - normalized_at).as_millis() as u64,
            total_ms = start.elapsed().as_millis() as u64,
            "Analysis complete"
        );

        Ok(Analysis {
            display,
            probabilities,
            quantification,
        })
    }

    /// Decode an upload, analyze it and encode both result images.
    pub fn analyze_bytes(&self, bytes: &[u8]) -> Result<AnalysisOutput, AnalysisError> {
        let image = decode_upload(bytes)?;
        let analysis = self.analyze_image(&image)?;
        self.encode(&analysis)
    }

    /// Encode the display image and overlay of an analysis.
    pub fn encode(&self, analysis: &Analysis) -> Result<AnalysisOutput, AnalysisError> {
        Ok(AnalysisOutput {
            preprocessed_jpeg: self.encoder.encode(&analysis.display)?,
            overlay_jpeg: self.encoder.encode(&analysis.quantification.overlay)?,
            counts: analysis.quantification.counts,
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
