//! Quantifier: probabilities to class mask, renderings and lesion counts.
//!
//! Rendering and counting use different masks: the colored mask and the
//! overlay show the raw argmax mask, while counts are taken on the opened
//! mask. A speck removed by the opening is still drawn but never counted.

mod counting;
mod lesion;
mod mask;

use image::RgbImage;
use tracing::debug;

use crate::error::AnalysisError;
use crate::inference::ProbabilityMap;
use crate::model::NUM_CLASSES;
use crate::preprocess::DisplayImage;

pub use counting::{
    binary_mask, component_areas, count_components, count_lesions, open_mask, CountingParams,
    LesionConnectivity, DEFAULT_MIN_LESION_AREA,
};
pub use lesion::{severity_text, DrGrade, LesionCounts, LesionType};
pub use mask::{class_mask, colored_mask, overlay, ClassMask};

/// Everything the quantifier derives from one probability map.
#[derive(Debug, Clone, PartialEq)]
pub struct Quantification {
    pub class_mask: ClassMask,
    pub colored_mask: RgbImage,
    pub overlay: RgbImage,
    pub counts: LesionCounts,
}

/// Converts probability maps into masks, overlays and counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Quantifier {
    params: CountingParams,
}

impl Quantifier {
    pub fn new(params: CountingParams) -> Self {
        Self { params }
    }

    /// Quantify a probability map against the display image it was computed
    /// from.
    pub fn quantify(
        &self,
        probs: &ProbabilityMap,
        display: &DisplayImage,
    ) -> Result<Quantification, AnalysisError> {
        if probs.classes() != NUM_CLASSES {
            return Err(AnalysisError::inference(format!(
                "expected {} classes, got {}",
                NUM_CLASSES,
                probs.classes()
            )));
        }
        let (width, height) = display.dimensions();
        if (probs.width(), probs.height()) != (width as usize, height as usize) {
            return Err(AnalysisError::inference(format!(
                "probability map is {}x{}, display image is {}x{}",
                probs.width(),
                probs.height(),
                width,
                height
            )));
        }

        let class_mask = class_mask(probs);
        let colored_mask = colored_mask(&class_mask);
        let overlay = overlay(display, &class_mask);
        let counts = count_lesions(&class_mask, &self.params);

        debug!(
            ex = counts.ex,
            he = counts.he,
            ma = counts.ma,
            se = counts.se,
            "Quantified lesions"
        );

        Ok(Quantification {
            class_mask,
            colored_mask,
            overlay,
            counts,
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
