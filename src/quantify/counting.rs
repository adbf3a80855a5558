//! Lesion counting by connected-component analysis.
//!
//! Each lesion class is counted on its own binary mask:
//!
//! 1. Morphological opening with a 3x3 square (removes specks)
//! 2. Connected-component labelling
//! 3. Components smaller than the minimum area are dropped

use image::{GrayImage, Luma};
use imageproc::distance_transform::Norm;
use imageproc::morphology;
use imageproc::region_labelling::{connected_components, Connectivity};
use serde::{Deserialize, Serialize};

use super::lesion::{LesionCounts, LesionType};
use super::mask::ClassMask;

/// Default minimum component area in pixels.
pub const DEFAULT_MIN_LESION_AREA: u32 = 10;

const FOREGROUND: u8 = 255;

/// Pixel adjacency used when labelling components.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LesionConnectivity {
    /// Edge-adjacent pixels only
    #[default]
    Four,
    /// Edge- and corner-adjacent pixels
    Eight,
}

impl From<LesionConnectivity> for Connectivity {
    fn from(value: LesionConnectivity) -> Self {
        match value {
            LesionConnectivity::Four => Connectivity::Four,
            LesionConnectivity::Eight => Connectivity::Eight,
        }
    }
}

/// Parameters of the counting stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CountingParams {
    pub min_area: u32,
    pub connectivity: LesionConnectivity,
}

impl Default for CountingParams {
    fn default() -> Self {
        Self {
            min_area: DEFAULT_MIN_LESION_AREA,
            connectivity: LesionConnectivity::default(),
        }
    }
}

/// Binary mask (255 = class present) for one class index.
pub fn binary_mask(mask: &ClassMask, class: u8) -> GrayImage {
    let (width, height) = mask.dimensions();
    GrayImage::from_fn(width, height, |x, y| {
        Luma([if mask.get_pixel(x, y)[0] == class { FOREGROUND } else { 0 }])
    })
}

/// Erosion then dilation with a 3x3 square structuring element.
///
/// Pixels outside the image count as foreground for the erosion and as
/// background for the dilation.
pub fn open_mask(mask: &GrayImage) -> GrayImage {
    morphology::open(mask, Norm::LInf, 1)
}

/// Pixel area of every connected component of a binary mask.
pub fn component_areas(mask: &GrayImage, connectivity: LesionConnectivity) -> Vec<u32> {
    let labels = connected_components(mask, connectivity.into(), Luma([0u8]));

    let mut areas: Vec<u32> = Vec::new();
    for label in labels.pixels() {
        let label = label[0] as usize;
        if label == 0 {
            continue;
        }
        if areas.len() < label {
            areas.resize(label, 0);
        }
        areas[label - 1] += 1;
    }
    areas
}

/// Number of components of an already-opened binary mask with area of at
/// least `min_area`.
pub fn count_components(mask: &GrayImage, params: &CountingParams) -> u32 {
    component_areas(mask, params.connectivity)
        .into_iter()
        .filter(|&area| area >= params.min_area)
        .count() as u32
}

/// Count every lesion class of a class mask.
pub fn count_lesions(mask: &ClassMask, params: &CountingParams) -> LesionCounts {
    let mut counts = LesionCounts::default();
    for lesion in LesionType::ALL {
        let opened = open_mask(&binary_mask(mask, lesion.class_index()));
        counts.set(lesion, count_components(&opened, params));
    }
    counts
}
