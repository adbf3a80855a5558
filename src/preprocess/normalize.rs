//! Image normalization.
//!
//! Maps a decoded photograph of arbitrary size to the fixed-resolution
//! display image and the network input tensor:
//!
//! 1. Center-crop the source to a square whose side is its shorter side
//!    (floor offsets)
//! 2. Resize the square to the target size (bilinear)
//! 3. Equalize each channel with CLAHE
//!
//! Cropping before resizing gives the same framing as scaling the shorter
//! side first, but the working buffer never exceeds the source or the target.
//!
//! The display image is the 8-bit result of these steps. The model tensor is
//! the same pixels rearranged to channel-first floats, without any further
//! scaling.

use image::imageops::{self, FilterType};
use image::{DynamicImage, RgbImage};

use crate::error::AnalysisError;

use super::clahe::Clahe;

/// Side length of the display image and network input.
pub const IMAGE_SIZE: u32 = 640;

/// Number of color channels expected by the network.
pub const RGB_CHANNELS: usize = 3;

// =============================================================================
// Data Types
// =============================================================================

/// Equalized square RGB image shown to the user and used for overlays.
///
/// Layout: height x width x 3, 8-bit, row-major.
pub type DisplayImage = RgbImage;

/// Network input tensor.
///
/// Layout: NCHW with a batch of one, `f32`, row-major. Values are the
/// equalized 8-bit intensities cast to float (range 0-255).
#[derive(Debug, Clone, PartialEq)]
pub struct ModelTensor {
    data: Vec<f32>,
    height: usize,
    width: usize,
}

impl ModelTensor {
    /// Build a tensor from a display image.
    pub fn from_display(image: &DisplayImage) -> Self {
        let (width, height) = (image.width() as usize, image.height() as usize);
        let plane = width * height;
        let mut data = vec![0.0f32; RGB_CHANNELS * plane];

        for (index, pixel) in image.pixels().enumerate() {
            for channel in 0..RGB_CHANNELS {
                data[channel * plane + index] = f32::from(pixel[channel]);
            }
        }

        Self {
            data,
            height,
            width,
        }
    }

    /// Build a tensor from raw NCHW data.
    ///
    /// Returns `None` when `data` does not hold exactly `3 * height * width`
    /// values.
    pub fn from_nchw(data: Vec<f32>, height: usize, width: usize) -> Option<Self> {
        (data.len() == RGB_CHANNELS * height * width).then_some(Self {
            data,
            height,
            width,
        })
    }

    /// Tensor shape as `(batch, channels, height, width)`.
    pub fn shape(&self) -> (usize, usize, usize, usize) {
        (1, RGB_CHANNELS, self.height, self.width)
    }

    /// Flat NCHW data.
    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }
}

// =============================================================================
// Normalizer
// =============================================================================

/// Deterministic, side-effect-free image normalizer.
#[derive(Debug, Clone)]
pub struct Normalizer {
    size: u32,
    clahe: Clahe,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new(IMAGE_SIZE)
    }
}

impl Normalizer {
    /// Create a normalizer producing `size x size` outputs with default CLAHE.
    pub fn new(size: u32) -> Self {
        Self {
            size,
            clahe: Clahe::default(),
        }
    }

    /// Replace the CLAHE parameters.
    pub fn with_clahe(mut self, clahe: Clahe) -> Self {
        self.clahe = clahe;
        self
    }

    /// Output side length.
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Normalize a decoded image into the display image and model tensor.
    ///
    /// Single-channel images are broadcast to RGB. Images that still carry an
    /// alpha channel are rejected: flattening is the ingestion step's job.
    pub fn normalize(
        &self,
        image: &DynamicImage,
    ) -> Result<(DisplayImage, ModelTensor), AnalysisError> {
        let rgb = to_rgb(image)?;
        let display = self.display_image(&rgb)?;
        let tensor = ModelTensor::from_display(&display);
        Ok((display, tensor))
    }

    /// Crop, resize and equalize an RGB image.
    pub fn display_image(&self, rgb: &RgbImage) -> Result<DisplayImage, AnalysisError> {
        let (width, height) = rgb.dimensions();
        if width == 0 || height == 0 {
            return Err(AnalysisError::invalid_image(format!(
                "image has no pixels ({}x{})",
                width, height
            )));
        }

        let (left, top, side) = center_square(width, height);
        let square = imageops::crop_imm(rgb, left, top, side, side).to_image();
        let resized = if side == self.size {
            square
        } else {
            imageops::resize(&square, self.size, self.size, FilterType::Triangle)
        };

        Ok(self.clahe.apply_rgb(&resized))
    }
}

/// Centered square covering the shorter side, as `(left, top, side)`.
///
/// Offsets are floored, so an odd surplus leaves the extra pixel on the
/// right or bottom.
pub fn center_square(width: u32, height: u32) -> (u32, u32, u32) {
    let side = width.min(height);
    ((width - side) / 2, (height - side) / 2, side)
}

/// Convert a decoded image to 8-bit RGB, rejecting images with alpha.
fn to_rgb(image: &DynamicImage) -> Result<RgbImage, AnalysisError> {
    if image.color().has_alpha() {
        return Err(AnalysisError::invalid_image(format!(
            "expected 3 channels, got {} (flatten alpha before analysis)",
            image.color().channel_count()
        )));
    }
    Ok(image.to_rgb8())
}

// =============================================================================
// Tests
// =============================================================================
