//! Upload ingestion.
//!
//! Decodes uploaded bytes and flattens transparent images onto an opaque
//! white background so that the normalizer always receives an image without
//! an alpha channel.

use image::{DynamicImage, ImageReader, RgbImage};
use std::io::Cursor;

use crate::error::AnalysisError;

/// Decode an uploaded image and drop any alpha channel.
///
/// # Errors
///
/// Returns `InvalidImage` if the format cannot be detected or the data
/// cannot be decoded.
pub fn decode_upload(bytes: &[u8]) -> Result<DynamicImage, AnalysisError> {
    if bytes.is_empty() {
        return Err(AnalysisError::invalid_image("empty upload"));
    }

    let reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| AnalysisError::invalid_image(e.to_string()))?;

    if reader.format().is_none() {
        return Err(AnalysisError::invalid_image("unrecognized image format"));
    }

    let image = reader
        .decode()
        .map_err(|e| AnalysisError::invalid_image(e.to_string()))?;

    Ok(flatten_alpha(image))
}

/// Composite an image with alpha onto white. Opaque images pass through.
pub fn flatten_alpha(image: DynamicImage) -> DynamicImage {
    if !image.color().has_alpha() {
        return image;
    }

    let rgba = image.to_rgba8();
    let (width, height) = rgba.dimensions();
    let flattened = RgbImage::from_fn(width, height, |x, y| {
        let [r, g, b, a] = rgba.get_pixel(x, y).0;
        image::Rgb([over_white(r, a), over_white(g, a), over_white(b, a)])
    });

    DynamicImage::ImageRgb8(flattened)
}

/// Blend one channel over white with integer rounding.
#[inline]
fn over_white(value: u8, alpha: u8) -> u8 {
    let (v, a) = (u32::from(value), u32::from(alpha));
    ((v * a + 255 * (255 - a) + 127) / 255) as u8
}

// =============================================================================
// Tests
// =============================================================================
