//! Class masks and their renderings.

use image::{GrayImage, Luma, Rgb, RgbImage};

use crate::inference::ProbabilityMap;
use crate::preprocess::DisplayImage;

use super::lesion::LesionType;

/// Per-pixel class index, 0 for background and 1..=4 for lesion classes.
pub type ClassMask = GrayImage;

/// Stable per-pixel argmax: ties go to the lowest class index.
pub fn class_mask(probs: &ProbabilityMap) -> ClassMask {
    let width = probs.width() as u32;
    let height = probs.height() as u32;
    GrayImage::from_fn(width, height, |x, y| {
        Luma([argmax(probs.pixel(y as usize, x as usize))])
    })
}

#[inline]
fn argmax(values: &[f32]) -> u8 {
    let mut best = 0;
    for (index, &value) in values.iter().enumerate().skip(1) {
        if value > values[best] {
            best = index;
        }
    }
    best as u8
}

/// Fixed lesion color at every lesion pixel, black elsewhere.
pub fn colored_mask(mask: &ClassMask) -> RgbImage {
    let (width, height) = mask.dimensions();
    RgbImage::from_fn(width, height, |x, y| Rgb(class_color(mask.get_pixel(x, y)[0])))
}

fn class_color(class: u8) -> [u8; 3] {
    LesionType::from_class_index(class).map_or([0, 0, 0], LesionType::color)
}

/// Blend the lesion colors 50/50 into the display image.
///
/// Background pixels are copied unchanged. `display` and `mask` must have the
/// same dimensions.
pub fn overlay(display: &DisplayImage, mask: &ClassMask) -> RgbImage {
    let mut out = display.clone();
    for (x, y, pixel) in out.enumerate_pixels_mut() {
        if let Some(lesion) = LesionType::from_class_index(mask.get_pixel(x, y)[0]) {
            let color = lesion.color();
            for c in 0..3 {
                pixel[c] = blend_half(pixel[c], color[c]);
            }
        }
    }
    out
}

/// `round(0.5 * a + 0.5 * b)` with ties to even.
#[inline]
pub(crate) fn blend_half(a: u8, b: u8) -> u8 {
    let sum = u16::from(a) + u16::from(b);
    let half = sum / 2;
    if sum % 2 == 1 && half % 2 == 1 {
        (half + 1) as u8
    } else {
        half as u8
    }
}
