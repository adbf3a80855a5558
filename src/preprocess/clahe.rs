//! Contrast-limited adaptive histogram equalization.
//!
//! The image is divided into a grid of tiles. Each tile gets its own
//! clipped-histogram lookup table, and every pixel is mapped by bilinearly
//! interpolating the tables of the four nearest tile centers.
//!
//! The arithmetic follows the OpenCV 8-bit implementation exactly (integer
//! clip limit, residual redistribution stride, single-precision interpolation,
//! round-half-to-even saturation) so that equalized pixels match images
//! produced by the reference preprocessing.

use image::RgbImage;

/// Number of histogram bins for 8-bit data.
const HIST_SIZE: usize = 256;

/// Default clip limit.
pub const DEFAULT_CLIP_LIMIT: f32 = 2.0;

/// Default tile grid (tiles per axis).
pub const DEFAULT_TILE_GRID: usize = 8;

// =============================================================================
// Clahe
// =============================================================================

/// CLAHE parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Clahe {
    /// Histogram clip limit, relative to a uniform distribution
    pub clip_limit: f32,

    /// Number of tiles along each axis
    pub tile_grid: usize,
}

impl Default for Clahe {
    fn default() -> Self {
        Self {
            clip_limit: DEFAULT_CLIP_LIMIT,
            tile_grid: DEFAULT_TILE_GRID,
        }
    }
}

impl Clahe {
    /// Create CLAHE parameters.
    pub fn new(clip_limit: f32, tile_grid: usize) -> Self {
        Self {
            clip_limit,
            tile_grid: tile_grid.max(1),
        }
    }

    /// Equalize each color channel of an RGB image independently.
    pub fn apply_rgb(&self, image: &RgbImage) -> RgbImage {
        let (width, height) = image.dimensions();
        let (w, h) = (width as usize, height as usize);
        if w == 0 || h == 0 {
            return image.clone();
        }

        let raw = image.as_raw();
        let mut out = vec![0u8; raw.len()];
        let mut plane = vec![0u8; w * h];

        for channel in 0..3 {
            for (dst, px) in plane.iter_mut().zip(raw.chunks_exact(3)) {
                *dst = px[channel];
            }
            let equalized = self.apply_plane(&plane, w, h);
            for (px, value) in out.chunks_exact_mut(3).zip(equalized) {
                px[channel] = value;
            }
        }

        // Buffer length is 3 * width * height by construction.
        RgbImage::from_raw(width, height, out).unwrap_or_else(|| image.clone())
    }

    /// Equalize a single 8-bit plane stored row-major.
    pub fn apply_plane(&self, plane: &[u8], width: usize, height: usize) -> Vec<u8> {
        let tiles = self.tile_grid;

        // Planes whose sides are not multiples of the grid are extended by
        // reflection before the lookup tables are built.
        let ext_w = width.div_ceil(tiles) * tiles;
        let ext_h = height.div_ceil(tiles) * tiles;
        let padded;
        let lut_source: &[u8] = if ext_w == width && ext_h == height {
            plane
        } else {
            padded = reflect_pad(plane, width, height, ext_w, ext_h);
            &padded
        };

        let tile_w = ext_w / tiles;
        let tile_h = ext_h / tiles;
        let luts = self.build_luts(lut_source, ext_w, tile_w, tile_h);

        interpolate(plane, width, height, tile_w, tile_h, tiles, &luts)
    }

    /// Integer clip limit for a tile of `tile_area` pixels.
    fn clip_count(&self, tile_area: usize) -> usize {
        if self.clip_limit <= 0.0 {
            return 0;
        }
        let limit = (self.clip_limit * tile_area as f32 / HIST_SIZE as f32) as usize;
        limit.max(1)
    }

    fn build_luts(&self, source: &[u8], stride: usize, tile_w: usize, tile_h: usize) -> Vec<[u8; HIST_SIZE]> {
        let tiles = self.tile_grid;
        let tile_area = tile_w * tile_h;
        let clip = self.clip_count(tile_area);
        let lut_scale = (HIST_SIZE - 1) as f32 / tile_area as f32;

        let mut luts = Vec::with_capacity(tiles * tiles);
        for ty in 0..tiles {
            for tx in 0..tiles {
                let mut hist = [0usize; HIST_SIZE];
                for row in ty * tile_h..(ty + 1) * tile_h {
                    let start = row * stride + tx * tile_w;
                    for &v in &source[start..start + tile_w] {
                        hist[v as usize] += 1;
                    }
                }

                if clip > 0 {
                    clip_histogram(&mut hist, clip);
                }

                let mut lut = [0u8; HIST_SIZE];
                let mut sum = 0usize;
                for (bin, count) in hist.iter().enumerate() {
                    sum += count;
                    lut[bin] = saturate_u8(sum as f32 * lut_scale);
                }
                luts.push(lut);
            }
        }
        luts
    }
}

/// Clip a histogram at `clip` and spread the excess over all bins.
fn clip_histogram(hist: &mut [usize; HIST_SIZE], clip: usize) {
    let mut clipped = 0usize;
    for count in hist.iter_mut() {
        if *count > clip {
            clipped += *count - clip;
            *count = clip;
        }
    }

    let batch = clipped / HIST_SIZE;
    let mut residual = clipped - batch * HIST_SIZE;
    for count in hist.iter_mut() {
        *count += batch;
    }

    if residual != 0 {
        let step = (HIST_SIZE / residual).max(1);
        let mut bin = 0;
        while bin < HIST_SIZE && residual > 0 {
            hist[bin] += 1;
            bin += step;
            residual -= 1;
        }
    }
}

fn interpolate(
    plane: &[u8],
    width: usize,
    height: usize,
    tile_w: usize,
    tile_h: usize,
    tiles: usize,
    luts: &[[u8; HIST_SIZE]],
) -> Vec<u8> {
    let inv_tw = 1.0f32 / tile_w as f32;
    let inv_th = 1.0f32 / tile_h as f32;
    let last = tiles as isize - 1;

    // Horizontal neighbours and weights are identical for every row.
    let columns: Vec<(usize, usize, f32)> = (0..width)
        .map(|x| {
            let txf = x as f32 * inv_tw - 0.5;
            let tx1 = txf.floor();
            let xa = txf - tx1;
            let left = (tx1 as isize).max(0) as usize;
            let right = (tx1 as isize + 1).min(last) as usize;
            (left, right, xa)
        })
        .collect();

    let mut out = vec![0u8; width * height];
    for y in 0..height {
        let tyf = y as f32 * inv_th - 0.5;
        let ty1 = tyf.floor();
        let ya = tyf - ty1;
        let ya1 = 1.0 - ya;
        let top = (ty1 as isize).max(0) as usize;
        let bottom = (ty1 as isize + 1).min(last) as usize;

        let row = &plane[y * width..(y + 1) * width];
        let dst = &mut out[y * width..(y + 1) * width];
        for (x, (&v, &(left, right, xa))) in row.iter().zip(columns.iter()).enumerate() {
            let v = v as usize;
            let xa1 = 1.0 - xa;
            let t = &luts[top * tiles..(top + 1) * tiles];
            let b = &luts[bottom * tiles..(bottom + 1) * tiles];
            let res = (t[left][v] as f32 * xa1 + t[right][v] as f32 * xa) * ya1
                + (b[left][v] as f32 * xa1 + b[right][v] as f32 * xa) * ya;
            dst[x] = saturate_u8(res);
        }
    }
    out
}

/// Extend a plane to `ext_w x ext_h` by mirror reflection without repeating
/// the edge pixel.
fn reflect_pad(plane: &[u8], width: usize, height: usize, ext_w: usize, ext_h: usize) -> Vec<u8> {
    let mut out = vec![0u8; ext_w * ext_h];
    for y in 0..ext_h {
        let sy = reflect_101(y, height);
        for x in 0..ext_w {
            out[y * ext_w + x] = plane[sy * width + reflect_101(x, width)];
        }
    }
    out
}

fn reflect_101(mut index: usize, len: usize) -> usize {
    if len == 1 {
        return 0;
    }
    let period = 2 * (len - 1);
    index %= period;
    if index >= len {
        period - index
    } else {
        index
    }
}

/// Round half to even and clamp to the u8 range.
#[inline]
pub(crate) fn saturate_u8(value: f32) -> u8 {
    value.round_ties_even().clamp(0.0, 255.0) as u8
}

// =============================================================================
// Tests
// =============================================================================
