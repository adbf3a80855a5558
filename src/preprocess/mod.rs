//! Image preprocessing.
//!
//! ```text
//! upload bytes ──► ingest (decode, flatten alpha)
//!                     │
//!                     ▼
//!               Normalizer: center crop ─► resize ─► CLAHE
//!                     │                                  │
//!                     ▼                                  ▼
//!               DisplayImage (640x640x3 u8)    ModelTensor (1x3x640x640 f32)
//! ```

mod clahe;
mod ingest;
mod normalize;

pub use clahe::{Clahe, DEFAULT_CLIP_LIMIT, DEFAULT_TILE_GRID};
pub use ingest::{decode_upload, flatten_alpha};
pub use normalize::{
    center_square, DisplayImage, ModelTensor, Normalizer, IMAGE_SIZE, RGB_CHANNELS,
};
