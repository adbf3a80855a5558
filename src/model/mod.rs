//! Segmentation network.
//!
//! This module contains the network graph and checkpoint binding:
//!
//! - [`layers`]: switchable normalization, residual blocks, attention gates
//! - [`LesionNet`]: the encoder-decoder graph with deep supervision
//! - [`Checkpoint`]: safetensors or PyTorch pickle weights, bound by name

mod checkpoint;
pub mod layers;
mod network;

pub use checkpoint::{load_network, Checkpoint, CheckpointFormat, PARALLEL_PREFIX, STATE_DICT_KEY};
pub use network::{
    LesionNet, NetworkConfig, NetworkOutput, DOWNSAMPLE_FACTOR, FILTERS, MIN_IMAGE_SIZE,
    NUM_CLASSES,
};
