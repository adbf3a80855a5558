//! Inference orchestration: network forward pass to class probabilities.

mod engine;
mod probability;

pub use engine::{select_device, to_probability_map, InferenceEngine, Segmenter};
pub use probability::ProbabilityMap;
