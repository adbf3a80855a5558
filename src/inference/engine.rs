//! Inference orchestration.
//!
//! [`InferenceEngine`] owns the network and the compute device. It turns a
//! [`ModelTensor`] into a [`ProbabilityMap`]:
//!
//! 1. Upload the tensor to the device
//! 2. Forward pass; keep only the primary output
//! 3. Move the class axis last if the output is channel-first
//! 4. Softmax over classes, copy back to host memory
//!
//! The network is immutable after load, so concurrent calls are safe on the
//! CPU. On accelerators forward passes are serialized by a mutex to bound
//! device memory.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use candle_core::{Device, Tensor, D};
use tracing::{debug, info};

use crate::error::{AnalysisError, ModelError};
use crate::model::{load_network, LesionNet, NetworkConfig};
use crate::preprocess::ModelTensor;

use super::probability::ProbabilityMap;

// =============================================================================
// Segmenter Trait
// =============================================================================

/// Anything that maps a normalized image tensor to class probabilities.
///
/// Implementations are called from blocking worker threads and must be
/// safe to share between them.
pub trait Segmenter: Send + Sync + 'static {
    /// Compute per-pixel class probabilities.
    fn segment(&self, input: &ModelTensor) -> Result<ProbabilityMap, AnalysisError>;

    /// Side length of the expected input.
    fn input_size(&self) -> usize;

    /// Number of output classes, background included.
    fn num_classes(&self) -> usize;

    /// Number of calls to `segment` currently in progress.
    fn active_inferences(&self) -> usize {
        0
    }

    /// Digest of the loaded weights, if known.
    fn model_digest(&self) -> Option<&str> {
        None
    }

    /// Human-readable compute device.
    fn device_label(&self) -> String {
        "unknown".to_string()
    }
}

// =============================================================================
// Device Selection
// =============================================================================

/// Pick the compute device: the first CUDA device when the `cuda` feature is
/// enabled and a device is present, otherwise the CPU.
pub fn select_device(force_cpu: bool) -> Result<Device, ModelError> {
    if force_cpu {
        return Ok(Device::Cpu);
    }
    Ok(Device::cuda_if_available(0)?)
}

fn device_label(device: &Device) -> String {
    match device {
        Device::Cpu => "cpu".to_string(),
        other => format!("{:?}", other.location()).to_lowercase(),
    }
}

// =============================================================================
// Inference Engine
// =============================================================================

/// Runs the segmentation network.
pub struct InferenceEngine {
    net: LesionNet,
    device: Device,
    digest: Option<String>,
    /// Present on accelerators only
    device_lock: Option<Mutex<()>>,
    active: AtomicUsize,
}

impl InferenceEngine {
    /// Wrap an already-built network.
    pub fn new(net: LesionNet, device: Device) -> Self {
        let device_lock = (!device.is_cpu()).then(|| Mutex::new(()));
        Self {
            net,
            device,
            digest: None,
            device_lock,
            active: AtomicUsize::new(0),
        }
    }

    /// Record the digest of the weights.
    pub fn with_digest(mut self, digest: impl Into<String>) -> Self {
        self.digest = Some(digest.into());
        self
    }

    /// Load a checkpoint and build an engine on `device`.
    pub fn load(path: &Path, config: NetworkConfig, device: Device) -> Result<Self, ModelError> {
        let (net, digest) = load_network(path, config, &device)?;
        info!(
            path = %path.display(),
            device = %device_label(&device),
            image_size = config.image_size,
            "Segmentation network ready"
        );
        Ok(Self::new(net, device).with_digest(digest))
    }

    pub fn config(&self) -> &NetworkConfig {
        self.net.config()
    }

    fn run(&self, input: &ModelTensor) -> Result<ProbabilityMap, AnalysisError> {
        let config = self.net.config();
        let (_, channels, height, width) = input.shape();
        if channels != config.input_channels
            || height != config.image_size
            || width != config.image_size
        {
            return Err(AnalysisError::inference(format!(
                "input tensor is {}x{}x{}, network expects {}x{}x{}",
                channels,
                height,
                width,
                config.input_channels,
                config.image_size,
                config.image_size
            )));
        }

        let start = Instant::now();
        let tensor = Tensor::from_slice(input.as_slice(), input.shape(), &self.device)
            .map_err(inference_error)?;

        let primary = {
            let _lock = self
                .device_lock
                .as_ref()
                .map(|m| m.lock().unwrap_or_else(|poisoned| poisoned.into_inner()));
            self.net.forward(&tensor).map_err(inference_error)?.primary
        };

        let map = to_probability_map(&primary, config.num_classes)?;
        debug!(
            elapsed_ms = start.elapsed().as_millis() as u64,
            height = map.height(),
            width = map.width(),
            "Forward pass complete"
        );
        Ok(map)
    }
}

impl Segmenter for InferenceEngine {
    fn segment(&self, input: &ModelTensor) -> Result<ProbabilityMap, AnalysisError> {
        let _active = ActiveGuard::enter(&self.active);
        self.run(input)
    }

    fn input_size(&self) -> usize {
        self.net.config().image_size
    }

    fn num_classes(&self) -> usize {
        self.net.config().num_classes
    }

    fn active_inferences(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    fn model_digest(&self) -> Option<&str> {
        self.digest.as_deref()
    }

    fn device_label(&self) -> String {
        device_label(&self.device)
    }
}

/// Decrements the in-flight counter on drop, including on early return.
struct ActiveGuard<'a>(&'a AtomicUsize);

impl<'a> ActiveGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter)
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Convert a `(1, H, W, C)` or `(1, C, H, W)` network output to a softmaxed
/// channel-last probability map.
pub fn to_probability_map(
    output: &Tensor,
    num_classes: usize,
) -> Result<ProbabilityMap, AnalysisError> {
    let (batch, d1, d2, d3) = output.dims4().map_err(inference_error)?;
    if batch != 1 {
        return Err(AnalysisError::inference(format!(
            "expected a batch of one, got {}",
            batch
        )));
    }

    let channel_last = if d3 == num_classes {
        output.clone()
    } else if d1 == num_classes {
        output
            .permute((0, 2, 3, 1))
            .and_then(|t| t.contiguous())
            .map_err(inference_error)?
    } else {
        return Err(AnalysisError::inference(format!(
            "output shape (1, {}, {}, {}) has no axis of {} classes",
            d1, d2, d3, num_classes
        )));
    };

    let (_, height, width, classes) = channel_last.dims4().map_err(inference_error)?;
    let data = candle_nn::ops::softmax(&channel_last, D::Minus1)
        .and_then(|t| t.flatten_all())
        .and_then(|t| t.to_vec1::<f32>())
        .map_err(inference_error)?;

    if let Some(index) = data.iter().position(|v| !v.is_finite()) {
        return Err(AnalysisError::inference(format!(
            "non-finite probability at flat index {}",
            index
        )));
    }

    ProbabilityMap::new(data, height, width, classes)
        .ok_or_else(|| AnalysisError::inference("probability buffer has the wrong length"))
}

fn inference_error(err: candle_core::Error) -> AnalysisError {
    AnalysisError::inference(err.to_string())
}

// =============================================================================
// Tests
// =============================================================================
