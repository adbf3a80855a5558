//! Checkpoint loading.
//!
//! Two containers are accepted:
//!
//! - safetensors files (`.safetensors`)
//! - PyTorch pickles (`.pth`, `.pt`, `.ckpt`), read from their `state_dict`
//!   entry when present, otherwise from the top level
//!
//! Parameter names saved from a data-parallel wrapper carry a `module.`
//! prefix; it is stripped before binding.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::ModelError;

use super::network::{LesionNet, NetworkConfig};

/// Prefix added to every parameter name by data-parallel training wrappers.
pub const PARALLEL_PREFIX: &str = "module.";

/// Key under which training scripts store the parameter dictionary.
pub const STATE_DICT_KEY: &str = "state_dict";

/// On-disk container of a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointFormat {
    Safetensors,
    Pickle,
}

impl CheckpointFormat {
    /// Infer the container from the file extension. Unknown extensions are
    /// treated as PyTorch pickles.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("safetensors") => CheckpointFormat::Safetensors,
            _ => CheckpointFormat::Pickle,
        }
    }
}

/// A set of named parameter tensors ready to bind to the network.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    tensors: HashMap<String, Tensor>,
    digest: String,
    format: CheckpointFormat,
}

impl Checkpoint {
    /// Read a checkpoint from disk.
    ///
    /// Tensors are loaded on the CPU and converted to `f32`.
    pub fn load(path: &Path) -> Result<Self, ModelError> {
        let bytes = std::fs::read(path).map_err(|source| ModelError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let digest = hex::encode(Sha256::digest(&bytes));
        let format = CheckpointFormat::from_path(path);

        let named = match format {
            CheckpointFormat::Safetensors => {
                candle_core::safetensors::load_buffer(&bytes, &Device::Cpu)
                    .map_err(|e| parse_error(path, e))?
                    .into_iter()
                    .collect::<Vec<_>>()
            }
            CheckpointFormat::Pickle => read_pickle(path)?,
        };

        let tensors = normalize_names(named)
            .into_iter()
            .map(|(name, tensor)| Ok((name, tensor.to_dtype(DType::F32)?)))
            .collect::<Result<HashMap<_, _>, candle_core::Error>>()?;

        info!(
            path = %path.display(),
            format = ?format,
            tensors = tensors.len(),
            digest = %digest,
            "Loaded checkpoint"
        );

        Ok(Self {
            tensors,
            digest,
            format,
        })
    }

    /// Wrap tensors that are already in memory.
    pub fn from_tensors(tensors: HashMap<String, Tensor>, digest: impl Into<String>) -> Self {
        Self {
            tensors: normalize_names(tensors).into_iter().collect(),
            digest: digest.into(),
            format: CheckpointFormat::Safetensors,
        }
    }

    /// Hex SHA-256 of the checkpoint file.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn format(&self) -> CheckpointFormat {
        self.format
    }

    /// Number of named tensors.
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    /// Total number of scalar values across all tensors.
    pub fn parameter_count(&self) -> usize {
        self.tensors.values().map(|t| t.elem_count()).sum()
    }

    /// Build the network from these parameters on `device`.
    ///
    /// Every slot of the network must be present with the right shape.
    /// Extra tensors in the checkpoint are ignored.
    pub fn build_network(
        self,
        config: NetworkConfig,
        device: &Device,
    ) -> Result<LesionNet, ModelError> {
        let vb = VarBuilder::from_tensors(self.tensors, DType::F32, device);
        LesionNet::new(config, vb)
    }
}

/// Load a checkpoint and build the network from it.
pub fn load_network(
    path: &Path,
    config: NetworkConfig,
    device: &Device,
) -> Result<(LesionNet, String), ModelError> {
    let checkpoint = Checkpoint::load(path)?;
    let digest = checkpoint.digest().to_string();
    let net = checkpoint.build_network(config, device)?;
    Ok((net, digest))
}

fn read_pickle(path: &Path) -> Result<Vec<(String, Tensor)>, ModelError> {
    match candle_core::pickle::read_all_with_key(path, Some(STATE_DICT_KEY)) {
        Ok(named) if !named.is_empty() => Ok(named),
        first => {
            debug!(
                path = %path.display(),
                "No '{}' entry, reading top-level tensors",
                STATE_DICT_KEY
            );
            match candle_core::pickle::read_all_with_key(path, None) {
                Ok(named) if !named.is_empty() => Ok(named),
                Ok(_) => Err(ModelError::Parse {
                    path: path.to_path_buf(),
                    message: "checkpoint contains no tensors".to_string(),
                }),
                Err(e) => Err(parse_error(path, first.err().unwrap_or(e))),
            }
        }
    }
}

fn parse_error(path: &Path, err: candle_core::Error) -> ModelError {
    ModelError::Parse {
        path: PathBuf::from(path),
        message: err.to_string(),
    }
}

/// Strip the data-parallel prefix from every name.
fn normalize_names<I>(named: I) -> Vec<(String, Tensor)>
where
    I: IntoIterator<Item = (String, Tensor)>,
{
    named
        .into_iter()
        .map(|(name, tensor)| match name.strip_prefix(PARALLEL_PREFIX) {
            Some(stripped) => (stripped.to_string(), tensor),
            None => (name, tensor),
        })
        .collect()
}

// =============================================================================
// Tests
// =============================================================================
