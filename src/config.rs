//! Configuration management.
//!
//! This module provides the command-line interface and its validation:
//! - Command-line arguments via clap
//! - Environment variables with `DR_` prefix
//! - Defaults that match the reference pipeline
//!
//! # Subcommands
//!
//! - `serve` - Run the HTTP API
//! - `analyze` - Analyze one image file and print the lesion counts
//! - `check` - Load the checkpoint and report its digest
//!
//! # Environment Variables
//!
//! - `DR_WEIGHTS` - Checkpoint path (required)
//! - `DR_IMAGE_SIZE` - Network input side (default: 640)
//! - `DR_FORCE_CPU` - Never use an accelerator (default: false)
//! - `DR_HOST` - Server bind address (default: 0.0.0.0)
//! - `DR_PORT` - Server port (default: 8005)
//! - `DR_MAX_CONCURRENT` - Analyses running at once (default: 4)
//! - `DR_MAX_UPLOAD_BYTES` - Largest accepted upload (default: 32MB)
//! - `DR_CACHE_BYTES` - Result cache size, 0 disables (default: 64MB)
//! - `DR_OUTPUT_DIR` - Directory for persisted images (default: none)
//! - `DR_JPEG_QUALITY` - JPEG quality of result images (default: 75)
//! - `DR_MIN_LESION_AREA` - Smallest counted lesion in pixels (default: 10)
//! - `DR_CONNECTIVITY` - `four` or `eight` (default: four)
//! - `DR_CLAHE_CLIP` / `DR_CLAHE_GRID` - Equalization parameters (default: 2.0 / 8)
//! - `DR_NARRATIVE_URL`, `DR_NARRATIVE_API_KEY`, `DR_NARRATIVE_MODEL`,
//!   `DR_NARRATIVE_TIMEOUT` - Chat-completions endpoint for narratives

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::analysis::{
    JpegImageEncoder, DEFAULT_JPEG_QUALITY, DEFAULT_RESULT_CACHE_CAPACITY, MAX_JPEG_QUALITY,
    MIN_JPEG_QUALITY,
};
use crate::model::{NetworkConfig, DOWNSAMPLE_FACTOR, MIN_IMAGE_SIZE};
use crate::narrative::{NarrativeConfig, DEFAULT_NARRATIVE_TIMEOUT};
use crate::preprocess::{Clahe, DEFAULT_CLIP_LIMIT, DEFAULT_TILE_GRID, IMAGE_SIZE};
use crate::quantify::{CountingParams, LesionConnectivity, Quantifier, DEFAULT_MIN_LESION_AREA};
use crate::server::{DEFAULT_MAX_CONCURRENT, DEFAULT_MAX_UPLOAD_BYTES};

// =============================================================================
// Default Values
// =============================================================================

/// Default server host.
pub const DEFAULT_HOST: &str = "0.0.0.0";

/// Default server port.
pub const DEFAULT_PORT: u16 = 8005;

/// Default model name sent to the narrative endpoint.
pub const DEFAULT_NARRATIVE_MODEL: &str = "doubao-1-5-pro-32k-250115";

// =============================================================================
// CLI Arguments
// =============================================================================

/// Diabetic-retinopathy lesion segmentation and quantification.
#[derive(Parser, Debug, Clone)]
#[command(name = "diabretina")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    pub fn into_command(self) -> Command {
        self.command
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run the HTTP API.
    Serve(ServeConfig),

    /// Analyze a single image file.
    Analyze(AnalyzeConfig),

    /// Load the checkpoint and report on it.
    Check(CheckConfig),
}

/// Checkpoint and device selection.
#[derive(Args, Debug, Clone)]
pub struct ModelOptions {
    /// Checkpoint file (.safetensors, or a PyTorch .pth with a state_dict).
    #[arg(long, env = "DR_WEIGHTS")]
    pub weights: PathBuf,

    /// Side length of the network input and display image.
    #[arg(long, default_value_t = IMAGE_SIZE as usize, env = "DR_IMAGE_SIZE")]
    pub image_size: usize,

    /// Run on the CPU even if an accelerator is available.
    #[arg(long, default_value_t = false, env = "DR_FORCE_CPU")]
    pub cpu: bool,
}

impl ModelOptions {
    pub fn validate(&self) -> Result<(), String> {
        if self.weights.as_os_str().is_empty() {
            return Err("Checkpoint path is required. Set --weights or DR_WEIGHTS".to_string());
        }
        if self.image_size % DOWNSAMPLE_FACTOR != 0 || self.image_size < MIN_IMAGE_SIZE {
            return Err(format!(
                "image_size must be a multiple of {} and at least {}",
                DOWNSAMPLE_FACTOR, MIN_IMAGE_SIZE
            ));
        }
        Ok(())
    }

    pub fn network_config(&self) -> NetworkConfig {
        NetworkConfig::with_image_size(self.image_size)
    }
}

/// Equalization, counting and encoding parameters.
#[derive(Args, Debug, Clone)]
pub struct PipelineOptions {
    /// JPEG quality of the returned images (1-100).
    #[arg(long, default_value_t = DEFAULT_JPEG_QUALITY, env = "DR_JPEG_QUALITY")]
    pub jpeg_quality: u8,

    /// Smallest connected component, in pixels, counted as a lesion.
    #[arg(long, default_value_t = DEFAULT_MIN_LESION_AREA, env = "DR_MIN_LESION_AREA")]
    pub min_lesion_area: u32,

    /// Pixel adjacency for lesion counting.
    #[arg(long, value_enum, default_value_t = LesionConnectivity::Four, env = "DR_CONNECTIVITY")]
    pub connectivity: LesionConnectivity,

    /// CLAHE clip limit.
    #[arg(long, default_value_t = DEFAULT_CLIP_LIMIT, env = "DR_CLAHE_CLIP")]
    pub clahe_clip: f32,

    /// CLAHE tiles per axis.
    #[arg(long, default_value_t = DEFAULT_TILE_GRID, env = "DR_CLAHE_GRID")]
    pub clahe_grid: usize,
}

impl PipelineOptions {
    pub fn validate(&self) -> Result<(), String> {
        if !(MIN_JPEG_QUALITY..=MAX_JPEG_QUALITY).contains(&self.jpeg_quality) {
            return Err("jpeg_quality must be between 1 and 100".to_string());
        }
        if self.min_lesion_area == 0 {
            return Err("min_lesion_area must be greater than 0".to_string());
        }
        if !self.clahe_clip.is_finite() || self.clahe_clip < 0.0 {
            return Err("clahe_clip must be a non-negative number".to_string());
        }
        if self.clahe_grid == 0 {
            return Err("clahe_grid must be greater than 0".to_string());
        }
        Ok(())
    }

    pub fn quantifier(&self) -> Quantifier {
        Quantifier::new(CountingParams {
            min_area: self.min_lesion_area,
            connectivity: self.connectivity,
        })
    }

    pub fn clahe(&self) -> Clahe {
        Clahe::new(self.clahe_clip, self.clahe_grid)
    }

    pub fn encoder(&self) -> JpegImageEncoder {
        JpegImageEncoder::new(self.jpeg_quality)
    }
}

// =============================================================================
// Serve
// =============================================================================

#[derive(Args, Debug, Clone)]
pub struct ServeConfig {
    #[command(flatten)]
    pub model: ModelOptions,

    #[command(flatten)]
    pub pipeline: PipelineOptions,

    /// Host address to bind the server to.
    #[arg(long, default_value = DEFAULT_HOST, env = "DR_HOST")]
    pub host: String,

    /// Port to listen on.
    #[arg(short, long, default_value_t = DEFAULT_PORT, env = "DR_PORT")]
    pub port: u16,

    /// Maximum number of analyses running at once; further uploads get 503.
    #[arg(long, default_value_t = DEFAULT_MAX_CONCURRENT, env = "DR_MAX_CONCURRENT")]
    pub max_concurrent: usize,

    /// Largest accepted request body in bytes.
    #[arg(long, default_value_t = DEFAULT_MAX_UPLOAD_BYTES, env = "DR_MAX_UPLOAD_BYTES")]
    pub max_upload_bytes: usize,

    /// Result cache size in bytes of encoded images (0 disables the cache).
    #[arg(long, default_value_t = DEFAULT_RESULT_CACHE_CAPACITY, env = "DR_CACHE_BYTES")]
    pub cache_bytes: usize,

    /// Directory where display images and overlays are persisted.
    #[arg(long, env = "DR_OUTPUT_DIR")]
    pub output_dir: Option<PathBuf>,

    /// Allowed CORS origins (comma-separated).
    ///
    /// If not specified, allows any origin.
    #[arg(long, env = "DR_CORS_ORIGINS", value_delimiter = ',')]
    pub cors_origins: Option<Vec<String>>,

    /// Chat-completions endpoint for narrative generation.
    ///
    /// If not specified, `/diagnosis` always returns the placeholder text.
    #[arg(long, env = "DR_NARRATIVE_URL")]
    pub narrative_url: Option<String>,

    /// Bearer token for the narrative endpoint.
    #[arg(long, env = "DR_NARRATIVE_API_KEY", hide_env_values = true)]
    pub narrative_api_key: Option<String>,

    /// Model name sent to the narrative endpoint.
    #[arg(long, default_value = DEFAULT_NARRATIVE_MODEL, env = "DR_NARRATIVE_MODEL")]
    pub narrative_model: String,

    /// Narrative request timeout in seconds.
    #[arg(long, default_value_t = DEFAULT_NARRATIVE_TIMEOUT.as_secs(), env = "DR_NARRATIVE_TIMEOUT")]
    pub narrative_timeout: u64,

    /// Enable verbose logging (debug level).
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,

    /// Disable request tracing.
    #[arg(long, default_value_t = false)]
    pub no_tracing: bool,
}

impl ServeConfig {
    /// Validate the configuration and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        self.model.validate()?;
        self.pipeline.validate()?;

        if self.max_concurrent == 0 {
            return Err("max_concurrent must be greater than 0".to_string());
        }
        if self.max_upload_bytes < 1024 {
            return Err("max_upload_bytes must be at least 1KB".to_string());
        }
        if let Some(url) = &self.narrative_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(format!("narrative_url must be an http(s) URL, got '{}'", url));
            }
        }
        if self.narrative_timeout == 0 {
            return Err("narrative_timeout must be greater than 0".to_string());
        }
        Ok(())
    }

    /// Get the server bind address as "host:port".
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Narrative endpoint settings, if an endpoint is configured.
    pub fn narrative_config(&self) -> Option<NarrativeConfig> {
        self.narrative_url.as_ref().map(|endpoint| NarrativeConfig {
            endpoint: endpoint.clone(),
            api_key: self.narrative_api_key.clone(),
            model: self.narrative_model.clone(),
            timeout: Duration::from_secs(self.narrative_timeout),
        })
    }
}

// =============================================================================
// Analyze
// =============================================================================

/// Output format for the `analyze` command.
#[derive(ValueEnum, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AnalyzeOutputFormat {
    /// One line per lesion class
    #[default]
    Text,
    /// The lesion counts as a JSON object
    Json,
}

#[derive(Args, Debug, Clone)]
pub struct AnalyzeConfig {
    /// Image file to analyze.
    pub input: PathBuf,

    #[command(flatten)]
    pub model: ModelOptions,

    #[command(flatten)]
    pub pipeline: PipelineOptions,

    /// Write `<stem>-preprocessed.jpg` and `<stem>-predicted.jpg` here.
    #[arg(short, long)]
    pub output_dir: Option<PathBuf>,

    /// How to print the lesion counts.
    #[arg(long, value_enum, default_value_t = AnalyzeOutputFormat::Text)]
    pub format: AnalyzeOutputFormat,

    /// Enable verbose logging (debug level).
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,
}

impl AnalyzeConfig {
    pub fn validate(&self) -> Result<(), String> {
        self.model.validate()?;
        self.pipeline.validate()?;
        if self.input.as_os_str().is_empty() {
            return Err("An input image is required".to_string());
        }
        Ok(())
    }

    /// File stem used for written images.
    pub fn output_stem(&self) -> String {
        self.input
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "image".to_string())
    }
}

// =============================================================================
// Check
// =============================================================================

#[derive(Args, Debug, Clone)]
pub struct CheckConfig {
    #[command(flatten)]
    pub model: ModelOptions,

    /// Run one forward pass on a blank image after loading.
    #[arg(long, default_value_t = false)]
    pub warmup: bool,

    /// Enable verbose logging (debug level).
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,
}

impl CheckConfig {
    pub fn validate(&self) -> Result<(), String> {
        self.model.validate()
    }
}

// =============================================================================
// Tests
// =============================================================================
