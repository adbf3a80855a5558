//! Test utilities for integration tests.
//!
//! This module provides mock segmenters, stores and narrative generators,
//! plus helpers for building test images and request bodies.

use async_trait::async_trait;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use std::collections::HashMap;
use std::io::Cursor;
use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use uuid::Uuid;

use diabretina::error::{AnalysisError, NarrativeError};
use diabretina::{ArtifactStore, ModelTensor, NarrativeGenerator, ProbabilityMap, Segmenter};
use diabretina::analysis::Artifacts;
use diabretina::NUM_CLASSES;

// =============================================================================
// Mock Segmenter
// =============================================================================

/// A rectangular region forced to one class.
#[derive(Debug, Clone)]
pub struct Region {
    pub class: usize,
    pub rows: Range<usize>,
    pub cols: Range<usize>,
}

/// Segmenter that paints fixed regions and counts its calls.
pub struct MockSegmenter {
    size: usize,
    regions: Vec<Region>,
    fail: bool,
    calls: AtomicUsize,
}

impl MockSegmenter {
    /// Everything is background.
    pub fn new(size: usize) -> Self {
        Self {
            size,
            regions: Vec::new(),
            fail: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_region(
        mut self,
        class: usize,
        rows: Range<usize>,
        cols: Range<usize>,
    ) -> Self {
        self.regions.push(Region { class, rows, cols });
        self
    }

    /// Every forward pass fails with an inference error.
    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn class_at(&self, y: usize, x: usize) -> usize {
        self.regions
            .iter()
            .rev()
            .find(|r| r.rows.contains(&y) && r.cols.contains(&x))
            .map(|r| r.class)
            .unwrap_or(0)
    }
}

impl Segmenter for MockSegmenter {
    fn segment(&self, input: &ModelTensor) -> Result<ProbabilityMap, AnalysisError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(AnalysisError::inference("mock forward pass failed"));
        }
        let (_, _, height, width) = input.shape();
        Ok(ProbabilityMap::from_fn(height, width, NUM_CLASSES, |y, x| {
            let mut row = vec![0.02; NUM_CLASSES];
            row[self.class_at(y, x)] = 0.92;
            row
        }).unwrap())
    }

    fn input_size(&self) -> usize {
        self.size
    }

    fn num_classes(&self) -> usize {
        NUM_CLASSES
    }

    fn model_digest(&self) -> Option<&str> {
        Some("mock")
    }

    fn device_label(&self) -> String {
        "cpu".to_string()
    }
}

// =============================================================================
// In-Memory Artifact Store
// =============================================================================

/// Artifact store that keeps committed images in memory.
#[derive(Default)]
pub struct MemoryArtifactStore {
    committed: Mutex<HashMap<Uuid, Artifacts>>,
    fail: bool,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every commit fails with an I/O error.
    pub fn failing() -> Self {
        Self {
            committed: Mutex::new(HashMap::new()),
            fail: true,
        }
    }

    pub fn len(&self) -> usize {
        self.committed.lock().unwrap().len()
    }

    pub fn get(&self, request_id: Uuid) -> Option<Artifacts> {
        self.committed.lock().unwrap().get(&request_id).cloned()
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn commit(&self, request_id: Uuid, artifacts: &Artifacts) -> Result<(), AnalysisError> {
        if self.fail {
            return Err(AnalysisError::IoFailure {
                path: format!("memory/{}", request_id).into(),
                source: std::io::Error::other("disk full"),
            });
        }
        self.committed
            .lock()
            .unwrap()
            .insert(request_id, artifacts.clone());
        Ok(())
    }
}

// =============================================================================
// Mock Narrative Generator
// =============================================================================

/// Narrative generator returning a fixed reply and recording prompts.
pub struct MockNarrative {
    reply: Result<String, u16>,
    prompts: Mutex<Vec<String>>,
}

impl MockNarrative {
    pub fn replying(text: impl Into<String>) -> Self {
        Self {
            reply: Ok(text.into()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Fails as if the endpoint answered with `status`.
    pub fn failing_with(status: u16) -> Self {
        Self {
            reply: Err(status),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl NarrativeGenerator for MockNarrative {
    async fn generate(&self, prompt: &str) -> Result<String, NarrativeError> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        match &self.reply {
            Ok(text) => Ok(text.clone()),
            Err(status) => Err(NarrativeError::Status { status: *status }),
        }
    }
}

// =============================================================================
// Image Fixtures
// =============================================================================

/// A reddish disc on a dark background, roughly the look of a fundus photo.
pub fn fundus_like(width: u32, height: u32) -> RgbImage {
    let (cx, cy) = (width as f32 / 2.0, height as f32 / 2.0);
    let radius = cx.min(cy) * 0.9;
    RgbImage::from_fn(width, height, |x, y| {
        let d = ((x as f32 - cx).powi(2) + (y as f32 - cy).powi(2)).sqrt();
        if d < radius {
            let shade = (1.0 - d / radius) * 80.0;
            Rgb([(150.0 + shade) as u8, (60.0 + shade / 2.0) as u8, 30])
        } else {
            Rgb([4, 2, 2])
        }
    })
}

/// Encode an image in the given container format.
pub fn encode_image(image: &RgbImage, format: ImageFormat) -> Vec<u8> {
    let mut buf = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(image.clone())
        .write_to(&mut buf, format)
        .unwrap();
    buf.into_inner()
}

pub fn fundus_png(width: u32, height: u32) -> Vec<u8> {
    encode_image(&fundus_like(width, height), ImageFormat::Png)
}

pub fn fundus_jpeg(width: u32, height: u32) -> Vec<u8> {
    encode_image(&fundus_like(width, height), ImageFormat::Jpeg)
}

/// Check if data is a valid JPEG (starts with SOI, ends with EOI).
pub fn is_valid_jpeg(data: &[u8]) -> bool {
    data.len() >= 4
        && data[0] == 0xFF
        && data[1] == 0xD8
        && data[data.len() - 2] == 0xFF
        && data[data.len() - 1] == 0xD9
}

// =============================================================================
// Request Bodies
// =============================================================================

pub const BOUNDARY: &str = "----diabretina-test-boundary";

/// Content-Type header value for bodies built by [`multipart_body`].
pub fn multipart_content_type() -> String {
    format!("multipart/form-data; boundary={}", BOUNDARY)
}

/// Build a multipart body with a single file field.
pub fn multipart_body(field: &str, file_name: &str, data: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
    body.extend_from_slice(
        format!(
            "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n",
            field, file_name
        )
        .as_bytes(),
    );
    body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
    body.extend_from_slice(data);
    body.extend_from_slice(format!("\r\n--{}--\r\n", BOUNDARY).as_bytes());
    body
}

/// A complete diagnosis request body.
pub fn diagnosis_json() -> serde_json::Value {
    serde_json::json!({
        "name": "Zhang Min",
        "gender": "M",
        "age": "63",
        "occupation": "Retired",
        "contact": 5550142,
        "address": "8 Harbour Street",
        "chief_complaint": "Floaters in the left eye",
        "present_illness": "Type 2 diabetes for fifteen years",
        "past_history": "None",
        "ma_count": 20,
        "he_count": 6,
        "ex_count": 9,
        "se_count": 1,
        "ma_severity": "3",
        "he_severity": "2",
        "ex_severity": "2",
        "se_severity": 1,
        "clinical_diagnosis": "Severe NPDR",
        "treatment_plan": "Refer for panretinal photocoagulation"
    })
}
