//! Face detection with a primary neural backend and a classical fallback.
//!
//! The backend is chosen once, when the detector is built, by probing for the
//! primary model artifacts. Every backend reports raw candidates in frame
//! coordinates; `FaceDetector` clips them to the frame, applies the
//! confidence and minimum-size gates, crops, and sorts by confidence.

use crate::cascade::CascadeBackend;
use crate::scrfd::ScrfdBackend;
use crate::types::{DetectedFace, Rect};
use image::{GrayImage, Luma};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("model unavailable: {0}")]
    ModelUnavailable(String),
    #[error("no face detection backend available (primary: {primary}; fallback: {fallback})")]
    NoBackendAvailable { primary: String, fallback: String },
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("frame buffer is {actual} bytes, expected {expected}")]
    InvalidFrame { expected: usize, actual: usize },
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Which detection strategy a `FaceDetector` was built with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Neural detector with calibrated confidence.
    Primary,
    /// Classical cascade with a fixed nominal confidence.
    Fallback,
}

/// Unclipped detection in frame coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

/// A face localisation strategy.
pub trait DetectionBackend: Send {
    fn kind(&self) -> BackendKind;

    fn name(&self) -> &'static str;

    /// Locate faces in a grayscale buffer of `width * height` bytes.
    fn locate(
        &mut self,
        luma: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<Candidate>, DetectorError>;
}

/// Post-detection gates applied regardless of backend.
#[derive(Debug, Clone)]
pub struct DetectorSettings {
    /// Detections below this confidence are dropped. The primary backend
    /// lowers its own pre-NMS floor to match, down to 0.05.
    pub confidence_threshold: f32,
    /// Clipped rectangles narrower or shorter than this (pixels) are dropped.
    pub min_face_size: u32,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.7,
            min_face_size: 100,
        }
    }
}

/// Model artifact locations probed at construction.
#[derive(Debug, Clone)]
pub struct DetectorModels {
    /// SCRFD ONNX model (primary).
    pub primary: PathBuf,
    /// SeetaFace cascade model (fallback).
    pub fallback: PathBuf,
}

pub struct FaceDetector {
    backend: Box<dyn DetectionBackend>,
    settings: DetectorSettings,
}

impl FaceDetector {
    /// Build a detector, preferring the primary backend.
    ///
    /// A missing or unloadable primary model is not fatal: the fallback is
    /// probed instead. Only when neither loads is an error returned.
    pub fn probe(models: &DetectorModels, settings: DetectorSettings) -> Result<Self, DetectorError> {
        let primary_err = match ScrfdBackend::load(&models.primary) {
            Ok(backend) => {
                let backend = backend.with_confidence_threshold(settings.confidence_threshold);
                tracing::info!(path = %models.primary.display(), "using primary SCRFD detector");
                return Ok(Self::with_backend(Box::new(backend), settings));
            }
            Err(e) => e,
        };

        tracing::warn!(
            error = %primary_err,
            fallback = %models.fallback.display(),
            "primary detector unavailable; probing fallback cascade"
        );

        match CascadeBackend::load(&models.fallback) {
            Ok(backend) => {
                tracing::info!(path = %models.fallback.display(), "using fallback cascade detector");
                Ok(Self::with_backend(Box::new(backend), settings))
            }
            Err(fallback_err) => Err(DetectorError::NoBackendAvailable {
                primary: primary_err.to_string(),
                fallback: fallback_err.to_string(),
            }),
        }
    }

    pub fn with_backend(backend: Box<dyn DetectionBackend>, settings: DetectorSettings) -> Self {
        Self { backend, settings }
    }

    pub fn backend(&self) -> BackendKind {
        self.backend.kind()
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn settings(&self) -> &DetectorSettings {
        &self.settings
    }

    /// Detect faces in a grayscale frame, sorted by descending confidence.
    pub fn detect(
        &mut self,
        luma: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<DetectedFace>, DetectorError> {
        let expected = width as usize * height as usize;
        if luma.len() != expected {
            return Err(DetectorError::InvalidFrame {
                expected,
                actual: luma.len(),
            });
        }
        if expected == 0 {
            return Ok(Vec::new());
        }

        let candidates = self.backend.locate(luma, width, height)?;

        let mut faces: Vec<DetectedFace> = candidates
            .into_iter()
            .filter(|c| c.confidence >= self.settings.confidence_threshold)
            .filter_map(|c| {
                let rect = clip_to_frame(&c, width, height)?;
                if rect.width < self.settings.min_face_size
                    || rect.height < self.settings.min_face_size
                {
                    return None;
                }
                Some(DetectedFace {
                    rect,
                    confidence: c.confidence.clamp(0.0, 1.0),
                    crop: crop(luma, width, &rect),
                })
            })
            .collect();

        // Stable sort keeps backend order for equal confidences.
        faces.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        tracing::trace!(backend = self.backend.name(), faces = faces.len(), "detect");
        Ok(faces)
    }
}

/// Clip a candidate to the frame. Returns `None` for zero-area results.
pub fn clip_to_frame(c: &Candidate, width: u32, height: u32) -> Option<Rect> {
    if !(c.x.is_finite() && c.y.is_finite() && c.width.is_finite() && c.height.is_finite()) {
        return None;
    }
    let left = c.x.floor().clamp(0.0, width as f32) as u32;
    let top = c.y.floor().clamp(0.0, height as f32) as u32;
    let right = (c.x + c.width).ceil().clamp(0.0, width as f32) as u32;
    let bottom = (c.y + c.height).ceil().clamp(0.0, height as f32) as u32;

    if right <= left || bottom <= top {
        return None;
    }
    Some(Rect {
        x: left,
        y: top,
        width: right - left,
        height: bottom - top,
    })
}

/// Copy a rectangle out of a grayscale buffer. `rect` must lie inside the frame.
fn crop(luma: &[u8], frame_width: u32, rect: &Rect) -> GrayImage {
    let stride = frame_width as usize;
    GrayImage::from_fn(rect.width, rect.height, |x, y| {
        let idx = (rect.y + y) as usize * stride + (rect.x + x) as usize;
        Luma([luma[idx]])
    })
}
