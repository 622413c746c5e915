//! Face encoders: turn a grayscale face crop into a fixed-length `Encoding`.
//!
//! Any encoder is acceptable as long as it is deterministic for identical
//! pixels and always yields the same length. `PixelEncoder` is the default;
//! `ArcFaceEncoder` plugs in a learned embedding.

use crate::arcface::ArcFaceEncoder;
use crate::types::Encoding;
use image::imageops::{self, FilterType};
use image::GrayImage;
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EncoderError {
    #[error("face crop is empty")]
    EmptyCrop,
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

pub trait FaceEncoder: Send {
    fn encode(&mut self, face: &GrayImage) -> Result<Encoding, EncoderError>;

    /// Length of every encoding this encoder produces.
    fn dimension(&self) -> usize;

    fn name(&self) -> &'static str;

    /// Match threshold used when none is configured.
    fn default_threshold(&self) -> f32;

    /// Upper bound on the distance between two encodings, if the encoder
    /// guarantees one. A threshold above it accepts every face.
    fn max_distance(&self) -> Option<f32> {
        None
    }
}

/// Configured encoder choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncoderKind {
    #[default]
    Pixel,
    Arcface,
}

const PIXEL_ENCODER_SIZE: u32 = 128;
pub const PIXEL_MATCH_THRESHOLD: f32 = 0.4;

/// Resizes the crop to a fixed square and flattens the gray levels (0..=255).
#[derive(Debug, Clone)]
pub struct PixelEncoder {
    size: u32,
}

impl PixelEncoder {
    pub fn new() -> Self {
        Self::with_size(PIXEL_ENCODER_SIZE)
    }

    pub fn with_size(size: u32) -> Self {
        Self { size: size.max(1) }
    }
}

impl Default for PixelEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FaceEncoder for PixelEncoder {
    fn encode(&mut self, face: &GrayImage) -> Result<Encoding, EncoderError> {
        if face.width() == 0 || face.height() == 0 {
            return Err(EncoderError::EmptyCrop);
        }
        let resized = imageops::resize(face, self.size, self.size, FilterType::Triangle);
        Ok(Encoding::new(
            resized.as_raw().iter().map(|&p| p as f32).collect(),
        ))
    }

    fn dimension(&self) -> usize {
        (self.size * self.size) as usize
    }

    fn name(&self) -> &'static str {
        "pixel"
    }

    fn default_threshold(&self) -> f32 {
        PIXEL_MATCH_THRESHOLD
    }
}

/// Build the configured encoder. An ArcFace model that cannot be loaded
/// falls back to `PixelEncoder` with a warning.
pub fn select_encoder(kind: EncoderKind, arcface_model: &Path) -> Box<dyn FaceEncoder> {
    match kind {
        EncoderKind::Pixel => Box::new(PixelEncoder::new()),
        EncoderKind::Arcface => match ArcFaceEncoder::load(arcface_model) {
            Ok(encoder) => Box::new(encoder),
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    path = %arcface_model.display(),
                    "ArcFace encoder unavailable; using pixel encoder"
                );
                Box::new(PixelEncoder::new())
            }
        },
    }
}
