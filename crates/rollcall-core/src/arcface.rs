//! ArcFace face encoder via ONNX Runtime.
//!
//! Produces 512-dimensional L2-normalised embeddings from a face crop using
//! the w600k_r50 model. The crop is resized to the model input without
//! landmark alignment.

use crate::encoder::{EncoderError, FaceEncoder};
use crate::types::Encoding;
use image::imageops::{self, FilterType};
use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;

const ARCFACE_INPUT_SIZE: usize = 112;
const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5; // symmetric normalization, unlike SCRFD
const ARCFACE_EMBEDDING_DIM: usize = 512;
/// Unit-length embeddings are at most 2.0 apart before scaling.
const ARCFACE_MAX_DISTANCE: f32 = 2.0 / ARCFACE_EMBEDDING_DIM as f32;
/// Euclidean 1.1 between unit embeddings (cosine similarity about 0.4).
pub const ARCFACE_MATCH_THRESHOLD: f32 = 1.1 / ARCFACE_EMBEDDING_DIM as f32;

pub struct ArcFaceEncoder {
    session: Session,
}

impl ArcFaceEncoder {
    /// Load the ArcFace ONNX model from the given path.
    pub fn load(model_path: &Path) -> Result<Self, EncoderError> {
        if !model_path.exists() {
            return Err(EncoderError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            inputs = ?session.inputs().iter().map(|i| i.name()).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded ArcFace model"
        );

        Ok(Self { session })
    }

    /// Preprocess a 112x112 grayscale crop into a NCHW float tensor.
    fn preprocess(face: &GrayImage) -> Array4<f32> {
        let size = ARCFACE_INPUT_SIZE;
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));

        for (x, y, pixel) in face.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            if x >= size || y >= size {
                continue;
            }
            let normalized = (pixel.0[0] as f32 - ARCFACE_MEAN) / ARCFACE_STD;
            // Grayscale → 3-channel: replicate Y
            tensor[[0, 0, y, x]] = normalized;
            tensor[[0, 1, y, x]] = normalized;
            tensor[[0, 2, y, x]] = normalized;
        }

        tensor
    }
}

impl FaceEncoder for ArcFaceEncoder {
    fn encode(&mut self, face: &GrayImage) -> Result<Encoding, EncoderError> {
        if face.width() == 0 || face.height() == 0 {
            return Err(EncoderError::EmptyCrop);
        }
        let size = ARCFACE_INPUT_SIZE as u32;
        let resized = imageops::resize(face, size, size, FilterType::Triangle);
        let input = Self::preprocess(&resized);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw_data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EncoderError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw_data.len() != ARCFACE_EMBEDDING_DIM {
            return Err(EncoderError::InferenceFailed(format!(
                "expected {ARCFACE_EMBEDDING_DIM}-dim embedding, got {}",
                raw_data.len()
            )));
        }

        Ok(Encoding::new(l2_normalize(raw_data)))
    }

    fn dimension(&self) -> usize {
        ARCFACE_EMBEDDING_DIM
    }

    fn name(&self) -> &'static str {
        "arcface"
    }

    fn default_threshold(&self) -> f32 {
        ARCFACE_MATCH_THRESHOLD
    }

    fn max_distance(&self) -> Option<f32> {
        Some(ARCFACE_MAX_DISTANCE)
    }
}

fn l2_normalize(raw: &[f32]) -> Vec<f32> {
    let norm: f32 = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        raw.iter().map(|x| x / norm).collect()
    } else {
        raw.to_vec()
    }
}
