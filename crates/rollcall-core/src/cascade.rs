//! SeetaFace funnel-cascade detector via `rustface` (fallback backend).
//!
//! The cascade has no calibrated confidence, so every detection is reported
//! with a fixed nominal score.

use crate::detector::{BackendKind, Candidate, DetectionBackend, DetectorError};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

/// Confidence assigned to every cascade hit.
pub const CASCADE_NOMINAL_CONFIDENCE: f32 = 0.9;

const CASCADE_MIN_FACE_SIZE: u32 = 40;
const CASCADE_SCORE_THRESHOLD: f64 = 2.0;
const CASCADE_PYRAMID_SCALE: f32 = 0.8;
const CASCADE_WINDOW_STEP: u32 = 4;

pub struct CascadeBackend {
    model: rustface::Model,
}

impl CascadeBackend {
    /// Load a SeetaFace model file (e.g. `seeta_fd_frontal_v1.0.bin`).
    pub fn load(model_path: &Path) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }
        let file = File::open(model_path).map_err(|e| {
            DetectorError::ModelUnavailable(format!("{}: {e}", model_path.display()))
        })?;
        let model = rustface::read_model(BufReader::new(file)).map_err(|e| {
            DetectorError::ModelUnavailable(format!("{}: {e}", model_path.display()))
        })?;

        tracing::info!(path = %model_path.display(), "loaded SeetaFace cascade model");
        Ok(Self { model })
    }
}

impl DetectionBackend for CascadeBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Fallback
    }

    fn name(&self) -> &'static str {
        "seetaface-cascade"
    }

    fn locate(
        &mut self,
        luma: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<Candidate>, DetectorError> {
        // Detectors are cheap to build from a loaded model and carry per-run state.
        let mut detector = rustface::create_detector_with_model(self.model.clone());
        detector.set_min_face_size(CASCADE_MIN_FACE_SIZE);
        detector.set_score_thresh(CASCADE_SCORE_THRESHOLD);
        detector.set_pyramid_scale_factor(CASCADE_PYRAMID_SCALE);
        detector.set_slide_window_step(CASCADE_WINDOW_STEP, CASCADE_WINDOW_STEP);

        let faces = detector.detect(&rustface::ImageData::new(luma, width, height));

        Ok(faces
            .iter()
            .map(|face| {
                let bbox = face.bbox();
                Candidate {
                    x: bbox.x() as f32,
                    y: bbox.y() as f32,
                    width: bbox.width() as f32,
                    height: bbox.height() as f32,
                    confidence: CASCADE_NOMINAL_CONFIDENCE,
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_missing_model() {
        let err = CascadeBackend::load(Path::new("/nonexistent/seeta.bin")).err().unwrap();
        assert!(matches!(err, DetectorError::ModelNotFound(_)));
    }
}
