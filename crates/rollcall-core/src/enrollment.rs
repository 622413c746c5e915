//! Guided multi-sample enrollment as a pure state machine.
//!
//! The session consumes detection results one frame at a time. It owns no
//! camera and no timer; a driver feeds it and stops acquisition once it
//! reports `Complete`.

use crate::encoder::{EncoderError, FaceEncoder};
use crate::quality::laplacian_variance;
use crate::types::{DetectedFace, Encoding};
use image::GrayImage;
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EnrollmentError {
    #[error("cannot {action} while {state}")]
    InvalidState { action: &'static str, state: String },
    #[error("encoding failed: {0}")]
    Encoder(#[from] EncoderError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    Cancelled,
    DeviceFailure(String),
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::Cancelled => write!(f, "cancelled"),
            AbortReason::DeviceFailure(reason) => write!(f, "device failure: {reason}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnrollmentState {
    Idle,
    Capturing,
    Completed,
    /// Aborted mid-capture. Nothing is finalized.
    Stopped { captured: usize, reason: AbortReason },
}

impl fmt::Display for EnrollmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnrollmentState::Idle => write!(f, "idle"),
            EnrollmentState::Capturing => write!(f, "capturing"),
            EnrollmentState::Completed => write!(f, "completed"),
            EnrollmentState::Stopped { captured, reason } => {
                write!(f, "stopped ({reason}) after {captured} samples")
            }
        }
    }
}

/// Per-frame feedback while capturing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureStatus {
    Sampled { captured: usize, target: usize },
    NoFace,
    MultipleFaces,
    TooBlurry,
    /// The target was reached with this frame.
    Complete,
}

#[derive(Debug, Clone)]
pub struct EnrollmentSettings {
    pub target_samples: usize,
    /// Minimum Laplacian variance for a sample. `None` disables the gate.
    pub blur_threshold: Option<f64>,
}

impl Default for EnrollmentSettings {
    fn default() -> Self {
        Self {
            target_samples: 80,
            blur_threshold: None,
        }
    }
}

/// A finalized enrollment: the encoding to store and the crop it came from.
#[derive(Debug, Clone)]
pub struct Enrollment {
    pub encoding: Encoding,
    pub representative: GrayImage,
    pub samples_captured: usize,
}

pub struct EnrollmentSession {
    settings: EnrollmentSettings,
    state: EnrollmentState,
    samples: Vec<GrayImage>,
}

impl EnrollmentSession {
    pub fn new(settings: EnrollmentSettings) -> Self {
        let target = settings.target_samples.max(1);
        Self {
            settings: EnrollmentSettings {
                target_samples: target,
                ..settings
            },
            state: EnrollmentState::Idle,
            samples: Vec::with_capacity(target),
        }
    }

    pub fn state(&self) -> &EnrollmentState {
        &self.state
    }

    pub fn captured(&self) -> usize {
        match &self.state {
            EnrollmentState::Stopped { captured, .. } => *captured,
            _ => self.samples.len(),
        }
    }

    pub fn target(&self) -> usize {
        self.settings.target_samples
    }

    pub fn begin(&mut self) -> Result<(), EnrollmentError> {
        if self.state != EnrollmentState::Idle {
            return Err(self.invalid("begin"));
        }
        self.state = EnrollmentState::Capturing;
        tracing::debug!(target = self.target(), "enrollment capture started");
        Ok(())
    }

    /// Feed the detections of one frame.
    pub fn observe(&mut self, faces: Vec<DetectedFace>) -> Result<CaptureStatus, EnrollmentError> {
        if self.state != EnrollmentState::Capturing {
            return Err(self.invalid("observe a frame"));
        }

        if faces.len() > 1 {
            return Ok(CaptureStatus::MultipleFaces);
        }
        let Some(face) = faces.into_iter().next() else {
            return Ok(CaptureStatus::NoFace);
        };

        if let Some(min_sharpness) = self.settings.blur_threshold {
            let sharpness = laplacian_variance(&face.crop);
            if sharpness < min_sharpness {
                tracing::trace!(sharpness, min_sharpness, "sample rejected as blurry");
                return Ok(CaptureStatus::TooBlurry);
            }
        }

        self.samples.push(face.crop);
        let captured = self.samples.len();
        if captured >= self.target() {
            self.state = EnrollmentState::Completed;
            tracing::debug!(captured, "enrollment capture complete");
            return Ok(CaptureStatus::Complete);
        }
        Ok(CaptureStatus::Sampled {
            captured,
            target: self.target(),
        })
    }

    /// Manual abort. Returns false if the session had already finished.
    pub fn cancel(&mut self) -> bool {
        self.abort(AbortReason::Cancelled)
    }

    /// The frame source failed mid-capture.
    pub fn device_failed(&mut self, reason: impl Into<String>) -> bool {
        self.abort(AbortReason::DeviceFailure(reason.into()))
    }

    /// Encode the temporal midpoint sample. Only valid once `Completed`.
    pub fn finalize(self, encoder: &mut dyn FaceEncoder) -> Result<Enrollment, EnrollmentError> {
        if self.state != EnrollmentState::Completed {
            return Err(self.invalid("finalize"));
        }
        let samples_captured = self.samples.len();
        let Some(representative) = self.samples.into_iter().nth(samples_captured / 2) else {
            return Err(EnrollmentError::InvalidState {
                action: "finalize",
                state: "completed without samples".into(),
            });
        };
        let encoding = encoder.encode(&representative)?;
        Ok(Enrollment {
            encoding,
            representative,
            samples_captured,
        })
    }

    fn abort(&mut self, reason: AbortReason) -> bool {
        match self.state {
            EnrollmentState::Idle | EnrollmentState::Capturing => {
                let captured = self.samples.len();
                self.samples.clear();
                tracing::info!(captured, %reason, "enrollment stopped");
                self.state = EnrollmentState::Stopped { captured, reason };
                true
            }
            EnrollmentState::Completed | EnrollmentState::Stopped { .. } => false,
        }
    }

    fn invalid(&self, action: &'static str) -> EnrollmentError {
        EnrollmentError::InvalidState {
            action,
            state: self.state.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::PixelEncoder;
    use crate::types::Rect;
    use image::Luma;

    fn face(shade: u8) -> DetectedFace {
        DetectedFace {
            rect: Rect { x: 0, y: 0, width: 8, height: 8 },
            confidence: 0.9,
            crop: GrayImage::from_fn(8, 8, |x, y| {
                Luma([shade.wrapping_add(((x + y) % 2 * 100) as u8)])
            }),
        }
    }

    fn session(target: usize) -> EnrollmentSession {
        let mut s = EnrollmentSession::new(EnrollmentSettings {
            target_samples: target,
            blur_threshold: None,
        });
        s.begin().unwrap();
        s
    }

    #[test]
    fn test_completes_after_exactly_target_frames() {
        let mut s = session(80);
        for i in 1..80 {
            let status = s.observe(vec![face(i as u8)]).unwrap();
            assert_eq!(status, CaptureStatus::Sampled { captured: i, target: 80 });
            assert!(s.captured() <= s.target());
        }
        assert_eq!(s.observe(vec![face(80)]).unwrap(), CaptureStatus::Complete);
        assert_eq!(s.state(), &EnrollmentState::Completed);
        assert_eq!(s.captured(), 80);
        assert!(s.observe(vec![face(81)]).is_err());
        assert_eq!(s.captured(), 80);
    }

    #[test]
    fn test_multiple_faces_take_no_sample() {
        let mut s = session(5);
        s.observe(vec![face(1)]).unwrap();
        assert_eq!(
            s.observe(vec![face(2), face(3)]).unwrap(),
            CaptureStatus::MultipleFaces
        );
        assert_eq!(s.captured(), 1);
        assert_eq!(s.state(), &EnrollmentState::Capturing);
    }

    #[test]
    fn test_no_face_takes_no_sample() {
        let mut s = session(5);
        assert_eq!(s.observe(vec![]).unwrap(), CaptureStatus::NoFace);
        assert_eq!(s.captured(), 0);
    }

    #[test]
    fn test_blurry_sample_rejected() {
        let mut s = EnrollmentSession::new(EnrollmentSettings {
            target_samples: 3,
            blur_threshold: Some(50.0),
        });
        s.begin().unwrap();
        let flat = DetectedFace {
            crop: GrayImage::from_pixel(8, 8, Luma([90])),
            ..face(0)
        };
        assert_eq!(s.observe(vec![flat]).unwrap(), CaptureStatus::TooBlurry);
        assert_eq!(
            s.observe(vec![face(0)]).unwrap(),
            CaptureStatus::Sampled { captured: 1, target: 3 }
        );
    }

    #[test]
    fn test_observe_before_begin_is_error() {
        let mut s = EnrollmentSession::new(EnrollmentSettings::default());
        assert!(matches!(
            s.observe(vec![face(1)]),
            Err(EnrollmentError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_cancel_reports_partial_count() {
        let mut s = session(10);
        for i in 0..4 {
            s.observe(vec![face(i)]).unwrap();
        }
        assert!(s.cancel());
        assert_eq!(
            s.state(),
            &EnrollmentState::Stopped { captured: 4, reason: AbortReason::Cancelled }
        );
        assert_eq!(s.captured(), 4);
        assert!(!s.cancel());

        let mut encoder = PixelEncoder::new();
        assert!(s.finalize(&mut encoder).is_err());
    }

    #[test]
    fn test_device_failure_stops_session() {
        let mut s = session(10);
        s.observe(vec![face(1)]).unwrap();
        assert!(s.device_failed("3 consecutive read failures"));
        assert!(matches!(
            s.state(),
            EnrollmentState::Stopped { captured: 1, reason: AbortReason::DeviceFailure(_) }
        ));
    }

    #[test]
    fn test_finalize_before_complete_is_error() {
        let mut s = session(3);
        s.observe(vec![face(1)]).unwrap();
        let mut encoder = PixelEncoder::new();
        assert!(matches!(
            s.finalize(&mut encoder),
            Err(EnrollmentError::InvalidState { action: "finalize", .. })
        ));
    }

    #[test]
    fn test_finalize_encodes_midpoint_sample() {
        let mut s = session(5);
        for shade in [10u8, 20, 30, 40, 50] {
            s.observe(vec![face(shade)]).unwrap();
        }
        let mut encoder = PixelEncoder::new();
        let enrollment = s.finalize(&mut encoder).unwrap();

        let expected = face(30).crop;
        assert_eq!(enrollment.samples_captured, 5);
        assert_eq!(enrollment.representative, expected);
        assert_eq!(enrollment.encoding, encoder.encode(&expected).unwrap());
    }

    #[test]
    fn test_begin_twice_is_error() {
        let mut s = session(3);
        assert!(s.begin().is_err());
    }
}
