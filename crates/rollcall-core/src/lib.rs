//! rollcall-core — face detection, encoding and matching for attendance.
//!
//! Detection runs SCRFD via ONNX Runtime when its model is present and falls
//! back to a SeetaFace cascade otherwise. Everything operates on grayscale
//! luma buffers; camera access lives in `rollcall-hw`.

pub mod arcface;
pub mod cascade;
pub mod cooldown;
pub mod detector;
pub mod encoder;
pub mod enrollment;
pub mod index;
pub mod quality;
pub mod repository;
pub mod scrfd;
pub mod types;

pub use cooldown::{Admission, Clock, CooldownGate, SystemClock};
pub use detector::{BackendKind, DetectorModels, DetectorSettings, FaceDetector};
pub use encoder::{select_encoder, EncoderKind, FaceEncoder, PixelEncoder};
pub use enrollment::{
    AbortReason, CaptureStatus, Enrollment, EnrollmentSession, EnrollmentSettings,
    EnrollmentState,
};
pub use index::{MatchIndex, MatchOutcome, NearestMatch};
pub use repository::{EventSink, Repository, RepositoryError};
pub use types::{AttendanceEvent, DetectedFace, Encoding, Rect, SubjectId, SubjectRecord};

use std::path::PathBuf;

/// File names of the model artifacts inside the model directory.
pub const SCRFD_MODEL_FILE: &str = "det_10g.onnx";
pub const CASCADE_MODEL_FILE: &str = "seeta_fd_frontal_v1.0.bin";
pub const ARCFACE_MODEL_FILE: &str = "w600k_r50.onnx";

/// Default model directory: `$XDG_DATA_HOME/rollcall/models`.
pub fn default_model_dir() -> PathBuf {
    data_home().join("rollcall").join("models")
}

/// `$XDG_DATA_HOME`, else `$HOME/.local/share`.
pub fn data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
}
