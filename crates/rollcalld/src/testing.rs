//! Fakes shared by the daemon's tests.

use rollcall_core::detector::{BackendKind, Candidate, DetectionBackend, DetectorError};
use rollcall_core::{DetectorSettings, FaceDetector};
use rollcall_hw::{CameraError, CaptureDevice, DeviceProvider, Frame};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

pub const FRAME_WIDTH: u32 = 200;
pub const FRAME_HEIGHT: u32 = 200;

/// Deterministic gray gradient, identical for every frame.
pub fn gradient_frame() -> Frame {
    let data = (0..FRAME_HEIGHT)
        .flat_map(|y| (0..FRAME_WIDTH).map(move |x| ((x * 3 + y * 5) % 251) as u8))
        .collect();
    Frame::gray(data, FRAME_WIDTH, FRAME_HEIGHT).unwrap()
}

/// Backend returning whatever candidate list is currently scripted.
pub struct FixedBackend {
    pub candidates: Arc<Mutex<Vec<Candidate>>>,
}

impl DetectionBackend for FixedBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Primary
    }

    fn name(&self) -> &'static str {
        "fixed"
    }

    fn locate(&mut self, _: &[u8], _: u32, _: u32) -> Result<Vec<Candidate>, DetectorError> {
        Ok(self.candidates.lock().unwrap().clone())
    }
}

pub fn face_at(x: f32, y: f32) -> Candidate {
    Candidate { x, y, width: 120.0, height: 120.0, confidence: 0.95 }
}

/// Detector whose candidates can be swapped while it runs.
pub fn scripted_detector(candidates: Vec<Candidate>) -> (FaceDetector, Arc<Mutex<Vec<Candidate>>>) {
    let script = Arc::new(Mutex::new(candidates));
    let detector = FaceDetector::with_backend(
        Box::new(FixedBackend { candidates: Arc::clone(&script) }),
        DetectorSettings::default(),
    );
    (detector, script)
}

/// Camera yielding `gradient_frame()`, or failing every read.
pub struct FakeCamera {
    failing: bool,
}

impl CaptureDevice for FakeCamera {
    fn read_frame(&mut self) -> Result<Frame, CameraError> {
        thread::sleep(Duration::from_millis(1));
        if self.failing {
            return Err(CameraError::CaptureFailed("fake read error".into()));
        }
        Ok(gradient_frame())
    }
}

#[derive(Default)]
pub struct FakeProvider {
    pub failing: bool,
}

impl DeviceProvider for FakeProvider {
    fn open(&self, _index: u32) -> Result<Box<dyn CaptureDevice>, CameraError> {
        Ok(Box::new(FakeCamera { failing: self.failing }))
    }
}

pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    cond()
}
