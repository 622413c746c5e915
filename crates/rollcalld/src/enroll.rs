use rollcall_core::enrollment::EnrollmentError;
use rollcall_core::{
    AbortReason, CaptureStatus, Enrollment, EnrollmentSession, EnrollmentSettings,
    EnrollmentState, FaceDetector, FaceEncoder,
};
use rollcall_hw::{CameraError, FrameSource, SourceStatus};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EnrollError {
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("enrollment error: {0}")]
    Session(#[from] EnrollmentError),
}

#[derive(Debug)]
pub enum EnrollOutcome {
    Completed(Enrollment),
    /// Aborted; nothing may be persisted.
    Stopped { captured: usize, reason: AbortReason },
}

/// Drive an enrollment session against a live frame source.
///
/// Starts the source, feeds each new frame's detections to the session and
/// stops the source as soon as the session completes or aborts. `cancel`
/// is polled once per tick.
#[allow(clippy::too_many_arguments)]
pub fn run_enrollment(
    source: &FrameSource,
    device_index: u32,
    detector: &mut FaceDetector,
    encoder: &mut dyn FaceEncoder,
    settings: EnrollmentSettings,
    interval: Duration,
    cancel: &AtomicBool,
    mut on_status: impl FnMut(CaptureStatus),
) -> Result<EnrollOutcome, EnrollError> {
    let mut session = EnrollmentSession::new(settings);
    source.start(device_index)?;
    session.begin()?;
    tracing::info!(device = device_index, target = session.target(), "enrollment started");

    let mut last_sequence = None;
    loop {
        if cancel.load(Ordering::SeqCst) {
            session.cancel();
            break;
        }
        if let SourceStatus::Degraded { reason, .. } = source.status() {
            session.device_failed(reason);
            break;
        }

        if let Some(frame) = source.latest_frame() {
            if last_sequence != Some(frame.sequence) {
                last_sequence = Some(frame.sequence);
                match detector.detect(&frame.luma(), frame.width, frame.height) {
                    Ok(faces) => {
                        let status = session.observe(faces)?;
                        on_status(status);
                        if status == CaptureStatus::Complete {
                            source.stop();
                            let enrollment = session.finalize(encoder)?;
                            tracing::info!(
                                samples = enrollment.samples_captured,
                                "enrollment complete"
                            );
                            return Ok(EnrollOutcome::Completed(enrollment));
                        }
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, sequence = frame.sequence, "detection failed");
                    }
                }
            }
        }

        thread::sleep(interval);
    }

    source.stop();
    match session.state().clone() {
        EnrollmentState::Stopped { captured, reason } => {
            Ok(EnrollOutcome::Stopped { captured, reason })
        }
        other => Err(EnrollError::Session(EnrollmentError::InvalidState {
            action: "stop",
            state: other.to_string(),
        })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{face_at, scripted_detector, FakeProvider};
    use rollcall_core::PixelEncoder;
    use rollcall_hw::SourceSettings;
    use std::sync::Arc;

    fn source(failing: bool) -> FrameSource {
        FrameSource::with_settings(
            Arc::new(FakeProvider { failing }),
            SourceSettings {
                frame_interval: Duration::from_millis(2),
                ..SourceSettings::default()
            },
        )
    }

    fn settings(target: usize) -> EnrollmentSettings {
        EnrollmentSettings {
            target_samples: target,
            blur_threshold: None,
        }
    }

    #[test]
    fn test_completes_and_stops_source() {
        let source = source(false);
        let (mut detector, _) = scripted_detector(vec![face_at(10.0, 10.0)]);
        let mut encoder = PixelEncoder::new();
        let mut statuses = Vec::new();

        let outcome = run_enrollment(
            &source,
            0,
            &mut detector,
            &mut encoder,
            settings(3),
            Duration::from_millis(3),
            &AtomicBool::new(false),
            |s| statuses.push(s),
        )
        .unwrap();

        let EnrollOutcome::Completed(enrollment) = outcome else {
            panic!("expected completion, got {outcome:?}");
        };
        assert_eq!(enrollment.samples_captured, 3);
        assert_eq!(enrollment.encoding.len(), 128 * 128);
        assert_eq!(enrollment.representative.dimensions(), (120, 120));
        assert_eq!(statuses.last(), Some(&CaptureStatus::Complete));
        assert!(!source.is_running());
    }

    #[test]
    fn test_cancel_persists_nothing() {
        let source = source(false);
        let (mut detector, _) = scripted_detector(vec![face_at(10.0, 10.0)]);
        let mut encoder = PixelEncoder::new();

        let outcome = run_enrollment(
            &source,
            0,
            &mut detector,
            &mut encoder,
            settings(80),
            Duration::from_millis(3),
            &AtomicBool::new(true),
            |_| {},
        )
        .unwrap();

        assert!(matches!(
            outcome,
            EnrollOutcome::Stopped { captured: 0, reason: AbortReason::Cancelled }
        ));
        assert!(!source.is_running());
    }

    #[test]
    fn test_multiple_faces_never_sampled() {
        let source = source(false);
        let (mut detector, _) =
            scripted_detector(vec![face_at(10.0, 10.0), face_at(70.0, 60.0)]);
        let mut encoder = PixelEncoder::new();
        let cancel = AtomicBool::new(false);
        let mut seen = 0;

        let outcome = run_enrollment(
            &source,
            0,
            &mut detector,
            &mut encoder,
            settings(2),
            Duration::from_millis(3),
            &cancel,
            |s| {
                assert_eq!(s, CaptureStatus::MultipleFaces);
                seen += 1;
                if seen == 5 {
                    cancel.store(true, Ordering::SeqCst);
                }
            },
        )
        .unwrap();

        assert!(matches!(outcome, EnrollOutcome::Stopped { captured: 0, .. }));
    }

    #[test]
    fn test_device_failure_stops_session() {
        let source = source(true);
        let (mut detector, _) = scripted_detector(vec![face_at(10.0, 10.0)]);
        let mut encoder = PixelEncoder::new();

        let outcome = run_enrollment(
            &source,
            0,
            &mut detector,
            &mut encoder,
            settings(5),
            Duration::from_millis(3),
            &AtomicBool::new(false),
            |_| {},
        )
        .unwrap();

        assert!(matches!(
            outcome,
            EnrollOutcome::Stopped { reason: AbortReason::DeviceFailure(_), .. }
        ));
    }
}
