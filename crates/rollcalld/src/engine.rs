use rollcall_core::{
    Admission, AttendanceEvent, CooldownGate, EventSink, FaceDetector, FaceEncoder, MatchIndex,
    MatchOutcome, Repository, RepositoryError, SubjectId,
};
use rollcall_hw::{Frame, FrameSource};
use std::collections::HashMap;
use std::fmt;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc as tokio_mpsc, watch};

/// Transient per-frame outcome published to observers. Never persisted.
#[derive(Debug, Clone, PartialEq)]
pub enum LoopStatus {
    Idle,
    NoFace,
    /// Nearest match did not clear the threshold (`None`: nothing comparable).
    Unknown { distance: Option<f32> },
    /// Matched, but not yet for enough consecutive frames.
    Confirming {
        subject: SubjectId,
        seen: u32,
        required: u32,
    },
    Recognized {
        subject: SubjectId,
        display_name: String,
    },
    CoolingDown {
        subject: SubjectId,
        remaining: chrono::Duration,
    },
}

impl fmt::Display for LoopStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoopStatus::Idle => write!(f, "idle"),
            LoopStatus::NoFace => write!(f, "no face"),
            LoopStatus::Unknown { distance: Some(d) } => write!(f, "unknown (distance {d:.4})"),
            LoopStatus::Unknown { distance: None } => write!(f, "unknown"),
            LoopStatus::Confirming { subject, seen, required } => {
                write!(f, "confirming subject {subject} ({seen}/{required})")
            }
            LoopStatus::Recognized { subject, display_name } => {
                write!(f, "recognized {display_name} (subject {subject})")
            }
            LoopStatus::CoolingDown { subject, remaining } => {
                write!(f, "subject {subject} cooling down, {}s left", remaining.num_seconds())
            }
        }
    }
}

impl LoopStatus {
    fn rank(&self) -> u8 {
        match self {
            LoopStatus::Idle => 0,
            LoopStatus::NoFace => 1,
            LoopStatus::Unknown { .. } => 2,
            LoopStatus::Confirming { .. } => 3,
            LoopStatus::CoolingDown { .. } => 4,
            LoopStatus::Recognized { .. } => 5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecognitionSettings {
    /// Pause between polls of the latest frame.
    pub interval: Duration,
    /// Consecutive processed frames a subject must be matched in.
    pub stability_frames: u32,
    /// Minimum gap between reload attempts while the index is empty.
    pub index_retry: Duration,
}

impl Default for RecognitionSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(100),
            stability_frames: 1,
            index_retry: Duration::from_secs(10),
        }
    }
}

/// Forwards accepted events into an async channel for persistence.
pub struct ChannelSink {
    tx: tokio_mpsc::UnboundedSender<AttendanceEvent>,
}

impl ChannelSink {
    pub fn new(tx: tokio_mpsc::UnboundedSender<AttendanceEvent>) -> Self {
        Self { tx }
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: AttendanceEvent) {
        if let Err(e) = self.tx.send(event) {
            tracing::warn!(subject = %e.0.subject_id, "event receiver closed; attendance event dropped");
        }
    }
}

/// Detect → encode → match → cooldown → emit, one frame at a time.
pub struct RecognitionLoop {
    detector: FaceDetector,
    encoder: Box<dyn FaceEncoder>,
    index: Arc<MatchIndex>,
    gate: Arc<CooldownGate>,
    repository: Arc<dyn Repository>,
    sink: Arc<dyn EventSink>,
    settings: RecognitionSettings,
    streaks: HashMap<SubjectId, u32>,
    last_sequence: Option<u64>,
    last_index_retry: Option<Instant>,
}

impl RecognitionLoop {
    pub fn new(
        detector: FaceDetector,
        encoder: Box<dyn FaceEncoder>,
        index: Arc<MatchIndex>,
        gate: Arc<CooldownGate>,
        repository: Arc<dyn Repository>,
        sink: Arc<dyn EventSink>,
        settings: RecognitionSettings,
    ) -> Self {
        Self {
            detector,
            encoder,
            index,
            gate,
            repository,
            sink,
            settings: RecognitionSettings {
                stability_frames: settings.stability_frames.max(1),
                ..settings
            },
            streaks: HashMap::new(),
            last_sequence: None,
            last_index_retry: None,
        }
    }

    /// Process one frame. Returns `None` when the frame was already seen.
    ///
    /// Every detected face goes through its own match and cooldown check.
    /// The returned status is the most significant outcome in the frame.
    pub fn process_frame(&mut self, frame: &Frame) -> Option<LoopStatus> {
        if self.last_sequence == Some(frame.sequence) {
            return None;
        }
        self.last_sequence = Some(frame.sequence);

        let faces = match self.detector.detect(&frame.luma(), frame.width, frame.height) {
            Ok(faces) => faces,
            Err(e) => {
                tracing::debug!(error = %e, sequence = frame.sequence, "detection failed");
                return Some(LoopStatus::Idle);
            }
        };

        if !faces.is_empty() {
            self.retry_empty_index();
        }

        let mut present: HashMap<SubjectId, u32> = HashMap::new();
        let mut status = if faces.is_empty() {
            LoopStatus::NoFace
        } else {
            LoopStatus::Unknown { distance: None }
        };

        for face in &faces {
            let encoding = match self.encoder.encode(&face.crop) {
                Ok(encoding) => encoding,
                Err(e) => {
                    tracing::debug!(error = %e, "encoding failed for face");
                    continue;
                }
            };

            let face_status = match self.index.match_nearest(&encoding) {
                MatchOutcome::Empty | MatchOutcome::NonComparable => {
                    LoopStatus::Unknown { distance: None }
                }
                MatchOutcome::Nearest(m) if !m.accepted => LoopStatus::Unknown {
                    distance: Some(m.distance),
                },
                MatchOutcome::Nearest(m) => {
                    if present.contains_key(&m.subject_id) {
                        continue;
                    }
                    let seen = self.streaks.get(&m.subject_id).copied().unwrap_or(0) + 1;
                    present.insert(m.subject_id, seen);
                    if seen < self.settings.stability_frames {
                        LoopStatus::Confirming {
                            subject: m.subject_id,
                            seen,
                            required: self.settings.stability_frames,
                        }
                    } else {
                        self.admit(m.subject_id, m.display_name, m.distance)
                    }
                }
            };

            if face_status.rank() > status.rank() {
                status = face_status;
            }
        }

        // Subjects absent from this frame lose their streak.
        self.streaks = present;
        Some(status)
    }

    /// An empty index may be the result of a failed load; try the
    /// repository again, at most once per `index_retry`.
    fn retry_empty_index(&mut self) {
        if !self.index.is_empty() {
            return;
        }
        let now = Instant::now();
        if let Some(last) = self.last_index_retry {
            if now.duration_since(last) < self.settings.index_retry {
                return;
            }
        }
        self.last_index_retry = Some(now);
        if let Ok(n) = self.index.reload_from(self.repository.as_ref()) {
            if n > 0 {
                tracing::info!(subjects = n, "match index loaded");
            }
        }
    }

    fn admit(&self, subject: SubjectId, display_name: String, distance: f32) -> LoopStatus {
        match self.gate.try_accept(subject) {
            Admission::Accepted { at } => {
                tracing::info!(
                    subject = %subject,
                    name = %display_name,
                    distance,
                    "attendance recorded"
                );
                self.sink.emit(AttendanceEvent {
                    subject_id: subject,
                    timestamp: at,
                });
                LoopStatus::Recognized {
                    subject,
                    display_name,
                }
            }
            Admission::Rejected { remaining } => LoopStatus::CoolingDown { subject, remaining },
        }
    }

    /// Run on a dedicated thread, polling the source's latest frame.
    pub fn spawn(mut self, source: Arc<FrameSource>) -> RecognitionHandle {
        let (status_tx, status_rx) = watch::channel(LoopStatus::Idle);
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let index = Arc::clone(&self.index);
        let repository = Arc::clone(&self.repository);
        let interval = self.settings.interval;

        let thread = std::thread::Builder::new()
            .name("rollcall-recognition".into())
            .spawn(move || {
                tracing::info!(
                    backend = self.detector.backend_name(),
                    encoder = self.encoder.name(),
                    subjects = self.index.len(),
                    "recognition loop started"
                );
                loop {
                    let status = match source.latest_frame() {
                        Some(frame) => self.process_frame(&frame),
                        None => Some(LoopStatus::Idle),
                    };
                    if let Some(status) = status {
                        status_tx.send_if_modified(|current| {
                            if *current == status {
                                return false;
                            }
                            tracing::trace!(?status, "recognition status");
                            *current = status;
                            true
                        });
                    }
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                tracing::info!("recognition loop exiting");
            })
            .expect("failed to spawn recognition thread");

        RecognitionHandle {
            stop_tx: Some(stop_tx),
            thread: Some(thread),
            status: status_rx,
            index,
            repository,
        }
    }
}

/// Owner-side handle to a running recognition loop.
pub struct RecognitionHandle {
    stop_tx: Option<mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
    status: watch::Receiver<LoopStatus>,
    index: Arc<MatchIndex>,
    repository: Arc<dyn Repository>,
}

impl RecognitionHandle {
    pub fn status(&self) -> watch::Receiver<LoopStatus> {
        self.status.clone()
    }

    pub fn reload_index(&self) -> Result<usize, RepositoryError> {
        self.index.reload_from(self.repository.as_ref())
    }

    /// Stop the loop and wait for the thread. The loop, and with it the
    /// event sink, is dropped before this returns.
    pub fn stop(&mut self) {
        drop(self.stop_tx.take());
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("recognition thread panicked");
            }
        }
    }
}

impl Drop for RecognitionHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
