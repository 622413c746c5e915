//! Continuous frame acquisition on a dedicated thread.
//!
//! `FrameSource` owns one capture device at a time, pulls frames at a target
//! cadence and republishes each one through a single-slot "latest frame"
//! handoff (last writer wins, unread frames are dropped) plus zero or more
//! synchronous subscriber callbacks.
//!
//! Stop guarantees: once `stop()` returns, no subscriber callback fires again
//! for that run, even when the device read is still blocked in the driver and
//! the thread has to be abandoned after the grace period.

use crate::camera::CameraError;
use crate::frame::Frame;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

/// A device that yields frames with blocking reads.
pub trait CaptureDevice: Send {
    fn read_frame(&mut self) -> Result<Frame, CameraError>;

    /// Human-readable name for logs.
    fn describe(&self) -> String {
        "capture device".to_string()
    }
}

/// Opens capture devices by index. Implemented by `V4lProvider` for real
/// hardware and by fakes in tests.
pub trait DeviceProvider: Send + Sync {
    fn open(&self, index: u32) -> Result<Box<dyn CaptureDevice>, CameraError>;
}

pub type FrameCallback = Arc<dyn Fn(&Arc<Frame>) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceStatus {
    Stopped,
    Running { device_index: u32 },
    /// The acquisition loop stopped itself after repeated read failures.
    Degraded { device_index: u32, reason: String },
}

/// Acquisition loop tuning.
#[derive(Debug, Clone)]
pub struct SourceSettings {
    /// Target interval between frame pulls (~30 Hz).
    pub frame_interval: Duration,
    /// Consecutive read failures that mark the source degraded.
    pub max_consecutive_failures: u32,
    /// How long `stop()` waits for an in-flight read before abandoning the thread.
    pub stop_grace: Duration,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            frame_interval: Duration::from_millis(33),
            max_consecutive_failures: 3,
            stop_grace: Duration::from_secs(1),
        }
    }
}

struct Shared {
    latest: Mutex<Option<Arc<Frame>>>,
    subscribers: Mutex<Vec<(SubscriptionId, FrameCallback)>>,
    /// Held while a frame is being published; `stop()` takes it to fence
    /// out in-flight callbacks.
    dispatch: Mutex<()>,
    status: Mutex<SourceStatus>,
    /// Acquisition thread id and its run flag, for stop() calls made from a callback.
    capture_thread: Mutex<Option<(ThreadId, Arc<AtomicBool>)>>,
    next_subscription: AtomicU64,
    sequence: AtomicU64,
}

impl Shared {
    /// Publish a frame unless the run has been cancelled. Returns false when cancelled.
    fn publish(&self, frame: Arc<Frame>, alive: &AtomicBool) -> bool {
        let _fence = lock(&self.dispatch);
        if !alive.load(Ordering::Acquire) {
            return false;
        }
        *lock(&self.latest) = Some(Arc::clone(&frame));

        // Snapshot so callbacks may subscribe/unsubscribe without deadlocking.
        let callbacks: Vec<FrameCallback> = lock(&self.subscribers)
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        for cb in callbacks {
            if !alive.load(Ordering::Acquire) {
                break;
            }
            cb(&frame);
        }
        true
    }

    fn set_status(&self, status: SourceStatus) {
        *lock(&self.status) = status;
    }
}

struct Worker {
    alive: Arc<AtomicBool>,
    done_rx: mpsc::Receiver<()>,
    handle: JoinHandle<()>,
}

/// Camera frame source with a background acquisition loop.
pub struct FrameSource {
    provider: Arc<dyn DeviceProvider>,
    settings: SourceSettings,
    shared: Arc<Shared>,
    worker: Mutex<Option<Worker>>,
}

impl FrameSource {
    pub fn new(provider: Arc<dyn DeviceProvider>) -> Self {
        Self::with_settings(provider, SourceSettings::default())
    }

    pub fn with_settings(provider: Arc<dyn DeviceProvider>, settings: SourceSettings) -> Self {
        Self {
            provider,
            settings,
            shared: Arc::new(Shared {
                latest: Mutex::new(None),
                subscribers: Mutex::new(Vec::new()),
                dispatch: Mutex::new(()),
                status: Mutex::new(SourceStatus::Stopped),
                capture_thread: Mutex::new(None),
                next_subscription: AtomicU64::new(1),
                sequence: AtomicU64::new(0),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Open the device and start the acquisition loop.
    ///
    /// A source that is already running is fully stopped first. Open failures
    /// are returned to the caller and leave the source stopped.
    pub fn start(&self, device_index: u32) -> Result<(), CameraError> {
        if self.on_capture_thread().is_some() {
            return Err(CameraError::CaptureFailed(
                "start() called from a frame callback".to_string(),
            ));
        }

        let mut slot = lock(&self.worker);
        if let Some(previous) = slot.take() {
            tracing::debug!("restarting frame source");
            self.shutdown(previous);
        }

        let device = match self.provider.open(device_index) {
            Ok(device) => device,
            Err(e) => {
                tracing::warn!(device_index, error = %e, "failed to open capture device");
                self.shared.set_status(SourceStatus::Stopped);
                return Err(e);
            }
        };

        let alive = Arc::new(AtomicBool::new(true));
        let (done_tx, done_rx) = mpsc::channel();
        // Set before spawning so an early degrade is not overwritten.
        self.shared.set_status(SourceStatus::Running { device_index });
        let shared = Arc::clone(&self.shared);
        let settings = self.settings.clone();
        let run_flag = Arc::clone(&alive);

        let handle = thread::Builder::new()
            .name("rollcall-capture".into())
            .spawn(move || {
                let me = thread::current().id();
                *lock(&shared.capture_thread) = Some((me, Arc::clone(&run_flag)));
                acquisition_loop(device, device_index, &shared, &settings, &run_flag);
                let mut registered = lock(&shared.capture_thread);
                if registered.as_ref().is_some_and(|(id, _)| *id == me) {
                    *registered = None;
                }
                drop(registered);
                let _ = done_tx.send(());
            })
            .map_err(|e| {
                self.shared.set_status(SourceStatus::Stopped);
                CameraError::CaptureFailed(format!("failed to spawn capture thread: {e}"))
            })?;

        tracing::info!(device_index, "frame source started");

        *slot = Some(Worker {
            alive,
            done_rx,
            handle,
        });
        Ok(())
    }

    /// Stop acquisition and release the device. Safe to call at any time,
    /// from any thread, including from inside a frame callback.
    pub fn stop(&self) {
        if let Some(alive) = self.on_capture_thread() {
            // Cannot join ourselves: cancel, and the loop releases the device
            // once the current callback returns.
            // The dispatch fence is held by this thread, so only the slot and
            // status are touched here.
            alive.store(false, Ordering::Release);
            *lock(&self.shared.latest) = None;
            self.shared.set_status(SourceStatus::Stopped);
            tracing::debug!("frame source stop requested from capture thread");
            return;
        }

        let mut slot = lock(&self.worker);
        if let Some(worker) = slot.take() {
            self.shutdown(worker);
            tracing::info!("frame source stopped");
        }
        self.shared.set_status(SourceStatus::Stopped);
    }

    /// Most recently published frame, if the source is running.
    pub fn latest_frame(&self) -> Option<Arc<Frame>> {
        lock(&self.shared.latest).clone()
    }

    pub fn status(&self) -> SourceStatus {
        lock(&self.shared.status).clone()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.status(), SourceStatus::Running { .. })
    }

    /// Register a callback invoked on the acquisition thread for every frame.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&Arc<Frame>) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.shared.next_subscription.fetch_add(1, Ordering::Relaxed));
        lock(&self.shared.subscribers).push((id, Arc::new(callback)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = lock(&self.shared.subscribers);
        let before = subscribers.len();
        subscribers.retain(|(sid, _)| *sid != id);
        subscribers.len() != before
    }

    fn on_capture_thread(&self) -> Option<Arc<AtomicBool>> {
        let current = thread::current().id();
        lock(&self.shared.capture_thread)
            .as_ref()
            .filter(|(id, _)| *id == current)
            .map(|(_, alive)| Arc::clone(alive))
    }

    fn shutdown(&self, worker: Worker) {
        worker.alive.store(false, Ordering::Release);

        {
            // Wait out any callback in progress; later publishes see the cleared flag.
            let _fence = lock(&self.shared.dispatch);
            *lock(&self.shared.latest) = None;
        }

        match worker.done_rx.recv_timeout(self.settings.stop_grace) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if worker.handle.join().is_err() {
                    tracing::warn!("capture thread panicked");
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!(
                    grace_ms = self.settings.stop_grace.as_millis() as u64,
                    "capture thread did not exit in time; abandoning in-flight read"
                );
            }
        }
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        self.stop();
    }
}

fn acquisition_loop(
    mut device: Box<dyn CaptureDevice>,
    device_index: u32,
    shared: &Shared,
    settings: &SourceSettings,
    alive: &AtomicBool,
) {
    let name = device.describe();
    tracing::debug!(device = %name, "acquisition loop running");

    let mut consecutive_failures = 0u32;
    let mut next_tick = Instant::now();

    while alive.load(Ordering::Acquire) {
        match device.read_frame() {
            Ok(mut frame) => {
                consecutive_failures = 0;
                frame.sequence = shared.sequence.fetch_add(1, Ordering::Relaxed) + 1;
                if !shared.publish(Arc::new(frame), alive) {
                    break;
                }
            }
            Err(e) => {
                consecutive_failures += 1;
                tracing::warn!(
                    device = %name,
                    error = %e,
                    consecutive_failures,
                    "frame read failed"
                );
                if consecutive_failures >= settings.max_consecutive_failures {
                    tracing::error!(
                        device = %name,
                        consecutive_failures,
                        "capture device degraded; stopping frame source"
                    );
                    {
                        let _fence = lock(&shared.dispatch);
                        alive.store(false, Ordering::Release);
                        *lock(&shared.latest) = None;
                    }
                    shared.set_status(SourceStatus::Degraded {
                        device_index,
                        reason: e.to_string(),
                    });
                    break;
                }
            }
        }

        next_tick += settings.frame_interval;
        let now = Instant::now();
        if next_tick > now {
            thread::sleep(next_tick - now);
        } else {
            next_tick = now;
        }
    }

    drop(device);
    tracing::debug!(device = %name, "capture device released");
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Yields gray frames; `fail_after` turns every read after N frames into an error.
    struct FakeDevice {
        reads: usize,
        fail_from: Option<usize>,
        fail_pattern: Vec<bool>,
        read_delay: Duration,
        released: Arc<AtomicBool>,
    }

    impl CaptureDevice for FakeDevice {
        fn read_frame(&mut self) -> Result<Frame, CameraError> {
            thread::sleep(self.read_delay);
            let n = self.reads;
            self.reads += 1;
            let fails = self.fail_from.is_some_and(|from| n >= from)
                || self.fail_pattern.get(n).copied().unwrap_or(false);
            if fails {
                return Err(CameraError::CaptureFailed("fake read error".into()));
            }
            Ok(Frame::gray(vec![n as u8; 4], 2, 2).unwrap())
        }
    }

    impl Drop for FakeDevice {
        fn drop(&mut self) {
            self.released.store(true, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct FakeProvider {
        opens: AtomicUsize,
        missing: bool,
        fail_from: Option<usize>,
        fail_pattern: Vec<bool>,
        read_delay: Duration,
        released: Mutex<Vec<Arc<AtomicBool>>>,
    }

    impl DeviceProvider for FakeProvider {
        fn open(&self, index: u32) -> Result<Box<dyn CaptureDevice>, CameraError> {
            if self.missing {
                return Err(CameraError::DeviceNotFound(format!("/dev/video{index}")));
            }
            self.opens.fetch_add(1, Ordering::SeqCst);
            let released = Arc::new(AtomicBool::new(false));
            self.released.lock().unwrap().push(Arc::clone(&released));
            Ok(Box::new(FakeDevice {
                reads: 0,
                fail_from: self.fail_from,
                fail_pattern: self.fail_pattern.clone(),
                read_delay: self.read_delay,
                released,
            }))
        }
    }

    fn fast_settings() -> SourceSettings {
        SourceSettings {
            frame_interval: Duration::from_millis(2),
            max_consecutive_failures: 3,
            stop_grace: Duration::from_millis(200),
        }
    }

    fn wait_until(timeout: Duration, cond: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        cond()
    }

    #[test]
    fn test_start_failure_is_reported() {
        let provider = Arc::new(FakeProvider {
            missing: true,
            ..Default::default()
        });
        let source = FrameSource::with_settings(provider, fast_settings());
        let err = source.start(7).unwrap_err();
        assert!(matches!(err, CameraError::DeviceNotFound(_)));
        assert_eq!(source.status(), SourceStatus::Stopped);
        assert!(source.latest_frame().is_none());
    }

    #[test]
    fn test_publishes_latest_and_notifies_subscribers() {
        let provider = Arc::new(FakeProvider::default());
        let source = FrameSource::with_settings(provider, fast_settings());
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        source.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        source.start(0).unwrap();
        assert_eq!(source.status(), SourceStatus::Running { device_index: 0 });
        assert!(wait_until(Duration::from_secs(2), || seen.load(Ordering::SeqCst) >= 3));

        let latest = source.latest_frame().expect("frame published");
        assert!(latest.sequence >= 1);
        source.stop();
        assert!(source.latest_frame().is_none());
        assert_eq!(source.status(), SourceStatus::Stopped);
    }

    #[test]
    fn test_no_callbacks_after_stop_returns() {
        let provider = Arc::new(FakeProvider::default());
        let source = FrameSource::with_settings(provider, fast_settings());
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        source.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        source.start(0).unwrap();
        assert!(wait_until(Duration::from_secs(2), || seen.load(Ordering::SeqCst) > 0));

        source.stop();
        let after_stop = seen.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(seen.load(Ordering::SeqCst), after_stop);
    }

    #[test]
    fn test_sequence_increases() {
        let provider = Arc::new(FakeProvider::default());
        let source = FrameSource::with_settings(provider, fast_settings());
        let sequences = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&sequences);
        source.subscribe(move |frame| sink.lock().unwrap().push(frame.sequence));
        source.start(0).unwrap();
        assert!(wait_until(Duration::from_secs(2), || sequences.lock().unwrap().len() >= 4));
        source.stop();

        let seqs = sequences.lock().unwrap().clone();
        assert!(seqs.windows(2).all(|w| w[1] > w[0]), "{seqs:?}");
    }

    #[test]
    fn test_three_consecutive_failures_degrade() {
        let provider = Arc::new(FakeProvider {
            fail_from: Some(2),
            ..Default::default()
        });
        let source = FrameSource::with_settings(Arc::clone(&provider) as Arc<dyn DeviceProvider>, fast_settings());
        source.start(4).unwrap();

        assert!(wait_until(Duration::from_secs(2), || matches!(
            source.status(),
            SourceStatus::Degraded { device_index: 4, .. }
        )));
        assert!(!source.is_running());
        assert!(source.latest_frame().is_none());
        let released = provider.released.lock().unwrap()[0].clone();
        assert!(wait_until(Duration::from_secs(1), || released.load(Ordering::SeqCst)));
    }

    #[test]
    fn test_intermittent_failures_are_skipped() {
        // two failures, a success, two failures, then healthy
        let provider = Arc::new(FakeProvider {
            fail_pattern: vec![true, true, false, true, true],
            ..Default::default()
        });
        let source = FrameSource::with_settings(provider, fast_settings());
        source.start(0).unwrap();
        assert!(wait_until(Duration::from_secs(2), || source
            .latest_frame()
            .is_some_and(|f| f.sequence >= 3)));
        assert!(source.is_running());
        source.stop();
    }

    #[test]
    fn test_start_while_running_restarts() {
        let provider = Arc::new(FakeProvider::default());
        let source = FrameSource::with_settings(Arc::clone(&provider) as Arc<dyn DeviceProvider>, fast_settings());
        source.start(0).unwrap();
        source.start(1).unwrap();

        assert_eq!(provider.opens.load(Ordering::SeqCst), 2);
        let first = provider.released.lock().unwrap()[0].clone();
        assert!(first.load(Ordering::SeqCst), "first device released before reopen");
        assert_eq!(source.status(), SourceStatus::Running { device_index: 1 });
        source.stop();
    }

    #[test]
    fn test_stop_from_callback_does_not_deadlock() {
        let provider = Arc::new(FakeProvider::default());
        let source = Arc::new(FrameSource::with_settings(provider, fast_settings()));
        let weak = Arc::downgrade(&source);
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        source.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            if let Some(source) = weak.upgrade() {
                source.stop();
            }
        });
        source.start(0).unwrap();

        assert!(wait_until(Duration::from_secs(2), || seen.load(Ordering::SeqCst) >= 1));
        thread::sleep(Duration::from_millis(30));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        source.stop();
    }

    #[test]
    fn test_stop_abandons_blocked_read_after_grace() {
        let provider = Arc::new(FakeProvider {
            read_delay: Duration::from_millis(600),
            ..Default::default()
        });
        let source = FrameSource::with_settings(provider, fast_settings());
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        source.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        source.start(0).unwrap();

        let started = Instant::now();
        source.stop();
        assert!(started.elapsed() < Duration::from_millis(500));

        // The abandoned read completes later but must not be published.
        thread::sleep(Duration::from_millis(800));
        assert_eq!(seen.load(Ordering::SeqCst), 0);
        assert!(source.latest_frame().is_none());
    }

    #[test]
    fn test_unsubscribe() {
        let provider = Arc::new(FakeProvider::default());
        let source = FrameSource::with_settings(provider, fast_settings());
        let id = source.subscribe(|_| {});
        assert!(source.unsubscribe(id));
        assert!(!source.unsubscribe(id));
    }

    #[test]
    fn test_stop_without_start_is_noop() {
        let source = FrameSource::with_settings(Arc::new(FakeProvider::default()), fast_settings());
        source.stop();
        source.stop();
        assert_eq!(source.status(), SourceStatus::Stopped);
    }
}
