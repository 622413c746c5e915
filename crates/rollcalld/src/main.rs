use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rollcall_core::{
    select_encoder, CaptureStatus, CooldownGate, FaceDetector, MatchIndex, Repository, SubjectId,
};
use rollcall_hw::{Camera, FrameSource, SourceStatus, V4lProvider};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

mod config;
mod engine;
mod enroll;
mod store;
#[cfg(test)]
mod testing;

use config::Config;
use engine::{ChannelSink, RecognitionLoop, RecognitionSettings};
use enroll::{run_enrollment, EnrollOutcome};
use store::SqliteStore;

#[derive(Parser)]
#[command(name = "rollcalld", about = "Face-recognition attendance daemon")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Recognize enrolled subjects and record attendance until interrupted
    Run,
    /// Enroll a new subject from the live camera
    Enroll {
        /// Display name for the subject
        #[arg(short, long)]
        name: String,
    },
    /// List enrolled subjects
    Subjects,
    /// Remove an enrolled subject and its attendance history
    Remove {
        /// Subject ID to remove
        id: i64,
    },
    /// List V4L2 capture devices
    Devices,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Devices => list_devices(),
        command => {
            let config = Config::load().context("loading configuration")?;
            match command {
                Commands::Run => run(config).await,
                Commands::Enroll { name } => enroll(config, name).await,
                Commands::Subjects => list_subjects(&config),
                Commands::Remove { id } => remove(&config, SubjectId(id)),
                Commands::Devices => list_devices(),
            }
        }
    }
}

fn open_store(config: &Config) -> Result<Arc<SqliteStore>> {
    let store = SqliteStore::open(&config.db_path)
        .with_context(|| format!("opening database {}", config.db_path.display()))?;
    Ok(Arc::new(store))
}

async fn run(config: Config) -> Result<()> {
    tracing::info!(camera = config.camera_index, "rollcalld starting");

    let store = open_store(&config)?;
    let detector = FaceDetector::probe(&config.detector_models(), config.detector_settings())
        .context("no face detection backend available")?;
    let encoder = select_encoder(config.encoder, &config.arcface_model_path());
    let threshold = config.match_threshold_for(encoder.as_ref())?;
    tracing::info!(encoder = encoder.name(), threshold, "match threshold");

    let index = Arc::new(MatchIndex::new(threshold));
    match index.reload_from(store.as_ref()) {
        Ok(0) => tracing::warn!("no subjects enrolled; every face will be unknown"),
        Ok(n) => tracing::info!(subjects = n, "match index loaded"),
        // The loop retries while the index is empty.
        Err(_) => {}
    }

    let repository: Arc<dyn Repository> = store.clone();
    let gate = Arc::new(CooldownGate::new(config.cooldown_window(), Arc::clone(&repository)));
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();

    let source = Arc::new(FrameSource::new(Arc::new(V4lProvider)));
    source
        .start(config.camera_index)
        .with_context(|| format!("starting camera {}", config.camera_index))?;

    let mut handle = RecognitionLoop::new(
        detector,
        encoder,
        Arc::clone(&index),
        gate,
        Arc::clone(&repository),
        Arc::new(ChannelSink::new(event_tx)),
        RecognitionSettings {
            interval: config.recognition_interval(),
            stability_frames: config.stability_frames,
            ..RecognitionSettings::default()
        },
    )
    .spawn(Arc::clone(&source));

    // The gate has already accepted these; a failed write is logged, not retried.
    let persist = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            let store = Arc::clone(&store);
            let subject = event.subject_id;
            match tokio::task::spawn_blocking(move || store.record_event(&event)).await {
                Ok(Ok(())) => tracing::debug!(subject = %subject, "attendance persisted"),
                Ok(Err(e)) => {
                    tracing::warn!(subject = %subject, error = %e, "failed to persist attendance")
                }
                Err(e) => tracing::error!(error = %e, "persistence task failed"),
            }
        }
    });

    let mut status = handle.status();
    let status_log = tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let current = status.borrow_and_update().clone();
            tracing::debug!(status = %current, "recognition status");
        }
    });

    tracing::info!("rollcalld ready; send SIGHUP to reload subjects");

    let monitor = {
        let source = Arc::clone(&source);
        async move {
            let mut tick = tokio::time::interval(Duration::from_millis(500));
            loop {
                tick.tick().await;
                if let SourceStatus::Degraded { reason, .. } = source.status() {
                    return reason;
                }
            }
        }
    };

    tokio::pin!(monitor);
    let mut hangup = signal(SignalKind::hangup()).context("installing SIGHUP handler")?;

    let degraded = loop {
        tokio::select! {
            interrupted = tokio::signal::ctrl_c() => {
                interrupted.context("waiting for Ctrl-C")?;
                tracing::info!("rollcalld shutting down");
                break None;
            }
            reason = &mut monitor => break Some(reason),
            _ = hangup.recv() => {
                if let Ok(n) = handle.reload_index() {
                    tracing::info!(subjects = n, "match index reloaded");
                }
            }
        }
    };

    tokio::task::spawn_blocking(move || {
        handle.stop();
        source.stop();
    })
    .await
    .context("stopping recognition")?;

    // The loop owned the only sender; draining ends once pending events are written.
    join_task(persist, "persistence").await;
    status_log.abort();

    if let Some(reason) = degraded {
        tracing::error!(reason = %reason, "camera degraded; recognition stopped");
        bail!("camera degraded: {reason}");
    }
    Ok(())
}

/// Await a background task, logging a panic or cancellation. Returns
/// whether it finished normally.
async fn join_task(task: tokio::task::JoinHandle<()>, name: &'static str) -> bool {
    match task.await {
        Ok(()) => true,
        Err(e) if e.is_panic() => {
            tracing::error!(task = name, error = %e, "background task panicked");
            false
        }
        Err(e) => {
            tracing::error!(task = name, error = %e, "background task cancelled");
            false
        }
    }
}

async fn enroll(config: Config, name: String) -> Result<()> {
    let name = name.trim().to_string();
    if name.is_empty() {
        bail!("subject name must not be empty");
    }

    let store = open_store(&config)?;
    let mut detector = FaceDetector::probe(&config.detector_models(), config.detector_settings())
        .context("no face detection backend available")?;
    let mut encoder = select_encoder(config.encoder, &config.arcface_model_path());

    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = Arc::clone(&cancel);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.store(true, Ordering::SeqCst);
            }
        });
    }

    println!("Look at the camera. Capturing {} samples...", config.enrollment_target);

    let device_index = config.camera_index;
    let settings = config.enrollment_settings();
    let interval = config.enrollment_interval();
    let outcome = tokio::task::spawn_blocking(move || {
        let source = FrameSource::new(Arc::new(V4lProvider));
        let mut last = None;
        run_enrollment(
            &source,
            device_index,
            &mut detector,
            encoder.as_mut(),
            settings,
            interval,
            &cancel,
            |status| {
                report_progress(status, last);
                last = Some(status);
            },
        )
    })
    .await
    .context("enrollment task failed")??;

    match outcome {
        EnrollOutcome::Completed(enrollment) => {
            let id = store
                .add_subject(&name, &enrollment.encoding)
                .context("saving subject")?;

            let photo_dir = config.photo_dir();
            let photo_path = photo_dir.join(format!("{id}.png"));
            let saved = std::fs::create_dir_all(&photo_dir)
                .map_err(anyhow::Error::from)
                .and_then(|_| enrollment.representative.save(&photo_path).map_err(anyhow::Error::from));
            match saved {
                Ok(()) => store.set_photo_path(id, &photo_path.to_string_lossy())?,
                Err(e) => tracing::warn!(error = %e, path = %photo_path.display(), "failed to save profile photo"),
            }

            tracing::info!(subject = %id, name = %name, "subject enrolled");
            println!("\nEnrolled {name} as subject {id} ({} samples).", enrollment.samples_captured);
            Ok(())
        }
        EnrollOutcome::Stopped { captured, reason } => {
            println!();
            bail!("enrollment stopped after {captured} samples ({reason}); nothing saved")
        }
    }
}

fn report_progress(status: CaptureStatus, last: Option<CaptureStatus>) {
    match status {
        CaptureStatus::Sampled { captured, target } => {
            eprint!("\r  captured {captured}/{target}        ");
        }
        CaptureStatus::Complete => eprintln!("\r  capture complete              "),
        other if Some(other) != last => {
            let message = match other {
                CaptureStatus::NoFace => "no face detected",
                CaptureStatus::MultipleFaces => "multiple faces detected",
                CaptureStatus::TooBlurry => "image too blurry, hold still",
                _ => return,
            };
            eprint!("\r  {message:<30}");
        }
        _ => {}
    }
}

fn list_subjects(config: &Config) -> Result<()> {
    let store = open_store(config)?;
    let subjects = store.list_subjects()?;
    if subjects.is_empty() {
        println!("No subjects enrolled");
        return Ok(());
    }
    println!("{:>5}  {:<24}  {:<20}  {:>6}  PHOTO", "ID", "NAME", "ENROLLED", "DIM");
    for s in subjects {
        println!(
            "{:>5}  {:<24}  {:<20}  {:>6}  {}",
            s.id.0,
            s.name,
            s.created_at.format("%Y-%m-%d %H:%M:%S"),
            s.encoding_len,
            s.photo_path.as_deref().unwrap_or("-"),
        );
    }
    Ok(())
}

fn remove(config: &Config, id: SubjectId) -> Result<()> {
    let store = open_store(config)?;
    if !store.remove_subject(id)? {
        bail!("no subject with id {id}");
    }
    println!("Removed subject {id}");
    Ok(())
}

fn list_devices() -> Result<()> {
    let devices = Camera::list_devices();
    if devices.is_empty() {
        println!("No capture devices found");
        return Ok(());
    }
    for d in devices {
        println!("{:>2}  {}  {} ({}, {})", d.index, d.path, d.name, d.driver, d.bus);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_join_task_reports_panic() {
        let task = tokio::spawn(async { panic!("disk full") });
        assert!(!join_task(task, "persistence").await);
    }

    #[tokio::test]
    async fn test_join_task_normal_exit() {
        let task = tokio::spawn(async {});
        assert!(join_task(task, "persistence").await);
    }
}
