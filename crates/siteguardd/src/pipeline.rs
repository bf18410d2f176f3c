//! Pipeline controller and the producer loop.
//!
//! At most one producer thread runs at a time. It owns the frame source
//! exclusively; everything else it talks to through shared handles.

use crate::engine::EngineHandle;
use crate::multiplexer::StreamMultiplexer;
use crate::notifier::{Evidence, NotificationDispatcher};
use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use siteguard_core::{AlertController, AlertDecision, ComplianceTally, FrameAnnotator};
use siteguard_hw::{CameraError, FrameSource};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("camera unavailable: {0}")]
    DeviceUnavailable(#[from] CameraError),
    #[error("failed to spawn producer thread: {0}")]
    Spawn(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    /// A producer was already running; it keeps the device.
    AlreadyRunning,
}

/// Opens the frame source on `start`.
pub type SourceOpener =
    Box<dyn Fn() -> Result<Box<dyn FrameSource>, CameraError> + Send + Sync>;

/// Shared collaborators of the producer loop.
pub struct ProducerContext {
    pub engine: EngineHandle,
    pub alerts: Arc<AlertController>,
    pub annotator: FrameAnnotator,
    pub multiplexer: Arc<StreamMultiplexer>,
    pub notifier: Arc<NotificationDispatcher>,
    pub jpeg_quality: u8,
}

struct Running {
    cancel: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

pub struct Pipeline {
    opener: SourceOpener,
    context: Arc<ProducerContext>,
    running: Mutex<Option<Running>>,
    /// Set while a producer thread is alive; readable without `running`.
    active: Arc<AtomicBool>,
}

/// Clears the active flag when the producer thread exits, panics included.
struct ActiveGuard(Arc<AtomicBool>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Pipeline {
    pub fn new(opener: SourceOpener, context: ProducerContext) -> Self {
        Self {
            opener,
            context: Arc::new(context),
            running: Mutex::new(None),
            active: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Open the source and start producing. A running producer is reused.
    pub fn start(&self) -> Result<StartOutcome, PipelineError> {
        let mut running = self.lock();
        if let Some(current) = running.as_ref() {
            if !current.thread.is_finished() {
                return Ok(StartOutcome::AlreadyRunning);
            }
        }
        // A producer that ended on its own has already released the source.
        if let Some(finished) = running.take() {
            let _ = finished.thread.join();
        }

        let source = (self.opener)()?;
        let cancel = Arc::new(AtomicBool::new(false));
        let context = self.context.clone();
        let flag = cancel.clone();
        self.active.store(true, Ordering::Release);
        let guard = ActiveGuard(self.active.clone());
        // A failed spawn drops the closure, and the guard with it.
        let thread = std::thread::Builder::new()
            .name("siteguard-producer".into())
            .spawn(move || {
                let _active = guard;
                run_producer(source, &context, &flag);
            })?;

        *running = Some(Running { cancel, thread });
        tracing::info!("pipeline started");
        Ok(StartOutcome::Started)
    }

    /// Stop the producer and wait for it to release the source.
    ///
    /// Returns `false` if nothing was running. Safe to call repeatedly.
    pub fn stop(&self) -> bool {
        let mut running = self.lock();
        let Some(current) = running.take() else {
            return false;
        };
        current.cancel.store(true, Ordering::Release);
        if current.thread.join().is_err() {
            tracing::error!("producer thread panicked");
            self.context.multiplexer.close_all();
        }
        tracing::info!("pipeline stopped");
        true
    }

    /// Never waits on `start` or `stop`, so async handlers may call it directly.
    pub fn is_running(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn lock(&self) -> MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Capture, analyse, alert, annotate, publish until cancelled or the source ends.
fn run_producer(mut source: Box<dyn FrameSource>, ctx: &ProducerContext, cancel: &AtomicBool) {
    tracing::info!("producer loop started");
    let mut frames = 0u64;

    while !cancel.load(Ordering::Acquire) {
        let Some(frame) = source.next_frame() else {
            tracing::info!("frame source ended");
            break;
        };
        frames += 1;

        let analysis = match ctx.engine.analyze_blocking(frame.clone()) {
            Ok(raw) => raw.absorb(frame.sequence()),
            Err(e) => {
                tracing::error!(error = %e, "inference engine unavailable; stopping producer");
                break;
            }
        };

        let tally = ComplianceTally::from_detections(&analysis.detections);
        let now = frame.timestamp();
        let decision = ctx.alerts.evaluate(&tally, now);
        let banner = ctx.alerts.banner_active(now);
        let annotated =
            ctx.annotator
                .annotate(&frame, &analysis.detections, &analysis.faces, banner);

        if let AlertDecision::Trigger { .. } = decision {
            let alert_id = Uuid::new_v4();
            tracing::info!(
                %alert_id,
                frame = frame.sequence(),
                persons = tally.persons,
                hardhats = tally.hardhats,
                "hardhat violation; dispatching alert"
            );
            let evidence = Evidence {
                alert_id,
                image: annotated.clone(),
                tally,
                captured_at: chrono::Local::now(),
            };
            if let Err(e) = ctx.notifier.dispatch(evidence) {
                tracing::warn!(%alert_id, error = %e, "alert not dispatched");
            }
        }

        if ctx.multiplexer.viewer_count() > 0 {
            match encode_jpeg(&annotated, ctx.jpeg_quality) {
                Ok(jpeg) => ctx.multiplexer.publish(Bytes::from(jpeg)),
                Err(e) => tracing::warn!(error = %e, "JPEG encoding failed; frame not published"),
            }
        }
    }

    source.close();
    ctx.multiplexer.close_all();
    tracing::info!(frames, "producer loop exited");
}

pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>, image::ImageError> {
    let mut jpeg = Vec::new();
    JpegEncoder::new_with_quality(&mut jpeg, quality.clamp(1, 100)).encode_image(image)?;
    Ok(jpeg)
}
