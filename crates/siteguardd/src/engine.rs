use siteguard_core::{DetectionBox, Detector, FaceMatch, FaceMatcher, Frame, Gallery, InferenceError};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Raw per-frame model output, failures included.
#[derive(Debug)]
pub struct RawAnalysis {
    pub detections: Result<Vec<DetectionBox>, InferenceError>,
    pub faces: Result<Vec<FaceMatch>, InferenceError>,
}

/// Per-frame model output after failure absorption.
#[derive(Debug, Clone, Default)]
pub struct Analysis {
    pub detections: Vec<DetectionBox>,
    pub faces: Vec<FaceMatch>,
}

impl RawAnalysis {
    /// Treat a failed model call as "nothing found" for this frame.
    pub fn absorb(self, sequence: u32) -> Analysis {
        let detections = self.detections.unwrap_or_else(|e| {
            tracing::warn!(frame = sequence, error = %e, "PPE inference failed; treating as no detections");
            Vec::new()
        });
        let faces = self.faces.unwrap_or_else(|e| {
            tracing::warn!(frame = sequence, error = %e, "face matching failed; treating as no faces");
            Vec::new()
        });
        Analysis { detections, faces }
    }
}

/// Messages sent from the producer loop and HTTP handlers to the engine thread.
enum EngineRequest {
    Analyze {
        frame: Frame,
        reply: oneshot::Sender<RawAnalysis>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    identities: Arc<Vec<String>>,
}

impl EngineHandle {
    /// Run both models on `frame` from async code.
    pub async fn analyze(&self, frame: Frame) -> Result<RawAnalysis, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Analyze {
                frame,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    /// Run both models on `frame` from a plain thread. Must not be called
    /// from inside the async runtime.
    pub fn analyze_blocking(&self, frame: Frame) -> Result<RawAnalysis, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .blocking_send(EngineRequest::Analyze {
                frame,
                reply: reply_tx,
            })
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.blocking_recv().map_err(|_| EngineError::ChannelClosed)
    }

    /// Gallery identities, sorted.
    pub fn identities(&self) -> &[String] {
        &self.identities
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// The thread owns both models and the gallery; every inference call in
/// the process goes through it, one at a time.
pub fn spawn_engine(
    mut detector: Box<dyn Detector>,
    mut matcher: Box<dyn FaceMatcher>,
    gallery: Gallery,
) -> Result<EngineHandle, EngineError> {
    let identities = Arc::new(gallery.identities());
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("siteguard-engine".into())
        .spawn(move || {
            tracing::info!(identities = gallery.identities().len(), "engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Analyze { frame, reply } => {
                        let result = RawAnalysis {
                            detections: detector.infer(&frame),
                            faces: matcher.locate_and_match(&frame, &gallery),
                        };
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })?;

    Ok(EngineHandle { tx, identities })
}
