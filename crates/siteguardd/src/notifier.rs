//! Asynchronous alert dispatch.
//!
//! The producer hands evidence to [`NotificationDispatcher::dispatch`],
//! which only enqueues. A dedicated worker thread writes the evidence file,
//! resolves the receiver and calls the transport.

use crate::pipeline::encode_jpeg;
use crate::receiver_store::ReceiverConfigStore;
use crate::transport::{AlertMessage, AlertTransport, DeliveryError, ALERT_SUBJECT};
use chrono::{DateTime, Local};
use image::RgbImage;
use siteguard_core::ComplianceTally;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DispatchError {
    #[error("notification queue full")]
    QueueFull,
    #[error("notification dispatcher shut down")]
    Closed,
}

/// Annotated frame captured at a triggering violation.
#[derive(Debug, Clone)]
pub struct Evidence {
    pub alert_id: Uuid,
    pub image: RgbImage,
    pub tally: ComplianceTally,
    pub captured_at: DateTime<Local>,
}

#[derive(Debug, Clone)]
pub struct EvidenceSettings {
    pub dir: PathBuf,
    pub jpeg_quality: u8,
}

/// What happened to one alert.
#[derive(Debug, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered { receiver: String },
    /// No receiver configured; the evidence file was still written.
    Skipped,
}

pub struct NotificationDispatcher {
    tx: Mutex<Option<mpsc::Sender<Evidence>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl NotificationDispatcher {
    /// Start the worker thread. `queue` bounds the number of pending alerts.
    pub fn spawn(
        transport: Box<dyn AlertTransport>,
        receivers: Arc<ReceiverConfigStore>,
        settings: EvidenceSettings,
        queue: usize,
    ) -> std::io::Result<Self> {
        let (tx, mut rx) = mpsc::channel::<Evidence>(queue.max(1));
        tracing::info!(transport = transport.name(), queue, "notification dispatcher starting");

        let worker = std::thread::Builder::new()
            .name("siteguard-notify".into())
            .spawn(move || {
                while let Some(evidence) = rx.blocking_recv() {
                    let alert_id = evidence.alert_id;
                    match deliver(&evidence, transport.as_ref(), &receivers, &settings) {
                        Ok(DeliveryOutcome::Delivered { receiver }) => {
                            tracing::info!(%alert_id, %receiver, "alert delivered")
                        }
                        Ok(DeliveryOutcome::Skipped) => tracing::warn!(
                            %alert_id,
                            "no alert receiver configured; delivery skipped"
                        ),
                        Err(e) => tracing::error!(%alert_id, error = %e, "alert delivery failed"),
                    }
                }
                tracing::info!("notification worker exiting");
            })?;

        Ok(Self {
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Enqueue `evidence` and return immediately.
    pub fn dispatch(&self, evidence: Evidence) -> Result<(), DispatchError> {
        let guard = self.tx.lock().unwrap_or_else(|p| p.into_inner());
        let tx = guard.as_ref().ok_or(DispatchError::Closed)?;
        tx.try_send(evidence).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DispatchError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => DispatchError::Closed,
        })
    }

    /// Stop accepting alerts and wait for queued ones to finish. Idempotent.
    pub fn shutdown(&self) {
        let tx = self.tx.lock().unwrap_or_else(|p| p.into_inner()).take();
        drop(tx);
        let worker = self.worker.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(worker) = worker {
            tracing::info!("draining notification queue");
            if worker.join().is_err() {
                tracing::error!("notification worker panicked");
            }
        }
    }
}

impl Drop for NotificationDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// `no_hardhat_<YYYYmmdd_HHMMSS_mmm>.jpg`
pub fn evidence_file_name(captured_at: &DateTime<Local>) -> String {
    format!("no_hardhat_{}.jpg", captured_at.format("%Y%m%d_%H%M%S_%3f"))
}

fn deliver(
    evidence: &Evidence,
    transport: &dyn AlertTransport,
    receivers: &ReceiverConfigStore,
    settings: &EvidenceSettings,
) -> Result<DeliveryOutcome, DeliveryError> {
    let jpeg = encode_jpeg(&evidence.image, settings.jpeg_quality)?;
    let name = evidence_file_name(&evidence.captured_at);
    std::fs::create_dir_all(&settings.dir)?;
    let path = settings.dir.join(&name);
    std::fs::write(&path, &jpeg)?;
    tracing::debug!(alert_id = %evidence.alert_id, path = %path.display(), "evidence written");

    let Some(receiver) = receivers.get() else {
        return Ok(DeliveryOutcome::Skipped);
    };

    let message = AlertMessage {
        alert_id: evidence.alert_id,
        receiver: receiver.clone(),
        subject: ALERT_SUBJECT.to_string(),
        body: alert_body(evidence),
        attachment_name: name,
        jpeg,
    };
    transport.deliver(&message)?;
    Ok(DeliveryOutcome::Delivered { receiver })
}

fn alert_body(evidence: &Evidence) -> String {
    let t = &evidence.tally;
    format!(
        "A person without a hardhat was detected at {}.\n\n\
         Persons: {}\nHardhats: {}\nVests: {}\n\n\
         The annotated frame is attached.\nAlert ID: {}\n",
        evidence.captured_at.format("%Y-%m-%d %H:%M:%S"),
        t.persons,
        t.hardhats,
        t.vests,
        evidence.alert_id
    )
}
