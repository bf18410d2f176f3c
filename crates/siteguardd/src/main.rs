use anyhow::{Context, Result};
use siteguard_core::face_detector::FaceDetector;
use siteguard_core::recognizer::FaceRecognizer;
use siteguard_core::{AlertController, ArcFaceMatcher, FrameAnnotator, Gallery, PpeDetector};
use siteguard_hw::{Camera, CameraError, FrameSource};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod engine;
mod http;
mod multiplexer;
mod notifier;
mod pipeline;
mod receiver_store;
mod transport;

use notifier::{EvidenceSettings, NotificationDispatcher};
use pipeline::{Pipeline, ProducerContext, SourceOpener};
use receiver_store::ReceiverConfigStore;
use transport::{AlertTransport, LogTransport, SmtpAlertTransport};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "siteguardd starting");

    let config = config::Config::load()?;
    tracing::info!(
        camera = %config.camera_device,
        model_dir = %config.model_dir.display(),
        gallery_dir = %config.gallery_dir.display(),
        bind = %config.bind,
        "configuration loaded"
    );

    // Models are required; refuse to start without them.
    let detector = PpeDetector::load_default(&config.ppe_model_path(), config.confidence)
        .context("loading PPE model")?;
    let mut matcher = ArcFaceMatcher::new(
        FaceDetector::load(&config.scrfd_model_path()).context("loading face detector")?,
        FaceRecognizer::load(&config.arcface_model_path()).context("loading face recognizer")?,
        config.match_threshold,
    );

    let gallery = if config.gallery_dir.is_dir() {
        Gallery::load(&config.gallery_dir, &mut matcher).context("loading face gallery")?
    } else {
        tracing::warn!(
            dir = %config.gallery_dir.display(),
            "gallery directory missing; every face will be reported as Unknown"
        );
        Gallery::empty()
    };
    tracing::info!(
        identities = gallery.identities().len(),
        encodings = gallery.len(),
        "face gallery ready"
    );

    let engine = engine::spawn_engine(Box::new(detector), Box::new(matcher), gallery)?;

    let receivers = Arc::new(ReceiverConfigStore::open(
        &config.receiver_file,
        config.default_receiver.clone(),
    ));

    let transport: Box<dyn AlertTransport> = match config.smtp_credentials() {
        Some((user, password)) => Box::new(
            SmtpAlertTransport::new(&config.smtp_host, config.smtp_port, &user, &password)
                .context("configuring SMTP transport")?,
        ),
        None => {
            tracing::warn!("SENDER_EMAIL/EMAIL_PASSWORD not set; alerts will only be logged");
            Box::new(LogTransport)
        }
    };
    let notifier = Arc::new(NotificationDispatcher::spawn(
        transport,
        receivers.clone(),
        EvidenceSettings {
            dir: config.evidence_dir.clone(),
            jpeg_quality: config.jpeg_quality,
        },
        config.notify_queue,
    )?);

    let multiplexer = multiplexer::StreamMultiplexer::new(config.viewer_buffer);
    let alerts = Arc::new(AlertController::new(config.alert_policy()));

    let device = config.camera_device.clone();
    let settings = config.capture_settings();
    let opener: SourceOpener = Box::new(move || -> Result<Box<dyn FrameSource>, CameraError> {
        Ok(Box::new(Camera::open(&device, &settings)?))
    });

    let pipeline = Arc::new(Pipeline::new(
        opener,
        ProducerContext {
            engine: engine.clone(),
            alerts: alerts.clone(),
            annotator: FrameAnnotator::default(),
            multiplexer: multiplexer.clone(),
            notifier: notifier.clone(),
            jpeg_quality: config.jpeg_quality,
        },
    ));

    let app = http::router(
        http::AppState {
            pipeline: pipeline.clone(),
            multiplexer: multiplexer.clone(),
            engine,
            alerts,
            receivers,
        },
        &config.cors_origin,
    );

    let listener = tokio::net::TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("binding {}", config.bind))?;
    tracing::info!(addr = %config.bind, "siteguardd ready");

    axum::serve(listener, app)
        .with_graceful_shutdown(http::shutdown_after(
            shutdown_signal(),
            pipeline.clone(),
            multiplexer,
        ))
        .await?;

    tracing::info!("siteguardd shutting down");
    tokio::task::spawn_blocking(move || {
        pipeline.stop();
        notifier.shutdown();
    })
    .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
