//! HTTP control surface and viewer stream.

use crate::engine::EngineHandle;
use crate::multiplexer::StreamMultiplexer;
use crate::pipeline::{Pipeline, StartOutcome};
use crate::receiver_store::{ReceiverConfigStore, ReceiverSource, StoreError};
use axum::body::Body;
use axum::extract::{Multipart, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::json;
use siteguard_core::{AlertController, AlertPhase, DetectionBox, FaceMatch, Frame, Rect};
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{AllowOrigin, CorsLayer};

pub const STREAM_BOUNDARY: &str = "frame";

/// Shared state for the axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub multiplexer: Arc<StreamMultiplexer>,
    pub engine: EngineHandle,
    pub alerts: Arc<AlertController>,
    pub receivers: Arc<ReceiverConfigStore>,
}

pub fn router(state: AppState, cors_origin: &str) -> Router {
    Router::new()
        .route("/start-webcam", post(start_webcam))
        .route("/stop-webcam", post(stop_webcam))
        .route("/video_feed", get(video_feed))
        .route("/upload", post(upload))
        .route("/set-receiver-email", post(set_receiver_email))
        .route("/receiver-email", get(get_receiver_email))
        .route("/status", get(status))
        .layer(cors_layer(cors_origin))
        .with_state(state)
}

/// Graceful-shutdown future for `axum::serve`.
///
/// Once `signal` fires, stops the producer and ends every viewer stream.
/// Open `/video_feed` bodies never finish on their own, so the server would
/// otherwise wait on them forever.
pub async fn shutdown_after(
    signal: impl Future<Output = ()>,
    pipeline: Arc<Pipeline>,
    multiplexer: Arc<StreamMultiplexer>,
) {
    signal.await;
    tracing::info!("shutdown requested; stopping pipeline");
    if let Err(e) = tokio::task::spawn_blocking(move || pipeline.stop()).await {
        tracing::error!(error = %e, "pipeline stop task failed");
    }
    multiplexer.close_all();
}

fn cors_layer(origin: &str) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE]);
    match HeaderValue::from_str(origin) {
        Ok(value) => layer.allow_origin(AllowOrigin::exact(value)),
        Err(e) => {
            tracing::warn!(origin, error = %e, "invalid CORS origin; cross-origin requests disabled");
            layer
        }
    }
}

fn failure(status: StatusCode, logs: Vec<String>, error: impl ToString) -> Response {
    (status, Json(json!({ "logs": logs, "error": error.to_string() }))).into_response()
}

async fn start_pipeline(pipeline: Arc<Pipeline>) -> Result<StartOutcome, String> {
    match tokio::task::spawn_blocking(move || pipeline.start()).await {
        Ok(Ok(outcome)) => Ok(outcome),
        Ok(Err(e)) => Err(e.to_string()),
        Err(e) => Err(format!("start task failed: {e}")),
    }
}

pub async fn start_webcam(State(state): State<AppState>) -> Response {
    match start_pipeline(state.pipeline.clone()).await {
        Ok(StartOutcome::Started) => Json(json!({ "logs": ["Webcam started"] })).into_response(),
        Ok(StartOutcome::AlreadyRunning) => {
            Json(json!({ "logs": ["Webcam already running"] })).into_response()
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to start webcam");
            failure(
                StatusCode::INTERNAL_SERVER_ERROR,
                vec!["Failed to start webcam".into()],
                e,
            )
        }
    }
}

pub async fn stop_webcam(State(state): State<AppState>) -> Response {
    let pipeline = state.pipeline.clone();
    match tokio::task::spawn_blocking(move || pipeline.stop()).await {
        Ok(true) => Json(json!({ "logs": ["Webcam stopped"] })).into_response(),
        Ok(false) => Json(json!({ "logs": ["Webcam was not running"] })).into_response(),
        Err(e) => failure(
            StatusCode::INTERNAL_SERVER_ERROR,
            vec!["Failed to stop webcam".into()],
            e,
        ),
    }
}

/// One multipart part: boundary, content type, JPEG bytes.
pub fn multipart_chunk(jpeg: &[u8]) -> Bytes {
    let head = format!("--{STREAM_BOUNDARY}\r\nContent-Type: image/jpeg\r\n\r\n");
    let mut part = BytesMut::with_capacity(head.len() + jpeg.len() + 2);
    part.put_slice(head.as_bytes());
    part.put_slice(jpeg);
    part.put_slice(b"\r\n");
    part.freeze()
}

pub async fn video_feed(State(state): State<AppState>) -> Response {
    let subscription = state.multiplexer.subscribe();
    if !state.pipeline.is_running() {
        if let Err(e) = start_pipeline(state.pipeline.clone()).await {
            tracing::warn!(error = %e, "video feed requested but camera unavailable");
            return (StatusCode::SERVICE_UNAVAILABLE, format!("camera unavailable: {e}"))
                .into_response();
        }
    }
    tracing::info!(viewer = subscription.id(), "viewer connected");

    let stream = futures::stream::unfold(subscription, |mut sub| async move {
        let Some(jpeg) = sub.next().await else {
            tracing::info!(viewer = sub.id(), dropped = sub.dropped(), "viewer stream ended");
            return None;
        };
        Some((Ok::<Bytes, Infallible>(multipart_chunk(&jpeg)), sub))
    });

    (
        [
            (
                header::CONTENT_TYPE,
                format!("multipart/x-mixed-replace; boundary={STREAM_BOUNDARY}"),
            ),
            (header::CACHE_CONTROL, "no-cache".to_string()),
        ],
        Body::from_stream(stream),
    )
        .into_response()
}

#[derive(Debug, Serialize)]
pub struct DetectionSummary {
    pub label: String,
    pub confidence: f32,
    pub bbox: Rect,
}

#[derive(Debug, Serialize)]
pub struct FaceSummary {
    pub identity: String,
    pub distance: Option<f32>,
    pub bbox: Rect,
}

#[derive(Debug, Serialize)]
pub struct UploadReport {
    pub logs: Vec<String>,
    pub message: String,
    pub detections: Vec<DetectionSummary>,
    pub counts: BTreeMap<String, usize>,
    pub faces: Vec<FaceSummary>,
}

pub fn upload_report(
    filename: &str,
    detections: &[DetectionBox],
    faces: &[FaceMatch],
    mut logs: Vec<String>,
) -> UploadReport {
    logs.insert(0, format!("Processing uploaded image: {filename}"));

    let mut counts = BTreeMap::new();
    for det in detections {
        *counts.entry(det.class_name.clone()).or_insert(0) += 1;
    }
    logs.push(format!("Detected {} objects", detections.len()));
    for (label, n) in &counts {
        logs.push(format!("{label}: {n}"));
    }
    for det in detections {
        logs.push(format!("{} ({:.2})", det.class_name, det.confidence));
    }
    for face in faces {
        logs.push(format!("Face: {}", face.identity));
    }

    UploadReport {
        logs,
        message: "Image processed successfully".into(),
        detections: detections
            .iter()
            .map(|d| DetectionSummary {
                label: d.class_name.clone(),
                confidence: d.confidence,
                bbox: d.bbox,
            })
            .collect(),
        counts,
        faces: faces
            .iter()
            .map(|f| FaceSummary {
                identity: f.identity.clone(),
                distance: f.distance,
                bbox: f.bbox,
            })
            .collect(),
    }
}

pub async fn upload(State(state): State<AppState>, mut multipart: Multipart) -> Response {
    let mut file: Option<(String, Bytes)> = None;
    loop {
        match multipart.next_field().await {
            Ok(Some(field)) if field.name() == Some("file") => {
                let name = field.file_name().unwrap_or("upload").to_string();
                match field.bytes().await {
                    Ok(data) => file = Some((name, data)),
                    Err(e) => {
                        return failure(StatusCode::BAD_REQUEST, vec!["Failed to read upload".into()], e)
                    }
                }
            }
            Ok(Some(_)) => continue,
            Ok(None) => break,
            Err(e) => {
                return failure(StatusCode::BAD_REQUEST, vec!["Malformed multipart body".into()], e)
            }
        }
    }

    let Some((filename, data)) = file.filter(|(_, d)| !d.is_empty()) else {
        return failure(
            StatusCode::BAD_REQUEST,
            vec!["No file uploaded".into()],
            "missing 'file' field",
        );
    };

    let image = match image::load_from_memory(&data) {
        Ok(img) => img.to_rgb8(),
        Err(e) => {
            return failure(
                StatusCode::BAD_REQUEST,
                vec![format!("Could not decode {filename}")],
                e,
            )
        }
    };

    let raw = match state.engine.analyze(Frame::new(image, 0)).await {
        Ok(raw) => raw,
        Err(e) => return failure(StatusCode::INTERNAL_SERVER_ERROR, vec![], e),
    };
    let detections = match raw.detections {
        Ok(d) => d,
        Err(e) => {
            tracing::warn!(file = %filename, error = %e, "upload inference failed");
            return failure(
                StatusCode::INTERNAL_SERVER_ERROR,
                vec![format!("Inference failed for {filename}")],
                e,
            );
        }
    };
    let mut logs = Vec::new();
    let faces = raw.faces.unwrap_or_else(|e| {
        logs.push(format!("Face matching failed: {e}"));
        Vec::new()
    });

    Json(upload_report(&filename, &detections, &faces, logs)).into_response()
}

#[derive(Debug, Deserialize)]
pub struct SetReceiver {
    pub email: String,
}

pub async fn set_receiver_email(
    State(state): State<AppState>,
    Json(req): Json<SetReceiver>,
) -> Response {
    let store = state.receivers.clone();
    let email = req.email.trim().to_string();
    let value = email.clone();
    match tokio::task::spawn_blocking(move || store.set(&value)).await {
        Ok(Ok(())) => Json(json!({
            "logs": [format!("Receiver email set to {email}")],
            "message": "Receiver email updated",
            "email": email,
        }))
        .into_response(),
        Ok(Err(e @ StoreError::Empty)) => {
            failure(StatusCode::BAD_REQUEST, vec!["Email is required".into()], e)
        }
        Ok(Err(e)) => failure(
            StatusCode::INTERNAL_SERVER_ERROR,
            vec!["Failed to save receiver email".into()],
            e,
        ),
        Err(e) => failure(StatusCode::INTERNAL_SERVER_ERROR, vec![], e),
    }
}

pub async fn get_receiver_email(State(state): State<AppState>) -> Response {
    let store = state.receivers.clone();
    let (email, source) = tokio::task::spawn_blocking(move || (store.get(), store.source()))
        .await
        .unwrap_or((None, ReceiverSource::Unset));
    let source = match source {
        ReceiverSource::Stored => "stored",
        ReceiverSource::Environment => "environment",
        ReceiverSource::Unset => "unset",
    };
    Json(json!({ "email": email, "source": source })).into_response()
}

pub async fn status(State(state): State<AppState>) -> Response {
    let now = Instant::now();
    let snapshot = state.alerts.snapshot();
    let phase = match state.alerts.phase(now) {
        AlertPhase::Monitoring => "monitoring",
        AlertPhase::Cooldown => "cooldown",
    };
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "running": state.pipeline.is_running(),
        "viewers": state.multiplexer.viewer_count(),
        "alert": {
            "phase": phase,
            "banner_active": state.alerts.banner_active(now),
            "last_alert_secs_ago": snapshot
                .last_alert
                .map(|t| now.saturating_duration_since(t).as_secs_f64()),
        },
        "gallery": state.engine.identities(),
    }))
    .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::spawn_engine;
    use crate::engine::tests::{NoFaces, ScriptedDetector};
    use crate::notifier::tests::RecordingTransport;
    use crate::notifier::{EvidenceSettings, NotificationDispatcher};
    use crate::pipeline::{ProducerContext, SourceOpener};
    use siteguard_core::{FrameAnnotator, Gallery};
    use siteguard_hw::{CameraError, FrameSource};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Never ends until closed.
    struct EndlessSource {
        sequence: u32,
        open: bool,
    }

    impl FrameSource for EndlessSource {
        fn next_frame(&mut self) -> Option<Frame> {
            if !self.open {
                return None;
            }
            std::thread::sleep(Duration::from_millis(20));
            self.sequence += 1;
            Some(Frame::new(image::RgbImage::new(16, 16), self.sequence))
        }

        fn close(&mut self) {
            self.open = false;
        }

        fn is_open(&self) -> bool {
            self.open
        }
    }

    fn test_state(dir: &std::path::Path) -> AppState {
        let opener: SourceOpener = Box::new(|| -> Result<Box<dyn FrameSource>, CameraError> {
            Err(CameraError::DeviceNotFound("/dev/video0".into()))
        });
        test_state_with(dir, opener)
    }

    fn test_state_with(dir: &std::path::Path, opener: SourceOpener) -> AppState {
        let receivers = Arc::new(ReceiverConfigStore::open(dir.join("receiver.txt"), None));
        let notifier = Arc::new(
            NotificationDispatcher::spawn(
                Box::new(RecordingTransport::default()),
                receivers.clone(),
                EvidenceSettings {
                    dir: dir.join("evidence"),
                    jpeg_quality: 80,
                },
                4,
            )
            .unwrap(),
        );
        let engine = spawn_engine(
            Box::new(ScriptedDetector {
                detections: vec![
                    DetectionBox::new("Person", 0.9, Rect::new(1.0, 1.0, 4.0, 4.0)),
                    DetectionBox::new("Person", 0.7, Rect::new(5.0, 1.0, 4.0, 4.0)),
                    DetectionBox::new("Hardhat", 0.8, Rect::new(1.0, 1.0, 2.0, 2.0)),
                ],
                fail_odd: false,
            }),
            Box::new(NoFaces),
            Gallery::empty(),
        )
        .unwrap();
        let multiplexer = StreamMultiplexer::new(4);
        let alerts = Arc::new(AlertController::default());
        let pipeline = Arc::new(Pipeline::new(
            opener,
            ProducerContext {
                engine: engine.clone(),
                alerts: alerts.clone(),
                annotator: FrameAnnotator::default(),
                multiplexer: multiplexer.clone(),
                notifier,
                jpeg_quality: 80,
            },
        ));
        AppState {
            pipeline,
            multiplexer,
            engine,
            alerts,
            receivers,
        }
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_multipart_chunk_framing() {
        let chunk = multipart_chunk(&[1, 2, 3]);
        let mut expected = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n".to_vec();
        expected.extend_from_slice(&[1, 2, 3]);
        expected.extend_from_slice(b"\r\n");
        assert_eq!(&chunk[..], &expected[..]);
    }

    #[test]
    fn test_upload_report_counts_and_logs() {
        let dets = vec![
            DetectionBox::new("Person", 0.91, Rect::default()),
            DetectionBox::new("Person", 0.62, Rect::default()),
            DetectionBox::new("Safety Vest", 0.55, Rect::default()),
        ];
        let faces = vec![FaceMatch::unknown(Rect::default())];
        let report = upload_report("site.jpg", &dets, &faces, Vec::new());
        assert_eq!(report.counts["Person"], 2);
        assert_eq!(report.counts["Safety Vest"], 1);
        assert_eq!(report.detections.len(), 3);
        assert_eq!(report.logs[0], "Processing uploaded image: site.jpg");
        assert!(report.logs.contains(&"Detected 3 objects".to_string()));
        assert!(report.logs.contains(&"Face: Unknown".to_string()));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_start_webcam_device_unavailable_is_500() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let resp = start_webcam(State(state)).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(resp).await;
        assert!(body["error"].as_str().unwrap().contains("camera unavailable"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_video_feed_without_camera_is_503_and_releases_viewer() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let resp = video_feed(State(state.clone())).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(state.multiplexer.viewer_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_stop_webcam_when_stopped_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let resp = stop_webcam(State(state.clone())).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let resp = stop_webcam(State(state)).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_receiver_email_set_and_get() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());

        let resp = set_receiver_email(
            State(state.clone()),
            Json(SetReceiver {
                email: " lead@example.com ".into(),
            }),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);

        let body = body_json(get_receiver_email(State(state.clone())).await).await;
        assert_eq!(body["email"], "lead@example.com");
        assert_eq!(body["source"], "stored");

        let resp = set_receiver_email(State(state), Json(SetReceiver { email: "  ".into() })).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_status_reports_idle_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let body = body_json(status(State(state)).await).await;
        assert_eq!(body["running"], false);
        assert_eq!(body["viewers"], 0);
        assert_eq!(body["alert"]["phase"], "monitoring");
        assert!(body["alert"]["last_alert_secs_ago"].is_null());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_graceful_shutdown_ends_open_video_feed() {
        let dir = tempfile::tempdir().unwrap();
        let opener: SourceOpener = Box::new(|| -> Result<Box<dyn FrameSource>, CameraError> {
            Ok(Box::new(EndlessSource {
                sequence: 0,
                open: true,
            }))
        });
        let state = test_state_with(dir.path(), opener);
        let pipeline = state.pipeline.clone();
        let (stopper, multiplexer) = (pipeline.clone(), state.multiplexer.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let signal = async move {
            let _ = stop_rx.await;
        };
        let server = tokio::spawn(async move {
            axum::serve(listener, router(state, "http://localhost:3000"))
                .with_graceful_shutdown(shutdown_after(signal, stopper, multiplexer))
                .await
        });

        let mut viewer = tokio::net::TcpStream::connect(addr).await.unwrap();
        viewer
            .write_all(b"GET /video_feed HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        let mut seen = Vec::new();
        let mut buf = [0u8; 4096];
        while !String::from_utf8_lossy(&seen).contains("--frame") {
            let n = tokio::time::timeout(Duration::from_secs(5), viewer.read(&mut buf))
                .await
                .expect("no frame within 5s")
                .unwrap();
            assert!(n > 0, "stream closed before the first frame");
            seen.extend_from_slice(&buf[..n]);
        }

        stop_tx.send(()).unwrap();
        let served = tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .expect("server still waiting on the open stream");
        served.unwrap().unwrap();
        assert!(!pipeline.is_running());
    }
}
