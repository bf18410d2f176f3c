//! Capability seams between the pipeline and the models.
//!
//! The pipeline only depends on these traits; ONNX-backed implementations
//! live in [`crate::ppe_detector`] and [`crate::face_matcher`].

use crate::frame::Frame;
use crate::gallery::Gallery;
use crate::types::{DetectionBox, Embedding, FaceMatch};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    #[error("PPE detector: {0}")]
    Ppe(#[from] crate::ppe_detector::PpeDetectorError),
    #[error("face detector: {0}")]
    FaceDetector(#[from] crate::face_detector::DetectorError),
    #[error("face recognizer: {0}")]
    Recognizer(#[from] crate::recognizer::RecognizerError),
}

/// Labelled object detection over a whole frame.
pub trait Detector: Send {
    fn infer(&mut self, frame: &Frame) -> Result<Vec<DetectionBox>, InferenceError>;
}

/// Face localisation plus identification against a gallery.
pub trait FaceMatcher: Send {
    fn locate_and_match(
        &mut self,
        frame: &Frame,
        gallery: &Gallery,
    ) -> Result<Vec<FaceMatch>, InferenceError>;
}

/// Produces a reference encoding from a still image, used to build the gallery.
pub trait FaceEncoder {
    /// Encoding of the most confident face, or `None` if no face was found.
    fn encode_best(&mut self, frame: &Frame) -> Result<Option<Embedding>, InferenceError>;
}

pub(crate) fn ensure_non_empty(frame: &Frame) -> Result<(), InferenceError> {
    if frame.is_empty() {
        return Err(InferenceError::MalformedFrame(format!(
            "zero-sized frame {}x{}",
            frame.width(),
            frame.height()
        )));
    }
    Ok(())
}
