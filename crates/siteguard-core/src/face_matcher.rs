//! Face localisation and identification: SCRFD boxes, ArcFace embeddings,
//! cosine matching against the gallery.

use crate::face_detector::FaceDetector;
use crate::frame::Frame;
use crate::gallery::Gallery;
use crate::inference::{ensure_non_empty, FaceEncoder, FaceMatcher, InferenceError};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::{CosineMatcher, Embedding, FaceMatch, MatchResult, Matcher, UNKNOWN_IDENTITY};

/// Default cosine similarity a face must reach to be named.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.40;

pub struct ArcFaceMatcher {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
    threshold: f32,
}

impl ArcFaceMatcher {
    pub fn new(detector: FaceDetector, recognizer: FaceRecognizer, threshold: f32) -> Self {
        Self {
            detector,
            recognizer,
            threshold,
        }
    }

    /// Load both models from `model_dir` (`det_10g.onnx`, `w600k_r50.onnx`).
    pub fn load(model_dir: &str, threshold: f32) -> Result<Self, InferenceError> {
        let detector = FaceDetector::load(&format!("{model_dir}/det_10g.onnx"))?;
        let recognizer = FaceRecognizer::load(&format!("{model_dir}/w600k_r50.onnx"))?;
        Ok(Self::new(detector, recognizer, threshold))
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }
}

impl FaceMatcher for ArcFaceMatcher {
    fn locate_and_match(
        &mut self,
        frame: &Frame,
        gallery: &Gallery,
    ) -> Result<Vec<FaceMatch>, InferenceError> {
        ensure_non_empty(frame)?;
        let faces = self.detector.detect(frame.image())?;

        let mut matches = Vec::with_capacity(faces.len());
        for face in &faces {
            let rect = face.rect().clamp_to(frame.width(), frame.height());
            match self.recognizer.extract(frame.image(), face) {
                Ok(embedding) => {
                    let result = CosineMatcher.compare(&embedding, gallery.entries(), self.threshold);
                    matches.push(to_face_match(rect, &result, gallery.is_empty()));
                }
                Err(RecognizerError::NoLandmarks) => matches.push(FaceMatch::unknown(rect)),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(matches)
    }
}

impl FaceEncoder for ArcFaceMatcher {
    fn encode_best(&mut self, frame: &Frame) -> Result<Option<Embedding>, InferenceError> {
        ensure_non_empty(frame)?;
        let faces = self.detector.detect(frame.image())?;
        // Detector output is sorted by confidence.
        match faces.first() {
            Some(face) => Ok(Some(self.recognizer.extract(frame.image(), face)?)),
            None => Ok(None),
        }
    }
}

fn to_face_match(bbox: crate::geometry::Rect, result: &MatchResult, empty_gallery: bool) -> FaceMatch {
    FaceMatch {
        bbox,
        identity: result
            .identity
            .clone()
            .unwrap_or_else(|| UNKNOWN_IDENTITY.to_string()),
        distance: (!empty_gallery).then(|| 1.0 - result.similarity),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Rect;

    #[test]
    fn test_to_face_match_named() {
        let result = MatchResult {
            matched: true,
            similarity: 0.75,
            identity: Some("alice".into()),
        };
        let m = to_face_match(Rect::default(), &result, false);
        assert_eq!(m.identity, "alice");
        assert!((m.distance.unwrap() - 0.25).abs() < 1e-6);
        assert!(m.is_known());
    }

    #[test]
    fn test_to_face_match_below_threshold_is_unknown_with_distance() {
        let result = MatchResult {
            matched: false,
            similarity: 0.2,
            identity: None,
        };
        let m = to_face_match(Rect::default(), &result, false);
        assert_eq!(m.identity, UNKNOWN_IDENTITY);
        assert!((m.distance.unwrap() - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_to_face_match_empty_gallery_has_no_distance() {
        let result = MatchResult {
            matched: false,
            similarity: 0.0,
            identity: None,
        };
        let m = to_face_match(Rect::default(), &result, true);
        assert!(!m.is_known());
        assert_eq!(m.distance, None);
    }
}
