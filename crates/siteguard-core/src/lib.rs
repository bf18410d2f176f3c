//! siteguard-core — PPE detection, face identification, alert debouncing
//! and frame annotation.
//!
//! Uses a YOLO model for PPE detection and SCRFD + ArcFace for face
//! identification, all running via ONNX Runtime for CPU inference.

pub mod alert;
pub mod alignment;
pub mod annotate;
pub mod face_detector;
pub mod face_matcher;
pub mod frame;
pub mod gallery;
pub mod geometry;
pub mod glyphs;
pub mod inference;
pub mod ppe_detector;
pub mod recognizer;
pub mod types;

pub use alert::{AlertController, AlertDecision, AlertPhase, AlertPolicy, AlertState};
pub use annotate::FrameAnnotator;
pub use face_matcher::ArcFaceMatcher;
pub use frame::Frame;
pub use gallery::{Gallery, GalleryError};
pub use geometry::Rect;
pub use inference::{Detector, FaceEncoder, FaceMatcher, InferenceError};
pub use ppe_detector::PpeDetector;
pub use types::{ComplianceTally, DetectionBox, Embedding, FaceMatch, Label, UNKNOWN_IDENTITY};
