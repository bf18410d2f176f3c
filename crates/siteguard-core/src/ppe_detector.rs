//! YOLO (v8-style, anchor-free) PPE detector via ONNX Runtime.
//!
//! The model emits one row per candidate: `[cx, cy, w, h, class_0 .. class_n]`,
//! either as `[1, 4+nc, N]` or transposed as `[1, N, 4+nc]`. Both layouts
//! are accepted.

use crate::frame::Frame;
use crate::geometry::{letterbox_tensor, nms, Letterbox, Rect};
use crate::inference::{ensure_non_empty, Detector, InferenceError};
use crate::types::{DetectionBox, DEFAULT_PPE_CLASSES};
use image::imageops::FilterType;
use ort::session::Session;
use ort::value::{TensorRef, ValueType};
use std::path::Path;
use thiserror::Error;

const DEFAULT_INPUT_SIZE: u32 = 640;
const YOLO_PAD: u8 = 114;
const NMS_IOU_THRESHOLD: f32 = 0.45;

/// Default confidence threshold for PPE detections.
pub const DEFAULT_CONFIDENCE: f32 = 0.25;

#[derive(Error, Debug)]
pub enum PpeDetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("unexpected output shape {shape:?} for {classes} classes")]
    OutputShape { shape: Vec<usize>, classes: usize },
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// YOLO-based PPE detector.
pub struct PpeDetector {
    session: Session,
    input_size: u32,
    class_names: Vec<String>,
    confidence: f32,
}

impl PpeDetector {
    /// Load a YOLO export. The input resolution is read from the model's
    /// NCHW input shape, falling back to 640 for dynamic shapes.
    pub fn load(
        model_path: &str,
        class_names: Vec<String>,
        confidence: f32,
    ) -> Result<Self, PpeDetectorError> {
        if !Path::new(model_path).exists() {
            return Err(PpeDetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let input_size = session
            .inputs()
            .first()
            .and_then(|input| match input.dtype() {
                ValueType::Tensor { shape, .. } if shape.len() >= 4 && shape[2] > 0 => {
                    Some(shape[2] as u32)
                }
                _ => None,
            })
            .unwrap_or(DEFAULT_INPUT_SIZE);

        tracing::info!(
            path = model_path,
            input_size,
            classes = class_names.len(),
            confidence,
            "loaded PPE model"
        );

        Ok(Self {
            session,
            input_size,
            class_names,
            confidence,
        })
    }

    /// Load with the construction-site class table.
    pub fn load_default(model_path: &str, confidence: f32) -> Result<Self, PpeDetectorError> {
        let classes = DEFAULT_PPE_CLASSES.iter().map(|s| s.to_string()).collect();
        Self::load(model_path, classes, confidence)
    }

    pub fn class_names(&self) -> &[String] {
        &self.class_names
    }

    fn run(&mut self, frame: &Frame) -> Result<Vec<DetectionBox>, PpeDetectorError> {
        let (input, letterbox) = letterbox_tensor(
            frame.image(),
            self.input_size,
            YOLO_PAD,
            FilterType::Nearest,
            |v| v / 255.0,
        );

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (shape, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| PpeDetectorError::InferenceFailed(format!("output extraction: {e}")))?;
        let shape: Vec<usize> = shape.iter().map(|&d| d.max(0) as usize).collect();

        let mut detections = decode_output(
            &shape,
            data,
            &self.class_names,
            self.confidence,
            &letterbox,
        )?;
        for det in &mut detections {
            det.bbox = det.bbox.clamp_to(frame.width(), frame.height());
        }
        Ok(detections)
    }
}

impl Detector for PpeDetector {
    fn infer(&mut self, frame: &Frame) -> Result<Vec<DetectionBox>, InferenceError> {
        ensure_non_empty(frame)?;
        Ok(self.run(frame)?)
    }
}

/// Decode raw YOLO output into detections in source-frame coordinates.
///
/// Each candidate keeps only its best class. NMS runs per class so a
/// hardhat box never suppresses the person wearing it.
pub fn decode_output(
    shape: &[usize],
    data: &[f32],
    class_names: &[String],
    confidence: f32,
    letterbox: &Letterbox,
) -> Result<Vec<DetectionBox>, PpeDetectorError> {
    let classes = class_names.len();
    let features = 4 + classes;
    let shape_err = || PpeDetectorError::OutputShape {
        shape: shape.to_vec(),
        classes,
    };

    if shape.len() != 3 || shape[0] != 1 {
        return Err(shape_err());
    }
    // Channels-first ([1, 4+nc, N]) is the default Ultralytics export.
    let (candidates, transposed) = if shape[1] == features {
        (shape[2], true)
    } else if shape[2] == features {
        (shape[1], false)
    } else {
        return Err(shape_err());
    };
    if data.len() < candidates * features {
        return Err(shape_err());
    }

    let at = |i: usize, f: usize| {
        if transposed {
            data[f * candidates + i]
        } else {
            data[i * features + f]
        }
    };

    let mut per_class: Vec<Vec<(usize, f32, Rect)>> = vec![Vec::new(); classes];
    for i in 0..candidates {
        let best = (0..classes)
            .map(|c| (c, at(i, 4 + c)))
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        let Some((class, score)) = best else { continue };
        if score < confidence {
            continue;
        }

        let (cx, cy, w, h) = (at(i, 0), at(i, 1), at(i, 2), at(i, 3));
        let (x1, y1) = letterbox.to_source(cx - w / 2.0, cy - h / 2.0);
        let (x2, y2) = letterbox.to_source(cx + w / 2.0, cy + h / 2.0);
        per_class[class].push((class, score, Rect::from_corners(x1, y1, x2, y2)));
    }

    let mut detections: Vec<DetectionBox> = per_class
        .into_iter()
        .flat_map(|group| nms(group, NMS_IOU_THRESHOLD, |d| d.2, |d| d.1))
        .map(|(class, score, rect)| DetectionBox::new(class_names[class].clone(), score, rect))
        .collect();

    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    Ok(detections)
}
