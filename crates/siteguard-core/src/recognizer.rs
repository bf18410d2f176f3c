//! Face embeddings from the InsightFace w600k_r50 (ArcFace) model.

use crate::alignment::{align_face, ALIGNED_SIZE};
use crate::types::{BoundingBox, Embedding};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

/// Pixels are mapped to [-1, 1] as `(p - 127.5) / 127.5`.
const PIXEL_CENTER: f32 = 127.5;
const EMBEDDING_LEN: usize = 512;
const MODEL_TAG: &str = "w600k_r50";

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("recognition model not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("face carries no landmarks; cannot align")]
    NoLandmarks,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

pub struct FaceRecognizer {
    session: Session,
}

impl FaceRecognizer {
    pub fn load(model_path: &str) -> Result<Self, RecognizerError> {
        if !Path::new(model_path).exists() {
            return Err(RecognizerError::ModelNotFound(model_path.to_string()));
        }
        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;
        tracing::info!(path = model_path, "loaded recognition model");
        Ok(Self { session })
    }

    /// Unit-length embedding of `face`, aligned from its landmarks.
    pub fn extract(
        &mut self,
        image: &RgbImage,
        face: &BoundingBox,
    ) -> Result<Embedding, RecognizerError> {
        let landmarks = face.landmarks.as_ref().ok_or(RecognizerError::NoLandmarks)?;
        self.embed_aligned(&align_face(image, landmarks))
    }

    /// Embed an already aligned 112x112 crop.
    pub fn embed_aligned(&mut self, crop: &RgbImage) -> Result<Embedding, RecognizerError> {
        let input = to_tensor(crop);
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(e.to_string()))?;

        if raw.len() != EMBEDDING_LEN {
            return Err(RecognizerError::InferenceFailed(format!(
                "embedding has {} values, want {EMBEDDING_LEN}",
                raw.len()
            )));
        }
        Ok(Embedding {
            values: normalized(raw),
            model_version: Some(MODEL_TAG.to_string()),
        })
    }
}

fn to_tensor(crop: &RgbImage) -> Array4<f32> {
    let side = ALIGNED_SIZE as usize;
    Array4::from_shape_fn((1, 3, side, side), |(_, c, y, x)| {
        match crop.get_pixel_checked(x as u32, y as u32) {
            Some(p) => (p[c] as f32 - PIXEL_CENTER) / PIXEL_CENTER,
            None => -1.0,
        }
    })
}

fn normalized(raw: &[f32]) -> Vec<f32> {
    let len = raw.iter().map(|v| v * v).sum::<f32>().sqrt();
    if len == 0.0 {
        return raw.to_vec();
    }
    raw.iter().map(|v| v / len).collect()
}
