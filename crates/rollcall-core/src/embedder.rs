//! FaceNet face embedder via ONNX Runtime.
//!
//! Turns a square RGB face crop into a 128-dimensional, L2-normalised
//! embedding. Inputs are prewhitened per image (zero mean, unit variance),
//! matching how FaceNet was trained.

use crate::types::Embedding;
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

pub const FACENET_INPUT_SIZE: u32 = 160;
const FACENET_EMBEDDING_DIM: usize = 128;
const FACENET_MODEL_VERSION: &str = "facenet128";

#[derive(Error, Debug)]
pub enum EmbedderError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// FaceNet-based embedding extractor.
pub struct FaceEmbeddingModel {
    session: Session,
}

impl FaceEmbeddingModel {
    /// Load the FaceNet ONNX model from `model_path`.
    pub fn load(model_path: &Path) -> Result<Self, EmbedderError> {
        if !model_path.exists() {
            return Err(EmbedderError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            inputs = ?session.inputs().iter().map(|i| i.name()).collect::<Vec<_>>(),
            "loaded FaceNet model"
        );

        Ok(Self { session })
    }

    /// Embed a face crop of any size; it is resized to 160x160 first.
    pub fn embed(&mut self, face: &RgbImage) -> Result<Embedding, EmbedderError> {
        let input = preprocess(face);
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EmbedderError::InferenceFailed(format!("embedding output: {e}")))?;

        if raw.len() != FACENET_EMBEDDING_DIM {
            return Err(EmbedderError::InferenceFailed(format!(
                "expected {FACENET_EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        Ok(Embedding {
            values: l2_normalize(raw),
            model_version: Some(FACENET_MODEL_VERSION.to_string()),
        })
    }
}

fn l2_normalize(raw: &[f32]) -> Vec<f32> {
    let norm = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        raw.iter().map(|x| x / norm).collect()
    } else {
        raw.to_vec()
    }
}

/// Resize to the model input and prewhiten into a NCHW tensor.
fn preprocess(face: &RgbImage) -> Array4<f32> {
    let size = FACENET_INPUT_SIZE;
    let resized = if face.dimensions() == (size, size) {
        face.clone()
    } else {
        imageops::resize(face, size, size, FilterType::Triangle)
    };

    let raw = resized.as_raw();
    let n = raw.len() as f32;
    let mean = raw.iter().map(|&v| v as f32).sum::<f32>() / n;
    let var = raw.iter().map(|&v| (v as f32 - mean).powi(2)).sum::<f32>() / n;
    // Floor the deviation so flat crops do not blow up.
    let std = var.sqrt().max(1.0 / n.sqrt());

    let s = size as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, s, s));
    for (x, y, pixel) in resized.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (pixel.0[c] as f32 - mean) / std;
        }
    }
    tensor
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_preprocess_shape_and_resize() {
        let face = RgbImage::from_pixel(50, 80, Rgb([10, 20, 30]));
        let t = preprocess(&face);
        assert_eq!(t.shape(), &[1, 3, 160, 160]);
    }

    #[test]
    fn test_preprocess_prewhitens() {
        let face = RgbImage::from_fn(160, 160, |x, _| {
            if x % 2 == 0 { Rgb([0, 0, 0]) } else { Rgb([200, 200, 200]) }
        });
        let t = preprocess(&face);
        let mean = t.iter().sum::<f32>() / t.len() as f32;
        let var = t.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / t.len() as f32;
        assert!(mean.abs() < 1e-4, "mean {mean}");
        assert!((var - 1.0).abs() < 1e-3, "var {var}");
    }

    #[test]
    fn test_preprocess_flat_crop_is_finite() {
        let face = RgbImage::from_pixel(160, 160, Rgb([128, 128, 128]));
        assert!(preprocess(&face).iter().all(|v| v.is_finite() && *v == 0.0));
    }

    #[test]
    fn test_l2_normalize() {
        let v = l2_normalize(&[3.0, 4.0]);
        assert!((v[0] - 0.6).abs() < 1e-6 && (v[1] - 0.8).abs() < 1e-6);
        assert_eq!(l2_normalize(&[0.0, 0.0]), vec![0.0, 0.0]);
    }
}
