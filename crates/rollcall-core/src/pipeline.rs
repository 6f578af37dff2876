//! Detector + embedder boundary used by the capture loop and roster builder.

use crate::detector::{DetectorError, FaceDetector};
use crate::embedder::{EmbedderError, FaceEmbeddingModel};
use crate::types::{BoundingBox, Embedding};
use image::imageops;
use image::RgbImage;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EmbedError {
    #[error("no face detected")]
    NoFace,
    #[error("face box lies outside the frame")]
    EmptyCrop,
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("embedder: {0}")]
    Embedder(#[from] EmbedderError),
}

/// A face found in a frame together with its embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceObservation {
    pub embedding: Embedding,
    pub bbox: BoundingBox,
}

/// Anything that can turn a frame into a face embedding.
pub trait FaceEmbedder {
    /// Detect the most confident face and embed it.
    fn detect_and_embed(&mut self, image: &RgbImage) -> Result<FaceObservation, EmbedError>;

    /// Embed the whole image as if it were a face crop.
    fn embed_whole(&mut self, image: &RgbImage) -> Result<Embedding, EmbedError>;
}

/// SCRFD detection followed by FaceNet embedding, both via ONNX Runtime.
pub struct OnnxFacePipeline {
    detector: FaceDetector,
    model: FaceEmbeddingModel,
}

impl OnnxFacePipeline {
    /// Load both models, failing fast if either is missing.
    pub fn load(detector_path: &Path, embedder_path: &Path) -> Result<Self, EmbedError> {
        let detector = FaceDetector::load(detector_path)?;
        let model = FaceEmbeddingModel::load(embedder_path)?;
        Ok(Self { detector, model })
    }

    /// All faces in the frame, most confident first.
    pub fn detect(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, EmbedError> {
        Ok(self.detector.detect(image)?)
    }
}

impl FaceEmbedder for OnnxFacePipeline {
    fn detect_and_embed(&mut self, image: &RgbImage) -> Result<FaceObservation, EmbedError> {
        let faces = self.detector.detect(image)?;
        let bbox = *faces.first().ok_or(EmbedError::NoFace)?;
        let crop = crop_face(image, &bbox).ok_or(EmbedError::EmptyCrop)?;
        let embedding = self.model.embed(&crop)?;
        Ok(FaceObservation { embedding, bbox })
    }

    fn embed_whole(&mut self, image: &RgbImage) -> Result<Embedding, EmbedError> {
        Ok(self.model.embed(image)?)
    }
}

/// Cut a square region centred on `bbox` out of `image`.
///
/// The side is the longer edge of the box; the square is clamped to the frame.
pub fn crop_face(image: &RgbImage, bbox: &BoundingBox) -> Option<RgbImage> {
    let side = bbox.width.max(bbox.height);
    let square = BoundingBox {
        x: bbox.x + (bbox.width - side) / 2.0,
        y: bbox.y + (bbox.height - side) / 2.0,
        width: side,
        height: side,
        confidence: bbox.confidence,
    };
    let (x, y, w, h) = square.clamped(image.width(), image.height())?;
    Some(imageops::crop_imm(image, x, y, w, h).to_image())
}
