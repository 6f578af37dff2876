//! SCRFD face detector via ONNX Runtime.
//!
//! Runs the insightface `det_10g` model on a letterboxed RGB frame and
//! decodes its three stride levels into face boxes, followed by NMS.
//! Landmark outputs are ignored; the embedder works on plain crops.

use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const INPUT_SIZE: u32 = 640;
const PIXEL_MEAN: f32 = 127.5;
const PIXEL_STD: f32 = 128.0;
const SCORE_THRESHOLD: f32 = 0.5;
const NMS_IOU: f32 = 0.4;
const STRIDES: [u32; 3] = [8, 16, 32];
const ANCHORS_PER_CELL: u32 = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("unexpected model outputs: {0}")]
    BadOutputs(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Scale and padding applied when fitting a frame into the model input.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: u32,
    pad_y: u32,
}

impl Letterbox {
    fn fit(width: u32, height: u32) -> Self {
        let scale = (INPUT_SIZE as f32 / width as f32).min(INPUT_SIZE as f32 / height as f32);
        let new_w = ((width as f32 * scale).round() as u32).min(INPUT_SIZE);
        let new_h = ((height as f32 * scale).round() as u32).min(INPUT_SIZE);
        Self {
            scale,
            pad_x: (INPUT_SIZE - new_w) / 2,
            pad_y: (INPUT_SIZE - new_h) / 2,
        }
    }

    /// Map a point in model input space back to the source frame.
    fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        (
            (x - self.pad_x as f32) / self.scale,
            (y - self.pad_y as f32) / self.scale,
        )
    }
}

/// Positions of the score and box tensors for one stride.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StrideOutputs {
    score: usize,
    bbox: usize,
}

/// SCRFD-based face detector.
pub struct FaceDetector {
    session: Session,
    outputs: [StrideOutputs; 3],
}

impl FaceDetector {
    /// Load the SCRFD ONNX model from `model_path`.
    pub fn load(model_path: &Path) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let names: Vec<String> = session
            .outputs()
            .iter()
            .map(|o| o.name().to_string())
            .collect();
        let outputs = map_outputs(&names)?;

        tracing::info!(
            path = %model_path.display(),
            outputs = ?names,
            mapping = ?outputs,
            "loaded SCRFD model"
        );

        Ok(Self { session, outputs })
    }

    /// Detect faces in an RGB frame, most confident first.
    pub fn detect(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
        if image.width() == 0 || image.height() == 0 {
            return Ok(Vec::new());
        }
        let letterbox = Letterbox::fit(image.width(), image.height());
        let input = preprocess(image, &letterbox);

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (level, &stride) in STRIDES.iter().enumerate() {
            let StrideOutputs { score, bbox } = self.outputs[level];
            let (_, scores) = outputs[score].try_extract_tensor::<f32>().map_err(|e| {
                DetectorError::InferenceFailed(format!("scores at stride {stride}: {e}"))
            })?;
            let (_, boxes) = outputs[bbox].try_extract_tensor::<f32>().map_err(|e| {
                DetectorError::InferenceFailed(format!("boxes at stride {stride}: {e}"))
            })?;
            candidates.extend(decode_level(scores, boxes, stride, &letterbox));
        }

        Ok(nms(candidates, NMS_IOU))
    }
}

/// Resize into a 640x640 letterbox and normalise into a NCHW tensor.
fn preprocess(image: &RgbImage, letterbox: &Letterbox) -> Array4<f32> {
    let new_w = ((image.width() as f32 * letterbox.scale).round() as u32).clamp(1, INPUT_SIZE);
    let new_h = ((image.height() as f32 * letterbox.scale).round() as u32).clamp(1, INPUT_SIZE);
    let resized = imageops::resize(image, new_w, new_h, FilterType::Triangle);

    let size = INPUT_SIZE as usize;
    // Padding is filled with the mean so it normalises to zero.
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, pixel) in resized.enumerate_pixels() {
        let tx = (x + letterbox.pad_x) as usize;
        let ty = (y + letterbox.pad_y) as usize;
        if tx >= size || ty >= size {
            continue;
        }
        for c in 0..3 {
            tensor[[0, c, ty, tx]] = (pixel.0[c] as f32 - PIXEL_MEAN) / PIXEL_STD;
        }
    }
    tensor
}

/// Find score/bbox tensors by name (`score_8`, `bbox_8`, ...), falling back to
/// the standard export order: scores 0..3, boxes 3..6, keypoints 6..9.
fn map_outputs(names: &[String]) -> Result<[StrideOutputs; 3], DetectorError> {
    if names.len() < 6 {
        return Err(DetectorError::BadOutputs(format!(
            "SCRFD needs score and bbox tensors for 3 strides, model has {} outputs",
            names.len()
        )));
    }

    let position = |kind: &str, stride: u32| {
        let wanted = format!("{kind}_{stride}");
        names.iter().position(|n| *n == wanted)
    };

    let mut mapped = [StrideOutputs { score: 0, bbox: 0 }; 3];
    for (level, &stride) in STRIDES.iter().enumerate() {
        match (position("score", stride), position("bbox", stride)) {
            (Some(score), Some(bbox)) => mapped[level] = StrideOutputs { score, bbox },
            _ => {
                return Ok(std::array::from_fn(|i| StrideOutputs {
                    score: i,
                    bbox: i + 3,
                }));
            }
        }
    }
    Ok(mapped)
}

/// Decode one stride level into candidate boxes in source frame coordinates.
fn decode_level(scores: &[f32], boxes: &[f32], stride: u32, letterbox: &Letterbox) -> Vec<BoundingBox> {
    let cells_per_row = INPUT_SIZE / stride;
    let anchors = (cells_per_row * cells_per_row * ANCHORS_PER_CELL) as usize;
    let s = stride as f32;

    scores
        .iter()
        .take(anchors)
        .enumerate()
        .filter(|(_, &score)| score > SCORE_THRESHOLD)
        .filter_map(|(i, &score)| {
            let offsets = boxes.get(i * 4..i * 4 + 4)?;
            let cell = i as u32 / ANCHORS_PER_CELL;
            let cx = (cell % cells_per_row * stride) as f32;
            let cy = (cell / cells_per_row * stride) as f32;

            let (x1, y1) = letterbox.unmap(cx - offsets[0] * s, cy - offsets[1] * s);
            let (x2, y2) = letterbox.unmap(cx + offsets[2] * s, cy + offsets[3] * s);
            Some(BoundingBox {
                x: x1,
                y: y1,
                width: x2 - x1,
                height: y2 - y1,
                confidence: score,
            })
        })
        .collect()
}

/// Greedy non-maximum suppression; output is sorted by confidence.
fn nms(mut candidates: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: Vec<BoundingBox> = Vec::new();
    for candidate in candidates {
        if kept.iter().all(|k| iou(k, &candidate) <= iou_threshold) {
            kept.push(candidate);
        }
    }
    kept
}

fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let w = ((a.x + a.width).min(b.x + b.width) - a.x.max(b.x)).max(0.0);
    let h = ((a.y + a.height).min(b.y + b.height) - a.y.max(b.y)).max(0.0);
    let inter = w * h;
    let union = a.width * a.height + b.width * b.height - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}
