use serde::{Deserialize, Serialize};
use std::fmt;

/// Bounding box of a detected face, in source frame pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

impl BoundingBox {
    /// Clamp the box to a `width` x `height` frame, returning integer
    /// `(x, y, w, h)` or `None` if nothing of it lies inside the frame.
    pub fn clamped(&self, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
        let x0 = self.x.max(0.0).floor() as u32;
        let y0 = self.y.max(0.0).floor() as u32;
        let x1 = ((self.x + self.width).ceil().max(0.0) as u32).min(width);
        let y1 = ((self.y + self.height).ceil().max(0.0) as u32).min(height);
        if x0 >= x1 || y0 >= y1 {
            return None;
        }
        Some((x0, y0, x1 - x0, y1 - y0))
    }
}

/// Face embedding vector (128-dimensional for FaceNet).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "facenet128").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values, model_version: None }
    }

    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    /// Euclidean distance between two embeddings of equal dimension.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }

    /// Element-wise mean of a set of embeddings.
    ///
    /// Returns `None` for an empty set or when dimensions disagree.
    pub fn mean(samples: &[Embedding]) -> Option<Embedding> {
        let first = samples.first()?;
        let dim = first.dimension();
        if samples.iter().any(|s| s.dimension() != dim) {
            return None;
        }

        let mut sum = vec![0.0f32; dim];
        for sample in samples {
            for (acc, v) in sum.iter_mut().zip(&sample.values) {
                *acc += v;
            }
        }
        let n = samples.len() as f32;

        Some(Embedding {
            values: sum.into_iter().map(|v| v / n).collect(),
            model_version: first.model_version.clone(),
        })
    }
}

/// One known individual and their reference embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RosterEntry {
    pub name: String,
    pub embedding: Embedding,
}

/// Name shown for a face that matched nobody on the roster.
pub const UNIDENTIFIED: &str = "Unidentified";

/// Who the recognizer thinks is in front of the camera.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub enum Identity {
    Known(String),
    #[default]
    Unidentified,
}

impl Identity {
    pub fn name(&self) -> &str {
        match self {
            Identity::Known(name) => name,
            Identity::Unidentified => UNIDENTIFIED,
        }
    }

    pub fn is_known(&self) -> bool {
        matches!(self, Identity::Known(_))
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Result of matching a probe embedding against the roster.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub identity: Identity,
    /// Distance to the nearest roster entry, whether or not it matched.
    pub distance: f32,
    /// Index of the nearest roster entry.
    pub nearest: usize,
}

/// Latest outcome of the capture loop, read by the mark operation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Observation {
    pub identity: Identity,
    pub distance: Option<f32>,
    pub face: Option<BoundingBox>,
}

impl Observation {
    pub fn unidentified() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_euclidean_distance_identical() {
        let a = Embedding::new(vec![0.5, -0.25, 1.0]);
        assert_eq!(a.euclidean_distance(&a.clone()), 0.0);
    }

    #[test]
    fn test_euclidean_distance_known_value() {
        let a = Embedding::new(vec![0.0, 0.0]);
        let b = Embedding::new(vec![3.0, 4.0]);
        assert!((a.euclidean_distance(&b) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_mean_of_samples() {
        let samples = vec![
            Embedding::new(vec![1.0, 2.0]),
            Embedding::new(vec![3.0, 6.0]),
        ];
        let mean = Embedding::mean(&samples).unwrap();
        assert_eq!(mean.values, vec![2.0, 4.0]);
    }

    #[test]
    fn test_mean_rejects_empty_and_ragged() {
        assert!(Embedding::mean(&[]).is_none());
        let ragged = vec![Embedding::new(vec![1.0]), Embedding::new(vec![1.0, 2.0])];
        assert!(Embedding::mean(&ragged).is_none());
    }

    #[test]
    fn test_identity_display() {
        assert_eq!(Identity::Unidentified.to_string(), UNIDENTIFIED);
        assert_eq!(Identity::Known("Amaya".into()).to_string(), "Amaya");
        assert!(!Identity::default().is_known());
    }

    #[test]
    fn test_bbox_clamped() {
        let b = BoundingBox { x: -10.0, y: 5.0, width: 50.0, height: 500.0, confidence: 0.9 };
        assert_eq!(b.clamped(100, 100), Some((0, 5, 40, 95)));

        let outside = BoundingBox { x: 200.0, y: 0.0, width: 10.0, height: 10.0, confidence: 0.9 };
        assert_eq!(outside.clamped(100, 100), None);
    }
}
