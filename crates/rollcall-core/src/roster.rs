//! Roster store: the offline-built table of known faces.
//!
//! The roster is a JSON document holding one averaged embedding per person.
//! [`RosterBuilder`] produces it from a directory of labelled sample photos,
//! one subdirectory per person.

use crate::pipeline::FaceEmbedder;
use crate::types::{Embedding, RosterEntry};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

#[derive(Error, Debug)]
pub enum RosterError {
    #[error("cannot read roster {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed roster {path}: {reason}")]
    Malformed { path: PathBuf, reason: String },
    #[error("dataset directory not found: {0}")]
    DatasetNotFound(PathBuf),
    #[error("no usable sample images under {0}")]
    NoSamples(PathBuf),
}

/// On-disk roster document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Roster {
    pub model_version: Option<String>,
    pub dimension: usize,
    pub entries: Vec<RosterEntry>,
}

impl Roster {
    /// Load and validate a roster file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, RosterError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|source| RosterError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let roster: Roster =
            serde_json::from_slice(&bytes).map_err(|e| RosterError::Malformed {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        roster.validate().map_err(|reason| RosterError::Malformed {
            path: path.to_path_buf(),
            reason,
        })?;

        tracing::info!(
            path = %path.display(),
            entries = roster.entries.len(),
            dimension = roster.dimension,
            model = roster.model_version.as_deref().unwrap_or("unknown"),
            "loaded roster"
        );
        Ok(roster)
    }

    /// Write the roster as pretty JSON via a temp file and rename.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), RosterError> {
        let path = path.as_ref();
        let io_err = |source| RosterError::Io {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let json = serde_json::to_vec_pretty(self).map_err(|e| RosterError::Malformed {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(io_err)?;
        std::fs::rename(&tmp, path).map_err(io_err)?;

        tracing::info!(path = %path.display(), entries = self.entries.len(), "roster saved");
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.name.as_str())
    }

    fn validate(&self) -> Result<(), String> {
        let mut seen = HashSet::new();
        for entry in &self.entries {
            if entry.name.trim().is_empty() {
                return Err("entry with empty name".into());
            }
            if !seen.insert(entry.name.as_str()) {
                return Err(format!("duplicate entry {:?}", entry.name));
            }
            if entry.embedding.dimension() != self.dimension {
                return Err(format!(
                    "entry {:?} has {} values, expected {}",
                    entry.name,
                    entry.embedding.dimension(),
                    self.dimension
                ));
            }
            if entry.embedding.values.iter().any(|v| !v.is_finite()) {
                return Err(format!("entry {:?} has non-finite values", entry.name));
            }
        }
        Ok(())
    }
}

/// Per-identity outcome of a roster build.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct BuildReport {
    /// Identities written, with the number of samples averaged.
    pub accepted: Vec<(String, usize)>,
    /// Identities dropped because no sample produced an embedding.
    pub empty: Vec<String>,
    /// Files that could not be decoded or embedded.
    pub failed: Vec<(PathBuf, String)>,
}

/// Accumulates sample embeddings per identity and averages them.
#[derive(Default)]
pub struct RosterBuilder {
    samples: BTreeMap<String, Vec<Embedding>>,
}

impl RosterBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an identity even if none of its samples end up usable.
    pub fn declare(&mut self, name: &str) {
        self.samples.entry(name.to_string()).or_default();
    }

    pub fn add_sample(&mut self, name: &str, embedding: Embedding) {
        self.samples.entry(name.to_string()).or_default().push(embedding);
    }

    /// Average every identity's samples into one entry, sorted by name.
    ///
    /// Identities whose samples disagree on dimension with the first
    /// accepted identity are reported as empty.
    pub fn build(self) -> (Roster, BuildReport) {
        let mut report = BuildReport::default();
        let mut entries = Vec::new();
        let mut dimension = None;
        let mut model_version = None;

        for (name, samples) in self.samples {
            let mean = Embedding::mean(&samples)
                .filter(|m| dimension.is_none_or(|d| d == m.dimension()));
            match mean {
                Some(embedding) => {
                    dimension.get_or_insert(embedding.dimension());
                    if model_version.is_none() {
                        model_version = embedding.model_version.clone();
                    }
                    report.accepted.push((name.clone(), samples.len()));
                    entries.push(RosterEntry { name, embedding });
                }
                None => report.empty.push(name),
            }
        }

        let roster = Roster {
            model_version,
            dimension: dimension.unwrap_or(0),
            entries,
        };
        (roster, report)
    }
}

/// Build a roster from `dataset`, where each subdirectory is one identity
/// and holds that person's sample photos.
///
/// Each photo is embedded from its detected face, or from the whole image
/// when no face is found.
pub fn build_from_dir(
    dataset: &Path,
    embedder: &mut dyn FaceEmbedder,
) -> Result<(Roster, BuildReport), RosterError> {
    if !dataset.is_dir() {
        return Err(RosterError::DatasetNotFound(dataset.to_path_buf()));
    }

    let mut builder = RosterBuilder::new();
    let mut failed = Vec::new();

    let people = WalkDir::new(dataset)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_dir());

    for person in people {
        let name = person.file_name().to_string_lossy().into_owned();
        builder.declare(&name);

        let images = WalkDir::new(person.path())
            .min_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file());

        for image_entry in images {
            let path = image_entry.path();
            let img = match image::open(path) {
                Ok(img) => img.to_rgb8(),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "could not read image");
                    failed.push((path.to_path_buf(), e.to_string()));
                    continue;
                }
            };

            let embedding = match embedder.detect_and_embed(&img) {
                Ok(face) => Ok(face.embedding),
                Err(e) => {
                    tracing::debug!(path = %path.display(), error = %e, "no face found; embedding whole image");
                    embedder.embed_whole(&img)
                }
            };

            match embedding {
                Ok(embedding) => builder.add_sample(&name, embedding),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "could not embed image");
                    failed.push((path.to_path_buf(), e.to_string()));
                }
            }
        }
    }

    let (roster, mut report) = builder.build();
    report.failed = failed;

    for (name, count) in &report.accepted {
        tracing::info!(name, samples = count, "identity processed");
    }
    for name in &report.empty {
        tracing::warn!(name, "no valid embeddings for identity");
    }

    if roster.is_empty() {
        return Err(RosterError::NoSamples(dataset.to_path_buf()));
    }
    Ok((roster, report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{EmbedError, FaceObservation};
    use crate::types::BoundingBox;
    use image::{Rgb, RgbImage};

    /// Embeds an image as its mean colour; "detects" a face only in bright images.
    struct ColourEmbedder;

    impl FaceEmbedder for ColourEmbedder {
        fn detect_and_embed(&mut self, image: &RgbImage) -> Result<FaceObservation, EmbedError> {
            let embedding = self.embed_whole(image)?;
            if embedding.values[0] < 0.5 {
                return Err(EmbedError::NoFace);
            }
            Ok(FaceObservation {
                embedding,
                bbox: BoundingBox {
                    x: 0.0,
                    y: 0.0,
                    width: image.width() as f32,
                    height: image.height() as f32,
                    confidence: 1.0,
                },
            })
        }

        fn embed_whole(&mut self, image: &RgbImage) -> Result<Embedding, EmbedError> {
            let n = (image.width() * image.height()) as f32;
            let mut sum = [0.0f32; 3];
            for p in image.pixels() {
                for c in 0..3 {
                    sum[c] += p.0[c] as f32 / 255.0;
                }
            }
            Ok(Embedding::new(sum.iter().map(|s| s / n).collect()))
        }
    }

    fn entry(name: &str, values: Vec<f32>) -> RosterEntry {
        RosterEntry {
            name: name.into(),
            embedding: Embedding::new(values),
        }
    }

    #[test]
    fn test_builder_averages_samples() {
        let mut b = RosterBuilder::new();
        b.add_sample("Nimal", Embedding::new(vec![1.0, 0.0]));
        b.add_sample("Nimal", Embedding::new(vec![0.0, 1.0]));
        b.add_sample("Amaya", Embedding::new(vec![2.0, 2.0]));
        b.declare("Ghost");

        let (roster, report) = b.build();
        assert_eq!(roster.dimension, 2);
        assert_eq!(
            roster.entries,
            vec![entry("Amaya", vec![2.0, 2.0]), entry("Nimal", vec![0.5, 0.5])]
        );
        assert_eq!(report.accepted, vec![("Amaya".into(), 1), ("Nimal".into(), 2)]);
        assert_eq!(report.empty, vec!["Ghost".to_string()]);
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("roster.json");
        let roster = Roster {
            model_version: Some("facenet128".into()),
            dimension: 3,
            entries: vec![entry("Nimal", vec![0.1, 0.2, 0.3])],
        };
        roster.save(&path).unwrap();
        assert_eq!(Roster::load(&path).unwrap(), roster);
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            Roster::load(dir.path().join("absent.json")),
            Err(RosterError::Io { .. })
        ));
    }

    #[test]
    fn test_load_rejects_garbage_and_bad_dimension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("roster.json");

        std::fs::write(&path, b"not json").unwrap();
        assert!(matches!(Roster::load(&path), Err(RosterError::Malformed { .. })));

        std::fs::write(
            &path,
            br#"{"model_version":null,"dimension":3,"entries":[{"name":"A","embedding":{"values":[1.0,2.0]}}]}"#,
        )
        .unwrap();
        assert!(matches!(Roster::load(&path), Err(RosterError::Malformed { .. })));
    }

    #[test]
    fn test_load_rejects_duplicate_names() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("roster.json");
        let roster = Roster {
            model_version: None,
            dimension: 1,
            entries: vec![entry("A", vec![1.0]), entry("A", vec![2.0])],
        };
        std::fs::write(&path, serde_json::to_vec(&roster).unwrap()).unwrap();
        assert!(matches!(Roster::load(&path), Err(RosterError::Malformed { .. })));
    }

    #[test]
    fn test_build_from_dir() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();

        std::fs::create_dir_all(root.join("bright")).unwrap();
        std::fs::create_dir_all(root.join("dark")).unwrap();
        std::fs::create_dir_all(root.join("nobody")).unwrap();

        RgbImage::from_pixel(4, 4, Rgb([255, 255, 255]))
            .save(root.join("bright/a.png"))
            .unwrap();
        RgbImage::from_pixel(4, 4, Rgb([255, 0, 255]))
            .save(root.join("bright/b.png"))
            .unwrap();
        // Dark image: no face found, falls back to the whole image.
        RgbImage::from_pixel(4, 4, Rgb([0, 0, 0]))
            .save(root.join("dark/a.png"))
            .unwrap();
        std::fs::write(root.join("nobody/readme.txt"), b"not an image").unwrap();

        let (roster, report) = build_from_dir(root, &mut ColourEmbedder).unwrap();

        assert_eq!(roster.names().collect::<Vec<_>>(), vec!["bright", "dark"]);
        assert_eq!(roster.entries[0].embedding.values, vec![1.0, 0.5, 1.0]);
        assert_eq!(roster.entries[1].embedding.values, vec![0.0, 0.0, 0.0]);
        assert_eq!(report.empty, vec!["nobody".to_string()]);
        assert_eq!(report.failed.len(), 1);
    }

    #[test]
    fn test_build_from_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            build_from_dir(&dir.path().join("missing"), &mut ColourEmbedder),
            Err(RosterError::DatasetNotFound(_))
        ));
    }
}
