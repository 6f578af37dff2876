//! Dataset preparation: crop every detected face out of raw photos.
//!
//! `input/<identity>/<photo>` becomes `output/<identity>/<stem>_face<i>.jpg`,
//! one crop per detected face, resized to a square.

use anyhow::{Context, Result};
use image::{imageops, RgbImage};
use rollcall_core::BoundingBox;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

#[derive(Debug, Default)]
pub struct PrepareReport {
    pub images: usize,
    pub faces: usize,
    pub without_face: Vec<PathBuf>,
    pub unreadable: Vec<PathBuf>,
}

pub fn prepare_dataset(
    input: &Path,
    output: &Path,
    size: u32,
    detect: &mut dyn FnMut(&RgbImage) -> Result<Vec<BoundingBox>>,
) -> Result<PrepareReport> {
    anyhow::ensure!(input.is_dir(), "input dataset {} is not a directory", input.display());
    std::fs::create_dir_all(output)
        .with_context(|| format!("creating {}", output.display()))?;

    let mut report = PrepareReport::default();
    let people = WalkDir::new(input)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_dir());

    for person in people {
        let target = output.join(person.file_name());
        std::fs::create_dir_all(&target)
            .with_context(|| format!("creating {}", target.display()))?;

        let photos = WalkDir::new(person.path())
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file());

        for photo in photos {
            let path = photo.path();
            let img = match image::open(path) {
                Ok(img) => img.to_rgb8(),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "could not read image");
                    report.unreadable.push(path.to_path_buf());
                    continue;
                }
            };
            report.images += 1;

            let faces =
                detect(&img).with_context(|| format!("detecting faces in {}", path.display()))?;
            let stem = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();

            let mut saved = 0;
            for (i, face) in faces.iter().enumerate() {
                let Some((x, y, w, h)) = face.clamped(img.width(), img.height()) else {
                    continue;
                };
                let crop = imageops::crop_imm(&img, x, y, w, h).to_image();
                let resized = imageops::resize(&crop, size, size, imageops::FilterType::Triangle);
                let out = target.join(format!("{stem}_face{i}.jpg"));
                resized
                    .save(&out)
                    .with_context(|| format!("writing {}", out.display()))?;
                saved += 1;
            }

            if saved == 0 {
                report.without_face.push(path.to_path_buf());
            }
            report.faces += saved;
        }
    }

    Ok(report)
}
