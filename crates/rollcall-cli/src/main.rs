use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use image::RgbImage;
use rollcall_core::ledger::{read_ledger_file, TIMESTAMP_FORMAT};
use rollcall_core::{BoundingBox, OnnxFacePipeline, DETECTOR_MODEL_FILE, EMBEDDER_MODEL_FILE};
use rollcall_hw::Camera;
use std::path::{Path, PathBuf};

mod prepare;

#[derive(Parser)]
#[command(name = "rollcall", version, about = "Rollcall face attendance tools")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the roster from a dataset with one directory per person
    BuildRoster {
        /// Dataset root; each subdirectory name is an identity
        dataset: PathBuf,
        /// Where to write the roster JSON
        #[arg(short, long, env = "ROLLCALL_ROSTER_PATH")]
        output: Option<PathBuf>,
        /// Directory holding the ONNX models
        #[arg(long, env = "ROLLCALL_MODEL_DIR")]
        model_dir: Option<PathBuf>,
    },
    /// Crop faces out of raw photos into a training dataset
    Prepare {
        /// Raw photos, one subdirectory per person
        input: PathBuf,
        /// Output dataset root
        output: PathBuf,
        /// Side length of the saved crops
        #[arg(long, default_value_t = 224)]
        size: u32,
        #[arg(long, env = "ROLLCALL_MODEL_DIR")]
        model_dir: Option<PathBuf>,
    },
    /// Run camera diagnostics
    Test {
        #[arg(short, long, env = "ROLLCALL_CAMERA_DEVICE", default_value = "/dev/video0")]
        device: String,
        /// Number of frames to capture
        #[arg(short, long, default_value_t = 10)]
        frames: usize,
        /// Also run face detection on each frame
        #[arg(long)]
        detect: bool,
        #[arg(long, env = "ROLLCALL_MODEL_DIR")]
        model_dir: Option<PathBuf>,
    },
    /// List V4L2 capture devices
    Devices,
    /// Print the attendance ledger
    Ledger {
        #[arg(short, long, env = "ROLLCALL_LEDGER_PATH")]
        path: Option<PathBuf>,
        /// Only records from this date (YYYY-MM-DD)
        #[arg(short, long)]
        date: Option<NaiveDate>,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::BuildRoster {
            dataset,
            output,
            model_dir,
        } => {
            let output =
                output.unwrap_or_else(|| rollcall_core::default_data_dir().join("roster.json"));
            let mut pipeline = load_pipeline(model_dir)?;

            println!("Building roster from {}...", dataset.display());
            let (roster, report) = rollcall_core::roster::build_from_dir(&dataset, &mut pipeline)?;

            for (name, count) in &report.accepted {
                println!("  {name}: {count} image(s)");
            }
            for name in &report.empty {
                println!("  {name}: no usable images, skipped");
            }
            for (path, reason) in &report.failed {
                println!("  could not use {}: {reason}", path.display());
            }

            roster.save(&output)?;
            println!("Roster with {} identities saved to {}", roster.len(), output.display());
        }
        Commands::Prepare {
            input,
            output,
            size,
            model_dir,
        } => {
            let mut pipeline = load_pipeline(model_dir)?;
            let mut detect = |img: &RgbImage| -> Result<Vec<BoundingBox>> {
                Ok(pipeline.detect(img)?)
            };
            let report = prepare::prepare_dataset(&input, &output, size, &mut detect)?;

            for path in &report.without_face {
                println!("  no face in {}", path.display());
            }
            for path in &report.unreadable {
                println!("  could not read {}", path.display());
            }
            println!(
                "Saved {} face(s) from {} image(s) to {}",
                report.faces,
                report.images,
                output.display()
            );
        }
        Commands::Test {
            device,
            frames,
            detect,
            model_dir,
        } => run_camera_test(&device, frames, detect.then_some(model_dir))?,
        Commands::Devices => {
            let devices = Camera::list_devices();
            if devices.is_empty() {
                println!("No video capture devices found");
            }
            for dev in devices {
                println!("{}  {} ({}, {})", dev.path, dev.name, dev.driver, dev.bus);
            }
        }
        Commands::Ledger { path, date, json } => {
            let path =
                path.unwrap_or_else(|| rollcall_core::default_data_dir().join("attendance.csv"));
            print_ledger(&path, date, json)?;
        }
    }

    Ok(())
}

fn load_pipeline(model_dir: Option<PathBuf>) -> Result<OnnxFacePipeline> {
    let dir = model_dir.unwrap_or_else(rollcall_core::default_model_dir);
    OnnxFacePipeline::load(&dir.join(DETECTOR_MODEL_FILE), &dir.join(EMBEDDER_MODEL_FILE))
        .with_context(|| format!("loading face models from {}", dir.display()))
}

/// Capture a few frames and report brightness, and detections when asked.
fn run_camera_test(device: &str, count: usize, detect: Option<Option<PathBuf>>) -> Result<()> {
    let mut pipeline = detect.map(load_pipeline).transpose()?;

    println!("Opening {device}...");
    let mut camera = Camera::open(device, 640, 480)?;
    println!("  {}x{} {:?}", camera.width, camera.height, camera.fourcc);
    camera.warm_up(4);

    let mut captured = 0;
    for _ in 0..count {
        let frame = match camera.capture_frame() {
            Ok(frame) => frame,
            Err(e) => {
                println!("  capture failed: {e}");
                continue;
            }
        };
        captured += 1;

        let mut line = format!(
            "  frame {:>5}: brightness {:6.1}{}",
            frame.sequence,
            frame.avg_brightness(),
            if frame.is_dark { " (dark)" } else { "" }
        );
        if let Some(pipeline) = pipeline.as_mut() {
            let faces = pipeline.detect(&frame.image)?;
            match faces.first() {
                Some(best) => line.push_str(&format!(
                    ", {} face(s), best confidence {:.2}",
                    faces.len(),
                    best.confidence
                )),
                None => line.push_str(", no face"),
            }
        }
        println!("{line}");
    }

    if captured == 0 {
        bail!("no frames captured from {device}");
    }
    println!("Captured {captured}/{count} frames");
    Ok(())
}

fn print_ledger(path: &Path, date: Option<NaiveDate>, json: bool) -> Result<()> {
    let records: Vec<_> = read_ledger_file(path)?
        .into_iter()
        .filter(|r| date.is_none_or(|d| r.date() == d))
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    if records.is_empty() {
        println!("No attendance records");
        return Ok(());
    }

    println!("{:<24} {:<20} {:<8} Slot", "Name", "Timestamp", "Status");
    for r in &records {
        println!(
            "{:<24} {:<20} {:<8} {}",
            r.name,
            r.timestamp.format(TIMESTAMP_FORMAT).to_string(),
            r.status.as_str(),
            r.slot
        );
    }
    println!("{} record(s)", records.len());
    Ok(())
}
