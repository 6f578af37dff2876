use rollcall_core::SlotPolicy;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Daemon configuration: optional TOML file, then `ROLLCALL_*` overrides.
#[derive(Debug, Clone)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    pub frame_width: u32,
    pub frame_height: u32,
    /// Directory containing the ONNX model files.
    pub model_dir: PathBuf,
    /// Roster JSON produced by `rollcall build-roster`.
    pub roster_path: PathBuf,
    /// Attendance CSV file.
    pub ledger_path: PathBuf,
    /// Address the dashboard listens on.
    pub listen_addr: String,
    /// Euclidean distance below which a face counts as a roster match.
    pub match_threshold: f32,
    /// Frames discarded at startup while auto exposure settles.
    pub warmup_frames: usize,
    pub jpeg_quality: u8,
    /// Consecutive capture errors after which the camera is considered gone.
    pub max_capture_failures: usize,
    pub slots: SlotPolicy,
}

/// Shape of the TOML file. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub camera_device: Option<String>,
    pub frame_width: Option<u32>,
    pub frame_height: Option<u32>,
    pub model_dir: Option<PathBuf>,
    pub roster_path: Option<PathBuf>,
    pub ledger_path: Option<PathBuf>,
    pub listen_addr: Option<String>,
    pub match_threshold: Option<f32>,
    pub warmup_frames: Option<usize>,
    pub jpeg_quality: Option<u8>,
    pub max_capture_failures: Option<usize>,
    pub slots: Option<SlotPolicy>,
}

impl FileConfig {
    pub fn read(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

impl Config {
    /// Load from `ROLLCALL_CONFIG` (must exist if set) or the default config
    /// path (skipped if absent), then apply environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let file = match std::env::var_os("ROLLCALL_CONFIG") {
            Some(path) => FileConfig::read(Path::new(&path))?,
            None => {
                let path = default_config_path();
                if path.exists() {
                    FileConfig::read(&path)?
                } else {
                    FileConfig::default()
                }
            }
        };
        Ok(Self::resolve(file, |key| std::env::var(key).ok()))
    }

    /// Merge file values and environment lookups over the defaults.
    pub fn resolve(file: FileConfig, env: impl Fn(&str) -> Option<String>) -> Self {
        let data_dir = rollcall_core::default_data_dir();

        Self {
            camera_device: env("ROLLCALL_CAMERA_DEVICE")
                .or(file.camera_device)
                .unwrap_or_else(|| "/dev/video0".to_string()),
            frame_width: env_parse(&env, "ROLLCALL_FRAME_WIDTH")
                .or(file.frame_width)
                .unwrap_or(640),
            frame_height: env_parse(&env, "ROLLCALL_FRAME_HEIGHT")
                .or(file.frame_height)
                .unwrap_or(480),
            model_dir: env("ROLLCALL_MODEL_DIR")
                .map(PathBuf::from)
                .or(file.model_dir)
                .unwrap_or_else(rollcall_core::default_model_dir),
            roster_path: env("ROLLCALL_ROSTER_PATH")
                .map(PathBuf::from)
                .or(file.roster_path)
                .unwrap_or_else(|| data_dir.join("roster.json")),
            ledger_path: env("ROLLCALL_LEDGER_PATH")
                .map(PathBuf::from)
                .or(file.ledger_path)
                .unwrap_or_else(|| data_dir.join("attendance.csv")),
            listen_addr: env("ROLLCALL_LISTEN_ADDR")
                .or(file.listen_addr)
                .unwrap_or_else(|| "127.0.0.1:5000".to_string()),
            match_threshold: env_parse(&env, "ROLLCALL_MATCH_THRESHOLD")
                .or(file.match_threshold)
                .unwrap_or(1.0),
            warmup_frames: env_parse(&env, "ROLLCALL_WARMUP_FRAMES")
                .or(file.warmup_frames)
                .unwrap_or(4),
            jpeg_quality: env_parse(&env, "ROLLCALL_JPEG_QUALITY")
                .or(file.jpeg_quality)
                .unwrap_or(80),
            max_capture_failures: env_parse(&env, "ROLLCALL_MAX_CAPTURE_FAILURES")
                .or(file.max_capture_failures)
                .unwrap_or(50),
            slots: file.slots.unwrap_or_default(),
        }
    }

    /// Path to the SCRFD detection model.
    pub fn detector_model_path(&self) -> PathBuf {
        self.model_dir.join(rollcall_core::DETECTOR_MODEL_FILE)
    }

    /// Path to the FaceNet embedding model.
    pub fn embedder_model_path(&self) -> PathBuf {
        self.model_dir.join(rollcall_core::EMBEDDER_MODEL_FILE)
    }
}

/// `$XDG_CONFIG_HOME/rollcall/rollcall.toml`, else `~/.config/rollcall/rollcall.toml`.
fn default_config_path() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".config")
        })
        .join("rollcall/rollcall.toml")
}

fn env_parse<T: std::str::FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = env(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparsable environment override");
            None
        }
    }
}
