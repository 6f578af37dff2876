//! rollcall-core — Face matching and attendance bookkeeping.
//!
//! Detection (SCRFD) and embedding (FaceNet) run through ONNX Runtime; the
//! rest is plain Rust: a Euclidean roster matcher, the lecture slot policy
//! and the append-only attendance ledger.

pub mod attendance;
pub mod detector;
pub mod embedder;
pub mod ledger;
pub mod matcher;
pub mod pipeline;
pub mod roster;
pub mod slots;
pub mod types;

use std::path::PathBuf;

pub use attendance::{AttendanceDesk, MarkError};
pub use ledger::{AttendanceRecord, Ledger, LedgerError};
pub use matcher::{EuclideanMatcher, MatchError, Matcher};
pub use pipeline::{EmbedError, FaceEmbedder, FaceObservation, OnnxFacePipeline};
pub use roster::{Roster, RosterBuilder, RosterError};
pub use slots::{AttendanceStatus, Slot, SlotPolicy, SlotWindow};
pub use types::{BoundingBox, Embedding, Identity, MatchResult, Observation, RosterEntry};

/// File name of the SCRFD detection model inside the model directory.
pub const DETECTOR_MODEL_FILE: &str = "det_10g.onnx";
/// File name of the FaceNet embedding model inside the model directory.
pub const EMBEDDER_MODEL_FILE: &str = "facenet128.onnx";

/// Per-user data directory: `$XDG_DATA_HOME/rollcall`, else `~/.local/share/rollcall`.
pub fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall")
}

/// Default location of the ONNX models.
pub fn default_model_dir() -> PathBuf {
    default_data_dir().join("models")
}
