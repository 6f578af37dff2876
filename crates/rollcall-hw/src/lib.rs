//! rollcall-hw — Webcam capture and frame handling.
//!
//! Provides V4L2-based camera access plus the RGB frame type with the
//! helpers the dashboard stream needs (annotation, JPEG encoding).

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, DeviceInfo, FrameSource, PixelFormat};
pub use frame::{Frame, FrameError};
