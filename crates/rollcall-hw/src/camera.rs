//! V4L2 webcam capture via the `v4l` crate.

use crate::frame::{self, Frame};
use std::io;
use std::path::Path;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::capability::{Capabilities, Flags};
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

const EBUSY: i32 = 16;
const STREAM_BUFFERS: u32 = 4;
const MAX_DEVICE_INDEX: u32 = 16;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("no camera at {0}")]
    NotFound(String),
    #[error("camera {0} is in use by another process")]
    Busy(String),
    #[error("{0} is not a video capture device")]
    NotCapture(String),
    #[error("camera cannot deliver {width}x{height}: {reason}")]
    Format {
        width: u32,
        height: u32,
        reason: String,
    },
    #[error("{context} on {device}: {source}")]
    Io {
        device: String,
        context: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("capture failed: {0}")]
    Capture(#[source] io::Error),
    #[error("frame conversion failed: {0}")]
    Frame(#[from] frame::FrameError),
}

/// A video capture node found by [`Camera::list_devices`].
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Pixel layouts the capture path knows how to turn into RGB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed.
    Yuyv,
    /// Motion-JPEG.
    Mjpeg,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"YUYV" => Some(Self::Yuyv),
            b"MJPG" => Some(Self::Mjpeg),
            _ => None,
        }
    }

    fn decode(self, buf: &[u8], width: u32, height: u32) -> Result<image::RgbImage, CameraError> {
        let rgb = match self {
            Self::Yuyv => frame::yuyv_to_rgb(buf, width, height)?,
            Self::Mjpeg => image::load_from_memory_with_format(buf, image::ImageFormat::Jpeg)
                .map_err(|e| frame::FrameError::Decode(e.to_string()))?
                .to_rgb8(),
        };
        Ok(rgb)
    }
}

/// Source of frames for the capture loop.
pub trait FrameSource {
    fn next_frame(&mut self) -> Result<Frame, CameraError>;
}

fn is_capture(caps: &Capabilities) -> bool {
    caps.capabilities.contains(Flags::VIDEO_CAPTURE)
}

/// Webcam held open for the lifetime of the value, streaming through
/// memory-mapped buffers.
pub struct Camera {
    stream: MmapStream<'static>,
    _device: Device,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pub fourcc: FourCC,
    pixel_format: PixelFormat,
}

impl Camera {
    /// Open `device_path` and ask for `width` x `height`. The driver may
    /// pick a different size; the negotiated one is stored on the camera.
    pub fn open(device_path: &str, width: u32, height: u32) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::NotFound(device_path.to_string()));
        }
        let io_err = |context: &'static str| {
            move |source: io::Error| CameraError::Io {
                device: device_path.to_string(),
                context,
                source,
            }
        };

        let device = Device::with_path(device_path).map_err(|e| match e.raw_os_error() {
            Some(EBUSY) => CameraError::Busy(device_path.to_string()),
            _ => io_err("opening device")(e),
        })?;

        let caps = device.query_caps().map_err(io_err("querying capabilities"))?;
        if !is_capture(&caps) {
            return Err(CameraError::NotCapture(device_path.to_string()));
        }
        tracing::debug!(device = device_path, driver = %caps.driver, card = %caps.card, "camera capabilities");

        // YUYV first; drivers that only stream MJPG at this size answer with MJPG.
        let mut requested = device.format().map_err(io_err("reading format"))?;
        requested.width = width;
        requested.height = height;
        requested.fourcc = FourCC::new(b"YUYV");
        let format = device.set_format(&requested).map_err(io_err("setting format"))?;

        let pixel_format = PixelFormat::from_fourcc(format.fourcc).ok_or_else(|| {
            CameraError::Format {
                width,
                height,
                reason: format!("driver offered {}, expected YUYV or MJPG", format.fourcc),
            }
        })?;

        let stream = MmapStream::with_buffers(&device, BufType::VideoCapture, STREAM_BUFFERS)
            .map_err(io_err("mapping capture buffers"))?;

        Ok(Self {
            stream,
            _device: device,
            width: format.width,
            height: format.height,
            device_path: device_path.to_string(),
            fourcc: format.fourcc,
            pixel_format,
        })
    }

    /// Dequeue the next buffer and convert it to RGB.
    pub fn capture_frame(&mut self) -> Result<Frame, CameraError> {
        let (buf, meta) = self.stream.next().map_err(CameraError::Capture)?;
        let sequence = meta.sequence;
        let image = self.pixel_format.decode(buf, self.width, self.height)?;
        Ok(Frame::new(image, sequence))
    }

    /// Throw away `count` frames so auto exposure can settle.
    pub fn warm_up(&mut self, count: usize) {
        for _ in 0..count {
            if let Err(e) = self.capture_frame() {
                tracing::debug!(error = %e, "warmup frame failed");
            }
        }
    }

    /// Probe `/dev/video0` through `/dev/video15` for capture-capable nodes.
    pub fn list_devices() -> Vec<DeviceInfo> {
        (0..MAX_DEVICE_INDEX)
            .map(|index| format!("/dev/video{index}"))
            .filter(|path| Path::new(path).exists())
            .filter_map(|path| {
                let caps = Device::with_path(&path)
                    .and_then(|device| device.query_caps())
                    .ok()?;
                is_capture(&caps).then(|| DeviceInfo {
                    path,
                    name: caps.card,
                    driver: caps.driver,
                    bus: caps.bus,
                })
            })
            .collect()
    }
}

impl FrameSource for Camera {
    fn next_frame(&mut self) -> Result<Frame, CameraError> {
        self.capture_frame()
    }
}
