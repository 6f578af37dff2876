use axum::body::Bytes;
use chrono::NaiveDateTime;
use rollcall_core::AttendanceDesk;
use std::sync::Arc;
use tokio::sync::watch;

/// Source of "now" for attendance decisions.
pub type Clock = fn() -> NaiveDateTime;

/// Local wall-clock time, which is what lecture slots are defined in.
pub fn local_now() -> NaiveDateTime {
    chrono::Local::now().naive_local()
}

pub struct AppState {
    pub desk: Arc<AttendanceDesk>,
    /// Latest annotated JPEG from the capture engine.
    pub frames: watch::Receiver<Option<Bytes>>,
    pub roster_size: usize,
    pub camera_device: String,
    pub clock: Clock,
}

impl AppState {
    pub fn new(
        desk: Arc<AttendanceDesk>,
        frames: watch::Receiver<Option<Bytes>>,
        roster_size: usize,
        camera_device: String,
    ) -> Arc<Self> {
        Arc::new(Self {
            desk,
            frames,
            roster_size,
            camera_device,
            clock: local_now,
        })
    }

    pub fn now(&self) -> NaiveDateTime {
        (self.clock)()
    }
}
