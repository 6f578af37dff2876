//! Capture engine: a dedicated OS thread that reads frames, recognises the
//! face in each one, updates the attendance desk and publishes annotated
//! JPEG frames for the video feed.

use axum::body::Bytes;
use chrono::NaiveDateTime;
use rollcall_core::{
    AttendanceDesk, EuclideanMatcher, FaceEmbedder, Identity, Matcher, Observation, RosterEntry,
    SlotPolicy,
};
use rollcall_hw::frame::{self, Frame};
use rollcall_hw::FrameSource;
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("engine startup failed: {0}")]
    Startup(#[source] anyhow::Error),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("engine thread exited during startup")]
    ThreadExited,
}

/// Tunables for the capture loop.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub match_threshold: f32,
    pub jpeg_quality: u8,
    /// Consecutive capture failures before the loop gives up.
    pub max_capture_failures: usize,
    /// Pause after a failed capture before trying again.
    pub retry_delay: Duration,
    /// Size of the placeholder frame shown while the camera is failing.
    pub placeholder_size: (u32, u32),
    /// Magnification of the caption font.
    pub caption_scale: u32,
    /// Time used for the slot caption.
    pub clock: fn() -> NaiveDateTime,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            match_threshold: 1.0,
            jpeg_quality: 80,
            max_capture_failures: 50,
            retry_delay: Duration::from_millis(100),
            placeholder_size: (640, 480),
            caption_scale: 2,
            clock: || chrono::Local::now().naive_local(),
        }
    }
}

/// Counters reported when the engine stops.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub frames: u64,
    pub recognized: u64,
    pub capture_failures: u64,
}

/// Owner's handle to the running engine thread.
pub struct EngineHandle {
    cancel: CancellationToken,
    thread: JoinHandle<EngineStats>,
}

impl EngineHandle {
    /// Stop the loop and wait for the thread, releasing the camera.
    pub fn shutdown(self) -> EngineStats {
        self.cancel.cancel();
        match self.thread.join() {
            Ok(stats) => stats,
            Err(_) => {
                tracing::error!("engine thread panicked");
                EngineStats::default()
            }
        }
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// `init` runs on that thread and opens the frame source and embedder, so
/// neither needs to be `Send`. Startup errors are returned here; once
/// startup succeeds the loop runs until `cancel` fires or the source fails
/// `max_capture_failures` times in a row. Either way `cancel` is triggered
/// on exit so the web server shuts down with it.
pub fn spawn_engine<S, E, F>(
    init: F,
    roster: Vec<RosterEntry>,
    desk: Arc<AttendanceDesk>,
    frames: watch::Sender<Option<Bytes>>,
    settings: EngineSettings,
    cancel: CancellationToken,
) -> Result<EngineHandle, EngineError>
where
    S: FrameSource + 'static,
    E: FaceEmbedder + 'static,
    F: FnOnce() -> anyhow::Result<(S, E)> + Send + 'static,
{
    let (ready_tx, ready_rx) = std_mpsc::sync_channel::<Result<(), anyhow::Error>>(1);
    let token = cancel.clone();

    let thread = std::thread::Builder::new()
        .name("rollcall-engine".into())
        .spawn(move || {
            let _guard = token.clone().drop_guard();
            let (source, embedder) = match init() {
                Ok(parts) => {
                    let _ = ready_tx.send(Ok(()));
                    parts
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return EngineStats::default();
                }
            };

            tracing::info!("engine thread started");
            let stats = CaptureLoop::new(source, embedder, roster, desk, frames, settings).run(&token);
            tracing::info!(
                frames = stats.frames,
                recognized = stats.recognized,
                capture_failures = stats.capture_failures,
                "engine thread exiting"
            );
            stats
        })?;

    match ready_rx.recv() {
        Ok(Ok(())) => Ok(EngineHandle { cancel, thread }),
        Ok(Err(e)) => {
            let _ = thread.join();
            Err(EngineError::Startup(e))
        }
        Err(_) => {
            let _ = thread.join();
            Err(EngineError::ThreadExited)
        }
    }
}

/// The per-frame work, separated from the thread so it can be driven in tests.
pub struct CaptureLoop<S, E> {
    source: S,
    embedder: E,
    roster: Vec<RosterEntry>,
    matcher: EuclideanMatcher,
    policy: SlotPolicy,
    desk: Arc<AttendanceDesk>,
    frames: watch::Sender<Option<Bytes>>,
    settings: EngineSettings,
    consecutive_failures: usize,
    stats: EngineStats,
}

impl<S: FrameSource, E: FaceEmbedder> CaptureLoop<S, E> {
    pub fn new(
        source: S,
        embedder: E,
        roster: Vec<RosterEntry>,
        desk: Arc<AttendanceDesk>,
        frames: watch::Sender<Option<Bytes>>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            source,
            embedder,
            roster,
            matcher: EuclideanMatcher,
            policy: desk.policy().clone(),
            desk,
            frames,
            settings,
            consecutive_failures: 0,
            stats: EngineStats::default(),
        }
    }

    pub fn run(mut self, cancel: &CancellationToken) -> EngineStats {
        while !cancel.is_cancelled() {
            if !self.step() {
                tracing::error!(
                    failures = self.consecutive_failures,
                    "camera stopped delivering frames"
                );
                break;
            }
        }
        self.stats
    }

    /// Process one frame. Returns false once the source is considered gone.
    fn step(&mut self) -> bool {
        match self.source.next_frame() {
            Ok(captured) => {
                self.consecutive_failures = 0;
                self.stats.frames += 1;
                self.handle_frame(captured);
                true
            }
            Err(e) => {
                self.consecutive_failures += 1;
                self.stats.capture_failures += 1;
                tracing::warn!(error = %e, failures = self.consecutive_failures, "frame capture failed");

                self.desk.observe(Observation::unidentified());
                let (w, h) = self.settings.placeholder_size;
                self.publish(&frame::placeholder(w, h));

                if self.consecutive_failures >= self.settings.max_capture_failures {
                    return false;
                }
                std::thread::sleep(self.settings.retry_delay);
                true
            }
        }
    }

    fn handle_frame(&mut self, captured: Frame) {
        let observation = self.recognize(&captured);
        if observation.identity.is_known() {
            self.stats.recognized += 1;
        }

        let mut image = captured.image;
        self.annotate(&mut image, &observation);

        self.desk.observe(observation);
        self.publish(&image);
    }

    fn recognize(&mut self, captured: &Frame) -> Observation {
        if captured.is_dark {
            return Observation::unidentified();
        }

        let face = match self.embedder.detect_and_embed(&captured.image) {
            Ok(face) => face,
            Err(e) => {
                tracing::trace!(error = %e, sequence = captured.sequence, "no usable face");
                return Observation::unidentified();
            }
        };

        match self
            .matcher
            .compare(&face.embedding, &self.roster, self.settings.match_threshold)
        {
            Ok(result) => {
                tracing::debug!(
                    identity = %result.identity,
                    distance = result.distance,
                    "frame recognized"
                );
                Observation {
                    identity: result.identity,
                    distance: Some(result.distance),
                    face: Some(face.bbox),
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "roster comparison failed");
                Observation {
                    face: Some(face.bbox),
                    ..Observation::unidentified()
                }
            }
        }
    }

    /// Face box with `name (distance)` next to it, plus the slot caption.
    fn annotate(&self, image: &mut image::RgbImage, observation: &Observation) {
        if let Some(face) = &observation.face {
            let color = match observation.identity {
                Identity::Known(_) => frame::GREEN,
                Identity::Unidentified => frame::RED,
            };
            draw_face(image, face, color);

            let caption = match observation.distance {
                Some(d) => format!("{} ({d:.2})", observation.identity),
                None => observation.identity.to_string(),
            };
            let above = face.y.round() as i64 - self.caption_height() - 2;
            let y = if above >= 0 { above } else { (face.y + face.height).round() as i64 + 2 };
            frame::draw_text(
                image,
                face.x.round() as i64,
                y,
                &caption,
                color,
                self.settings.caption_scale,
            );
        }
        self.draw_slot_caption(image);
    }

    fn caption_height(&self) -> i64 {
        (frame::GLYPH_SIZE * self.settings.caption_scale.max(1)) as i64
    }

    /// Current lecture slot in the bottom-left corner.
    fn draw_slot_caption(&self, image: &mut image::RgbImage) {
        let text = match self.policy.slot_for((self.settings.clock)()) {
            Some(slot) => self.policy.label(slot),
            None => "Outside lecture hours".to_string(),
        };
        let y = image.height() as i64 - self.caption_height() - 4;
        frame::draw_text(image, 4, y.max(0), &text, frame::GREEN, self.settings.caption_scale);
    }

    fn publish(&self, image: &image::RgbImage) {
        match frame::encode_jpeg(image, self.settings.jpeg_quality) {
            Ok(jpeg) => {
                self.frames.send_replace(Some(Bytes::from(jpeg)));
            }
            Err(e) => tracing::warn!(error = %e, "dropping frame"),
        }
    }
}

fn draw_face(image: &mut image::RgbImage, face: &rollcall_core::BoundingBox, color: image::Rgb<u8>) {
    frame::draw_rect(
        image,
        face.x.round() as i64,
        face.y.round() as i64,
        face.width.max(0.0).round() as u32,
        face.height.max(0.0).round() as u32,
        color,
        2,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use rollcall_core::{
        BoundingBox, EmbedError, Embedding, FaceObservation, Ledger, SlotPolicy,
    };
    use rollcall_hw::CameraError;
    use std::collections::VecDeque;

    /// Replays a scripted sequence of frames and failures, then keeps failing.
    struct ScriptedSource {
        script: VecDeque<Result<RgbImage, ()>>,
    }

    impl FrameSource for ScriptedSource {
        fn next_frame(&mut self) -> Result<Frame, CameraError> {
            match self.script.pop_front() {
                Some(Ok(image)) => Ok(Frame::new(image, 0)),
                _ => Err(CameraError::Capture(std::io::Error::other("scripted"))),
            }
        }
    }

    /// Embeds the mean colour of the image; no face if the image is blue.
    struct ColourEmbedder;

    impl FaceEmbedder for ColourEmbedder {
        fn detect_and_embed(&mut self, image: &RgbImage) -> Result<FaceObservation, EmbedError> {
            let embedding = self.embed_whole(image)?;
            if embedding.values[2] > 0.5 {
                return Err(EmbedError::NoFace);
            }
            Ok(FaceObservation {
                embedding,
                bbox: BoundingBox { x: 1.0, y: 1.0, width: 4.0, height: 4.0, confidence: 0.9 },
            })
        }

        fn embed_whole(&mut self, image: &RgbImage) -> Result<Embedding, EmbedError> {
            let [r, g, b] = image.get_pixel(0, 0).0;
            Ok(Embedding::new(vec![r as f32 / 255.0, g as f32 / 255.0, b as f32 / 255.0]))
        }
    }

    fn roster() -> Vec<RosterEntry> {
        vec![
            RosterEntry { name: "Red".into(), embedding: Embedding::new(vec![1.0, 0.0, 0.0]) },
            RosterEntry { name: "Green".into(), embedding: Embedding::new(vec![0.0, 1.0, 0.0]) },
        ]
    }

    fn desk(dir: &tempfile::TempDir) -> Arc<AttendanceDesk> {
        let ledger = Ledger::open(dir.path().join("attendance.csv"), SlotPolicy::default()).unwrap();
        Arc::new(AttendanceDesk::new(ledger).unwrap())
    }

    fn solid(rgb: [u8; 3]) -> RgbImage {
        RgbImage::from_pixel(8, 8, Rgb(rgb))
    }

    fn settings() -> EngineSettings {
        EngineSettings {
            max_capture_failures: 3,
            retry_delay: Duration::ZERO,
            placeholder_size: (8, 8),
            ..EngineSettings::default()
        }
    }

    fn capture_loop(
        script: Vec<Result<RgbImage, ()>>,
        desk: Arc<AttendanceDesk>,
        frames: watch::Sender<Option<Bytes>>,
    ) -> CaptureLoop<ScriptedSource, ColourEmbedder> {
        let source = ScriptedSource { script: script.into() };
        CaptureLoop::new(source, ColourEmbedder, roster(), desk, frames, settings())
    }

    #[test]
    fn test_known_face_updates_desk_and_publishes() {
        let dir = tempfile::tempdir().unwrap();
        let desk = desk(&dir);
        let (tx, rx) = watch::channel(None);

        let mut lp = capture_loop(vec![Ok(solid([250, 10, 10]))], Arc::clone(&desk), tx);
        assert!(lp.step());

        let latest = desk.latest();
        assert_eq!(latest.identity, Identity::Known("Red".into()));
        assert!(latest.distance.unwrap() < 1.0);
        let jpeg = rx.borrow().clone().unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn test_no_face_and_dark_frames_are_unidentified() {
        let dir = tempfile::tempdir().unwrap();
        let desk = desk(&dir);
        let (tx, _rx) = watch::channel(None);

        let mut lp = capture_loop(
            vec![Ok(solid([250, 10, 10])), Ok(solid([10, 10, 250])), Ok(solid([0, 0, 0]))],
            Arc::clone(&desk),
            tx,
        );
        lp.step();
        lp.step();
        assert_eq!(desk.latest_identity(), Identity::Unidentified);

        lp.step();
        assert_eq!(desk.latest(), Observation::unidentified());
    }

    #[test]
    fn test_face_far_from_roster_keeps_box() {
        let dir = tempfile::tempdir().unwrap();
        let desk = desk(&dir);
        let (tx, _rx) = watch::channel(None);
        let mut lp = capture_loop(vec![Ok(solid([128, 128, 0]))], Arc::clone(&desk), tx);

        // Distance to either entry is about 0.71 under threshold 1.0, so lower it.
        lp.settings.match_threshold = 0.5;
        lp.step();
        let latest = desk.latest();
        assert_eq!(latest.identity, Identity::Unidentified);
        assert!(latest.face.is_some());
    }

    #[test]
    fn test_annotation_captions_face_and_slot() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = watch::channel(None);
        let mut lp = capture_loop(vec![], desk(&dir), tx);
        lp.settings.caption_scale = 1;
        lp.settings.clock = || {
            chrono::NaiveDate::from_ymd_opt(2026, 3, 2)
                .unwrap()
                .and_hms_opt(8, 2, 0)
                .unwrap()
        };

        let grey = Rgb([120, 120, 120]);
        let mut image = RgbImage::from_pixel(160, 80, grey);
        lp.annotate(
            &mut image,
            &Observation {
                identity: Identity::Known("Red".into()),
                distance: Some(0.25),
                face: Some(BoundingBox { x: 20.0, y: 30.0, width: 16.0, height: 16.0, confidence: 0.9 }),
            },
        );

        // Name caption sits in the 8px band just above the box.
        let caption_lit = (20..28)
            .flat_map(|y| (20..100).map(move |x| (x, y)))
            .any(|(x, y)| image.get_pixel(x, y) == &frame::GREEN);
        assert!(caption_lit);
        assert_eq!(image.get_pixel(20, 30), &frame::GREEN);

        // Slot caption along the bottom edge.
        assert_ne!(image.get_pixel(4, 68), &grey);
        assert_eq!(image.get_pixel(4, 60), &grey);
    }

    #[test]
    fn test_capture_failure_publishes_placeholder() {
        let dir = tempfile::tempdir().unwrap();
        let desk = desk(&dir);
        desk.observe(Observation {
            identity: Identity::Known("Red".into()),
            distance: Some(0.1),
            face: None,
        });
        let (tx, rx) = watch::channel(None);

        let mut lp = capture_loop(vec![Err(())], Arc::clone(&desk), tx);
        assert!(lp.step());
        assert_eq!(desk.latest_identity(), Identity::Unidentified);
        assert!(rx.borrow().is_some());
    }

    #[test]
    fn test_loop_stops_after_repeated_failures() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = watch::channel(None);
        let lp = capture_loop(
            vec![Ok(solid([250, 10, 10])), Err(()), Ok(solid([10, 250, 10]))],
            desk(&dir),
            tx,
        );

        let stats = lp.run(&CancellationToken::new());
        assert_eq!(stats.frames, 2);
        assert_eq!(stats.recognized, 2);
        // One isolated failure, then three in a row.
        assert_eq!(stats.capture_failures, 4);
    }

    #[test]
    fn test_spawn_and_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = watch::channel(None);
        let cancel = CancellationToken::new();

        let handle = spawn_engine(
            || {
                let frames = std::iter::repeat_with(|| Ok(solid([250, 10, 10])))
                    .take(10_000)
                    .collect();
                Ok((ScriptedSource { script: frames }, ColourEmbedder))
            },
            roster(),
            desk(&dir),
            tx,
            settings(),
            cancel.clone(),
        )
        .unwrap();

        std::thread::sleep(Duration::from_millis(20));
        let stats = handle.shutdown();
        assert!(stats.frames > 0);
        assert!(cancel.is_cancelled());
    }

    #[test]
    fn test_spawn_reports_startup_failure() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = watch::channel(None);
        let cancel = CancellationToken::new();

        let result = spawn_engine::<ScriptedSource, ColourEmbedder, _>(
            || Err(anyhow::anyhow!("no camera")),
            roster(),
            desk(&dir),
            tx,
            settings(),
            cancel.clone(),
        );
        assert!(matches!(result, Err(EngineError::Startup(_))));
        assert!(cancel.is_cancelled());
    }
}
