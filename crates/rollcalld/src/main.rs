use anyhow::{bail, Context, Result};
use rollcall_core::{AttendanceDesk, Ledger, OnnxFacePipeline, Roster};
use rollcall_hw::Camera;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

mod config;
mod engine;
mod server;

use config::Config;
use engine::{spawn_engine, EngineSettings};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "rollcalld starting");

    let config = Config::load()?;

    let roster = Roster::load(&config.roster_path)
        .with_context(|| format!("loading roster {}", config.roster_path.display()))?;
    if roster.is_empty() {
        bail!("roster {} has no entries", config.roster_path.display());
    }
    tracing::info!(
        path = %config.roster_path.display(),
        identities = roster.len(),
        "roster loaded"
    );
    let roster_size = roster.len();

    let ledger = Ledger::open(&config.ledger_path, config.slots.clone())?;
    let desk = Arc::new(AttendanceDesk::new(ledger)?);

    let (frames_tx, frames_rx) = watch::channel(None);
    let cancel = CancellationToken::new();

    let settings = EngineSettings {
        match_threshold: config.match_threshold,
        jpeg_quality: config.jpeg_quality,
        max_capture_failures: config.max_capture_failures,
        retry_delay: Duration::from_millis(100),
        placeholder_size: (config.frame_width, config.frame_height),
        caption_scale: 2,
        clock: server::local_now,
    };

    let init_config = config.clone();
    let engine = spawn_engine(
        move || {
            let mut camera = Camera::open(
                &init_config.camera_device,
                init_config.frame_width,
                init_config.frame_height,
            )?;
            tracing::info!(
                device = %camera.device_path,
                width = camera.width,
                height = camera.height,
                fourcc = ?camera.fourcc,
                "camera opened"
            );

            let pipeline = OnnxFacePipeline::load(
                &init_config.detector_model_path(),
                &init_config.embedder_model_path(),
            )?;
            tracing::info!(model_dir = %init_config.model_dir.display(), "face models loaded");

            if init_config.warmup_frames > 0 {
                tracing::info!(count = init_config.warmup_frames, "discarding warmup frames");
                camera.warm_up(init_config.warmup_frames);
            }
            Ok((camera, pipeline))
        },
        roster.entries,
        Arc::clone(&desk),
        frames_tx,
        settings,
        cancel.clone(),
    )?;

    let state = server::AppState::new(desk, frames_rx, roster_size, config.camera_device.clone());
    let app = server::create_app(state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.listen_addr))?;
    tracing::info!(addr = %config.listen_addr, "rollcalld ready");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await;

    // Stop the engine even if the server failed, so the camera is released.
    cancel.cancel();
    let stats = tokio::task::spawn_blocking(move || engine.shutdown()).await?;
    tracing::info!(
        frames = stats.frames,
        recognized = stats.recognized,
        capture_failures = stats.capture_failures,
        "rollcalld shutting down"
    );

    served?;
    Ok(())
}

/// Resolves on ctrl-c, or when the engine stops on its own.
async fn shutdown_signal(cancel: CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "failed to listen for ctrl-c");
            }
            tracing::info!("shutdown requested");
            cancel.cancel();
        }
        _ = cancel.cancelled() => {
            tracing::warn!("capture engine stopped; shutting down");
        }
    }
}
