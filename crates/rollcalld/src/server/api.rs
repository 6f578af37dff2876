use std::convert::Infallible;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::header;
use axum::response::{Html, IntoResponse};
use axum::Json;
use rollcall_core::{AttendanceDesk, AttendanceRecord};
use serde::Serialize;

use super::dashboard;
use super::error::Result;
use super::state::AppState;

const MJPEG_CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

/// Run a ledger-touching closure off the async runtime.
async fn with_desk<T, F>(state: &AppState, f: F) -> Result<T>
where
    F: FnOnce(&AttendanceDesk) -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let desk = Arc::clone(&state.desk);
    Ok(tokio::task::spawn_blocking(move || f(&desk)).await??)
}

pub async fn index(State(state): State<Arc<AppState>>) -> Result<Html<String>> {
    let page = with_desk(&state, |desk| {
        let records = desk.records()?;
        let latecomers = desk.latecomer_count(&records);
        Ok(dashboard::render(&records, latecomers, desk.policy()))
    })
    .await?;
    Ok(Html(page))
}

/// Endless multipart stream of the latest annotated frames.
///
/// Ends when the capture engine stops and drops its sender.
pub async fn video_feed(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let frames = state.frames.clone();
    let parts = futures::stream::unfold(frames, |mut rx| async move {
        loop {
            rx.changed().await.ok()?;
            let jpeg = rx.borrow_and_update().clone();
            if let Some(jpeg) = jpeg {
                return Some((Ok::<_, Infallible>(multipart_part(&jpeg)), rx));
            }
        }
    });

    (
        [(header::CONTENT_TYPE, MJPEG_CONTENT_TYPE)],
        Body::from_stream(parts),
    )
}

fn multipart_part(jpeg: &[u8]) -> Bytes {
    const HEAD: &[u8] = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n";
    let mut part = Vec::with_capacity(HEAD.len() + jpeg.len() + 2);
    part.extend_from_slice(HEAD);
    part.extend_from_slice(jpeg);
    part.extend_from_slice(b"\r\n");
    Bytes::from(part)
}

#[derive(Debug, Serialize)]
pub struct LatestName {
    pub name: String,
    pub distance: Option<f32>,
}

pub async fn get_latest_name(State(state): State<Arc<AppState>>) -> Result<Json<LatestName>> {
    let latest = with_desk(&state, |desk| Ok(desk.latest())).await?;
    Ok(Json(LatestName {
        name: latest.identity.name().to_string(),
        distance: latest.distance,
    }))
}

#[derive(Debug, Serialize)]
pub struct MarkResponse {
    pub success: bool,
    pub message: String,
}

pub async fn mark_attendance(State(state): State<Arc<AppState>>) -> Result<Json<MarkResponse>> {
    let now = state.now();
    let outcome = with_desk(&state, move |desk| Ok(desk.mark(now))).await?;

    let response = match outcome {
        Ok(_) => MarkResponse {
            success: true,
            message: "Attendance marked successfully!".to_string(),
        },
        Err(e) if e.is_rejection() => {
            tracing::debug!(reason = %e, "mark rejected");
            MarkResponse {
                success: false,
                message: e.to_string(),
            }
        }
        Err(e) => return Err(e.into()),
    };
    Ok(Json(response))
}

#[derive(Debug, Serialize)]
pub struct LateAlert {
    pub late: bool,
}

pub async fn check_late(State(state): State<Arc<AppState>>) -> Result<Json<LateAlert>> {
    let now = state.now();
    let late = with_desk(&state, move |desk| Ok(desk.check_late(now))).await?;
    Ok(Json(LateAlert { late }))
}

pub async fn download(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse> {
    let text = with_desk(&state, |desk| Ok(desk.read_ledger()?)).await?;
    Ok((
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8"),
            (
                header::CONTENT_DISPOSITION,
                "attachment; filename=\"attendance.csv\"",
            ),
        ],
        text,
    ))
}

pub async fn records(State(state): State<Arc<AppState>>) -> Result<Json<Vec<AttendanceRecord>>> {
    let records = with_desk(&state, |desk| Ok(desk.records()?)).await?;
    Ok(Json(records))
}

#[derive(Debug, Serialize)]
pub struct Status {
    pub version: &'static str,
    pub roster_size: usize,
    pub camera_device: String,
    pub latest: String,
    pub slot: Option<String>,
}

pub async fn status(State(state): State<Arc<AppState>>) -> Result<Json<Status>> {
    let slot = state
        .desk
        .slot_for(state.now())
        .map(|s| state.desk.policy().label(s));
    let latest = with_desk(&state, |desk| Ok(desk.latest_identity())).await?;
    Ok(Json(Status {
        version: env!("CARGO_PKG_VERSION"),
        roster_size: state.roster_size,
        camera_device: state.camera_device.clone(),
        latest: latest.to_string(),
        slot,
    }))
}
