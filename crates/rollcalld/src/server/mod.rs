//! HTTP surface: dashboard, MJPEG stream and the attendance endpoints.

mod api;
mod dashboard;
mod error;
mod state;

use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub use self::state::*;

/// Build the router over shared state.
pub fn create_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(api::index))
        .route("/video_feed", get(api::video_feed))
        .route("/get_latest_name", get(api::get_latest_name))
        .route("/mark_attendance", post(api::mark_attendance))
        .route("/check_late", get(api::check_late))
        .route("/download", get(api::download))
        .route("/records", get(api::records))
        .route("/status", get(api::status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
