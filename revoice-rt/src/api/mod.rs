//! HTTP API: job intake, status polling and status streaming

pub mod health;
pub mod jobs;
pub mod sse;

use crate::AppState;
use axum::routing::{get, post};
use axum::Router;

/// All job routes
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/jobs", post(jobs::submit_job))
        .route("/jobs/:job_id", get(jobs::get_job))
        .route("/jobs/:job_id/cancel", post(jobs::cancel_job))
        .route("/jobs/:job_id/events", get(sse::job_event_stream))
        .route("/health", get(health::health_check))
}
