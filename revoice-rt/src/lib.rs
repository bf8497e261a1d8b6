//! revoice-rt - Audio Retargeting Service
//!
//! Replaces the spoken utterances of an audio track with synthesized
//! speech in a new language, aligned to the original timeline and mixed
//! over the separated background.
//!
//! Flow: intake converts a transcreation into a job envelope, the queue
//! runtime executes jobs through the media pipeline (separate → build
//! references → synthesize → combine → upload), and the status API polls
//! or streams the runtime's view of each job.

pub mod api;
pub mod db;
pub mod intake;
pub mod media;
pub mod notify;
pub mod pipeline;
pub mod queue;
pub mod storage;
pub mod tts;

use crate::intake::Intake;
use crate::queue::QueueRuntime;
use axum::Router;
use revoice_common::{EventBus, Settings};
use sqlx::SqlitePool;
use std::sync::Arc;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Job store connection pool
    pub db: SqlitePool,
    /// Event bus feeding SSE subscribers and the notifier
    pub event_bus: EventBus,
    /// Queue runtime executing jobs
    pub runtime: Arc<QueueRuntime>,
    /// Transcreation → job conversion
    pub intake: Arc<Intake>,
    /// Loaded configuration
    pub settings: Arc<Settings>,
}

impl AppState {
    pub fn new(
        db: SqlitePool,
        event_bus: EventBus,
        runtime: Arc<QueueRuntime>,
        intake: Arc<Intake>,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            db,
            event_bus,
            runtime,
            intake,
            settings,
        }
    }
}

/// Build the application router
///
/// - `POST /jobs` - accept a transcreation for retargeting
/// - `GET /jobs/:id` - poll job status
/// - `POST /jobs/:id/cancel` - cancel at the next checkpoint
/// - `GET /jobs/:id/events` - SSE status stream
/// - `GET /health` - health check
/// - `GET /blobs/*` - final artifacts, when the filesystem blob store
///   is configured
pub fn build_router(state: AppState) -> Router {
    let router = api::routes();
    let router = if let Some(dir) = &state.settings.blob_public_dir {
        router.nest_service("/blobs", tower_http::services::ServeDir::new(dir))
    } else {
        router
    };
    router.with_state(state)
}
