//! Job intake and status endpoints

use crate::queue::JobSnapshot;
use crate::AppState;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use revoice_common::types::processing_stage;
use revoice_common::{Error, JobState};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct SubmitJobRequest {
    #[serde(rename = "transcreationId")]
    pub transcreation_id: Uuid,
}

/// POST /jobs - accept a transcreation for retargeting
pub async fn submit_job(
    State(state): State<AppState>,
    Json(request): Json<SubmitJobRequest>,
) -> Response {
    match state.intake.submit(request.transcreation_id).await {
        Ok(job_id) => (StatusCode::OK, Json(json!({ "jobId": job_id }))).into_response(),
        Err(e) => error_response(e),
    }
}

/// GET /jobs/:job_id - point-in-time status
///
/// Jobs pruned from the runtime after their retention window still
/// answer from the durable status row.
pub async fn get_job(State(state): State<AppState>, Path(job_id): Path<Uuid>) -> Response {
    if let Some(snapshot) = state.runtime.get(job_id) {
        return Json(status_body(&snapshot)).into_response();
    }

    match crate::db::status::get_status(&state.db, job_id).await {
        Ok(Some(row)) => Json(json!({
            "state": row.state,
            "progress": if row.state == JobState::Completed { 100 } else { 0 },
            "remainingTime": serde_json::Value::Null,
            "result": row.final_audio_url,
            "error": row.failure_reason,
            "data": serde_json::Value::Null,
            "title": "",
        }))
        .into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "NotFound", "message": format!("unknown job {job_id}") })),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.reason_code(), "message": e.to_string() })),
        )
            .into_response(),
    }
}

/// POST /jobs/:job_id/cancel - abort at the next checkpoint
pub async fn cancel_job(State(state): State<AppState>, Path(job_id): Path<Uuid>) -> Response {
    if state.runtime.cancel(job_id) {
        (StatusCode::ACCEPTED, Json(json!({ "cancelled": true }))).into_response()
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "NotFound", "message": format!("no cancellable job {job_id}") })),
        )
            .into_response()
    }
}

/// Shared status payload of the poll endpoint and the SSE stream
pub fn status_body(snapshot: &JobSnapshot) -> serde_json::Value {
    json!({
        "state": snapshot.state,
        "progress": snapshot.progress,
        "remainingTime": snapshot.estimated_remaining_secs,
        "result": snapshot.result_url,
        "error": snapshot.failure_reason,
        "data": snapshot.data,
        "title": snapshot.title,
    })
}

/// Status payload extended with the stream-only fields
pub fn stream_body(snapshot: &JobSnapshot) -> serde_json::Value {
    let mut body = status_body(snapshot);
    let failed = snapshot.state == JobState::Failed;
    body["processingStage"] = json!(processing_stage(snapshot.progress, failed));
    body["estimatedTimeRemaining"] = json!(snapshot.estimated_remaining_secs);
    body
}

fn error_response(error: Error) -> Response {
    let status = match &error {
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::PreconditionFailed(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(json!({
            "error": error.reason_code(),
            "message": error.to_string(),
        })),
    )
        .into_response()
}
