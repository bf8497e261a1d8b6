//! Per-job status streaming (Server-Sent Events)
//!
//! On connect the client immediately receives a snapshot; every
//! progress/terminal event for the job re-derives a fresh snapshot from
//! the runtime and pushes it. After a terminal snapshot the stream stays
//! open briefly to guarantee delivery, then closes. Unknown or expired
//! jobs get a 404 and no subscription.

use super::jobs::stream_body;
use crate::AppState;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How long a stream lingers after pushing a terminal snapshot
const TERMINAL_LINGER: Duration = Duration::from_secs(5);

const HEARTBEAT: Duration = Duration::from_secs(15);

/// GET /jobs/:job_id/events
pub async fn job_event_stream(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Response {
    // subscribe only for jobs the runtime still knows
    let Some(initial) = state.runtime.get(job_id) else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "NotFound", "message": format!("unknown job {job_id}") })),
        )
            .into_response();
    };

    info!(%job_id, "SSE client subscribed to job status");
    let mut rx = state.event_bus.subscribe();
    let runtime = state.runtime.clone();

    let stream = async_stream::stream! {
        let initial_terminal = initial.state.is_terminal();
        yield Ok::<_, std::convert::Infallible>(status_event(&initial));

        while !initial_terminal {
            tokio::select! {
                _ = tokio::time::sleep(HEARTBEAT) => {
                    yield Ok(Event::default().comment("heartbeat"));
                }
                received = rx.recv() => match received {
                    Ok(event) if event.job_id() == job_id => {
                        // the event is only a wake-up; the payload is
                        // re-derived from the runtime
                        let Some(snapshot) = runtime.get(job_id) else {
                            debug!(%job_id, "Job pruned mid-stream; closing");
                            break;
                        };
                        let terminal = snapshot.state.is_terminal();
                        yield Ok(status_event(&snapshot));
                        if terminal {
                            break;
                        }
                    }
                    Ok(_) => {} // another job's event
                    Err(RecvError::Lagged(skipped)) => {
                        // harmless: the next event triggers a fresh snapshot
                        warn!(%job_id, skipped, "SSE subscriber lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }

        // guarantee terminal delivery before closing the sink
        tokio::time::sleep(TERMINAL_LINGER).await;
        debug!(%job_id, "SSE stream closing after terminal snapshot");
    };

    Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(HEARTBEAT).text("keep-alive"))
        .into_response()
}

fn status_event(snapshot: &crate::queue::JobSnapshot) -> Event {
    Event::default()
        .event("status")
        .data(stream_body(snapshot).to_string())
}
