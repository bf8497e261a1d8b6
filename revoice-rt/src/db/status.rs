//! Job status persistence
//!
//! One row per transcreation with upsert semantics. Transitions are
//! monotonic except retry back to `processing`; `mark_completed` is
//! idempotent for the same URL and `mark_failed` after completion is
//! rejected.

use chrono::Utc;
use revoice_common::{Error, JobState, Result};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

/// Persisted status row
#[derive(Debug, Clone, PartialEq)]
pub struct StatusRow {
    pub state: JobState,
    pub final_audio_url: Option<String>,
    pub failure_reason: Option<String>,
}

pub async fn get_status(pool: &SqlitePool, id: Uuid) -> Result<Option<StatusRow>> {
    let row = sqlx::query(
        "SELECT state, final_audio_url, failure_reason FROM job_status WHERE transcreation_id = ?",
    )
    .bind(id.to_string())
    .fetch_optional(pool)
    .await?;

    match row {
        None => Ok(None),
        Some(row) => {
            let state: String = row.get("state");
            let state = state
                .parse::<JobState>()
                .map_err(Error::Internal)?;
            Ok(Some(StatusRow {
                state,
                final_audio_url: row.get("final_audio_url"),
                failure_reason: row.get("failure_reason"),
            }))
        }
    }
}

/// Upsert the row into a non-terminal state (`queued` / `processing`).
///
/// Retry transitions back to `processing` are allowed; everything else
/// is monotonic. Clears any previous failure reason.
pub async fn mark_active(pool: &SqlitePool, id: Uuid, state: JobState) -> Result<()> {
    debug_assert!(!state.is_terminal());
    sqlx::query(
        r#"
        INSERT INTO job_status (transcreation_id, state, final_audio_url, failure_reason, updated_at)
        VALUES (?, ?, NULL, NULL, ?)
        ON CONFLICT(transcreation_id) DO UPDATE SET
            state = excluded.state,
            failure_reason = NULL,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(id.to_string())
    .bind(state.as_str())
    .bind(Utc::now().to_rfc3339())
    .execute(pool)
    .await?;
    Ok(())
}

/// Record terminal success with the final audio URL.
///
/// Calling again with the same URL is a no-op; a different URL for an
/// already-completed job is rejected.
pub async fn mark_completed(pool: &SqlitePool, id: Uuid, url: &str) -> Result<()> {
    if let Some(existing) = get_status(pool, id).await? {
        if existing.state == JobState::Completed {
            return match existing.final_audio_url.as_deref() {
                Some(current) if current == url => Ok(()),
                _ => Err(Error::PreconditionFailed(format!(
                    "job {id} already completed with a different result"
                ))),
            };
        }
    }

    sqlx::query(
        r#"
        INSERT INTO job_status (transcreation_id, state, final_audio_url, failure_reason, updated_at)
        VALUES (?, 'completed', ?, NULL, ?)
        ON CONFLICT(transcreation_id) DO UPDATE SET
            state = 'completed',
            final_audio_url = excluded.final_audio_url,
            failure_reason = NULL,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(id.to_string())
    .bind(url)
    .bind(Utc::now().to_rfc3339())
    .execute(pool)
    .await?;
    Ok(())
}

/// Record terminal failure with a short stable reason.
///
/// Rejected once the job has completed.
pub async fn mark_failed(pool: &SqlitePool, id: Uuid, reason: &str) -> Result<()> {
    if let Some(existing) = get_status(pool, id).await? {
        if existing.state == JobState::Completed {
            return Err(Error::PreconditionFailed(format!(
                "job {id} already completed; failure not recorded"
            )));
        }
    }

    sqlx::query(
        r#"
        INSERT INTO job_status (transcreation_id, state, final_audio_url, failure_reason, updated_at)
        VALUES (?, 'failed', NULL, ?, ?)
        ON CONFLICT(transcreation_id) DO UPDATE SET
            state = 'failed',
            failure_reason = excluded.failure_reason,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(id.to_string())
    .bind(reason)
    .bind(Utc::now().to_rfc3339())
    .execute(pool)
    .await?;
    Ok(())
}
