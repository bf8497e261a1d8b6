//! Database schema initialization

use revoice_common::Result;
use sqlx::SqlitePool;

/// Create all tables and indexes if they do not exist
pub async fn initialize_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS transcreations (
            id TEXT PRIMARY KEY,
            original_audio_url TEXT NOT NULL,
            from_language TEXT,
            to_language TEXT,
            plan TEXT NOT NULL DEFAULT 'free',
            owner_email TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS transcript_segments (
            transcreation_id TEXT NOT NULL,
            seq INTEGER NOT NULL,
            start_ms INTEGER NOT NULL,
            end_ms INTEGER NOT NULL,
            text TEXT NOT NULL,
            source_text TEXT,
            speaker TEXT NOT NULL,
            emotion TEXT,
            voice TEXT NOT NULL,
            PRIMARY KEY (transcreation_id, seq),
            FOREIGN KEY (transcreation_id) REFERENCES transcreations(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_segments_by_start
        ON transcript_segments(transcreation_id, start_ms)
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS job_status (
            transcreation_id TEXT PRIMARY KEY,
            state TEXT NOT NULL,
            final_audio_url TEXT,
            failure_reason TEXT,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    tracing::debug!("Database schema initialized");
    Ok(())
}
