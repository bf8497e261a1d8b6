//! Transcreation and transcript reads

use revoice_common::types::{Transcreation, TranscriptSegment};
use revoice_common::Result;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

/// Load a transcreation with its transcript ordered by segment start
pub async fn fetch_transcreation(
    pool: &SqlitePool,
    id: Uuid,
) -> Result<Option<Transcreation>> {
    let id_str = id.to_string();

    let row = sqlx::query(
        r#"
        SELECT id, original_audio_url, from_language, to_language, plan, owner_email
        FROM transcreations
        WHERE id = ?
        "#,
    )
    .bind(&id_str)
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    let segments = fetch_segments(pool, &id_str).await?;

    Ok(Some(Transcreation {
        id,
        original_audio_url: row.get("original_audio_url"),
        from_language: row.get("from_language"),
        to_language: row.get("to_language"),
        plan: row.get("plan"),
        owner_email: row.get("owner_email"),
        segments,
    }))
}

async fn fetch_segments(pool: &SqlitePool, id_str: &str) -> Result<Vec<TranscriptSegment>> {
    let rows = sqlx::query(
        r#"
        SELECT start_ms, end_ms, text, source_text, speaker, emotion, voice
        FROM transcript_segments
        WHERE transcreation_id = ?
        ORDER BY start_ms, seq
        "#,
    )
    .bind(id_str)
    .fetch_all(pool)
    .await?;

    let mut segments = Vec::with_capacity(rows.len());
    for row in rows {
        let emotion: Option<String> = row.get("emotion");
        let emotion = match emotion {
            Some(raw) if !raw.is_empty() => serde_json::from_str(&raw)
                .map_err(|e| {
                    revoice_common::Error::Internal(format!("corrupt emotion column: {e}"))
                })?,
            _ => None,
        };
        segments.push(TranscriptSegment {
            start_ms: row.get::<i64, _>("start_ms") as u64,
            end_ms: row.get::<i64, _>("end_ms") as u64,
            text: row.get("text"),
            source_text: row.get("source_text"),
            speaker: row.get("speaker"),
            emotion,
            voice: row.get("voice"),
        });
    }
    Ok(segments)
}

/// Insert a transcreation and its transcript (used by seeding and tests)
pub async fn save_transcreation(pool: &SqlitePool, transcreation: &Transcreation) -> Result<()> {
    let id_str = transcreation.id.to_string();

    sqlx::query(
        r#"
        INSERT INTO transcreations (id, original_audio_url, from_language, to_language, plan, owner_email)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            original_audio_url = excluded.original_audio_url,
            from_language = excluded.from_language,
            to_language = excluded.to_language,
            plan = excluded.plan,
            owner_email = excluded.owner_email
        "#,
    )
    .bind(&id_str)
    .bind(&transcreation.original_audio_url)
    .bind(&transcreation.from_language)
    .bind(&transcreation.to_language)
    .bind(&transcreation.plan)
    .bind(&transcreation.owner_email)
    .execute(pool)
    .await?;

    sqlx::query("DELETE FROM transcript_segments WHERE transcreation_id = ?")
        .bind(&id_str)
        .execute(pool)
        .await?;

    for (seq, segment) in transcreation.segments.iter().enumerate() {
        let emotion = segment
            .emotion
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| revoice_common::Error::Internal(format!("emotion serialization: {e}")))?;
        sqlx::query(
            r#"
            INSERT INTO transcript_segments
                (transcreation_id, seq, start_ms, end_ms, text, source_text, speaker, emotion, voice)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id_str)
        .bind(seq as i64)
        .bind(segment.start_ms as i64)
        .bind(segment.end_ms as i64)
        .bind(&segment.text)
        .bind(&segment.source_text)
        .bind(&segment.speaker)
        .bind(emotion)
        .bind(&segment.voice)
        .execute(pool)
        .await?;
    }

    Ok(())
}
