//! Job intake: transcreation record → queued job envelope
//!
//! Reads the transcreation and its ordered transcript from the job
//! store, derives one TTS request per segment, materializes the status
//! row and places the envelope on the priority queue.

use crate::db;
use crate::queue::QueueRuntime;
use revoice_common::types::{TtsRequestSpec, DEFAULT_LANGUAGE};
use revoice_common::{Error, JobEnvelope, JobState, Result, Settings, TranscriptSegment};
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

pub struct Intake {
    pool: SqlitePool,
    runtime: Arc<QueueRuntime>,
    settings: Arc<Settings>,
}

impl Intake {
    pub fn new(pool: SqlitePool, runtime: Arc<QueueRuntime>, settings: Arc<Settings>) -> Self {
        Self {
            pool,
            runtime,
            settings,
        }
    }

    /// Convert a transcreation into a job and enqueue it.
    ///
    /// Fails `NotFound` for unknown ids and `PreconditionFailed` when the
    /// record has no original audio or a previous run is still active.
    pub async fn submit(&self, transcreation_id: Uuid) -> Result<Uuid> {
        let transcreation = db::transcreations::fetch_transcreation(&self.pool, transcreation_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("transcreation {transcreation_id}")))?;

        if transcreation.original_audio_url.trim().is_empty() {
            return Err(Error::PreconditionFailed(
                "transcreation has no original audio URL".to_string(),
            ));
        }

        let target_language = transcreation
            .to_language
            .clone()
            .filter(|l| !l.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_LANGUAGE.to_string());

        let priority = self.settings.priority_for_plan(&transcreation.plan);
        let envelope = JobEnvelope {
            transcreation_id,
            original_audio_url: transcreation.original_audio_url.clone(),
            tts_requests: build_tts_requests(&transcreation.segments),
            transcript: transcreation.segments,
            target_language,
            owner_email: transcreation.owner_email,
            priority,
        };

        db::status::mark_active(&self.pool, transcreation_id, JobState::Processing).await?;
        let job_id = self.runtime.enqueue(envelope)?;
        info!(%job_id, priority, "Transcreation accepted for retargeting");
        Ok(job_id)
    }
}

/// One synthesis request per segment, preserving transcript order.
///
/// The per-request language is left empty here; the TTS client fills in
/// the job's target language at call time.
pub fn build_tts_requests(segments: &[TranscriptSegment]) -> Vec<TtsRequestSpec> {
    segments
        .iter()
        .enumerate()
        .map(|(index, segment)| TtsRequestSpec {
            segment_index: index,
            text: segment.text.clone(),
            voice: segment.voice.clone(),
            language: None,
            emotion: segment.emotion.clone(),
            speaker: segment.speaker.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{JobExecutor, QueueConfig};
    use revoice_common::types::Transcreation;
    use revoice_common::EventBus;
    use std::time::Duration;

    fn segment(start_ms: u64, text: &str, voice: &str) -> TranscriptSegment {
        TranscriptSegment {
            start_ms,
            end_ms: start_ms + 1000,
            text: text.to_string(),
            source_text: None,
            speaker: "s1".to_string(),
            emotion: None,
            voice: voice.to_string(),
        }
    }

    fn idle_runtime() -> Arc<QueueRuntime> {
        // never started: jobs stay queued, which is all intake tests need
        QueueRuntime::new(
            QueueConfig {
                worker_concurrency: 1,
                max_attempts: 3,
                backoff_base: Duration::from_millis(1),
                retain_completed: Duration::from_secs(3600),
                retain_failed: Duration::from_secs(86400),
            },
            EventBus::new(16),
            JobExecutor::func(|_ctx| Box::pin(async { Ok(String::new()) })),
        )
    }

    async fn seeded_intake(transcreation: &Transcreation) -> (Intake, Arc<QueueRuntime>, SqlitePool) {
        let pool = crate::db::init_memory_pool().await.unwrap();
        db::transcreations::save_transcreation(&pool, transcreation)
            .await
            .unwrap();
        let runtime = idle_runtime();
        let intake = Intake::new(pool.clone(), Arc::clone(&runtime), Arc::new(Settings::default()));
        (intake, runtime, pool)
    }

    fn transcreation(id: Uuid, url: &str, plan: &str) -> Transcreation {
        Transcreation {
            id,
            original_audio_url: url.to_string(),
            from_language: Some("en-US".to_string()),
            to_language: Some("es-ES".to_string()),
            plan: plan.to_string(),
            owner_email: None,
            segments: vec![segment(0, "Hola", "clone"), segment(1500, "Adiós", "clone")],
        }
    }

    #[test]
    fn requests_follow_transcript_order() {
        let segments = vec![
            segment(0, "uno", "clone"),
            segment(2000, "dos", "voice-a"),
            segment(4000, "tres", "clone"),
        ];
        let requests = build_tts_requests(&segments);
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[0].segment_index, 0);
        assert_eq!(requests[1].text, "dos");
        assert_eq!(requests[1].voice, "voice-a");
        assert_eq!(requests[2].segment_index, 2);
        assert!(requests.iter().all(|r| r.language.is_none()));
    }

    #[tokio::test]
    async fn submit_enqueues_and_materializes_status() {
        let id = Uuid::new_v4();
        let (intake, runtime, pool) = seeded_intake(&transcreation(id, "https://cdn/a.mp3", "pro")).await;

        let job_id = intake.submit(id).await.unwrap();
        assert_eq!(job_id, id);

        let snapshot = runtime.get(job_id).unwrap();
        assert_eq!(snapshot.state, JobState::Queued);
        assert_eq!(snapshot.data["priority"], 10); // pro plan

        let row = db::status::get_status(&pool, id).await.unwrap().unwrap();
        assert_eq!(row.state, JobState::Processing);
    }

    #[tokio::test]
    async fn unknown_transcreation_is_not_found() {
        let (intake, _runtime, _pool) =
            seeded_intake(&transcreation(Uuid::new_v4(), "https://cdn/a.mp3", "pro")).await;
        let err = intake.submit(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn empty_audio_url_fails_precondition() {
        let id = Uuid::new_v4();
        let (intake, _runtime, _pool) = seeded_intake(&transcreation(id, "  ", "pro")).await;
        let err = intake.submit(id).await.unwrap_err();
        assert!(matches!(err, Error::PreconditionFailed(_)));
    }

    #[tokio::test]
    async fn unknown_plan_maps_to_lowest_priority() {
        let id = Uuid::new_v4();
        let (intake, runtime, _pool) =
            seeded_intake(&transcreation(id, "https://cdn/a.mp3", "mystery-plan")).await;
        intake.submit(id).await.unwrap();
        let snapshot = runtime.get(id).unwrap();
        assert_eq!(snapshot.data["priority"], u32::MAX);
    }

    #[tokio::test]
    async fn double_submission_is_rejected_while_active() {
        let id = Uuid::new_v4();
        let (intake, _runtime, _pool) = seeded_intake(&transcreation(id, "https://cdn/a.mp3", "pro")).await;
        intake.submit(id).await.unwrap();
        let err = intake.submit(id).await.unwrap_err();
        assert!(matches!(err, Error::PreconditionFailed(_)));
    }
}
