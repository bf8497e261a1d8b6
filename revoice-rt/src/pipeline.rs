//! Per-job stage sequencer
//!
//! Runs one retargeting end to end inside a private workspace:
//! fetch-and-normalize → separate → build-references → synthesize →
//! combine → upload → mark-completed. Progress lands at fixed stage-end
//! percentages; cancellation is honored between stages and at the TTS
//! client's own checkpoints; the workspace is released on every exit
//! path.

use crate::db;
use crate::media::{
    Combiner, CombinerConfig, ReferenceBuilder, ReferencePolicy, Separator, Toolkit, Workspace,
};
use crate::queue::JobContext;
use crate::storage::BlobStore;
use crate::tts::TtsClient;
use revoice_common::{Error, JobState, Result, Settings};
use sqlx::SqlitePool;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub struct JobPipeline {
    settings: Arc<Settings>,
    pool: SqlitePool,
    toolkit: Toolkit,
    separator: Separator,
    tts: TtsClient,
    blob: BlobStore,
    http: reqwest::Client,
}

impl JobPipeline {
    pub fn new(
        settings: Arc<Settings>,
        pool: SqlitePool,
        tts: TtsClient,
        blob: BlobStore,
    ) -> Result<Self> {
        let toolkit = Toolkit::from_settings(&settings);
        let separator = Separator::from_settings(&settings);
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| Error::Internal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            settings,
            pool,
            toolkit,
            separator,
            tts,
            blob,
            http,
        })
    }

    /// Execute one job attempt. Returns the final signed URL.
    pub async fn run(&self, ctx: JobContext) -> Result<String> {
        let job_id = ctx.job_id;
        db::status::mark_active(&self.pool, job_id, JobState::Processing).await?;

        let workspace = Workspace::create(&self.settings.temp_root, "job")?;
        info!(%job_id, workspace = %workspace.root().display(), "Pipeline started");

        let result = self.run_stages(&ctx, &workspace).await;

        // release must run before the failure write so a crashed store
        // can never leak the temp tree
        workspace.release();

        if let Err(e) = &result {
            let reason = e.reason_code();
            if let Err(store_err) = db::status::mark_failed(&self.pool, job_id, reason).await {
                warn!(%job_id, "Failed to persist failure state: {store_err}");
            }
        }
        result
    }

    async fn run_stages(&self, ctx: &JobContext, workspace: &Workspace) -> Result<String> {
        let envelope = &ctx.envelope;
        let cancel = &ctx.cancel;

        // Stage 1: fetch-and-normalize-original
        checkpoint(cancel)?;
        let fetched = self.fetch_original(&envelope.original_audio_url, workspace, cancel).await?;
        let original = workspace.named_path(workspace.root(), "original.wav");
        self.toolkit.to_wav(&fetched, &original).await?;
        workspace.verify(&original)?;
        ctx.progress.update(10, "fetch-and-normalize-original");

        // Stage 2: separate
        checkpoint(cancel)?;
        let stems = self.separator.separate(&original, workspace).await?;
        ctx.progress.update(25, "separate");

        // Stage 3: build-references
        checkpoint(cancel)?;
        let reference_builder = ReferenceBuilder::new(
            self.toolkit.clone(),
            ReferencePolicy::default(),
            &self.settings,
        );
        let references = reference_builder
            .build(&stems.vocals, &envelope.transcript, workspace)
            .await?;
        ctx.progress.update(40, "build-references");

        // Stage 4: synthesize (batched; progress per completed batch)
        checkpoint(cancel)?;
        let progress = ctx.progress.clone();
        let speech = self
            .tts
            .batch(
                &envelope.tts_requests,
                &envelope.target_language,
                &references,
                workspace,
                cancel,
                |done, total| {
                    let percent = (40 + 50 * done / total.max(1)).min(90) as u8;
                    progress.update(percent, "synthesize");
                },
            )
            .await?;

        // Stage 5: combine
        checkpoint(cancel)?;
        let combiner = Combiner::new(
            self.toolkit.clone(),
            CombinerConfig::from_settings(&self.settings),
        );
        let final_mix = combiner
            .combine(&stems.accompaniment, &speech, &envelope.transcript, workspace)
            .await?;
        // later stages with lower nominal percents clamp monotonic
        ctx.progress.update(80, "combine");

        // Stage 6: upload
        checkpoint(cancel)?;
        let url = self
            .blob
            .upload(&final_mix, &self.settings.bucket_name)
            .await?;
        ctx.progress.update(95, "upload");

        // Stage 7: mark-completed; the runtime emits the terminal event
        db::status::mark_completed(&self.pool, ctx.job_id, &url).await?;
        ctx.progress.update(100, "mark-completed");

        info!(job_id = %ctx.job_id, url = %url, "Pipeline completed");
        Ok(url)
    }

    /// Download an http(s) original, or copy a local one, into the
    /// workspace
    async fn fetch_original(
        &self,
        url: &str,
        workspace: &Workspace,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        let target = workspace.path("source", None);
        if url.starts_with("http://") || url.starts_with("https://") {
            let response = tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                response = self.http.get(url).send() => response,
            }
            .and_then(|r| r.error_for_status())
            .map_err(|e| Error::Internal(format!("original audio fetch failed: {e}")))?;

            let bytes = tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                bytes = response.bytes() => bytes,
            }
            .map_err(|e| Error::Internal(format!("original audio read failed: {e}")))?;

            tokio::fs::write(&target, &bytes).await?;
        } else {
            let source = url.strip_prefix("file://").unwrap_or(url);
            tokio::fs::copy(source, &target).await?;
        }
        workspace.verify(&target)?;
        Ok(target)
    }
}

fn checkpoint(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(Error::Cancelled)
    } else {
        Ok(())
    }
}
