//! revoice-seed - load a transcreation and its transcript into the job
//! store, optionally submitting it to a running service.
//!
//! The transcript file is a JSON array of segments:
//!
//! ```json
//! [
//!   {"start_ms": 0, "end_ms": 1000, "text": "Hola", "speaker": "s1", "voice": "clone"},
//!   {"start_ms": 1000, "end_ms": 2500, "text": "¿Cómo estás?", "speaker": "s1", "voice": "clone"}
//! ]
//! ```

use anyhow::{bail, Context, Result};
use clap::Parser;
use revoice_common::types::{Transcreation, TranscriptSegment};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "revoice-seed", about = "Seed a transcreation into the job store", version)]
struct Cli {
    /// Job store database path
    #[arg(long, env = "DATABASE_PATH", default_value = "revoice.db")]
    database: PathBuf,

    /// URL or local path of the original audio
    #[arg(long)]
    audio_url: String,

    /// Source language code
    #[arg(long)]
    from_language: Option<String>,

    /// Target language code
    #[arg(long, default_value = "en-US")]
    to_language: String,

    /// Owner plan name (maps to queue priority)
    #[arg(long, default_value = "free")]
    plan: String,

    /// Owner contact for terminal notifications
    #[arg(long)]
    owner_email: Option<String>,

    /// Overwrite an existing transcreation instead of creating a new id
    #[arg(long)]
    id: Option<Uuid>,

    /// JSON file holding the ordered transcript segments
    transcript: PathBuf,

    /// Base URL of a running service to submit the job to, e.g.
    /// http://127.0.0.1:5730
    #[arg(long)]
    submit: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let raw = std::fs::read_to_string(&cli.transcript)
        .with_context(|| format!("cannot read transcript {}", cli.transcript.display()))?;
    let segments: Vec<TranscriptSegment> =
        serde_json::from_str(&raw).context("transcript is not a JSON segment array")?;

    if segments.is_empty() {
        bail!("transcript has no segments");
    }
    for (index, segment) in segments.iter().enumerate() {
        if segment.text.trim().is_empty() {
            bail!("segment {index} has empty text");
        }
        if segment.end_ms < segment.start_ms {
            bail!(
                "segment {index} ends before it starts ({} < {})",
                segment.end_ms,
                segment.start_ms
            );
        }
    }

    let pool = revoice_rt::db::init_database_pool(&cli.database).await?;
    let transcreation = Transcreation {
        id: cli.id.unwrap_or_else(Uuid::new_v4),
        original_audio_url: cli.audio_url,
        from_language: cli.from_language,
        to_language: Some(cli.to_language),
        plan: cli.plan,
        owner_email: cli.owner_email,
        segments,
    };
    revoice_rt::db::transcreations::save_transcreation(&pool, &transcreation).await?;
    info!(
        id = %transcreation.id,
        segments = transcreation.segments.len(),
        "Transcreation stored"
    );
    println!("{}", transcreation.id);

    if let Some(base) = cli.submit {
        let response = reqwest::Client::new()
            .post(format!("{}/jobs", base.trim_end_matches('/')))
            .json(&serde_json::json!({ "transcreationId": transcreation.id }))
            .send()
            .await
            .context("job submission request failed")?
            .error_for_status()
            .context("service rejected the job")?;
        let body: serde_json::Value = response.json().await?;
        info!(job_id = %body["jobId"], "Job submitted");
    }

    Ok(())
}
