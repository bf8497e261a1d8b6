//! revoice-rt - Audio Retargeting Service binary

use anyhow::Result;
use clap::Parser;
use revoice_common::{EventBus, Settings};
use revoice_rt::intake::Intake;
use revoice_rt::notify::{spawn_notifier, Notifier};
use revoice_rt::pipeline::JobPipeline;
use revoice_rt::queue::{JobExecutor, QueueConfig, QueueRuntime};
use revoice_rt::storage::BlobStore;
use revoice_rt::tts::TtsClient;
use revoice_rt::{build_router, AppState};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "revoice-rt", about = "Audio retargeting service", version)]
struct Cli {
    /// Path to a TOML config file (overrides the platform default)
    #[arg(long, env = "REVOICE_CONFIG")]
    config: Option<PathBuf>,

    /// Listen port override
    #[arg(long)]
    port: Option<u16>,

    /// Job store database path override
    #[arg(long)]
    database: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    if let Some(config) = &cli.config {
        // Settings::load reads REVOICE_CONFIG
        std::env::set_var("REVOICE_CONFIG", config);
    }

    let mut settings = Settings::load()?;
    if let Some(port) = cli.port {
        settings.port = port;
    }
    if let Some(database) = cli.database {
        settings.database_path = database;
    }
    let settings = Arc::new(settings);

    info!("Starting revoice-rt (audio retargeting service)");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("Temp root: {}", settings.temp_root.display());
    std::fs::create_dir_all(&settings.temp_root)?;

    let db_pool = revoice_rt::db::init_database_pool(&settings.database_path).await?;
    info!("Job store ready: {}", settings.database_path.display());

    let event_bus = EventBus::new(256);

    let tts = TtsClient::from_settings(&settings)?;
    let blob = BlobStore::from_settings(&settings)?;
    let pipeline = Arc::new(JobPipeline::new(
        Arc::clone(&settings),
        db_pool.clone(),
        tts,
        blob,
    )?);

    let runtime = QueueRuntime::new(
        QueueConfig::from_settings(&settings),
        event_bus.clone(),
        JobExecutor::Pipeline(pipeline),
    );
    runtime.start();

    spawn_notifier(
        &event_bus,
        Notifier::from_webhook_url(settings.notify_webhook_url.clone()),
        Arc::clone(&runtime),
    );

    let intake = Arc::new(Intake::new(
        db_pool.clone(),
        Arc::clone(&runtime),
        Arc::clone(&settings),
    ));

    let state = AppState::new(
        db_pool,
        event_bus,
        Arc::clone(&runtime),
        intake,
        Arc::clone(&settings),
    );
    let app = build_router(state);

    let addr = format!("{}:{}", settings.host, settings.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(runtime))
        .await?;

    Ok(())
}

async fn shutdown_signal(runtime: Arc<QueueRuntime>) {
    let _ = tokio::signal::ctrl_c().await;
    info!("Shutdown requested, draining workers");
    runtime.shutdown();
}
