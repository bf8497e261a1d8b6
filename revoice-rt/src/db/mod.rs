//! Job store access (SQLite)
//!
//! The store holds transcreation records with their transcripts
//! (read-only to the core) and the per-transcreation job status row
//! (the core's only write surface).

pub mod schema;
pub mod status;
pub mod transcreations;

use revoice_common::Result;
use sqlx::SqlitePool;
use std::path::Path;

/// Initialize the database connection pool and ensure the schema exists
pub async fn init_database_pool(db_path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    tracing::debug!("Connecting to database: {}", db_url);

    let pool = SqlitePool::connect(&db_url).await?;
    schema::initialize_schema(&pool).await?;
    Ok(pool)
}

/// In-memory pool for tests
pub async fn init_memory_pool() -> Result<SqlitePool> {
    let pool = SqlitePool::connect("sqlite::memory:").await?;
    schema::initialize_schema(&pool).await?;
    Ok(pool)
}
