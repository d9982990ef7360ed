//! Track metadata database (library.db)
//!
//! One of the engine's three stores. Holds the `tracks` table, whose rows
//! are the commit point of ingestion and the authority on what exists.

pub mod retry;
pub mod tracks;

use sqlx::SqlitePool;
use std::path::Path;

use crate::Result;

/// Open (creating if needed) the metadata database and ensure its schema
pub async fn init_metadata_pool(db_path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // mode=rwc: read, write, create
    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    tracing::debug!("Connecting to metadata database: {}", db_url);

    let pool = SqlitePool::connect(&db_url).await?;
    init_tables(&pool).await?;

    Ok(pool)
}

async fn init_tables(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tracks (
            id TEXT PRIMARY KEY,
            content_hash TEXT NOT NULL UNIQUE,
            title TEXT,
            artist TEXT,
            duration_seconds REAL NOT NULL,
            fingerprint_indexed INTEGER NOT NULL DEFAULT 0,
            embedding_model TEXT,
            embedding_dim INTEGER,
            embedding_count INTEGER NOT NULL DEFAULT 0,
            coarse_digest BLOB,
            canonical_path TEXT,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Near-duplicate scans filter candidates by duration window
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_tracks_duration ON tracks(duration_seconds)",
    )
    .execute(pool)
    .await?;

    tracing::info!("Metadata tables initialized (tracks)");

    Ok(())
}

#[cfg(test)]
pub(crate) async fn memory_pool() -> SqlitePool {
    let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
    init_tables(&pool).await.unwrap();
    pool
}
