//! Track row operations
//!
//! Uses `retry_on_lock` on write paths to ride out transient lock
//! contention with concurrent readers.

use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::db::retry::retry_on_lock;
use crate::models::Track;
use crate::{Error, Result};

/// Max total time to wait out "database is locked" on writes
const MAX_LOCK_WAIT_MS: u64 = 5_000;

/// Insert a new track row (the ingestion commit point)
pub async fn insert_track(
    pool: &SqlitePool,
    track: &Track,
    coarse_digest: Option<&[u8]>,
) -> Result<()> {
    let id = track.id.to_string();
    let created_at = track.created_at.to_rfc3339();

    retry_on_lock("insert_track", MAX_LOCK_WAIT_MS, || async {
        sqlx::query(
            r#"
            INSERT INTO tracks (
                id, content_hash, title, artist, duration_seconds,
                fingerprint_indexed, embedding_model, embedding_dim,
                embedding_count, coarse_digest, canonical_path, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&track.content_hash)
        .bind(&track.title)
        .bind(&track.artist)
        .bind(track.duration_seconds)
        .bind(track.fingerprint_indexed as i64)
        .bind(&track.embedding_model)
        .bind(track.embedding_dim.map(|d| d as i64))
        .bind(track.embedding_count as i64)
        .bind(coarse_digest)
        .bind(&track.canonical_path)
        .bind(&created_at)
        .execute(pool)
        .await
        .map_err(Error::Database)?;

        Ok(())
    })
    .await
}

/// Look up a track id by content hash (exact-duplicate check)
pub async fn find_by_hash(pool: &SqlitePool, content_hash: &str) -> Result<Option<Uuid>> {
    let row = sqlx::query("SELECT id FROM tracks WHERE content_hash = ? LIMIT 1")
        .bind(content_hash)
        .fetch_optional(pool)
        .await?;

    match row {
        Some(row) => {
            let id: String = row.get("id");
            Ok(Some(parse_uuid(&id)?))
        }
        None => Ok(None),
    }
}

/// Load a track by id
pub async fn get_track(pool: &SqlitePool, track_id: Uuid) -> Result<Option<Track>> {
    let row = sqlx::query(
        r#"
        SELECT id, content_hash, title, artist, duration_seconds,
               fingerprint_indexed, embedding_model, embedding_dim,
               embedding_count, canonical_path, created_at
        FROM tracks
        WHERE id = ?
        "#,
    )
    .bind(track_id.to_string())
    .fetch_optional(pool)
    .await?;

    match row {
        Some(row) => Ok(Some(row_to_track(&row)?)),
        None => Ok(None),
    }
}

/// Coarse digests of tracks within a duration window, for near-duplicate
/// scanning. Only tracks that carry a digest are returned.
pub async fn digest_candidates(
    pool: &SqlitePool,
    min_seconds: f64,
    max_seconds: f64,
) -> Result<Vec<(Uuid, Vec<u8>)>> {
    let rows = sqlx::query(
        r#"
        SELECT id, coarse_digest
        FROM tracks
        WHERE coarse_digest IS NOT NULL
          AND duration_seconds BETWEEN ? AND ?
        "#,
    )
    .bind(min_seconds)
    .bind(max_seconds)
    .fetch_all(pool)
    .await?;

    let mut candidates = Vec::with_capacity(rows.len());
    for row in &rows {
        let id: String = row.get("id");
        let digest: Vec<u8> = row.get("coarse_digest");
        candidates.push((parse_uuid(&id)?, digest));
    }
    Ok(candidates)
}

/// Flip the fingerprint-indexed flag after (re)indexing
pub async fn set_fingerprint_indexed(
    pool: &SqlitePool,
    track_id: Uuid,
    indexed: bool,
) -> Result<()> {
    let id = track_id.to_string();

    retry_on_lock("set_fingerprint_indexed", MAX_LOCK_WAIT_MS, || async {
        sqlx::query("UPDATE tracks SET fingerprint_indexed = ? WHERE id = ?")
            .bind(indexed as i64)
            .bind(&id)
            .execute(pool)
            .await
            .map_err(Error::Database)?;
        Ok(())
    })
    .await
}

/// Record the embedding state after (re)embedding
pub async fn set_embedding_state(
    pool: &SqlitePool,
    track_id: Uuid,
    model: &str,
    dim: u32,
    count: u32,
) -> Result<()> {
    let id = track_id.to_string();

    retry_on_lock("set_embedding_state", MAX_LOCK_WAIT_MS, || async {
        sqlx::query(
            r#"
            UPDATE tracks
            SET embedding_model = ?, embedding_dim = ?, embedding_count = ?
            WHERE id = ?
            "#,
        )
        .bind(model)
        .bind(dim as i64)
        .bind(count as i64)
        .bind(&id)
        .execute(pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    })
    .await
}

/// Delete a track row; returns false when no such track existed
pub async fn delete_track(pool: &SqlitePool, track_id: Uuid) -> Result<bool> {
    let id = track_id.to_string();

    retry_on_lock("delete_track", MAX_LOCK_WAIT_MS, || async {
        let result = sqlx::query("DELETE FROM tracks WHERE id = ?")
            .bind(&id)
            .execute(pool)
            .await
            .map_err(Error::Database)?;
        Ok(result.rows_affected() > 0)
    })
    .await
}

/// All track ids in the library (orphan reclamation scans against this)
pub async fn all_track_ids(pool: &SqlitePool) -> Result<Vec<Uuid>> {
    let rows = sqlx::query("SELECT id FROM tracks")
        .fetch_all(pool)
        .await?;

    let mut ids = Vec::with_capacity(rows.len());
    for row in &rows {
        let id: String = row.get("id");
        ids.push(parse_uuid(&id)?);
    }
    Ok(ids)
}

pub async fn count_tracks(pool: &SqlitePool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tracks")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| Error::Internal(format!("Invalid track id {}: {}", s, e)))
}

fn row_to_track(row: &sqlx::sqlite::SqliteRow) -> Result<Track> {
    let id: String = row.get("id");
    let created_at: String = row.get("created_at");
    let created_at = chrono::DateTime::parse_from_rfc3339(&created_at)
        .map_err(|e| Error::Internal(format!("Failed to parse created_at: {}", e)))?
        .with_timezone(&chrono::Utc);

    let fingerprint_indexed: i64 = row.get("fingerprint_indexed");
    let embedding_dim: Option<i64> = row.get("embedding_dim");
    let embedding_count: i64 = row.get("embedding_count");

    Ok(Track {
        id: parse_uuid(&id)?,
        content_hash: row.get("content_hash"),
        title: row.get("title"),
        artist: row.get("artist"),
        duration_seconds: row.get("duration_seconds"),
        fingerprint_indexed: fingerprint_indexed != 0,
        embedding_model: row.get("embedding_model"),
        embedding_dim: embedding_dim.map(|d| d as u32),
        embedding_count: embedding_count as u32,
        canonical_path: row.get("canonical_path"),
        created_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory_pool;
    use chrono::Utc;

    fn sample_track(hash: &str, duration: f64) -> Track {
        Track {
            id: Uuid::new_v4(),
            content_hash: hash.to_string(),
            title: Some("Test Title".to_string()),
            artist: Some("Test Artist".to_string()),
            duration_seconds: duration,
            fingerprint_indexed: true,
            embedding_model: Some("mel-stats-v1".to_string()),
            embedding_dim: Some(120),
            embedding_count: 7,
            canonical_path: Some("vault/ab/abcd.wav".to_string()),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_insert_and_get_round_trip() {
        let pool = memory_pool().await;
        let track = sample_track("hash-a", 240.0);

        insert_track(&pool, &track, Some(&[1, 2, 3, 4])).await.unwrap();

        let loaded = get_track(&pool, track.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, track.id);
        assert_eq!(loaded.content_hash, "hash-a");
        assert_eq!(loaded.title.as_deref(), Some("Test Title"));
        assert!(loaded.fingerprint_indexed);
        assert_eq!(loaded.embedding_dim, Some(120));
        assert_eq!(loaded.embedding_count, 7);
    }

    #[tokio::test]
    async fn test_find_by_hash() {
        let pool = memory_pool().await;
        let track = sample_track("hash-b", 180.0);
        insert_track(&pool, &track, None).await.unwrap();

        assert_eq!(
            find_by_hash(&pool, "hash-b").await.unwrap(),
            Some(track.id)
        );
        assert_eq!(find_by_hash(&pool, "hash-missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_duplicate_hash_rejected_by_constraint() {
        let pool = memory_pool().await;
        insert_track(&pool, &sample_track("hash-c", 100.0), None)
            .await
            .unwrap();

        let result = insert_track(&pool, &sample_track("hash-c", 101.0), None).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_digest_candidates_respect_duration_window() {
        let pool = memory_pool().await;

        let inside = sample_track("hash-d", 200.0);
        let outside = sample_track("hash-e", 400.0);
        let no_digest = sample_track("hash-f", 205.0);

        insert_track(&pool, &inside, Some(&[9, 9])).await.unwrap();
        insert_track(&pool, &outside, Some(&[8, 8])).await.unwrap();
        insert_track(&pool, &no_digest, None).await.unwrap();

        let candidates = digest_candidates(&pool, 180.0, 220.0).await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].0, inside.id);
        assert_eq!(candidates[0].1, vec![9, 9]);
    }

    #[tokio::test]
    async fn test_flag_updates() {
        let pool = memory_pool().await;
        let mut track = sample_track("hash-g", 150.0);
        track.fingerprint_indexed = false;
        track.embedding_model = None;
        track.embedding_dim = None;
        track.embedding_count = 0;
        insert_track(&pool, &track, None).await.unwrap();

        set_fingerprint_indexed(&pool, track.id, true).await.unwrap();
        set_embedding_state(&pool, track.id, "mel-stats-v1", 120, 12)
            .await
            .unwrap();

        let loaded = get_track(&pool, track.id).await.unwrap().unwrap();
        assert!(loaded.fingerprint_indexed);
        assert_eq!(loaded.embedding_model.as_deref(), Some("mel-stats-v1"));
        assert_eq!(loaded.embedding_count, 12);
    }

    #[tokio::test]
    async fn test_delete_track() {
        let pool = memory_pool().await;
        let track = sample_track("hash-h", 120.0);
        insert_track(&pool, &track, None).await.unwrap();

        assert!(delete_track(&pool, track.id).await.unwrap());
        assert!(!delete_track(&pool, track.id).await.unwrap());
        assert!(get_track(&pool, track.id).await.unwrap().is_none());
        assert_eq!(count_tracks(&pool).await.unwrap(), 0);
    }
}
