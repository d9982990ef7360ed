//! Landmark inverted index (fingerprints.db)
//!
//! The index maps packed hashes to (track, anchor frame) postings. Writes
//! are serialized through an explicit [`WriterToken`]: every mutating
//! method takes a [`WriterGuard`], so exclusive access is visible in the
//! types instead of being a convention. Reads need no guard.

use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

use crate::db::retry::retry_on_lock;
use crate::fingerprint::landmark::Landmark;
use crate::{Error, Result};

const MAX_LOCK_WAIT_MS: u64 = 5_000;

/// Rows per multi-row INSERT, keeping bind counts under SQLite's limit
const INSERT_CHUNK_ROWS: usize = 300;

/// Hashes per IN(...) clause in queries
const QUERY_CHUNK_HASHES: usize = 500;

/// Process-wide writer mutual exclusion for the fingerprint index
#[derive(Clone)]
pub struct WriterToken {
    inner: Arc<tokio::sync::Mutex<()>>,
}

impl WriterToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Wait for exclusive write access
    pub async fn acquire(&self) -> WriterGuard<'_> {
        WriterGuard {
            _lock: self.inner.lock().await,
        }
    }
}

impl Default for WriterToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Proof of exclusive write access; hold it for the whole write
pub struct WriterGuard<'a> {
    _lock: tokio::sync::MutexGuard<'a, ()>,
}

/// One posting from the inverted index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashHit {
    pub track_id: Uuid,
    /// Anchor frame of the hash within the indexed track
    pub offset_frames: i64,
}

/// Fingerprint index seam
///
/// The SQLite adapter is the default; tests substitute failing doubles.
#[async_trait::async_trait]
pub trait FingerprintIndex: Send + Sync {
    /// Replace a track's postings with the given landmarks
    async fn index_track(
        &self,
        guard: &WriterGuard<'_>,
        track_id: Uuid,
        landmarks: &[Landmark],
    ) -> Result<()>;

    /// Remove a track's postings; returns the number of hash rows removed
    async fn remove_track(&self, guard: &WriterGuard<'_>, track_id: Uuid) -> Result<u64>;

    /// Postings for each query hash, keyed by hash
    async fn query_hashes(&self, hashes: &[u32]) -> Result<HashMap<u32, Vec<HashHit>>>;

    /// Ids of all indexed tracks
    async fn indexed_track_ids(&self) -> Result<Vec<Uuid>>;

    /// Number of postings stored for a track
    async fn hash_count(&self, track_id: Uuid) -> Result<u64>;
}

/// SQLite-backed fingerprint index
pub struct SqliteFingerprintIndex {
    pool: SqlitePool,
}

impl SqliteFingerprintIndex {
    /// Open (creating if needed) the index database and ensure its schema
    pub async fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
        tracing::debug!("Connecting to fingerprint database: {}", db_url);

        let pool = SqlitePool::connect(&db_url)
            .await
            .map_err(|e| store_unavailable(e.to_string()))?;

        let index = Self { pool };
        index.init_tables().await?;
        Ok(index)
    }

    /// In-memory index for tests
    #[cfg(test)]
    pub async fn open_memory() -> Result<Self> {
        let pool = SqlitePool::connect("sqlite::memory:")
            .await
            .map_err(|e| store_unavailable(e.to_string()))?;
        let index = Self { pool };
        index.init_tables().await?;
        Ok(index)
    }

    async fn init_tables(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS fingerprints (
                hash INTEGER NOT NULL,
                track_id TEXT NOT NULL,
                offset_frames INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_fingerprints_hash ON fingerprints(hash)")
            .execute(&self.pool)
            .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_fingerprints_track ON fingerprints(track_id)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS indexed_tracks (
                track_id TEXT PRIMARY KEY,
                hash_count INTEGER NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        tracing::info!("Fingerprint tables initialized (fingerprints, indexed_tracks)");

        Ok(())
    }
}

#[async_trait::async_trait]
impl FingerprintIndex for SqliteFingerprintIndex {
    async fn index_track(
        &self,
        _guard: &WriterGuard<'_>,
        track_id: Uuid,
        landmarks: &[Landmark],
    ) -> Result<()> {
        let track = track_id.to_string();
        let created_at = chrono::Utc::now().to_rfc3339();

        retry_on_lock("fingerprint_index_track", MAX_LOCK_WAIT_MS, || async {
            let mut tx = self.pool.begin().await.map_err(Error::Database)?;

            // Re-indexing replaces any previous postings
            sqlx::query("DELETE FROM fingerprints WHERE track_id = ?")
                .bind(&track)
                .execute(&mut *tx)
                .await
                .map_err(Error::Database)?;

            for chunk in landmarks.chunks(INSERT_CHUNK_ROWS) {
                let mut sql = String::from(
                    "INSERT INTO fingerprints (hash, track_id, offset_frames) VALUES ",
                );
                sql.push_str(&vec!["(?, ?, ?)"; chunk.len()].join(", "));

                let mut query = sqlx::query(&sql);
                for lm in chunk {
                    query = query
                        .bind(lm.hash as i64)
                        .bind(&track)
                        .bind(lm.anchor_frame as i64);
                }
                query.execute(&mut *tx).await.map_err(Error::Database)?;
            }

            sqlx::query(
                r#"
                INSERT INTO indexed_tracks (track_id, hash_count, created_at)
                VALUES (?, ?, ?)
                ON CONFLICT(track_id) DO UPDATE SET
                    hash_count = excluded.hash_count,
                    created_at = excluded.created_at
                "#,
            )
            .bind(&track)
            .bind(landmarks.len() as i64)
            .bind(&created_at)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;

            tx.commit().await.map_err(Error::Database)?;
            Ok(())
        })
        .await
        .map_err(map_store_err)?;

        tracing::info!(
            track_id = %track_id,
            hashes = landmarks.len(),
            "Indexed track fingerprints"
        );
        Ok(())
    }

    async fn remove_track(&self, _guard: &WriterGuard<'_>, track_id: Uuid) -> Result<u64> {
        let track = track_id.to_string();

        let removed = retry_on_lock("fingerprint_remove_track", MAX_LOCK_WAIT_MS, || async {
            let mut tx = self.pool.begin().await.map_err(Error::Database)?;

            let result = sqlx::query("DELETE FROM fingerprints WHERE track_id = ?")
                .bind(&track)
                .execute(&mut *tx)
                .await
                .map_err(Error::Database)?;

            sqlx::query("DELETE FROM indexed_tracks WHERE track_id = ?")
                .bind(&track)
                .execute(&mut *tx)
                .await
                .map_err(Error::Database)?;

            tx.commit().await.map_err(Error::Database)?;
            Ok(result.rows_affected())
        })
        .await
        .map_err(map_store_err)?;

        Ok(removed)
    }

    async fn query_hashes(&self, hashes: &[u32]) -> Result<HashMap<u32, Vec<HashHit>>> {
        let mut postings: HashMap<u32, Vec<HashHit>> = HashMap::new();
        if hashes.is_empty() {
            return Ok(postings);
        }

        for chunk in hashes.chunks(QUERY_CHUNK_HASHES) {
            let sql = format!(
                "SELECT hash, track_id, offset_frames FROM fingerprints WHERE hash IN ({})",
                vec!["?"; chunk.len()].join(", ")
            );

            let mut query = sqlx::query(&sql);
            for hash in chunk {
                query = query.bind(*hash as i64);
            }

            let rows = query
                .fetch_all(&self.pool)
                .await
                .map_err(|e| store_unavailable(e.to_string()))?;

            for row in &rows {
                let hash: i64 = row.get("hash");
                let track_id: String = row.get("track_id");
                let offset_frames: i64 = row.get("offset_frames");

                let track_id = Uuid::parse_str(&track_id)
                    .map_err(|e| Error::Internal(format!("Invalid track id in index: {}", e)))?;

                postings.entry(hash as u32).or_default().push(HashHit {
                    track_id,
                    offset_frames,
                });
            }
        }

        Ok(postings)
    }

    async fn indexed_track_ids(&self) -> Result<Vec<Uuid>> {
        let rows = sqlx::query("SELECT track_id FROM indexed_tracks")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| store_unavailable(e.to_string()))?;

        let mut ids = Vec::with_capacity(rows.len());
        for row in &rows {
            let id: String = row.get("track_id");
            ids.push(
                Uuid::parse_str(&id)
                    .map_err(|e| Error::Internal(format!("Invalid track id in index: {}", e)))?,
            );
        }
        Ok(ids)
    }

    async fn hash_count(&self, track_id: Uuid) -> Result<u64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM fingerprints WHERE track_id = ?")
                .bind(track_id.to_string())
                .fetch_one(&self.pool)
                .await
                .map_err(|e| store_unavailable(e.to_string()))?;
        Ok(count as u64)
    }
}

fn store_unavailable(detail: String) -> Error {
    Error::StoreUnavailable {
        store: "fingerprint",
        detail,
    }
}

/// Writes go through retry_on_lock, which speaks Database errors; fold
/// whatever is left into the store taxonomy
fn map_store_err(e: Error) -> Error {
    match e {
        Error::Database(db) => store_unavailable(db.to_string()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::landmark::pack_hash;
    use std::time::Duration;

    fn landmarks_for(hashes: &[(u16, u16, u32)], base_frame: u32) -> Vec<Landmark> {
        hashes
            .iter()
            .enumerate()
            .map(|(i, &(f1, f2, dt))| Landmark {
                hash: pack_hash(f1, f2, dt),
                anchor_frame: base_frame + i as u32,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_index_and_query_round_trip() {
        let index = SqliteFingerprintIndex::open_memory().await.unwrap();
        let token = WriterToken::new();
        let track = Uuid::new_v4();

        let landmarks = landmarks_for(&[(10, 20, 3), (30, 40, 5), (10, 20, 3)], 100);
        {
            let guard = token.acquire().await;
            index.index_track(&guard, track, &landmarks).await.unwrap();
        }

        let hits = index
            .query_hashes(&[pack_hash(10, 20, 3), pack_hash(99, 99, 9)])
            .await
            .unwrap();

        let postings = hits.get(&pack_hash(10, 20, 3)).unwrap();
        assert_eq!(postings.len(), 2);
        assert!(postings.iter().all(|h| h.track_id == track));
        assert!(hits.get(&pack_hash(99, 99, 9)).is_none());

        assert_eq!(index.hash_count(track).await.unwrap(), 3);
        assert_eq!(index.indexed_track_ids().await.unwrap(), vec![track]);
    }

    #[tokio::test]
    async fn test_reindex_replaces_postings() {
        let index = SqliteFingerprintIndex::open_memory().await.unwrap();
        let token = WriterToken::new();
        let track = Uuid::new_v4();

        let guard = token.acquire().await;
        index
            .index_track(&guard, track, &landmarks_for(&[(1, 2, 1), (3, 4, 2)], 0))
            .await
            .unwrap();
        index
            .index_track(&guard, track, &landmarks_for(&[(5, 6, 1)], 0))
            .await
            .unwrap();
        drop(guard);

        assert_eq!(index.hash_count(track).await.unwrap(), 1);
        let hits = index.query_hashes(&[pack_hash(1, 2, 1)]).await.unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn test_remove_track() {
        let index = SqliteFingerprintIndex::open_memory().await.unwrap();
        let token = WriterToken::new();
        let track = Uuid::new_v4();

        let guard = token.acquire().await;
        index
            .index_track(&guard, track, &landmarks_for(&[(1, 1, 1), (2, 2, 2)], 0))
            .await
            .unwrap();
        let removed = index.remove_track(&guard, track).await.unwrap();
        drop(guard);

        assert_eq!(removed, 2);
        assert_eq!(index.hash_count(track).await.unwrap(), 0);
        assert!(index.indexed_track_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_large_batch_chunked_insert() {
        let index = SqliteFingerprintIndex::open_memory().await.unwrap();
        let token = WriterToken::new();
        let track = Uuid::new_v4();

        // Spans several insert chunks
        let landmarks: Vec<Landmark> = (0..1000u32)
            .map(|i| Landmark {
                hash: pack_hash((i % 512) as u16, ((i * 7) % 512) as u16, (i % 63) + 1),
                anchor_frame: i,
            })
            .collect();

        let guard = token.acquire().await;
        index.index_track(&guard, track, &landmarks).await.unwrap();
        drop(guard);

        assert_eq!(index.hash_count(track).await.unwrap(), 1000);
    }

    #[tokio::test]
    async fn test_empty_query_returns_empty() {
        let index = SqliteFingerprintIndex::open_memory().await.unwrap();
        assert!(index.query_hashes(&[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_writer_token_is_exclusive() {
        let token = WriterToken::new();
        let guard = token.acquire().await;

        let token2 = token.clone();
        let contender = tokio::spawn(async move {
            let _guard = token2.acquire().await;
        });

        // Second acquire must block while the first guard lives
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!contender.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), contender)
            .await
            .expect("contender should finish after release")
            .unwrap();
    }
}
