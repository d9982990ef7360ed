//! Chunk vector store (vectors.db)
//!
//! Vectors live in SQLite as f32 little-endian BLOBs and are served from
//! an in-memory cache for similarity scans. The table is created lazily on
//! the first upsert; searching an empty store just returns no hits.
//!
//! Brute-force cosine scan. At 120 dims a million chunks is under 500 MB
//! and a scan is a few milliseconds, which covers the target library size
//! without an ANN index.

use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::path::Path;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::db::retry::retry_on_lock;
use crate::embedding::model::l2_normalize;
use crate::{Error, Result};

const MAX_LOCK_WAIT_MS: u64 = 5_000;

/// Rows per multi-row INSERT, keeping bind counts under SQLite's limit
const INSERT_CHUNK_ROWS: usize = 150;

/// One embedded chunk ready for storage
#[derive(Debug, Clone)]
pub struct ChunkEmbedding {
    pub chunk_index: u32,
    pub offset_seconds: f64,
    pub vector: Vec<f32>,
}

/// One nearest-neighbor hit from a chunk query
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkHit {
    pub track_id: Uuid,
    pub chunk_index: u32,
    /// Cosine similarity in [-1, 1]
    pub score: f32,
}

/// Vector store seam
///
/// The SQLite adapter is the default; tests substitute failing doubles.
#[async_trait::async_trait]
pub trait VectorStore: Send + Sync {
    /// Replace all vectors for a track
    async fn upsert_track(
        &self,
        track_id: Uuid,
        model: &str,
        chunks: &[ChunkEmbedding],
    ) -> Result<()>;

    /// Drop all vectors for a track; returns the number of rows removed
    async fn remove_track(&self, track_id: Uuid) -> Result<u64>;

    /// The k stored chunks nearest to `vector` by cosine similarity
    ///
    /// Hits from `exclude_track` are filtered out before the k cutoff, so
    /// excluding a track never costs result slots.
    async fn search(
        &self,
        vector: &[f32],
        k: usize,
        exclude_track: Option<Uuid>,
    ) -> Result<Vec<ChunkHit>>;

    /// Ids of all tracks with at least one stored vector
    async fn track_ids(&self) -> Result<Vec<Uuid>>;

    /// Stored chunk count for one track
    async fn chunk_count(&self, track_id: Uuid) -> Result<u64>;
}

struct CachedChunk {
    chunk_index: u32,
    vector: Vec<f32>,
}

/// SQLite-backed vector store with an in-memory scan cache
///
/// The cache is loaded on first search and kept in step by upserts and
/// removals; `None` means not loaded yet.
pub struct SqliteVectorStore {
    pool: SqlitePool,
    cache: RwLock<Option<HashMap<Uuid, Vec<CachedChunk>>>>,
}

impl SqliteVectorStore {
    /// Open (creating if needed) the vector database
    ///
    /// The chunk table itself is not created until the first upsert.
    pub async fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
        tracing::debug!("Connecting to vector database: {}", db_url);

        let pool = SqlitePool::connect(&db_url)
            .await
            .map_err(|e| store_unavailable(e.to_string()))?;

        Ok(Self {
            pool,
            cache: RwLock::new(None),
        })
    }

    /// In-memory store for tests
    #[cfg(test)]
    pub async fn open_memory() -> Result<Self> {
        let pool = SqlitePool::connect("sqlite::memory:")
            .await
            .map_err(|e| store_unavailable(e.to_string()))?;
        Ok(Self {
            pool,
            cache: RwLock::new(None),
        })
    }

    async fn table_exists(&self) -> Result<bool> {
        let row = sqlx::query(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'embedding_chunks'",
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| store_unavailable(e.to_string()))?;
        Ok(row.is_some())
    }

    /// Load every stored vector; called once, then kept in step
    async fn ensure_cache(&self) -> Result<()> {
        {
            let cache = self.cache.read().await;
            if cache.is_some() {
                return Ok(());
            }
        }

        let mut cache = self.cache.write().await;
        if cache.is_some() {
            return Ok(());
        }

        let mut map: HashMap<Uuid, Vec<CachedChunk>> = HashMap::new();
        if self.table_exists().await? {
            let rows = sqlx::query(
                "SELECT track_id, chunk_index, vector FROM embedding_chunks \
                 ORDER BY track_id, chunk_index",
            )
            .fetch_all(&self.pool)
            .await
            .map_err(|e| store_unavailable(e.to_string()))?;

            for row in &rows {
                let id: String = row.get("track_id");
                let chunk_index: i64 = row.get("chunk_index");
                let blob: Vec<u8> = row.get("vector");

                let track_id = Uuid::parse_str(&id)
                    .map_err(|e| Error::Internal(format!("Invalid track id in store: {}", e)))?;

                map.entry(track_id).or_default().push(CachedChunk {
                    chunk_index: chunk_index as u32,
                    vector: bytes_to_vector(&blob),
                });
            }
            tracing::debug!(
                tracks = map.len(),
                "Loaded vector cache from embedding_chunks"
            );
        }

        *cache = Some(map);
        Ok(())
    }
}

#[async_trait::async_trait]
impl VectorStore for SqliteVectorStore {
    async fn upsert_track(
        &self,
        track_id: Uuid,
        model: &str,
        chunks: &[ChunkEmbedding],
    ) -> Result<()> {
        let track = track_id.to_string();

        // Vectors are stored normalized so dot product is cosine
        let normalized: Vec<ChunkEmbedding> = chunks
            .iter()
            .map(|c| ChunkEmbedding {
                chunk_index: c.chunk_index,
                offset_seconds: c.offset_seconds,
                vector: l2_normalize(c.vector.clone()),
            })
            .collect();

        retry_on_lock("vector_upsert_track", MAX_LOCK_WAIT_MS, || async {
            let mut tx = self.pool.begin().await.map_err(Error::Database)?;

            // Lazy schema: the table appears with the first stored track
            sqlx::query(
                r#"
                CREATE TABLE IF NOT EXISTS embedding_chunks (
                    track_id TEXT NOT NULL,
                    model TEXT NOT NULL,
                    chunk_index INTEGER NOT NULL,
                    offset_seconds REAL NOT NULL,
                    vector BLOB NOT NULL,
                    PRIMARY KEY (track_id, chunk_index)
                )
                "#,
            )
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;

            sqlx::query("DELETE FROM embedding_chunks WHERE track_id = ?")
                .bind(&track)
                .execute(&mut *tx)
                .await
                .map_err(Error::Database)?;

            for batch in normalized.chunks(INSERT_CHUNK_ROWS) {
                let mut sql = String::from(
                    "INSERT INTO embedding_chunks \
                     (track_id, model, chunk_index, offset_seconds, vector) VALUES ",
                );
                sql.push_str(&vec!["(?, ?, ?, ?, ?)"; batch.len()].join(", "));

                let mut query = sqlx::query(&sql);
                for chunk in batch {
                    query = query
                        .bind(&track)
                        .bind(model)
                        .bind(chunk.chunk_index as i64)
                        .bind(chunk.offset_seconds)
                        .bind(vector_to_bytes(&chunk.vector));
                }
                query.execute(&mut *tx).await.map_err(Error::Database)?;
            }

            tx.commit().await.map_err(Error::Database)?;
            Ok(())
        })
        .await
        .map_err(map_store_err)?;

        let mut cache = self.cache.write().await;
        if let Some(map) = cache.as_mut() {
            map.insert(
                track_id,
                normalized
                    .iter()
                    .map(|c| CachedChunk {
                        chunk_index: c.chunk_index,
                        vector: c.vector.clone(),
                    })
                    .collect(),
            );
        }
        drop(cache);

        tracing::info!(
            track_id = %track_id,
            model,
            chunks = chunks.len(),
            "Upserted track vectors"
        );
        Ok(())
    }

    async fn remove_track(&self, track_id: Uuid) -> Result<u64> {
        let track = track_id.to_string();

        let removed = retry_on_lock("vector_remove_track", MAX_LOCK_WAIT_MS, || async {
            if !self.table_exists().await? {
                return Ok(0);
            }
            let result = sqlx::query("DELETE FROM embedding_chunks WHERE track_id = ?")
                .bind(&track)
                .execute(&self.pool)
                .await
                .map_err(Error::Database)?;
            Ok(result.rows_affected())
        })
        .await
        .map_err(map_store_err)?;

        let mut cache = self.cache.write().await;
        if let Some(map) = cache.as_mut() {
            map.remove(&track_id);
        }
        Ok(removed)
    }

    async fn search(
        &self,
        vector: &[f32],
        k: usize,
        exclude_track: Option<Uuid>,
    ) -> Result<Vec<ChunkHit>> {
        if k == 0 || vector.is_empty() {
            return Ok(Vec::new());
        }

        self.ensure_cache().await?;
        let query = l2_normalize(vector.to_vec());

        let cache = self.cache.read().await;
        let map = match cache.as_ref() {
            Some(map) => map,
            None => return Ok(Vec::new()),
        };

        let mut hits = Vec::new();
        for (track_id, chunks) in map.iter() {
            if exclude_track == Some(*track_id) {
                continue;
            }
            for chunk in chunks {
                if chunk.vector.len() != query.len() {
                    continue;
                }
                let score: f32 = chunk.vector.iter().zip(&query).map(|(a, b)| a * b).sum();
                hits.push(ChunkHit {
                    track_id: *track_id,
                    chunk_index: chunk.chunk_index,
                    score,
                });
            }
        }

        hits.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.track_id.cmp(&b.track_id))
                .then_with(|| a.chunk_index.cmp(&b.chunk_index))
        });
        hits.truncate(k);
        Ok(hits)
    }

    async fn track_ids(&self) -> Result<Vec<Uuid>> {
        if !self.table_exists().await? {
            return Ok(Vec::new());
        }

        let rows = sqlx::query("SELECT DISTINCT track_id FROM embedding_chunks ORDER BY track_id")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| store_unavailable(e.to_string()))?;

        let mut ids = Vec::with_capacity(rows.len());
        for row in &rows {
            let id: String = row.get("track_id");
            ids.push(
                Uuid::parse_str(&id)
                    .map_err(|e| Error::Internal(format!("Invalid track id in store: {}", e)))?,
            );
        }
        Ok(ids)
    }

    async fn chunk_count(&self, track_id: Uuid) -> Result<u64> {
        if !self.table_exists().await? {
            return Ok(0);
        }

        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM embedding_chunks WHERE track_id = ?")
                .bind(track_id.to_string())
                .fetch_one(&self.pool)
                .await
                .map_err(|e| store_unavailable(e.to_string()))?;
        Ok(count as u64)
    }
}

/// f32 slice to little-endian bytes
fn vector_to_bytes(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vector.len() * 4);
    for value in vector {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

/// Little-endian bytes back to f32s; a trailing partial value is dropped
fn bytes_to_vector(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

fn store_unavailable(detail: String) -> Error {
    Error::StoreUnavailable {
        store: "vector",
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
