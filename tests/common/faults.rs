//! Store doubles for fault and latency injection
//!
//! Swapped in through `Engine::open_with_stores` to exercise partial
//! failure, rollback, and lane-concurrency behavior without touching
//! the real adapters.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use uuid::Uuid;

use sonance_core::embedding::{ChunkEmbedding, ChunkHit, VectorStore};
use sonance_core::fingerprint::{
    FingerprintIndex, HashHit, Landmark, SqliteFingerprintIndex, WriterGuard,
};
use sonance_core::{Error, Result};

fn down(store: &'static str) -> Error {
    Error::StoreUnavailable {
        store,
        detail: "store offline".to_string(),
    }
}

/// Fingerprint index that refuses every call
pub struct FailingFingerprintIndex;

#[async_trait::async_trait]
impl FingerprintIndex for FailingFingerprintIndex {
    async fn index_track(
        &self,
        _guard: &WriterGuard<'_>,
        _track_id: Uuid,
        _landmarks: &[Landmark],
    ) -> Result<()> {
        Err(down("fingerprint"))
    }

    async fn remove_track(&self, _guard: &WriterGuard<'_>, _track_id: Uuid) -> Result<u64> {
        Err(down("fingerprint"))
    }

    async fn query_hashes(&self, _hashes: &[u32]) -> Result<HashMap<u32, Vec<HashHit>>> {
        Err(down("fingerprint"))
    }

    async fn indexed_track_ids(&self) -> Result<Vec<Uuid>> {
        Err(down("fingerprint"))
    }

    async fn hash_count(&self, _track_id: Uuid) -> Result<u64> {
        Err(down("fingerprint"))
    }
}

/// Vector store that refuses every call
pub struct FailingVectorStore;

#[async_trait::async_trait]
impl VectorStore for FailingVectorStore {
    async fn upsert_track(
        &self,
        _track_id: Uuid,
        _model: &str,
        _chunks: &[ChunkEmbedding],
    ) -> Result<()> {
        Err(down("vector"))
    }

    async fn remove_track(&self, _track_id: Uuid) -> Result<u64> {
        Err(down("vector"))
    }

    async fn search(
        &self,
        _vector: &[f32],
        _k: usize,
        _exclude_track: Option<Uuid>,
    ) -> Result<Vec<ChunkHit>> {
        Err(down("vector"))
    }

    async fn track_ids(&self) -> Result<Vec<Uuid>> {
        Err(down("vector"))
    }

    async fn chunk_count(&self, _track_id: Uuid) -> Result<u64> {
        Err(down("vector"))
    }
}

/// Fingerprint index whose reads stall for a fixed delay
pub struct SlowFingerprintIndex {
    pub delay: Duration,
}

#[async_trait::async_trait]
impl FingerprintIndex for SlowFingerprintIndex {
    async fn index_track(
        &self,
        _guard: &WriterGuard<'_>,
        _track_id: Uuid,
        _landmarks: &[Landmark],
    ) -> Result<()> {
        Ok(())
    }

    async fn remove_track(&self, _guard: &WriterGuard<'_>, _track_id: Uuid) -> Result<u64> {
        Ok(0)
    }

    async fn query_hashes(&self, _hashes: &[u32]) -> Result<HashMap<u32, Vec<HashHit>>> {
        tokio::time::sleep(self.delay).await;
        Ok(HashMap::new())
    }

    async fn indexed_track_ids(&self) -> Result<Vec<Uuid>> {
        Ok(Vec::new())
    }

    async fn hash_count(&self, _track_id: Uuid) -> Result<u64> {
        Ok(0)
    }
}

/// Fingerprint index that parks its id snapshot until released,
/// delegating everything else to a real index
///
/// `indexed_track_ids` adds a permit to `entered`, then consumes one
/// from `release` before answering, letting a test freeze a caller at
/// that point and decide when it resumes.
pub struct PausingFingerprintIndex {
    pub inner: SqliteFingerprintIndex,
    pub entered: Arc<Semaphore>,
    pub release: Arc<Semaphore>,
}

#[async_trait::async_trait]
impl FingerprintIndex for PausingFingerprintIndex {
    async fn index_track(
        &self,
        guard: &WriterGuard<'_>,
        track_id: Uuid,
        landmarks: &[Landmark],
    ) -> Result<()> {
        self.inner.index_track(guard, track_id, landmarks).await
    }

    async fn remove_track(&self, guard: &WriterGuard<'_>, track_id: Uuid) -> Result<u64> {
        self.inner.remove_track(guard, track_id).await
    }

    async fn query_hashes(&self, hashes: &[u32]) -> Result<HashMap<u32, Vec<HashHit>>> {
        self.inner.query_hashes(hashes).await
    }

    async fn indexed_track_ids(&self) -> Result<Vec<Uuid>> {
        self.entered.add_permits(1);
        match self.release.acquire().await {
            Ok(permit) => permit.forget(),
            Err(e) => {
                return Err(Error::Internal(format!("release semaphore closed: {}", e)));
            }
        }
        self.inner.indexed_track_ids().await
    }

    async fn hash_count(&self, track_id: Uuid) -> Result<u64> {
        self.inner.hash_count(track_id).await
    }
}

/// Vector store whose reads stall for a fixed delay
pub struct SlowVectorStore {
    pub delay: Duration,
}

#[async_trait::async_trait]
impl VectorStore for SlowVectorStore {
    async fn upsert_track(
        &self,
        _track_id: Uuid,
        _model: &str,
        _chunks: &[ChunkEmbedding],
    ) -> Result<()> {
        Ok(())
    }

    async fn remove_track(&self, _track_id: Uuid) -> Result<u64> {
        Ok(0)
    }

    async fn search(
        &self,
        _vector: &[f32],
        _k: usize,
        _exclude_track: Option<Uuid>,
    ) -> Result<Vec<ChunkHit>> {
        tokio::time::sleep(self.delay).await;
        Ok(Vec::new())
    }

    async fn track_ids(&self) -> Result<Vec<Uuid>> {
        Ok(Vec::new())
    }

    async fn chunk_count(&self, _track_id: Uuid) -> Result<u64> {
        Ok(0)
    }
}
