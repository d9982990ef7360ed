//! Duplicate detection
//!
//! Two layers, both cheap relative to indexing:
//! - exact: SHA-256 over the source bytes, checked against the library
//!   before anything is decoded
//! - near: a chromaprint digest compared against tracks of similar
//!   duration, checked before any index writes
//!
//! The coarse digest is a dedup pre-filter only. Identification always
//! goes through the landmark index, never through this digest.

use rusty_chromaprint::{Configuration, Fingerprinter};
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use std::sync::Arc;
use uuid::Uuid;

use crate::audio::DecodedAudio;
use crate::config::IngestConfig;
use crate::db::tracks;
use crate::{Error, Result};

/// Digest pairs sharing fewer than this many u32 words are not comparable
const MIN_COMPARABLE_WORDS: usize = 16;

/// Duplicate detection service
#[derive(Debug, Clone)]
pub struct DedupEngine {
    /// Normalized digest distance at or below which tracks are duplicates
    near_dup_max_distance: f64,
    /// Candidate duration window as a fraction of the incoming duration
    duration_window: f64,
}

impl DedupEngine {
    pub fn new(config: &IngestConfig) -> Self {
        Self {
            near_dup_max_distance: config.near_dup_max_distance,
            duration_window: config.near_dup_duration_window,
        }
    }

    /// SHA-256 hex digest of the source bytes, computed off the runtime
    pub async fn hash_bytes(&self, bytes: Arc<Vec<u8>>) -> Result<String> {
        tokio::task::spawn_blocking(move || {
            let mut hasher = Sha256::new();
            hasher.update(bytes.as_slice());
            format!("{:x}", hasher.finalize())
        })
        .await
        .map_err(|e| Error::Internal(format!("Hash task failed: {}", e)))
    }

    /// Library lookup by content hash
    pub async fn find_exact_duplicate(
        &self,
        pool: &SqlitePool,
        content_hash: &str,
    ) -> Result<Option<Uuid>> {
        tracks::find_by_hash(pool, content_hash).await
    }

    /// Chromaprint digest of the low-rate PCM, computed off the runtime
    pub async fn coarse_digest(&self, audio: Arc<DecodedAudio>) -> Result<Vec<u32>> {
        tokio::task::spawn_blocking(move || {
            let samples: Vec<i16> = audio
                .low
                .samples
                .iter()
                .map(|&s| (s * 32767.0).clamp(-32768.0, 32767.0) as i16)
                .collect();

            let config = Configuration::preset_test2();
            let mut printer = Fingerprinter::new(&config);
            printer
                .start(audio.low.sample_rate, 1)
                .map_err(|e| Error::Internal(format!("Chromaprint init failed: {}", e)))?;
            printer.consume(&samples);
            printer.finish();

            Ok(printer.fingerprint().to_vec())
        })
        .await
        .map_err(|e| Error::Internal(format!("Digest task failed: {}", e)))?
    }

    /// Scan tracks of similar duration for a near-duplicate digest
    ///
    /// Returns the closest track at or below the distance threshold.
    pub async fn find_near_duplicate(
        &self,
        pool: &SqlitePool,
        digest: &[u32],
        duration_seconds: f64,
    ) -> Result<Option<Uuid>> {
        let min = duration_seconds * (1.0 - self.duration_window);
        let max = duration_seconds * (1.0 + self.duration_window);
        let candidates = tracks::digest_candidates(pool, min, max).await?;

        let mut best: Option<(Uuid, f64)> = None;
        for (track_id, stored_bytes) in candidates {
            let stored = digest_from_bytes(&stored_bytes);
            let distance = match digest_distance(digest, &stored) {
                Some(d) => d,
                None => continue,
            };
            if distance <= self.near_dup_max_distance
                && best.map_or(true, |(_, d)| distance < d)
            {
                best = Some((track_id, distance));
            }
        }

        if let Some((track_id, distance)) = best {
            tracing::info!(
                track_id = %track_id,
                distance = format!("{:.3}", distance),
                "Near-duplicate digest match"
            );
            return Ok(Some(track_id));
        }
        Ok(None)
    }
}

/// Normalized bit distance over the overlapping prefix of two digests
///
/// None when the overlap is too short to be meaningful.
pub fn digest_distance(a: &[u32], b: &[u32]) -> Option<f64> {
    let overlap = a.len().min(b.len());
    if overlap < MIN_COMPARABLE_WORDS {
        return None;
    }

    let differing: u32 = a
        .iter()
        .zip(b.iter())
        .take(overlap)
        .map(|(x, y)| (x ^ y).count_ones())
        .sum();

    Some(differing as f64 / (overlap as f64 * 32.0))
}

/// Digest serialization for the BLOB column (u32 little-endian)
pub fn digest_to_bytes(digest: &[u32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(digest.len() * 4);
    for word in digest {
        bytes.extend_from_slice(&word.to_le_bytes());
    }
    bytes
}

pub fn digest_from_bytes(bytes: &[u8]) -> Vec<u32> {
    bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}
