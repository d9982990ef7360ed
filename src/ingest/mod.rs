//! Ingestion pipeline
//!
//! Takes a file from bytes on disk to a fully indexed track across the
//! three stores. Ordering carries the consistency model: duplicate
//! checks run before any write, index writes run before the metadata
//! row, and the metadata row is the commit point. Failures before the
//! commit roll the partial writes back best-effort; anything the
//! rollback misses stays invisible until [`IngestPipeline::reclaim_orphans`]
//! sweeps it.

pub mod vault;

pub use vault::AudioVault;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use lofty::file::TaggedFileExt;
use lofty::prelude::*;
use lofty::probe::Probe;
use sqlx::SqlitePool;
use tokio::sync::{RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use walkdir::WalkDir;

use crate::audio::{DecodedAudio, Decoder, SymphoniaDecoder};
use crate::config::{EmbeddingConfig, FingerprintConfig, IngestConfig};
use crate::db::tracks;
use crate::dedup::{digest_to_bytes, DedupEngine};
use crate::embedding::{AudioChunk, ChunkEmbedding, ChunkPolicy, EmbeddingModel, VectorStore};
use crate::events::{EngineEvent, EventBus};
use crate::fingerprint::{FingerprintIndex, LandmarkExtractor, WriterToken};
use crate::models::{BatchReport, IngestReport, IngestStatus, Track};
use crate::{Error, Result};

/// Bytes sniffed from each candidate file during a directory scan
const SCAN_HEADER_BYTES: usize = 64;

/// Per-file ingestion pipeline over the three stores
///
/// Holds the only [`WriterToken`] handle used for fingerprint writes, so
/// index mutation is serialized through this pipeline no matter how many
/// callers share it.
pub struct IngestPipeline {
    pool: SqlitePool,
    fingerprints: Arc<dyn FingerprintIndex>,
    vectors: Arc<dyn VectorStore>,
    writer: WriterToken,
    /// Held shared across a file's store writes and metadata commit;
    /// the orphan sweep takes it exclusively so a track between those
    /// two points never reads as orphaned
    sweep_gate: RwLock<()>,
    vault: AudioVault,
    decoder: Arc<SymphoniaDecoder>,
    dedup: DedupEngine,
    extractor: Arc<LandmarkExtractor>,
    model: Arc<dyn EmbeddingModel>,
    policy: ChunkPolicy,
    /// Shared with the vibe lane so inference never oversubscribes the CPU
    embed_permits: Arc<Semaphore>,
    events: EventBus,
    min_track_seconds: f64,
    max_track_seconds: f64,
}

impl IngestPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: SqlitePool,
        fingerprints: Arc<dyn FingerprintIndex>,
        vectors: Arc<dyn VectorStore>,
        writer: WriterToken,
        vault: AudioVault,
        decoder: Arc<SymphoniaDecoder>,
        model: Arc<dyn EmbeddingModel>,
        embed_permits: Arc<Semaphore>,
        events: EventBus,
        ingest: &IngestConfig,
        fingerprint: &FingerprintConfig,
        embedding: &EmbeddingConfig,
    ) -> Self {
        Self {
            pool,
            fingerprints,
            vectors,
            writer,
            sweep_gate: RwLock::new(()),
            vault,
            decoder,
            dedup: DedupEngine::new(ingest),
            extractor: Arc::new(LandmarkExtractor::new(fingerprint.fan_out)),
            model,
            policy: ChunkPolicy::new(embedding),
            embed_permits,
            events,
            min_track_seconds: ingest.min_track_seconds,
            max_track_seconds: ingest.max_track_seconds,
        }
    }

    /// Ingest one file
    ///
    /// Duplicates and out-of-bounds durations come back as statuses;
    /// decode and store failures are errors, with any partial writes
    /// already rolled back best-effort.
    pub async fn ingest_file(&self, path: &Path) -> Result<IngestReport> {
        let started = Instant::now();
        self.events.emit_lossy(EngineEvent::IngestStarted {
            path: path.to_path_buf(),
            timestamp: Utc::now(),
        });

        match self.ingest_inner(path, started).await {
            Ok(report) => {
                self.events.emit_lossy(EngineEvent::IngestFinished {
                    path: report.path.clone(),
                    status: report.status,
                    track_id: report.track_id,
                    elapsed_ms: report.elapsed_ms,
                    timestamp: Utc::now(),
                });
                Ok(report)
            }
            Err(e) => {
                self.events.emit_lossy(EngineEvent::IngestFailed {
                    path: path.to_path_buf(),
                    error: e.to_string(),
                    timestamp: Utc::now(),
                });
                Err(e)
            }
        }
    }

    async fn ingest_inner(&self, path: &Path, started: Instant) -> Result<IngestReport> {
        // Hash first: the exact-duplicate short-circuit costs no decode
        let bytes = Arc::new(tokio::fs::read(path).await?);
        let content_hash = self.dedup.hash_bytes(Arc::clone(&bytes)).await?;

        if let Some(existing) = self
            .dedup
            .find_exact_duplicate(&self.pool, &content_hash)
            .await?
        {
            tracing::info!(
                path = %path.display(),
                track_id = %existing,
                "Identical bytes already in the library"
            );
            return Ok(report(
                path,
                IngestStatus::Duplicate,
                Some(existing),
                Some("identical content hash".to_string()),
                started,
            ));
        }

        let decoder = Arc::clone(&self.decoder);
        let decode_input = Arc::clone(&bytes);
        let decoded = tokio::task::spawn_blocking(move || decoder.decode(&decode_input))
            .await
            .map_err(|e| Error::Internal(format!("Decode task failed: {}", e)))??;
        let decoded = Arc::new(decoded);

        let seconds = decoded.duration_seconds();
        if seconds < self.min_track_seconds || seconds > self.max_track_seconds {
            let reason = Error::DurationOutOfBounds {
                seconds,
                min: self.min_track_seconds,
                max: self.max_track_seconds,
            }
            .to_string();
            tracing::info!(path = %path.display(), reason = %reason, "File skipped");
            return Ok(report(
                path,
                IngestStatus::Skipped,
                None,
                Some(reason),
                started,
            ));
        }

        // Near-duplicate scan runs before any index write
        let digest = self.dedup.coarse_digest(Arc::clone(&decoded)).await?;
        if let Some(existing) = self
            .dedup
            .find_near_duplicate(&self.pool, &digest, seconds)
            .await?
        {
            return Ok(report(
                path,
                IngestStatus::Duplicate,
                Some(existing),
                Some("near-duplicate of an existing recording".to_string()),
                started,
            ));
        }

        let (title, artist) = read_tags(path).await;

        // The three store writes are independent until the metadata
        // commit; the gate keeps the orphan sweep out of that window
        let _sweep_gate = self.sweep_gate.read().await;
        let track_id = Uuid::new_v4();
        let (vault_res, fp_res, embed_res) = tokio::join!(
            self.vault.store(&content_hash, &bytes),
            self.index_fingerprints(track_id, &decoded),
            self.embed_chunks(track_id, &decoded),
        );

        let vault_path = match vault_res {
            Ok(relative) => Some(relative),
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "Vault write failed; track will carry no canonical copy"
                );
                None
            }
        };

        let (fingerprint_indexed, fp_err) = match fp_res {
            Ok(hashes) => {
                tracing::debug!(path = %path.display(), hashes, "Fingerprints indexed");
                (true, None)
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Fingerprint indexing failed");
                (false, Some(e))
            }
        };

        let (embedding_count, embed_err) = match embed_res {
            Ok(count) => (count, None),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Embedding failed");
                (0, Some(e))
            }
        };

        // With both index lanes down there is nothing worth committing;
        // a single surviving lane commits and reindex completes the rest
        if let (Some(fp_e), Some(_)) = (fp_err, embed_err) {
            self.rollback_file(track_id, &content_hash, vault_path.as_deref())
                .await;
            return Err(fp_e);
        }

        let track = Track {
            id: track_id,
            content_hash,
            title,
            artist,
            duration_seconds: seconds,
            fingerprint_indexed,
            embedding_model: (embedding_count > 0).then(|| self.model.name().to_string()),
            embedding_dim: (embedding_count > 0).then(|| self.model.dim() as u32),
            embedding_count,
            canonical_path: vault_path,
            created_at: Utc::now(),
        };

        if let Err(e) =
            tracks::insert_track(&self.pool, &track, Some(&digest_to_bytes(&digest))).await
        {
            let owner = self
                .rollback_file(track_id, &track.content_hash, track.canonical_path.as_deref())
                .await;

            // A commit that lost a same-bytes race is a duplicate, not
            // a failure: the winner's row now owns these bytes
            if let Some(existing) = owner {
                tracing::info!(
                    path = %path.display(),
                    track_id = %existing,
                    "Identical bytes committed by a concurrent ingest"
                );
                return Ok(report(
                    path,
                    IngestStatus::Duplicate,
                    Some(existing),
                    Some("identical content hash".to_string()),
                    started,
                ));
            }

            tracing::error!(
                path = %path.display(),
                error = %e,
                "Metadata commit failed, index writes rolled back"
            );
            return Err(e);
        }

        tracing::info!(
            path = %path.display(),
            track_id = %track_id,
            seconds = format!("{:.1}", seconds),
            fingerprint_indexed,
            embedding_count,
            "Track ingested"
        );

        Ok(report(
            path,
            IngestStatus::Ingested,
            Some(track_id),
            None,
            started,
        ))
    }

    /// Ingest every audio file under a directory
    ///
    /// Files are processed strictly sequentially; the fingerprint index
    /// has a single writer and cross-file concurrency buys nothing
    /// against it. Per-file failures land in the report and the batch
    /// moves on. Already-committed content hashes short-circuit, so an
    /// interrupted batch can simply be rerun.
    pub async fn ingest_dir(&self, root: &Path, cancel: CancellationToken) -> Result<BatchReport> {
        let started = Instant::now();

        if !root.is_dir() {
            return Err(Error::InvalidInput(format!(
                "Not a directory: {}",
                root.display()
            )));
        }

        let scan_root = root.to_path_buf();
        let files = tokio::task::spawn_blocking(move || scan_audio_files(&scan_root))
            .await
            .map_err(|e| Error::Internal(format!("Scan task failed: {}", e)))?;

        tracing::info!(
            root = %root.display(),
            candidates = files.len(),
            "Batch ingestion started"
        );

        let mut batch = BatchReport {
            root: root.to_path_buf(),
            scanned: files.len(),
            ingested: 0,
            duplicates: 0,
            skipped: 0,
            failed: 0,
            reports: Vec::new(),
            errors: Vec::new(),
            elapsed_ms: 0,
        };

        for path in files {
            if cancel.is_cancelled() {
                tracing::info!(root = %root.display(), "Batch ingestion cancelled");
                break;
            }

            match self.ingest_file(&path).await {
                Ok(file_report) => {
                    match file_report.status {
                        IngestStatus::Ingested => batch.ingested += 1,
                        IngestStatus::Duplicate => batch.duplicates += 1,
                        IngestStatus::Skipped => batch.skipped += 1,
                    }
                    batch.reports.push(file_report);
                }
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "File failed, batch continues"
                    );
                    batch.failed += 1;
                    batch.errors.push(format!("{}: {}", path.display(), e));
                }
            }
        }

        batch.elapsed_ms = started.elapsed().as_millis() as u64;

        self.events.emit_lossy(EngineEvent::BatchFinished {
            root: batch.root.clone(),
            scanned: batch.scanned,
            ingested: batch.ingested,
            duplicates: batch.duplicates,
            skipped: batch.skipped,
            failed: batch.failed,
            elapsed_ms: batch.elapsed_ms,
            timestamp: Utc::now(),
        });

        tracing::info!(
            root = %root.display(),
            ingested = batch.ingested,
            duplicates = batch.duplicates,
            skipped = batch.skipped,
            failed = batch.failed,
            "Batch ingestion finished"
        );

        Ok(batch)
    }

    /// Remove a track from the library and all indexes
    ///
    /// The metadata row goes first, hiding the track immediately; store
    /// cleanup after that is best-effort and anything it misses is an
    /// invisible orphan. Returns false when no such track existed.
    pub async fn delete_track(&self, track_id: Uuid) -> Result<bool> {
        let Some(track) = tracks::get_track(&self.pool, track_id).await? else {
            return Ok(false);
        };

        if !tracks::delete_track(&self.pool, track_id).await? {
            return Ok(false);
        }

        self.remove_store_entries(track_id, track.canonical_path.as_deref())
            .await;

        self.events.emit_lossy(EngineEvent::TrackDeleted {
            track_id,
            timestamp: Utc::now(),
        });
        tracing::info!(track_id = %track_id, "Track deleted");
        Ok(true)
    }

    /// Complete the missing index halves of a partially indexed track
    ///
    /// Re-decodes the canonical vault bytes and redoes whichever of the
    /// fingerprint / embedding writes the track row says are missing. A
    /// fully indexed track is a no-op. Returns the refreshed row.
    pub async fn reindex_track(&self, track_id: Uuid) -> Result<Track> {
        let track = tracks::get_track(&self.pool, track_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Track {}", track_id)))?;

        if track.fingerprint_indexed && track.embedding_count > 0 {
            tracing::debug!(track_id = %track_id, "Track already fully indexed");
            return Ok(track);
        }

        let relative = track.canonical_path.as_deref().ok_or_else(|| {
            Error::NotFound(format!("Track {} has no canonical audio copy", track_id))
        })?;
        let bytes = self.vault.read(relative).await?;

        let decoder = Arc::clone(&self.decoder);
        let decoded = tokio::task::spawn_blocking(move || decoder.decode(&bytes))
            .await
            .map_err(|e| Error::Internal(format!("Decode task failed: {}", e)))??;
        let decoded = Arc::new(decoded);

        if !track.fingerprint_indexed {
            self.index_fingerprints(track_id, &decoded).await?;
            tracks::set_fingerprint_indexed(&self.pool, track_id, true).await?;
        }

        if track.embedding_count == 0 {
            let count = self.embed_chunks(track_id, &decoded).await?;
            tracks::set_embedding_state(
                &self.pool,
                track_id,
                self.model.name(),
                self.model.dim() as u32,
                count,
            )
            .await?;
        }

        tracing::info!(track_id = %track_id, "Track reindexed");
        tracks::get_track(&self.pool, track_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Track {}", track_id)))
    }

    /// Remove fingerprint/vector entries whose track ids have no
    /// metadata row
    ///
    /// Aborted ingests leave such entries behind when their rollback
    /// could not finish. They are invisible to callers but consume
    /// storage. The sweep holds the gate exclusively, so every in-flight
    /// file is either before its store writes or fully committed while
    /// the id snapshots below are taken. Returns the number of orphaned
    /// track ids swept.
    pub async fn reclaim_orphans(&self) -> Result<usize> {
        let _sweep_gate = self.sweep_gate.write().await;

        let known: HashSet<Uuid> = tracks::all_track_ids(&self.pool).await?.into_iter().collect();

        let mut orphans: HashSet<Uuid> = HashSet::new();
        for id in self.fingerprints.indexed_track_ids().await? {
            if !known.contains(&id) {
                orphans.insert(id);
            }
        }
        for id in self.vectors.track_ids().await? {
            if !known.contains(&id) {
                orphans.insert(id);
            }
        }

        if orphans.is_empty() {
            tracing::debug!("No orphaned index entries");
            return Ok(0);
        }

        for &track_id in &orphans {
            self.remove_store_entries(track_id, None).await;
        }

        tracing::info!(count = orphans.len(), "Reclaimed orphaned index entries");
        Ok(orphans.len())
    }

    /// Extract landmarks off the runtime and write them under the token
    async fn index_fingerprints(&self, track_id: Uuid, decoded: &Arc<DecodedAudio>) -> Result<usize> {
        let extractor = Arc::clone(&self.extractor);
        let audio = Arc::clone(decoded);
        let landmarks = tokio::task::spawn_blocking(move || extractor.extract(&audio.low.samples))
            .await
            .map_err(|e| Error::Internal(format!("Landmark task failed: {}", e)))?;

        let guard = self.writer.acquire().await;
        self.fingerprints
            .index_track(&guard, track_id, &landmarks)
            .await?;
        Ok(landmarks.len())
    }

    /// Chunk, embed (semaphore-gated), and upsert a track's vectors
    async fn embed_chunks(&self, track_id: Uuid, decoded: &Arc<DecodedAudio>) -> Result<u32> {
        let chunks = self.policy.chunks(&decoded.high);
        if chunks.is_empty() {
            return Ok(0);
        }

        let rate = decoded.high.sample_rate;
        let mut embedded = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            let AudioChunk {
                index,
                offset_seconds,
                samples,
            } = chunk;

            let _permit = self
                .embed_permits
                .acquire()
                .await
                .map_err(|e| Error::Internal(format!("Embedding permits closed: {}", e)))?;

            let model = Arc::clone(&self.model);
            let vector = tokio::task::spawn_blocking(move || model.embed(&samples, rate))
                .await
                .map_err(|e| Error::Internal(format!("Embedding task failed: {}", e)))??;

            embedded.push(ChunkEmbedding {
                chunk_index: index,
                offset_seconds,
                vector,
            });
        }

        self.vectors
            .upsert_track(track_id, self.model.name(), &embedded)
            .await?;
        Ok(embedded.len() as u32)
    }

    /// Roll back a failed file's pre-commit writes
    ///
    /// Fingerprint and vector entries are keyed by the file's fresh
    /// track id and always removed. The vault entry is content-addressed
    /// and may already be the canonical copy of a row committed by a
    /// parallel ingest of identical bytes, so it only goes when no row
    /// owns the hash. Returns the owning track id when one exists.
    async fn rollback_file(
        &self,
        track_id: Uuid,
        content_hash: &str,
        vault_path: Option<&str>,
    ) -> Option<Uuid> {
        let (owner, removable) = match self
            .dedup
            .find_exact_duplicate(&self.pool, content_hash)
            .await
        {
            Ok(Some(owner)) => (Some(owner), None),
            Ok(None) => (None, vault_path),
            Err(e) => {
                tracing::warn!(error = %e, "Hash owner lookup failed, vault entry kept");
                (None, None)
            }
        };
        self.remove_store_entries(track_id, removable).await;
        owner
    }

    /// Best-effort removal of a track's store entries
    ///
    /// Serves both rollback of an uncommitted ingest and cleanup after a
    /// delete. Failures are logged and swallowed.
    async fn remove_store_entries(&self, track_id: Uuid, vault_path: Option<&str>) {
        let guard = self.writer.acquire().await;
        if let Err(e) = self.fingerprints.remove_track(&guard, track_id).await {
            tracing::warn!(track_id = %track_id, error = %e, "Fingerprint cleanup failed");
        }
        drop(guard);

        if let Err(e) = self.vectors.remove_track(track_id).await {
            tracing::warn!(track_id = %track_id, error = %e, "Vector cleanup failed");
        }

        if let Some(relative) = vault_path {
            if let Err(e) = self.vault.remove(relative).await {
                tracing::warn!(track_id = %track_id, error = %e, "Vault cleanup failed");
            }
        }
    }
}

fn report(
    path: &Path,
    status: IngestStatus,
    track_id: Option<Uuid>,
    reason: Option<String>,
    started: Instant,
) -> IngestReport {
    IngestReport {
        path: path.to_path_buf(),
        status,
        track_id,
        reason,
        elapsed_ms: started.elapsed().as_millis() as u64,
    }
}

/// Tag metadata via lofty; tag problems never fail ingestion
async fn read_tags(path: &Path) -> (Option<String>, Option<String>) {
    let probe_path = path.to_path_buf();
    let result = tokio::task::spawn_blocking(move || {
        let tagged_file = Probe::open(&probe_path)?.read()?;
        let tag = tagged_file.primary_tag().or_else(|| tagged_file.first_tag());
        Ok::<_, lofty::error::LoftyError>(match tag {
            Some(tag) => (
                tag.title().map(|s| s.to_string()),
                tag.artist().map(|s| s.to_string()),
            ),
            None => (None, None),
        })
    })
    .await;

    match result {
        Ok(Ok(tags)) => tags,
        Ok(Err(e)) => {
            tracing::debug!(path = %path.display(), error = %e, "No readable tags");
            (None, None)
        }
        Err(e) => {
            tracing::debug!(path = %path.display(), error = %e, "Tag task failed");
            (None, None)
        }
    }
}

/// Audio files under `root` in deterministic (sorted) order
///
/// Extension pre-filter, then a container sniff on the leading bytes.
/// Hidden entries are skipped and symlinks are not followed.
fn scan_audio_files(root: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !is_hidden(e));

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!("Scan cannot access entry: {}", e);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        if !has_audio_extension(path) {
            continue;
        }

        match read_header(path) {
            Ok(header) if vault::looks_like_audio(&header) => files.push(path.to_path_buf()),
            Ok(_) => {
                tracing::debug!(
                    path = %path.display(),
                    "Extension matched but leading bytes are not audio"
                );
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Scan cannot read header");
            }
        }
    }

    files
}

fn is_hidden(entry: &walkdir::DirEntry) -> bool {
    entry.depth() > 0 && entry.file_name().to_string_lossy().starts_with('.')
}

fn has_audio_extension(path: &Path) -> bool {
    path.extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .map_or(false, |ext| {
            matches!(
                ext.as_str(),
                "mp3" | "flac" | "ogg" | "oga" | "m4a" | "aac" | "mp4" | "wav" | "opus" | "wma"
            )
        })
}

fn read_header(path: &Path) -> std::io::Result<Vec<u8>> {
    use std::io::Read;

    let mut file = std::fs::File::open(path)?;
    let mut header = vec![0u8; SCAN_HEADER_BYTES];
    let n = file.read(&mut header)?;
    header.truncate(n);
    Ok(header)
}
