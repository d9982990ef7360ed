//! Audio identification engine: exact matching plus similarity search
//! over a local library.
//!
//! Tracks are ingested once and indexed three ways. A relational store
//! holds the metadata row (the commit point), an inverted index holds
//! landmark fingerprint hashes for exact identification, and a vector
//! store holds chunk embeddings for "sounds like" search. Queries run
//! the two retrieval lanes concurrently and report per-lane outcomes,
//! so one degraded store never takes the whole answer down.
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//!
//! use sonance_core::{Engine, EngineConfig, SearchMode, SearchRequest};
//!
//! #[tokio::main]
//! async fn main() -> sonance_core::Result<()> {
//!     let mut config = EngineConfig::default();
//!     config.storage.root = "/var/lib/sonance".into();
//!     let engine = Engine::open(config).await?;
//!
//!     let report = engine.ingest_file(Path::new("/music/track.flac")).await?;
//!     println!("ingest: {:?}", report.status);
//!
//!     let clip = std::fs::read("/tmp/clip.wav")?;
//!     let response = engine
//!         .search(SearchRequest::new(SearchMode::Both), clip)
//!         .await?;
//!     for hit in &response.exact.matches {
//!         println!(
//!             "{} at {:.1}s (confidence {:.2})",
//!             hit.track_id, hit.offset_seconds, hit.confidence
//!         );
//!     }
//!     Ok(())
//! }
//! ```

pub mod audio;
pub mod config;
pub mod db;
pub mod dedup;
pub mod embedding;
pub mod error;
pub mod events;
pub mod fingerprint;
pub mod ingest;
pub mod models;
pub mod search;

pub use config::EngineConfig;
pub use error::{Error, Result};
pub use events::{EngineEvent, EventBus};
pub use models::{
    AggregationStrategy, BatchReport, ExactMatch, IngestReport, IngestStatus, LaneReport,
    LaneStatus, SearchMode, SearchOutcome, SearchRequest, SearchResponse, Track, VibeMatch,
};

use std::path::Path;
use std::sync::Arc;

use sqlx::SqlitePool;
use tokio::sync::{broadcast, Semaphore};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use audio::SymphoniaDecoder;
use embedding::{EmbeddingModel, SqliteVectorStore, VectorStore};
use fingerprint::{FingerprintIndex, SqliteFingerprintIndex, WriterToken};
use ingest::{AudioVault, IngestPipeline};
use search::{ExactMatchLane, Orchestrator, SearchService, VibeSearchLane};

/// The whole engine behind one handle
///
/// Cheap to share behind an [`Arc`]; all methods take `&self`.
pub struct Engine {
    config: EngineConfig,
    pool: SqlitePool,
    pipeline: IngestPipeline,
    search: SearchService,
    events: EventBus,
    shutdown: CancellationToken,
}

impl Engine {
    /// Open the engine over SQLite-backed stores under the configured
    /// storage root, creating files on first use.
    pub async fn open(config: EngineConfig) -> Result<Self> {
        config.validate()?;

        let fingerprints: Arc<dyn FingerprintIndex> =
            Arc::new(SqliteFingerprintIndex::open(&config.storage.fingerprint_db()).await?);
        let vectors: Arc<dyn VectorStore> =
            Arc::new(SqliteVectorStore::open(&config.storage.vector_db()).await?);

        Self::open_with_stores(config, fingerprints, vectors).await
    }

    /// Open the engine over caller-provided index stores
    ///
    /// The metadata database stays SQLite under the storage root; the
    /// fingerprint and vector stores are whatever the caller passes.
    pub async fn open_with_stores(
        config: EngineConfig,
        fingerprints: Arc<dyn FingerprintIndex>,
        vectors: Arc<dyn VectorStore>,
    ) -> Result<Self> {
        config.validate()?;

        let pool = db::init_metadata_pool(&config.storage.metadata_db()).await?;
        let decoder = Arc::new(SymphoniaDecoder::new());
        let model: Arc<dyn EmbeddingModel> = embedding::shared_model();
        let embed_permits = Arc::new(Semaphore::new(config.ingest.embedding_concurrency));
        let events = EventBus::new(config.events.bus_capacity);

        let pipeline = IngestPipeline::new(
            pool.clone(),
            Arc::clone(&fingerprints),
            Arc::clone(&vectors),
            WriterToken::new(),
            AudioVault::new(config.storage.vault_dir()),
            Arc::clone(&decoder),
            Arc::clone(&model),
            Arc::clone(&embed_permits),
            events.clone(),
            &config.ingest,
            &config.fingerprint,
            &config.embedding,
        );

        let exact = Arc::new(ExactMatchLane::new(
            Arc::clone(&fingerprints),
            config.fingerprint.clone(),
        ));
        let vibe = Arc::new(VibeSearchLane::new(
            Arc::clone(&vectors),
            Arc::clone(&model),
            &config.embedding,
            &config.search,
            embed_permits,
        ));
        let orchestrator = Orchestrator::new(exact, vibe, config.search.clone());
        let search = SearchService::new(decoder, orchestrator, events.clone(), &config.search);

        tracing::info!(root = %config.storage.root.display(), "Engine opened");

        Ok(Self {
            config,
            pool,
            pipeline,
            search,
            events,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Ingest one audio file into the library
    pub async fn ingest_file(&self, path: &Path) -> Result<IngestReport> {
        self.pipeline.ingest_file(path).await
    }

    /// Ingest every audio file under a directory
    ///
    /// Runs until done or until [`Engine::shutdown`] is called.
    pub async fn ingest_dir(&self, root: &Path) -> Result<BatchReport> {
        self.pipeline
            .ingest_dir(root, self.shutdown.child_token())
            .await
    }

    /// Ingest a directory under a caller-owned cancellation token
    pub async fn ingest_dir_with_cancel(
        &self,
        root: &Path,
        cancel: CancellationToken,
    ) -> Result<BatchReport> {
        self.pipeline.ingest_dir(root, cancel).await
    }

    /// Identify a query clip exactly and/or by similarity
    ///
    /// `audio` is the encoded bytes of the clip (any supported
    /// container). Lane selection comes from the request mode.
    pub async fn search(&self, request: SearchRequest, audio: Vec<u8>) -> Result<SearchResponse> {
        self.search.search(request, audio).await
    }

    pub async fn get_track(&self, track_id: Uuid) -> Result<Option<Track>> {
        db::tracks::get_track(&self.pool, track_id).await
    }

    pub async fn track_count(&self) -> Result<i64> {
        db::tracks::count_tracks(&self.pool).await
    }

    /// Remove a track from the library and all indexes
    pub async fn delete_track(&self, track_id: Uuid) -> Result<bool> {
        self.pipeline.delete_track(track_id).await
    }

    /// Redo the missing index halves of a partially indexed track
    pub async fn reindex_track(&self, track_id: Uuid) -> Result<Track> {
        self.pipeline.reindex_track(track_id).await
    }

    /// Sweep index entries that no metadata row references
    pub async fn reclaim_orphans(&self) -> Result<usize> {
        self.pipeline.reclaim_orphans().await
    }

    /// Engine event feed; every subscriber sees every event from the
    /// moment it subscribes
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Cancel in-flight batch ingestions
    ///
    /// The file being processed finishes; nothing after it starts.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}
