//! Engine configuration
//!
//! All tunables live here, grouped by subsystem. Every field has a serde
//! default so a partial TOML file (or an empty one) yields a working
//! configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::models::AggregationStrategy;
use crate::{Error, Result};

/// Top-level engine configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EngineConfig {
    /// Storage locations (databases, canonical audio vault)
    #[serde(default)]
    pub storage: StorageConfig,

    /// Ingestion pipeline tunables
    #[serde(default)]
    pub ingest: IngestConfig,

    /// Landmark fingerprint tunables
    #[serde(default)]
    pub fingerprint: FingerprintConfig,

    /// Embedding chunking tunables
    #[serde(default)]
    pub embedding: EmbeddingConfig,

    /// Search lane and orchestrator tunables
    #[serde(default)]
    pub search: SearchConfig,

    /// Event bus capacity
    #[serde(default)]
    pub events: EventsConfig,
}

/// Storage root and derived paths
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root folder holding the three databases and the audio vault
    #[serde(default = "default_root")]
    pub root: PathBuf,
}

/// Ingestion pipeline tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Minimum accepted track duration in seconds (default: 5.0)
    #[serde(default = "default_min_track_seconds")]
    pub min_track_seconds: f64,

    /// Maximum accepted track duration in seconds (default: 7200.0)
    #[serde(default = "default_max_track_seconds")]
    pub max_track_seconds: f64,

    /// Normalized digest distance at or below which two tracks are
    /// considered the same recording (default: 0.15)
    #[serde(default = "default_near_dup_max_distance")]
    pub near_dup_max_distance: f64,

    /// Duration window for near-duplicate candidates, as a fraction of
    /// the incoming track's duration on either side (default: 0.10)
    #[serde(default = "default_near_dup_duration_window")]
    pub near_dup_duration_window: f64,

    /// Concurrent embedding inference permits shared by ingestion and
    /// query paths (default: 1)
    #[serde(default = "default_embedding_concurrency")]
    pub embedding_concurrency: usize,
}

/// Landmark fingerprint tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FingerprintConfig {
    /// Later peaks each anchor pairs with (default: 8)
    #[serde(default = "default_fan_out")]
    pub fan_out: usize,

    /// Consensus aligned-hash floor below which a candidate is noise
    /// (default: 8)
    #[serde(default = "default_min_aligned_hashes")]
    pub min_aligned_hashes: u32,

    /// Aligned-hash count treated as full confidence (default: 20)
    #[serde(default = "default_strong_match_hashes")]
    pub strong_match_hashes: u32,

    /// Clips shorter than this take the sub-window consensus path
    /// (default: 5.0)
    #[serde(default = "default_short_clip_seconds")]
    pub short_clip_seconds: f64,

    /// Number of overlapping sub-windows for short clips (default: 3)
    #[serde(default = "default_short_clip_windows")]
    pub short_clip_windows: usize,
}

/// Embedding chunking tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Chunk window length in seconds (default: 5.0)
    #[serde(default = "default_chunk_seconds")]
    pub chunk_seconds: f64,

    /// Chunk hop in seconds (default: 2.5 for 50% overlap)
    #[serde(default = "default_chunk_hop_seconds")]
    pub chunk_hop_seconds: f64,

    /// Nearest chunks fetched per query chunk (default: 8)
    #[serde(default = "default_search_k")]
    pub search_k: usize,
}

/// Search lane and orchestrator tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Minimum query clip duration in seconds; shorter clips are
    /// rejected before any lane runs (default: 3.0)
    #[serde(default = "default_min_query_seconds")]
    pub min_query_seconds: f64,

    /// Exact lane deadline in milliseconds (default: 8000)
    #[serde(default = "default_exact_timeout_ms")]
    pub exact_timeout_ms: u64,

    /// Vibe lane deadline in milliseconds (default: 15000)
    #[serde(default = "default_vibe_timeout_ms")]
    pub vibe_timeout_ms: u64,

    /// Maximum matches returned per lane (default: 10)
    #[serde(default = "default_max_results")]
    pub max_results: usize,

    /// Aggregated similarity score below which a vibe candidate is
    /// dropped (default: 0.60)
    #[serde(default = "default_min_track_score")]
    pub min_track_score: f32,

    /// How per-chunk similarity hits combine into one track score
    #[serde(default)]
    pub aggregation: AggregationStrategy,
}

/// Event bus capacity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Broadcast channel capacity (default: 256)
    #[serde(default = "default_bus_capacity")]
    pub bus_capacity: usize,
}

// Default value functions

fn default_root() -> PathBuf {
    PathBuf::from("./sonance_data")
}

fn default_min_track_seconds() -> f64 {
    5.0
}

fn default_max_track_seconds() -> f64 {
    7200.0
}

fn default_near_dup_max_distance() -> f64 {
    0.15
}

fn default_near_dup_duration_window() -> f64 {
    0.10
}

fn default_embedding_concurrency() -> usize {
    1
}

fn default_fan_out() -> usize {
    8
}

fn default_min_aligned_hashes() -> u32 {
    8
}

fn default_strong_match_hashes() -> u32 {
    20
}

fn default_short_clip_seconds() -> f64 {
    5.0
}

fn default_short_clip_windows() -> usize {
    3
}

fn default_chunk_seconds() -> f64 {
    5.0
}

fn default_chunk_hop_seconds() -> f64 {
    2.5
}

fn default_search_k() -> usize {
    8
}

fn default_min_query_seconds() -> f64 {
    3.0
}

fn default_exact_timeout_ms() -> u64 {
    8_000
}

fn default_vibe_timeout_ms() -> u64 {
    15_000
}

fn default_max_results() -> usize {
    10
}

fn default_min_track_score() -> f32 {
    0.60
}

fn default_bus_capacity() -> usize {
    256
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            min_track_seconds: default_min_track_seconds(),
            max_track_seconds: default_max_track_seconds(),
            near_dup_max_distance: default_near_dup_max_distance(),
            near_dup_duration_window: default_near_dup_duration_window(),
            embedding_concurrency: default_embedding_concurrency(),
        }
    }
}

impl Default for FingerprintConfig {
    fn default() -> Self {
        Self {
            fan_out: default_fan_out(),
            min_aligned_hashes: default_min_aligned_hashes(),
            strong_match_hashes: default_strong_match_hashes(),
            short_clip_seconds: default_short_clip_seconds(),
            short_clip_windows: default_short_clip_windows(),
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            chunk_seconds: default_chunk_seconds(),
            chunk_hop_seconds: default_chunk_hop_seconds(),
            search_k: default_search_k(),
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            min_query_seconds: default_min_query_seconds(),
            exact_timeout_ms: default_exact_timeout_ms(),
            vibe_timeout_ms: default_vibe_timeout_ms(),
            max_results: default_max_results(),
            min_track_score: default_min_track_score(),
            aggregation: AggregationStrategy::default(),
        }
    }
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            bus_capacity: default_bus_capacity(),
        }
    }
}

impl StorageConfig {
    /// Path of the track metadata database
    pub fn metadata_db(&self) -> PathBuf {
        self.root.join("library.db")
    }

    /// Path of the landmark fingerprint index database
    pub fn fingerprint_db(&self) -> PathBuf {
        self.root.join("fingerprints.db")
    }

    /// Path of the embedding vector database
    pub fn vector_db(&self) -> PathBuf {
        self.root.join("vectors.db")
    }

    /// Directory holding canonical audio bytes
    pub fn vault_dir(&self) -> PathBuf {
        self.root.join("vault")
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read {}: {}", path.display(), e)))?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: EngineConfig = toml::from_str(content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if self.ingest.min_track_seconds <= 0.0
            || self.ingest.max_track_seconds <= self.ingest.min_track_seconds
        {
            return Err(Error::Config(format!(
                "Track duration bounds invalid: [{}, {}]",
                self.ingest.min_track_seconds, self.ingest.max_track_seconds
            )));
        }
        if !(0.0..=1.0).contains(&self.ingest.near_dup_max_distance) {
            return Err(Error::Config(format!(
                "near_dup_max_distance must be within [0, 1], got {}",
                self.ingest.near_dup_max_distance
            )));
        }
        if self.ingest.embedding_concurrency == 0 {
            return Err(Error::Config(
                "embedding_concurrency must be at least 1".to_string(),
            ));
        }
        if self.embedding.chunk_hop_seconds <= 0.0
            || self.embedding.chunk_hop_seconds > self.embedding.chunk_seconds
        {
            return Err(Error::Config(format!(
                "Chunk hop {}s must be positive and no longer than the chunk {}s",
                self.embedding.chunk_hop_seconds, self.embedding.chunk_seconds
            )));
        }
        if self.fingerprint.min_aligned_hashes == 0
            || self.fingerprint.strong_match_hashes < self.fingerprint.min_aligned_hashes
        {
            return Err(Error::Config(format!(
                "Aligned-hash thresholds invalid: floor {}, ceiling {}",
                self.fingerprint.min_aligned_hashes, self.fingerprint.strong_match_hashes
            )));
        }
        if self.fingerprint.short_clip_windows == 0 {
            return Err(Error::Config(
                "short_clip_windows must be at least 1".to_string(),
            ));
        }
        if self.search.min_query_seconds <= 0.0 {
            return Err(Error::Config(
                "min_query_seconds must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
