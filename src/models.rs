//! Domain types shared across the engine
//!
//! Search requests/responses, match results, ingestion reports, and the
//! track metadata model. All types serialize cleanly so the outer API
//! layer can forward them as-is.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// Track metadata as stored in the library database
///
/// A row here is the commit point of ingestion: fingerprint and vector
/// entries without a corresponding track row are invisible orphans.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Track {
    pub id: Uuid,
    /// SHA-256 hex digest of the source bytes
    pub content_hash: String,
    pub title: Option<String>,
    pub artist: Option<String>,
    pub duration_seconds: f64,
    /// True once the landmark index holds this track's hashes
    pub fingerprint_indexed: bool,
    /// Embedding model name, when vector chunks exist
    pub embedding_model: Option<String>,
    pub embedding_dim: Option<u32>,
    pub embedding_count: u32,
    /// Location of the canonical audio bytes in the vault
    pub canonical_path: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Which search lanes a request wants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchMode {
    Exact,
    Vibe,
    Both,
}

impl SearchMode {
    pub fn wants_exact(&self) -> bool {
        matches!(self, SearchMode::Exact | SearchMode::Both)
    }

    pub fn wants_vibe(&self) -> bool {
        matches!(self, SearchMode::Vibe | SearchMode::Both)
    }
}

/// Ephemeral search request; query audio travels alongside, never through,
/// this struct
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchRequest {
    pub query_id: Uuid,
    pub mode: SearchMode,
    /// Per-lane result cap; None falls back to the configured default
    pub max_results: Option<usize>,
    /// Track to drop from vibe results (e.g. the query's own source track)
    pub exclude_track_id: Option<Uuid>,
}

impl SearchRequest {
    pub fn new(mode: SearchMode) -> Self {
        Self {
            query_id: Uuid::new_v4(),
            mode,
            max_results: None,
            exclude_track_id: None,
        }
    }

    pub fn with_max_results(mut self, max_results: usize) -> Self {
        self.max_results = Some(max_results);
        self
    }

    pub fn with_exclude_track(mut self, track_id: Uuid) -> Self {
        self.exclude_track_id = Some(track_id);
        self
    }
}

/// One exact-lane identification candidate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExactMatch {
    pub track_id: Uuid,
    /// Offset-aligned hash votes backing this candidate
    pub aligned_hashes: u32,
    /// Aligned count scaled against the strong-match ceiling, clamped to 1.0
    pub confidence: f32,
    /// Position of the query clip within the matched track
    pub offset_seconds: f64,
}

/// One vibe-lane similarity candidate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VibeMatch {
    pub track_id: Uuid,
    /// Aggregated chunk similarity in [0, 1] (cosine-based strategies)
    pub score: f32,
    /// Query-chunk hits that contributed to the score
    pub chunk_hits: u32,
}

/// How per-chunk similarity hits combine into one track score
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationStrategy {
    /// Best single chunk similarity wins
    MaxPool,
    /// Mean of the k best chunk similarities
    TopKAverage { k: usize },
    /// Rank-based fusion across query chunks; scores are RRF mass, not
    /// cosine values, so tune the score threshold accordingly
    ReciprocalRankFusion,
}

impl Default for AggregationStrategy {
    fn default() -> Self {
        AggregationStrategy::TopKAverage { k: 3 }
    }
}

/// Terminal state of one search lane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaneStatus {
    Completed,
    Failed,
    TimedOut,
    /// Lane was not requested
    Skipped,
}

/// Per-lane outcome and matches
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaneReport<T> {
    pub status: LaneStatus,
    pub matches: Vec<T>,
}

impl<T> LaneReport<T> {
    pub fn skipped() -> Self {
        Self {
            status: LaneStatus::Skipped,
            matches: Vec::new(),
        }
    }

    pub fn completed(matches: Vec<T>) -> Self {
        Self {
            status: LaneStatus::Completed,
            matches,
        }
    }

    /// Whether the lane actually ran (requested and not skipped)
    pub fn executed(&self) -> bool {
        self.status != LaneStatus::Skipped
    }
}

/// Overall outcome of a search that produced a response
///
/// Total lane failure never produces a response; it surfaces as
/// `Error::AllLanesFailed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchOutcome {
    /// Every requested lane completed
    Complete,
    /// At least one requested lane failed or timed out
    Partial,
}

/// Search response: per-lane reports plus total elapsed time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    pub query_id: Uuid,
    pub outcome: SearchOutcome,
    pub exact: LaneReport<ExactMatch>,
    pub vibe: LaneReport<VibeMatch>,
    /// Wall time from request acceptance to merge completion
    pub elapsed_ms: u64,
}

/// Terminal status of one ingested file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestStatus {
    /// New track committed to the library
    Ingested,
    /// Exact or near duplicate of an existing track; nothing written
    Duplicate,
    /// Rejected without indexing (duration outside configured bounds)
    Skipped,
}

/// Outcome of ingesting a single file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestReport {
    pub path: PathBuf,
    pub status: IngestStatus,
    /// New track id, or the existing track for duplicates
    pub track_id: Option<Uuid>,
    /// Human-readable cause for Duplicate/Skipped outcomes
    pub reason: Option<String>,
    pub elapsed_ms: u64,
}

/// Summary of a directory ingestion run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchReport {
    pub root: PathBuf,
    pub scanned: usize,
    pub ingested: usize,
    pub duplicates: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Per-file outcomes in processing order
    pub reports: Vec<IngestReport>,
    /// Per-file failures (path: error), batch always continues past them
    pub errors: Vec<String>,
    pub elapsed_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_search_mode_lane_selection() {
        assert!(SearchMode::Exact.wants_exact());
        assert!(!SearchMode::Exact.wants_vibe());
        assert!(SearchMode::Vibe.wants_vibe());
        assert!(!SearchMode::Vibe.wants_exact());
        assert!(SearchMode::Both.wants_exact() && SearchMode::Both.wants_vibe());
    }

    #[test]
    fn test_request_builder() {
        let track = Uuid::new_v4();
        let req = SearchRequest::new(SearchMode::Both)
            .with_max_results(5)
            .with_exclude_track(track);
        assert_eq!(req.max_results, Some(5));
        assert_eq!(req.exclude_track_id, Some(track));
    }

    #[test]
    fn test_lane_report_executed() {
        let skipped: LaneReport<ExactMatch> = LaneReport::skipped();
        assert!(!skipped.executed());

        let done: LaneReport<ExactMatch> = LaneReport::completed(Vec::new());
        assert!(done.executed());
    }

    #[test]
    fn test_aggregation_default_is_top3_average() {
        assert_eq!(
            AggregationStrategy::default(),
            AggregationStrategy::TopKAverage { k: 3 }
        );
    }

    #[test]
    fn test_search_mode_serde_round_trip() {
        let json = serde_json::to_string(&SearchMode::Both).unwrap();
        assert_eq!(json, "\"both\"");
        let mode: SearchMode = serde_json::from_str(&json).unwrap();
        assert_eq!(mode, SearchMode::Both);
    }
}
