//! Error types for the identification engine

use thiserror::Error;

/// Crate-wide result type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by engine operations
///
/// Recoverable ingestion outcomes (duplicates, out-of-bounds durations)
/// are reported as statuses, not errors; see `IngestStatus`.
#[derive(Error, Debug)]
pub enum Error {
    /// Audio decode failure (malformed, unsupported, or empty input)
    #[error("Decode error: {0}")]
    Decode(#[from] crate::audio::DecodeError),

    /// Track duration outside the configured ingestion bounds
    #[error("Duration {seconds:.1}s outside allowed range [{min:.0}s, {max:.0}s]")]
    DurationOutOfBounds { seconds: f64, min: f64, max: f64 },

    /// Query clip shorter than the minimum the search lanes accept
    #[error("Query too short: {seconds:.2}s (minimum {min:.1}s)")]
    QueryTooShort { seconds: f64, min: f64 },

    /// A backing store rejected or failed an operation
    #[error("Store unavailable ({store}): {detail}")]
    StoreUnavailable { store: &'static str, detail: String },

    /// A search lane exceeded its deadline
    #[error("{lane} lane timed out after {timeout_ms}ms")]
    LaneTimeout { lane: &'static str, timeout_ms: u64 },

    /// Every requested search lane failed or timed out
    #[error("All requested search lanes failed")]
    AllLanesFailed,

    /// Database operation error (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Requested resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input or request parameter
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Internal error (task join failures, serialization, poisoned state)
    #[error("Internal error: {0}")]
    Internal(String),
}
