//! Engine event definitions and broadcast bus
//!
//! Ingestion and search publish lifecycle events here; an embedding API
//! layer subscribes and forwards them (e.g. over SSE). Emission is
//! lossy: with no subscriber the event is dropped.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::models::{IngestStatus, SearchOutcome};

/// Engine lifecycle events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EngineEvent {
    /// A file entered the ingestion pipeline
    IngestStarted {
        path: PathBuf,
        timestamp: DateTime<Utc>,
    },

    /// A file left the pipeline with a terminal status
    IngestFinished {
        path: PathBuf,
        status: IngestStatus,
        /// Present for Ingested, and for Duplicate (the existing track)
        track_id: Option<Uuid>,
        elapsed_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// A file failed mid-pipeline; partial writes were rolled back
    IngestFailed {
        path: PathBuf,
        error: String,
        timestamp: DateTime<Utc>,
    },

    /// A directory ingestion run finished
    BatchFinished {
        root: PathBuf,
        scanned: usize,
        ingested: usize,
        duplicates: usize,
        skipped: usize,
        failed: usize,
        elapsed_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// A search request produced a response
    SearchCompleted {
        query_id: Uuid,
        outcome: SearchOutcome,
        exact_matches: usize,
        vibe_matches: usize,
        elapsed_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// One search lane failed or timed out (the query may still succeed)
    LaneFailed {
        query_id: Uuid,
        lane: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// A track was removed from the library
    TrackDeleted {
        track_id: Uuid,
        timestamp: DateTime<Utc>,
    },
}

impl EngineEvent {
    /// Event type name for logging and SSE event routing
    pub fn event_type(&self) -> &'static str {
        match self {
            EngineEvent::IngestStarted { .. } => "IngestStarted",
            EngineEvent::IngestFinished { .. } => "IngestFinished",
            EngineEvent::IngestFailed { .. } => "IngestFailed",
            EngineEvent::BatchFinished { .. } => "BatchFinished",
            EngineEvent::SearchCompleted { .. } => "SearchCompleted",
            EngineEvent::LaneFailed { .. } => "LaneFailed",
            EngineEvent::TrackDeleted { .. } => "TrackDeleted",
        }
    }
}

/// Central event distribution bus
///
/// Wraps `tokio::broadcast`: non-blocking publish, any number of
/// subscribers, lagged receivers drop old events instead of stalling
/// producers.
///
/// # Examples
///
/// ```
/// use sonance_core::events::{EngineEvent, EventBus};
///
/// let bus = EventBus::new(256);
/// let mut rx = bus.subscribe();
///
/// bus.emit_lossy(EngineEvent::TrackDeleted {
///     track_id: uuid::Uuid::new_v4(),
///     timestamp: chrono::Utc::now(),
/// });
///
/// assert!(rx.try_recv().is_ok());
/// ```
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
    capacity: usize,
}

impl EventBus {
    /// Create a bus with the given channel capacity
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    ///
    /// Events emitted before subscription are not received.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns the subscriber count, or an error when nobody is listening.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: EngineEvent,
    ) -> Result<usize, broadcast::error::SendError<EngineEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring the no-subscriber case
    pub fn emit_lossy(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }

    /// Current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Configured channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscriber_receives_emitted_event() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        let track_id = Uuid::new_v4();
        bus.emit_lossy(EngineEvent::TrackDeleted {
            track_id,
            timestamp: Utc::now(),
        });

        match rx.recv().await.unwrap() {
            EngineEvent::TrackDeleted { track_id: got, .. } => assert_eq!(got, track_id),
            other => panic!("Unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_emit_without_subscribers_is_lossy() {
        let bus = EventBus::new(16);
        // No subscribers: must neither block nor panic
        bus.emit_lossy(EngineEvent::IngestStarted {
            path: PathBuf::from("/tmp/x.flac"),
            timestamp: Utc::now(),
        });
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_event_type_names() {
        let event = EngineEvent::SearchCompleted {
            query_id: Uuid::new_v4(),
            outcome: SearchOutcome::Complete,
            exact_matches: 1,
            vibe_matches: 0,
            elapsed_ms: 12,
            timestamp: Utc::now(),
        };
        assert_eq!(event.event_type(), "SearchCompleted");
    }

    #[test]
    fn test_events_serialize_with_type_tag() {
        let event = EngineEvent::IngestFailed {
            path: PathBuf::from("a.mp3"),
            error: "decode error".to_string(),
            timestamp: Utc::now(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"IngestFailed\""));
    }
}
