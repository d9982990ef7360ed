//! Dual-lane search
//!
//! [`SearchService`] is the query entry point: it decodes the clip,
//! enforces the minimum length, and hands both PCM rates to the
//! [`Orchestrator`], which drives the exact and vibe lanes concurrently.

pub mod exact;
pub mod orchestrator;
pub mod vibe;

pub use exact::ExactMatchLane;
pub use orchestrator::Orchestrator;
pub use vibe::VibeSearchLane;

use std::sync::Arc;

use crate::audio::{Decoder, SymphoniaDecoder};
use crate::config::SearchConfig;
use crate::events::{EngineEvent, EventBus};
use crate::models::{LaneStatus, SearchRequest, SearchResponse};
use crate::{Error, Result};

pub struct SearchService {
    decoder: Arc<SymphoniaDecoder>,
    orchestrator: Orchestrator,
    events: EventBus,
    min_query_seconds: f64,
}

impl SearchService {
    pub fn new(
        decoder: Arc<SymphoniaDecoder>,
        orchestrator: Orchestrator,
        events: EventBus,
        config: &SearchConfig,
    ) -> Self {
        Self {
            decoder,
            orchestrator,
            events,
            min_query_seconds: config.min_query_seconds,
        }
    }

    /// Decode query bytes and run the requested lanes
    ///
    /// Clips shorter than the configured minimum are rejected before any
    /// lane runs.
    pub async fn search(&self, request: SearchRequest, audio: Vec<u8>) -> Result<SearchResponse> {
        let decoder = Arc::clone(&self.decoder);
        let decoded = tokio::task::spawn_blocking(move || decoder.decode(&audio))
            .await
            .map_err(|e| Error::Internal(format!("Decode task failed: {}", e)))??;

        let seconds = decoded.duration_seconds();
        if seconds < self.min_query_seconds {
            return Err(Error::QueryTooShort {
                seconds,
                min: self.min_query_seconds,
            });
        }

        tracing::info!(
            query_id = %request.query_id,
            mode = ?request.mode,
            clip_seconds = seconds,
            "Search accepted"
        );

        let response = self
            .orchestrator
            .run(&request, &decoded.low, &decoded.high)
            .await?;

        for (lane, status) in [("exact", response.exact.status), ("vibe", response.vibe.status)] {
            let reason = match status {
                LaneStatus::Failed => "lane failed",
                LaneStatus::TimedOut => "lane deadline exceeded",
                _ => continue,
            };
            self.events.emit_lossy(EngineEvent::LaneFailed {
                query_id: response.query_id,
                lane: lane.to_string(),
                reason: reason.to_string(),
                timestamp: chrono::Utc::now(),
            });
        }

        self.events.emit_lossy(EngineEvent::SearchCompleted {
            query_id: response.query_id,
            outcome: response.outcome,
            exact_matches: response.exact.matches.len(),
            vibe_matches: response.vibe.matches.len(),
            elapsed_ms: response.elapsed_ms,
            timestamp: chrono::Utc::now(),
        });

        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::sync::Semaphore;

    use crate::config::{EmbeddingConfig, FingerprintConfig};
    use crate::embedding::model::shared_model;
    use crate::embedding::store::SqliteVectorStore;
    use crate::fingerprint::store::SqliteFingerprintIndex;
    use crate::models::{SearchMode, SearchOutcome};

    fn sine_wav_bytes(frequency: f64, seconds: f64) -> Vec<u8> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 22_050,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };

        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            let frames = (22_050.0 * seconds) as usize;
            for i in 0..frames {
                let t = i as f64 / 22_050.0;
                let sample =
                    ((2.0 * std::f64::consts::PI * frequency * t).sin() * 0.5 * 32767.0) as i16;
                writer.write_sample(sample).unwrap();
            }
            writer.finalize().unwrap();
        }
        cursor.into_inner()
    }

    async fn empty_library_service() -> SearchService {
        let index = Arc::new(SqliteFingerprintIndex::open_memory().await.unwrap());
        let store = Arc::new(SqliteVectorStore::open_memory().await.unwrap());
        let config = SearchConfig::default();

        let orchestrator = Orchestrator::new(
            Arc::new(ExactMatchLane::new(index, FingerprintConfig::default())),
            Arc::new(VibeSearchLane::new(
                store,
                shared_model(),
                &EmbeddingConfig::default(),
                &config,
                Arc::new(Semaphore::new(1)),
            )),
            config.clone(),
        );

        SearchService::new(
            Arc::new(SymphoniaDecoder::new()),
            orchestrator,
            EventBus::new(16),
            &config,
        )
    }

    #[tokio::test]
    async fn test_short_clip_rejected_before_lanes() {
        let service = empty_library_service().await;
        let err = service
            .search(SearchRequest::new(SearchMode::Both), sine_wav_bytes(440.0, 2.0))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::QueryTooShort { .. }));
    }

    #[tokio::test]
    async fn test_empty_library_search_completes() {
        let service = empty_library_service().await;
        let mut rx = service.events.subscribe();

        let response = service
            .search(SearchRequest::new(SearchMode::Both), sine_wav_bytes(440.0, 4.0))
            .await
            .unwrap();

        assert_eq!(response.outcome, SearchOutcome::Complete);
        assert_eq!(response.exact.status, LaneStatus::Completed);
        assert_eq!(response.vibe.status, LaneStatus::Completed);
        assert!(response.exact.matches.is_empty());
        assert!(response.vibe.matches.is_empty());

        match rx.recv().await.unwrap() {
            EngineEvent::SearchCompleted { query_id, .. } => {
                assert_eq!(query_id, response.query_id)
            }
            other => panic!("Unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_garbage_bytes_fail_decode() {
        let service = empty_library_service().await;
        let err = service
            .search(
                SearchRequest::new(SearchMode::Both),
                vec![0xAB; 4096],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
    }
}
