//! Vibe similarity lane
//!
//! The query clip is chunked and embedded exactly like ingested audio,
//! each chunk pulls its nearest stored chunks, and per-chunk hits are
//! aggregated into one score per track.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::audio::MonoPcm;
use crate::config::{EmbeddingConfig, SearchConfig};
use crate::embedding::chunker::ChunkPolicy;
use crate::embedding::model::EmbeddingModel;
use crate::embedding::store::VectorStore;
use crate::models::{AggregationStrategy, VibeMatch};
use crate::{Error, Result};

/// Rank constant for reciprocal rank fusion; the usual k=60 keeps deep
/// ranks from dominating
const RRF_RANK_OFFSET: f32 = 60.0;

pub struct VibeSearchLane {
    store: Arc<dyn VectorStore>,
    model: Arc<dyn EmbeddingModel>,
    policy: ChunkPolicy,
    search_k: usize,
    min_track_score: f32,
    aggregation: AggregationStrategy,
    /// Shared with ingestion so inference never oversubscribes the CPU
    embed_permits: Arc<Semaphore>,
}

impl VibeSearchLane {
    pub fn new(
        store: Arc<dyn VectorStore>,
        model: Arc<dyn EmbeddingModel>,
        embedding: &EmbeddingConfig,
        search: &SearchConfig,
        embed_permits: Arc<Semaphore>,
    ) -> Self {
        Self {
            store,
            model,
            policy: ChunkPolicy::new(embedding),
            search_k: embedding.search_k,
            min_track_score: search.min_track_score,
            aggregation: search.aggregation,
            embed_permits,
        }
    }

    /// Find tracks that sound like the query clip
    ///
    /// `exclude_track` hits are dropped inside the store, before the
    /// nearest-k cutoff, so excluding a track never costs result slots.
    pub async fn search(
        &self,
        pcm: &MonoPcm,
        max_results: usize,
        exclude_track: Option<Uuid>,
    ) -> Result<Vec<VibeMatch>> {
        let chunks = self.policy.chunks(pcm);
        if chunks.is_empty() {
            tracing::debug!("Query clip produced no embedding chunks");
            return Ok(Vec::new());
        }

        let rate = pcm.sample_rate;
        let mut vectors = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            let _permit = self
                .embed_permits
                .acquire()
                .await
                .map_err(|e| Error::Internal(format!("Embedding permits closed: {}", e)))?;

            let model = Arc::clone(&self.model);
            let vector = tokio::task::spawn_blocking(move || model.embed(&chunk.samples, rate))
                .await
                .map_err(|e| Error::Internal(format!("Embedding task failed: {}", e)))??;
            vectors.push(vector);
        }

        // Chunk queries are independent reads; fan them out
        let searches = vectors
            .iter()
            .map(|vector| self.store.search(vector, self.search_k, exclude_track));
        let per_chunk = futures::future::try_join_all(searches).await?;

        // track -> (rank within its chunk query, cosine score) per hit
        let mut hits_by_track: HashMap<Uuid, Vec<(usize, f32)>> = HashMap::new();
        for hits in &per_chunk {
            for (rank, hit) in hits.iter().enumerate() {
                hits_by_track
                    .entry(hit.track_id)
                    .or_default()
                    .push((rank, hit.score));
            }
        }

        let mut matches: Vec<VibeMatch> = hits_by_track
            .into_iter()
            .map(|(track_id, hits)| VibeMatch {
                track_id,
                score: aggregate(&self.aggregation, &hits),
                chunk_hits: hits.len() as u32,
            })
            .filter(|m| m.score >= self.min_track_score)
            .collect();

        matches.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.track_id.cmp(&b.track_id))
        });
        matches.truncate(max_results);

        tracing::debug!(
            query_chunks = vectors.len(),
            candidates = matches.len(),
            "Vibe lane aggregation finished"
        );
        Ok(matches)
    }
}

/// Collapse one track's chunk hits into a single score
fn aggregate(strategy: &AggregationStrategy, hits: &[(usize, f32)]) -> f32 {
    match strategy {
        AggregationStrategy::MaxPool => {
            hits.iter().map(|&(_, score)| score).fold(f32::NEG_INFINITY, f32::max)
        }
        AggregationStrategy::TopKAverage { k } => {
            let mut scores: Vec<f32> = hits.iter().map(|&(_, score)| score).collect();
            scores.sort_by(|a, b| b.total_cmp(a));
            scores.truncate((*k).max(1));
            scores.iter().sum::<f32>() / scores.len() as f32
        }
        AggregationStrategy::ReciprocalRankFusion => hits
            .iter()
            .map(|&(rank, _)| 1.0 / (RRF_RANK_OFFSET + rank as f32 + 1.0))
            .sum(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::EMBEDDING_SAMPLE_RATE;
    use crate::embedding::model::shared_model;
    use crate::embedding::store::{ChunkEmbedding, SqliteVectorStore};

    fn tone(freq: f64, seconds: f64) -> MonoPcm {
        let rate = EMBEDDING_SAMPLE_RATE as f64;
        let samples = (0..(rate * seconds) as usize)
            .map(|i| ((2.0 * std::f64::consts::PI * freq * i as f64 / rate).sin() * 0.5) as f32)
            .collect();
        MonoPcm::new(samples, EMBEDDING_SAMPLE_RATE)
    }

    /// Chunk + embed + upsert one synthetic track, the way ingestion does
    async fn store_track(store: &SqliteVectorStore, track_id: Uuid, pcm: &MonoPcm) {
        let model = shared_model();
        let policy = ChunkPolicy::new(&EmbeddingConfig::default());
        let chunks: Vec<ChunkEmbedding> = policy
            .chunks(pcm)
            .into_iter()
            .map(|chunk| ChunkEmbedding {
                chunk_index: chunk.index,
                offset_seconds: chunk.offset_seconds,
                vector: model.embed(&chunk.samples, pcm.sample_rate).unwrap(),
            })
            .collect();
        store
            .upsert_track(track_id, model.name(), &chunks)
            .await
            .unwrap();
    }

    async fn lane_with_tracks(
        search: SearchConfig,
        tracks: &[(Uuid, &MonoPcm)],
    ) -> VibeSearchLane {
        let store = SqliteVectorStore::open_memory().await.unwrap();
        for (track_id, pcm) in tracks {
            store_track(&store, *track_id, pcm).await;
        }
        VibeSearchLane::new(
            Arc::new(store),
            shared_model(),
            &EmbeddingConfig::default(),
            &search,
            Arc::new(Semaphore::new(1)),
        )
    }

    #[tokio::test]
    async fn test_same_audio_ranks_first() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let lane = lane_with_tracks(
            SearchConfig::default(),
            &[(a, &tone(440.0, 10.0)), (b, &tone(3500.0, 10.0))],
        )
        .await;

        let matches = lane.search(&tone(440.0, 6.0), 10, None).await.unwrap();
        assert!(!matches.is_empty());
        assert_eq!(matches[0].track_id, a);
        assert!(matches[0].score > 0.97, "score was {}", matches[0].score);
        assert!(matches[0].chunk_hits > 0);

        // Scores come out descending
        for pair in matches.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
    }

    #[tokio::test]
    async fn test_score_threshold_drops_weak_candidates() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let strict = SearchConfig {
            min_track_score: 0.99,
            ..SearchConfig::default()
        };
        let lane = lane_with_tracks(
            strict,
            &[(a, &tone(440.0, 10.0)), (b, &tone(3500.0, 10.0))],
        )
        .await;

        let matches = lane.search(&tone(440.0, 6.0), 10, None).await.unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].track_id, a);
    }

    #[tokio::test]
    async fn test_exclude_track_removes_self_match() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let lane = lane_with_tracks(
            SearchConfig::default(),
            &[(a, &tone(440.0, 10.0)), (b, &tone(3500.0, 10.0))],
        )
        .await;

        let matches = lane.search(&tone(440.0, 6.0), 10, Some(a)).await.unwrap();
        assert!(matches.iter().all(|m| m.track_id != a));
    }

    #[tokio::test]
    async fn test_empty_query_yields_no_matches() {
        let a = Uuid::new_v4();
        let lane =
            lane_with_tracks(SearchConfig::default(), &[(a, &tone(440.0, 10.0))]).await;

        let empty = MonoPcm::new(Vec::new(), EMBEDDING_SAMPLE_RATE);
        let matches = lane.search(&empty, 10, None).await.unwrap();
        assert!(matches.is_empty());
    }

    #[test]
    fn test_aggregate_max_pool() {
        let hits = vec![(0, 0.4), (1, 0.9), (2, 0.7)];
        assert_eq!(aggregate(&AggregationStrategy::MaxPool, &hits), 0.9);
    }

    #[test]
    fn test_aggregate_top_k_average() {
        let hits = vec![(0, 0.9), (1, 0.5), (2, 0.7), (3, 0.1)];
        let score = aggregate(&AggregationStrategy::TopKAverage { k: 3 }, &hits);
        assert!((score - (0.9 + 0.7 + 0.5) / 3.0).abs() < 1e-6);

        // Fewer hits than k averages what exists
        let short = vec![(0, 0.8)];
        assert_eq!(
            aggregate(&AggregationStrategy::TopKAverage { k: 3 }, &short),
            0.8
        );
    }

    #[test]
    fn test_aggregate_reciprocal_rank_fusion() {
        let hits = vec![(0, 0.9), (2, 0.5)];
        let score = aggregate(&AggregationStrategy::ReciprocalRankFusion, &hits);
        let expected = 1.0 / 61.0 + 1.0 / 63.0;
        assert!((score - expected).abs() < 1e-6);
    }
}
