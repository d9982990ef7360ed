//! Chunk window policy
//!
//! Ingestion and query embedding must cut audio identically or their
//! vectors drift apart; both paths go through this policy.

use crate::audio::MonoPcm;
use crate::config::EmbeddingConfig;

/// One window of samples to embed
#[derive(Debug, Clone)]
pub struct AudioChunk {
    pub index: u32,
    pub offset_seconds: f64,
    pub samples: Vec<f32>,
}

/// Fixed-window chunker with overlap
///
/// Rules:
/// - full windows every hop
/// - a trailing remainder of at least half a window is kept, zero-padded
///   to full length
/// - audio shorter than one window becomes a single zero-padded chunk
#[derive(Debug, Clone, Copy)]
pub struct ChunkPolicy {
    chunk_seconds: f64,
    hop_seconds: f64,
}

impl ChunkPolicy {
    pub fn new(config: &EmbeddingConfig) -> Self {
        Self {
            chunk_seconds: config.chunk_seconds,
            hop_seconds: config.chunk_hop_seconds,
        }
    }

    pub fn chunk_seconds(&self) -> f64 {
        self.chunk_seconds
    }

    /// Cut PCM into embedding windows
    pub fn chunks(&self, pcm: &MonoPcm) -> Vec<AudioChunk> {
        let rate = pcm.sample_rate as f64;
        let window = (self.chunk_seconds * rate) as usize;
        let hop = (self.hop_seconds * rate) as usize;

        let samples = &pcm.samples;
        if samples.is_empty() || window == 0 || hop == 0 {
            return Vec::new();
        }

        // Sub-window clip: one padded chunk
        if samples.len() < window {
            let mut padded = samples.clone();
            padded.resize(window, 0.0);
            return vec![AudioChunk {
                index: 0,
                offset_seconds: 0.0,
                samples: padded,
            }];
        }

        let mut chunks = Vec::new();
        let mut index: u32 = 0;
        let mut start = 0usize;

        while start + window <= samples.len() {
            chunks.push(AudioChunk {
                index,
                offset_seconds: start as f64 / rate,
                samples: samples[start..start + window].to_vec(),
            });
            index += 1;
            start += hop;
        }

        // Trailing remainder: keep if it covers at least half a window
        let remaining = samples.len() - start;
        if remaining >= window / 2 {
            let mut padded = samples[start..].to_vec();
            padded.resize(window, 0.0);
            chunks.push(AudioChunk {
                index,
                offset_seconds: start as f64 / rate,
                samples: padded,
            });
        }

        chunks
    }
}
