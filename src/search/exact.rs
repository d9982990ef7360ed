//! Exact identification lane
//!
//! Landmark consensus voting: query hashes pull postings from the
//! inverted index, and a candidate is scored by how many hashes agree on
//! one alignment offset. Random hash collisions scatter across offsets;
//! a real match piles votes onto a single offset bucket.

use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::audio::MonoPcm;
use crate::config::FingerprintConfig;
use crate::fingerprint::landmark::{frames_to_seconds, LandmarkExtractor, HOP_SIZE};
use crate::fingerprint::store::FingerprintIndex;
use crate::models::ExactMatch;
use crate::{Error, Result};

/// Offset bucket width in STFT frames (~186 ms); absorbs the frame
/// jitter between an indexed track and a query excerpt cut mid-frame
const OFFSET_BUCKET_FRAMES: i64 = 4;

/// Sub-window length for short clips, as a fraction of the clip
const SHORT_CLIP_WINDOW_FRACTION: f64 = 0.60;

/// One extraction window of the query clip
///
/// `frame_shift` places the window's landmark anchors back into the full
/// clip's frame timeline, so votes from every window land in one offset
/// space.
struct QueryWindow {
    samples: Vec<f32>,
    frame_shift: i64,
}

pub struct ExactMatchLane {
    index: Arc<dyn FingerprintIndex>,
    extractor: Arc<LandmarkExtractor>,
    config: FingerprintConfig,
}

impl ExactMatchLane {
    pub fn new(index: Arc<dyn FingerprintIndex>, config: FingerprintConfig) -> Self {
        let extractor = Arc::new(LandmarkExtractor::new(config.fan_out));
        Self {
            index,
            extractor,
            config,
        }
    }

    /// Identify the query clip against the indexed library
    ///
    /// A clip that produces no landmarks (silence, too short) yields an
    /// empty match list, never an error.
    pub async fn identify(&self, pcm: &MonoPcm, max_results: usize) -> Result<Vec<ExactMatch>> {
        let windows = self.query_windows(pcm);

        let extractor = Arc::clone(&self.extractor);
        let query_landmarks: Vec<(u32, i64)> = tokio::task::spawn_blocking(move || {
            let mut out = Vec::new();
            for window in &windows {
                for lm in extractor.extract(&window.samples) {
                    out.push((lm.hash, lm.anchor_frame as i64 + window.frame_shift));
                }
            }
            out
        })
        .await
        .map_err(|e| Error::Internal(format!("Landmark extraction task failed: {}", e)))?;

        if query_landmarks.is_empty() {
            tracing::debug!("Query clip produced no landmarks");
            return Ok(Vec::new());
        }

        let mut hashes: Vec<u32> = query_landmarks.iter().map(|&(hash, _)| hash).collect();
        hashes.sort_unstable();
        hashes.dedup();

        let postings = self.index.query_hashes(&hashes).await?;

        // (track, offset bucket) -> (votes, smallest delta seen)
        let mut votes: HashMap<(Uuid, i64), (u32, i64)> = HashMap::new();
        for &(hash, query_frame) in &query_landmarks {
            if let Some(hits) = postings.get(&hash) {
                for hit in hits {
                    let delta = hit.offset_frames - query_frame;
                    let bucket = delta.div_euclid(OFFSET_BUCKET_FRAMES);
                    let entry = votes.entry((hit.track_id, bucket)).or_insert((0, delta));
                    entry.0 += 1;
                    entry.1 = entry.1.min(delta);
                }
            }
        }

        // Best bucket per track; ties go to the earlier offset
        let mut best: HashMap<Uuid, ExactMatch> = HashMap::new();
        for ((track_id, _bucket), (count, min_delta)) in votes {
            if count < self.config.min_aligned_hashes {
                continue;
            }
            let candidate = ExactMatch {
                track_id,
                aligned_hashes: count,
                confidence: (count as f32 / self.config.strong_match_hashes as f32).min(1.0),
                offset_seconds: frames_to_seconds(min_delta).max(0.0),
            };
            let replace = match best.get(&track_id) {
                None => true,
                Some(existing) => {
                    count > existing.aligned_hashes
                        || (count == existing.aligned_hashes
                            && candidate.offset_seconds < existing.offset_seconds)
                }
            };
            if replace {
                best.insert(track_id, candidate);
            }
        }

        let mut matches: Vec<ExactMatch> = best.into_values().collect();
        matches.sort_by(|a, b| {
            b.aligned_hashes
                .cmp(&a.aligned_hashes)
                .then_with(|| a.offset_seconds.total_cmp(&b.offset_seconds))
                .then_with(|| a.track_id.cmp(&b.track_id))
        });
        matches.truncate(max_results);

        tracing::debug!(
            query_hashes = hashes.len(),
            candidates = matches.len(),
            "Exact lane voting finished"
        );
        Ok(matches)
    }

    /// Split the query into extraction windows
    ///
    /// Normal clips are one window. Clips under the short-clip threshold
    /// get several overlapping sub-windows whose votes are summed, which
    /// steadies the consensus when there are few landmarks to begin with.
    fn query_windows(&self, pcm: &MonoPcm) -> Vec<QueryWindow> {
        let n = self.config.short_clip_windows;
        if pcm.duration_seconds() >= self.config.short_clip_seconds || n <= 1 {
            return vec![QueryWindow {
                samples: pcm.samples.clone(),
                frame_shift: 0,
            }];
        }

        let window_len = (pcm.samples.len() as f64 * SHORT_CLIP_WINDOW_FRACTION) as usize;
        if window_len == 0 {
            return Vec::new();
        }

        let span = pcm.samples.len() - window_len;
        (0..n)
            .map(|w| {
                let start = span * w / (n - 1);
                QueryWindow {
                    samples: pcm.samples[start..start + window_len].to_vec(),
                    frame_shift: (start / HOP_SIZE) as i64,
                }
            })
            .collect()
    }
}
