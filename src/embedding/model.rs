//! The "mel-stats-v1" embedding model
//!
//! A deterministic spectral-statistics embedding: log mel band energies
//! summarized per band by level, spread, and frame-to-frame motion. It is
//! not a learned model, but it is stable across codecs and resampling,
//! which is what chunk vectors need to be comparable.

use once_cell::sync::Lazy;
use rustfft::{num_complex::Complex, Fft, FftPlanner};
use std::sync::Arc;

use crate::audio::EMBEDDING_SAMPLE_RATE;
use crate::error::{Error, Result};

/// Model identifier persisted next to every vector it produced
pub const MODEL_NAME: &str = "mel-stats-v1";

/// Output dimensionality: 40 mel bands x (mean, std, motion)
pub const EMBEDDING_DIM: usize = 120;

const MEL_BANDS: usize = 40;
const WINDOW_SIZE: usize = 1024;
const HOP_SIZE: usize = 512;

/// Turns a chunk of mono PCM into a fixed-length vector
///
/// Implementations must be deterministic: the same samples always produce
/// the same vector, or stored and query vectors stop being comparable.
pub trait EmbeddingModel: Send + Sync {
    fn name(&self) -> &'static str;
    fn dim(&self) -> usize;

    /// Embed one chunk of mono PCM
    ///
    /// The output is L2-normalized, so dot product equals cosine
    /// similarity. Input shorter than one analysis window yields the zero
    /// vector.
    fn embed(&self, samples: &[f32], sample_rate: u32) -> Result<Vec<f32>>;
}

/// Sparse triangular mel filter as (bin, weight) pairs
type MelFilter = Vec<(usize, f32)>;

pub struct MelBandModel {
    sample_rate: u32,
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    filterbank: Vec<MelFilter>,
}

impl MelBandModel {
    pub fn new() -> Self {
        let mut planner = FftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(WINDOW_SIZE);

        // Hann window
        let window = (0..WINDOW_SIZE)
            .map(|i| {
                let x = i as f32 / (WINDOW_SIZE - 1) as f32;
                0.5 * (1.0 - (2.0 * std::f32::consts::PI * x).cos())
            })
            .collect();

        Self {
            sample_rate: EMBEDDING_SAMPLE_RATE,
            fft,
            window,
            filterbank: build_filterbank(EMBEDDING_SAMPLE_RATE),
        }
    }

    /// STFT the input and reduce each frame to log mel band energies
    fn mel_frames(&self, samples: &[f32]) -> Vec<[f32; MEL_BANDS]> {
        let mut frames = Vec::new();
        if samples.len() < WINDOW_SIZE {
            return frames;
        }

        let mut buffer = vec![Complex::new(0.0f32, 0.0f32); WINDOW_SIZE];
        let mut power = vec![0.0f32; WINDOW_SIZE / 2];

        let mut start = 0usize;
        while start + WINDOW_SIZE <= samples.len() {
            for i in 0..WINDOW_SIZE {
                buffer[i] = Complex::new(samples[start + i] * self.window[i], 0.0);
            }
            self.fft.process(&mut buffer);

            for (bin, value) in buffer.iter().take(WINDOW_SIZE / 2).enumerate() {
                power[bin] = value.norm_sqr();
            }

            let mut bands = [0.0f32; MEL_BANDS];
            for (band, filter) in self.filterbank.iter().enumerate() {
                let energy: f32 = filter.iter().map(|&(bin, w)| power[bin] * w).sum();
                bands[band] = (energy + 1e-10).ln();
            }
            frames.push(bands);

            start += HOP_SIZE;
        }

        frames
    }
}

impl Default for MelBandModel {
    fn default() -> Self {
        Self::new()
    }
}

impl EmbeddingModel for MelBandModel {
    fn name(&self) -> &'static str {
        MODEL_NAME
    }

    fn dim(&self) -> usize {
        EMBEDDING_DIM
    }

    fn embed(&self, samples: &[f32], sample_rate: u32) -> Result<Vec<f32>> {
        if sample_rate != self.sample_rate {
            return Err(Error::InvalidInput(format!(
                "{} expects {} Hz input, got {} Hz",
                MODEL_NAME, self.sample_rate, sample_rate
            )));
        }

        let frames = self.mel_frames(samples);
        if frames.is_empty() {
            return Ok(vec![0.0; EMBEDDING_DIM]);
        }

        let n = frames.len() as f32;
        let mut features = vec![0.0f32; EMBEDDING_DIM];
        for band in 0..MEL_BANDS {
            let mean = frames.iter().map(|f| f[band]).sum::<f32>() / n;
            let var = frames.iter().map(|f| (f[band] - mean).powi(2)).sum::<f32>() / n;
            let motion = if frames.len() > 1 {
                frames
                    .windows(2)
                    .map(|pair| (pair[1][band] - pair[0][band]).abs())
                    .sum::<f32>()
                    / (n - 1.0)
            } else {
                0.0
            };

            features[band] = mean;
            features[MEL_BANDS + band] = var.sqrt();
            features[2 * MEL_BANDS + band] = motion;
        }

        Ok(l2_normalize(features))
    }
}

/// Scale a vector to unit length; near-zero vectors are left as-is
pub(crate) fn l2_normalize(mut vector: Vec<f32>) -> Vec<f32> {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 1e-6 {
        for x in vector.iter_mut() {
            *x /= norm;
        }
    }
    vector
}

static SHARED_MODEL: Lazy<Arc<MelBandModel>> = Lazy::new(|| Arc::new(MelBandModel::new()));

/// Process-wide model instance
///
/// The FFT plan and filterbank are built once and shared; `embed` itself
/// holds no mutable state.
pub fn shared_model() -> Arc<MelBandModel> {
    Arc::clone(&SHARED_MODEL)
}

/// Triangular mel filterbank over the usable FFT bins
fn build_filterbank(sample_rate: u32) -> Vec<MelFilter> {
    let nyquist = sample_rate as f32 / 2.0;
    let mel_max = hz_to_mel(nyquist);

    // MEL_BANDS + 2 edge points, evenly spaced on the mel scale
    let edges: Vec<usize> = (0..MEL_BANDS + 2)
        .map(|i| {
            let hz = mel_to_hz(mel_max * i as f32 / (MEL_BANDS + 1) as f32);
            let bin = (hz / nyquist * (WINDOW_SIZE / 2) as f32).round() as usize;
            bin.min(WINDOW_SIZE / 2 - 1)
        })
        .collect();

    (0..MEL_BANDS)
        .map(|band| {
            let (lo, mid, hi) = (edges[band], edges[band + 1], edges[band + 2]);
            let mut filter: MelFilter = Vec::new();
            for bin in lo..=hi {
                let weight = if bin < mid {
                    (bin - lo) as f32 / (mid - lo).max(1) as f32
                } else {
                    (hi - bin) as f32 / (hi - mid).max(1) as f32
                };
                if weight > 0.0 {
                    filter.push((bin, weight));
                }
            }
            // Low-frequency bands can collapse onto a single bin
            if filter.is_empty() {
                filter.push((mid, 1.0));
            }
            filter
        })
        .collect()
}

fn hz_to_mel(hz: f32) -> f32 {
    2595.0 * (1.0 + hz / 700.0).log10()
}

fn mel_to_hz(mel: f32) -> f32 {
    700.0 * (10.0f32.powf(mel / 2595.0) - 1.0)
}
