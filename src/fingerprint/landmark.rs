//! Landmark hash extraction
//!
//! Converts low-rate mono PCM into constellation landmarks: an STFT, a
//! handful of spectral peaks per frame, and anchor/target peak pairs
//! packed into compact hashes. The same extraction runs at ingest and at
//! query time; matching lives in the search lanes.

use rustfft::{num_complex::Complex, Fft, FftPlanner};
use std::sync::Arc;

use crate::audio::FINGERPRINT_SAMPLE_RATE;

/// STFT window length in samples (~93 ms at the fingerprint rate)
pub const WINDOW_SIZE: usize = 1024;

/// STFT hop in samples (50% overlap, ~46 ms per frame)
pub const HOP_SIZE: usize = 512;

/// Logarithmic peak-picking bands over the 512 usable bins, [lo, hi)
const BAND_EDGES: [(usize, usize); 6] = [
    (1, 12),
    (12, 24),
    (24, 48),
    (48, 96),
    (96, 192),
    (192, 512),
];

/// A band maximum must exceed the frame mean by this factor to be a peak
const PEAK_MEAN_FACTOR: f32 = 2.0;

/// Absolute magnitude floor; silence frames produce no peaks
const PEAK_ABS_FLOOR: f32 = 1e-3;

/// Pairing target zone in frames; the upper bound fits the 6 hash bits
const MIN_PAIR_DT: u32 = 1;
const MAX_PAIR_DT: u32 = 63;

/// One spectral peak
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Peak {
    pub frame: u32,
    pub bin: u16,
}

/// One landmark: a packed peak-pair hash anchored at an STFT frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Landmark {
    pub hash: u32,
    pub anchor_frame: u32,
}

/// Pack an anchor bin, target bin, and frame delta into 24 bits
///
/// Layout: f1 (9 bits) | f2 (9 bits) | dt (6 bits).
#[inline]
pub fn pack_hash(f1: u16, f2: u16, dt: u32) -> u32 {
    ((f1 as u32 & 0x1FF) << 15) | ((f2 as u32 & 0x1FF) << 6) | (dt & 0x3F)
}

/// Convert an STFT frame delta to seconds
#[inline]
pub fn frames_to_seconds(frames: i64) -> f64 {
    frames as f64 * HOP_SIZE as f64 / FINGERPRINT_SAMPLE_RATE as f64
}

/// Landmark extractor with a pre-planned FFT
///
/// Cheap to share; `extract` is CPU-bound and runs on blocking threads.
pub struct LandmarkExtractor {
    fan_out: usize,
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
}

impl LandmarkExtractor {
    pub fn new(fan_out: usize) -> Self {
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
            fan_out,
            fft,
            window,
        }
    }

    /// Extract landmarks from low-rate mono PCM
    ///
    /// Input shorter than one STFT window yields no landmarks; this is
    /// never an error.
    pub fn extract(&self, samples: &[f32]) -> Vec<Landmark> {
        let peaks = self.spectral_peaks(samples);
        self.pair_peaks(&peaks)
    }

    /// STFT the input and pick per-band magnitude peaks
    pub(crate) fn spectral_peaks(&self, samples: &[f32]) -> Vec<Peak> {
        let mut peaks = Vec::new();
        if samples.len() < WINDOW_SIZE {
            return peaks;
        }

        let mut buffer = vec![Complex::new(0.0f32, 0.0f32); WINDOW_SIZE];
        let mut magnitudes = vec![0.0f32; WINDOW_SIZE / 2];

        let mut frame: u32 = 0;
        let mut start = 0usize;
        while start + WINDOW_SIZE <= samples.len() {
            for i in 0..WINDOW_SIZE {
                buffer[i] = Complex::new(samples[start + i] * self.window[i], 0.0);
            }
            self.fft.process(&mut buffer);

            for (bin, value) in buffer.iter().take(WINDOW_SIZE / 2).enumerate() {
                magnitudes[bin] = value.norm();
            }

            // Frame noise floor, DC excluded
            let mean: f32 = magnitudes[1..].iter().sum::<f32>() / (magnitudes.len() - 1) as f32;
            let threshold = (mean * PEAK_MEAN_FACTOR).max(PEAK_ABS_FLOOR);

            for &(lo, hi) in BAND_EDGES.iter() {
                let mut best_bin = lo;
                let mut best_mag = 0.0f32;
                for bin in lo..hi {
                    if magnitudes[bin] > best_mag {
                        best_mag = magnitudes[bin];
                        best_bin = bin;
                    }
                }
                if best_mag > threshold {
                    peaks.push(Peak {
                        frame,
                        bin: best_bin as u16,
                    });
                }
            }

            frame += 1;
            start += HOP_SIZE;
        }

        peaks
    }

    /// Pair each anchor peak with up to `fan_out` later peaks in the
    /// target zone
    fn pair_peaks(&self, peaks: &[Peak]) -> Vec<Landmark> {
        let mut landmarks = Vec::new();

        for (i, anchor) in peaks.iter().enumerate() {
            let mut paired = 0usize;
            for target in peaks.iter().skip(i + 1) {
                let dt = target.frame - anchor.frame;
                if dt < MIN_PAIR_DT {
                    continue;
                }
                if dt > MAX_PAIR_DT {
                    break;
                }
                landmarks.push(Landmark {
                    hash: pack_hash(anchor.bin, target.bin, dt),
                    anchor_frame: anchor.frame,
                });
                paired += 1;
                if paired >= self.fan_out {
                    break;
                }
            }
        }

        landmarks
    }
}
