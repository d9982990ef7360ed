//! Decoded audio representations
//!
//! Everything downstream of the decoder works on mono f32 PCM at one of
//! two fixed rates: a low rate for landmark fingerprinting and a higher
//! rate for embedding inference.

mod decoder;

pub use decoder::{DecodeError, Decoder, SymphoniaDecoder};

/// Sample rate of the fingerprinting lane input (Hz)
pub const FINGERPRINT_SAMPLE_RATE: u32 = 11_025;

/// Sample rate of the embedding lane input (Hz)
pub const EMBEDDING_SAMPLE_RATE: u32 = 22_050;

/// Mono PCM buffer at a known sample rate
#[derive(Debug, Clone)]
pub struct MonoPcm {
    /// Samples normalized to [-1.0, 1.0]
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl MonoPcm {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    pub fn duration_seconds(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Copy out a segment, clamped to the buffer end
    pub fn segment(&self, start_seconds: f64, duration_seconds: f64) -> MonoPcm {
        let start = ((start_seconds * self.sample_rate as f64) as usize).min(self.samples.len());
        let len = (duration_seconds * self.sample_rate as f64) as usize;
        let end = (start + len).min(self.samples.len());
        MonoPcm {
            samples: self.samples[start..end].to_vec(),
            sample_rate: self.sample_rate,
        }
    }
}

/// Decoder output: the same audio at both processing rates
#[derive(Debug, Clone)]
pub struct DecodedAudio {
    /// Mono PCM at [`FINGERPRINT_SAMPLE_RATE`]
    pub low: MonoPcm,
    /// Mono PCM at [`EMBEDDING_SAMPLE_RATE`]
    pub high: MonoPcm,
}

impl DecodedAudio {
    /// Duration of the decoded stream in seconds
    pub fn duration_seconds(&self) -> f64 {
        self.high.duration_seconds()
    }
}
