//! Audio decoding via symphonia
//!
//! Decodes any container/codec symphonia recognizes, downmixes to mono,
//! and resamples to the two fixed processing rates. Decoding is CPU-bound
//! and synchronous; callers run it on a blocking thread.

use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use std::io::Cursor;
use symphonia::core::audio::{AudioBufferRef, Signal};
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use thiserror::Error;
use tracing::debug;

use super::{DecodedAudio, MonoPcm, EMBEDDING_SAMPLE_RATE, FINGERPRINT_SAMPLE_RATE};

/// Decode failure modes
///
/// Malformed input is an error, never a panic. Callers decide whether it
/// aborts (ingestion) or fails a request (search).
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Container probe failed; bytes are not a recognized audio format
    #[error("Unrecognized audio format: {0}")]
    UnrecognizedFormat(String),

    /// Container recognized but holds no decodable audio track
    #[error("No decodable audio track in container")]
    NoAudioTrack,

    /// Stream parameters are missing the sample rate
    #[error("Sample rate not specified in stream parameters")]
    UnknownSampleRate,

    /// Codec-level failure while decoding packets
    #[error("Codec failure: {0}")]
    Codec(String),

    /// Resampling to a processing rate failed
    #[error("Resampling failed: {0}")]
    Resample(String),

    /// Decoding succeeded but produced zero samples
    #[error("Decoded stream contained no samples")]
    EmptyStream,
}

/// Audio decoding seam
///
/// Synchronous by contract: implementations may burn CPU freely, callers
/// offload via `spawn_blocking`.
pub trait Decoder: Send + Sync {
    fn decode(&self, bytes: &[u8]) -> Result<DecodedAudio, DecodeError>;
}

/// Default decoder backed by symphonia with rubato resampling
#[derive(Debug, Default)]
pub struct SymphoniaDecoder;

impl SymphoniaDecoder {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for SymphoniaDecoder {
    fn decode(&self, bytes: &[u8]) -> Result<DecodedAudio, DecodeError> {
        let (native, native_rate) = decode_to_mono(bytes)?;
        if native.is_empty() {
            return Err(DecodeError::EmptyStream);
        }

        debug!(
            native_rate,
            frames = native.len(),
            "Decoded stream, resampling to processing rates"
        );

        let low = resample_mono(&native, native_rate, FINGERPRINT_SAMPLE_RATE)?;
        let high = resample_mono(&native, native_rate, EMBEDDING_SAMPLE_RATE)?;

        Ok(DecodedAudio {
            low: MonoPcm::new(low, FINGERPRINT_SAMPLE_RATE),
            high: MonoPcm::new(high, EMBEDDING_SAMPLE_RATE),
        })
    }
}

/// Decode the full stream, downmixing every frame to mono
fn decode_to_mono(bytes: &[u8]) -> Result<(Vec<f32>, u32), DecodeError> {
    let mss = MediaSourceStream::new(Box::new(Cursor::new(bytes.to_vec())), Default::default());

    let probed = symphonia::default::get_probe()
        .format(
            &Hint::new(),
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| DecodeError::UnrecognizedFormat(e.to_string()))?;

    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or(DecodeError::NoAudioTrack)?;

    let track_id = track.id;
    let codec_params = track.codec_params.clone();

    let native_rate = codec_params
        .sample_rate
        .ok_or(DecodeError::UnknownSampleRate)?;

    let mut decoder = symphonia::default::get_codecs()
        .make(&codec_params, &DecoderOptions::default())
        .map_err(|e| DecodeError::Codec(e.to_string()))?;

    let mut samples = Vec::new();

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(symphonia::core::errors::Error::IoError(e))
                if e.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                break;
            }
            Err(e) => return Err(DecodeError::Codec(e.to_string())),
        };

        if packet.track_id() != track_id {
            continue;
        }

        match decoder.decode(&packet) {
            Ok(decoded) => downmix_into(&decoded, &mut samples),
            // Corrupt packets are skipped; the stream usually recovers
            Err(symphonia::core::errors::Error::DecodeError(e)) => {
                debug!("Skipping undecodable packet: {}", e);
            }
            Err(e) => return Err(DecodeError::Codec(e.to_string())),
        }
    }

    Ok((samples, native_rate))
}

/// Append the mono downmix of a decoded buffer (all channels averaged)
fn downmix_into(decoded: &AudioBufferRef<'_>, out: &mut Vec<f32>) {
    match decoded {
        AudioBufferRef::F32(buf) => mix_frames(buf, out, |s| s),
        AudioBufferRef::F64(buf) => mix_frames(buf, out, |s| s as f32),
        AudioBufferRef::S8(buf) => mix_frames(buf, out, |s| s as f32 / 128.0),
        AudioBufferRef::S16(buf) => mix_frames(buf, out, |s| s as f32 / 32768.0),
        AudioBufferRef::S24(buf) => mix_frames(buf, out, |s| s.inner() as f32 / 8_388_608.0),
        AudioBufferRef::S32(buf) => mix_frames(buf, out, |s| s as f32 / 2_147_483_648.0),
        AudioBufferRef::U8(buf) => mix_frames(buf, out, |s| (s as f32 - 128.0) / 128.0),
        AudioBufferRef::U16(buf) => mix_frames(buf, out, |s| (s as f32 - 32768.0) / 32768.0),
        AudioBufferRef::U24(buf) => {
            mix_frames(buf, out, |s| (s.inner() as f32 - 8_388_608.0) / 8_388_608.0)
        }
        AudioBufferRef::U32(buf) => mix_frames(buf, out, |s| {
            (s as f32 - 2_147_483_648.0) / 2_147_483_648.0
        }),
    }
}

fn mix_frames<S, F>(buf: &symphonia::core::audio::AudioBuffer<S>, out: &mut Vec<f32>, convert: F)
where
    S: symphonia::core::sample::Sample + Copy,
    F: Fn(S) -> f32,
{
    let channels = buf.spec().channels.count();
    let frames = buf.frames();
    out.reserve(frames);

    if channels == 1 {
        let chan = buf.chan(0);
        out.extend(chan.iter().take(frames).map(|&s| convert(s)));
        return;
    }

    let scale = 1.0 / channels as f32;
    for i in 0..frames {
        let mut acc = 0.0f32;
        for c in 0..channels {
            acc += convert(buf.chan(c)[i]);
        }
        out.push(acc * scale);
    }
}

/// Resample mono PCM with rubato's sinc interpolator
///
/// 256-tap filter, 0.95 cutoff, BlackmanHarris2 window; the whole input
/// is processed as a single chunk.
fn resample_mono(samples: &[f32], source_rate: u32, target_rate: u32) -> Result<Vec<f32>, DecodeError> {
    if source_rate == target_rate {
        return Ok(samples.to_vec());
    }
    if samples.is_empty() {
        return Ok(Vec::new());
    }

    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };

    let resample_ratio = target_rate as f64 / source_rate as f64;

    let mut resampler = SincFixedIn::<f32>::new(
        resample_ratio,
        2.0,
        params,
        samples.len(),
        1,
    )
    .map_err(|e| DecodeError::Resample(e.to_string()))?;

    let input = vec![samples.to_vec()];
    let mut output = resampler
        .process(&input, None)
        .map_err(|e| DecodeError::Resample(e.to_string()))?;

    Ok(output.remove(0))
}
