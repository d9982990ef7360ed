//! Shared fixtures for engine integration tests
//!
//! Builds engines on throwaway storage roots and renders deterministic
//! melody WAVs. Melodies are non-repeating note ladders parameterized by
//! (base, step), so two tracks never share material and an excerpt
//! rendered from an offset is sample-identical to the full track's
//! slice.

#![allow(dead_code)]

pub mod faults;

use std::io::Cursor;
use std::path::Path;
use std::sync::Once;

use tempfile::TempDir;

use sonance_core::{Engine, EngineConfig};

pub const SAMPLE_RATE: u32 = 22_050;

static TRACING: Once = Once::new();

/// Route test logs through tracing when RUST_LOG asks for them
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub fn engine_config(root: &Path) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.storage.root = root.to_path_buf();
    config
}

pub async fn open_engine(dir: &TempDir) -> Engine {
    init_tracing();
    Engine::open(engine_config(dir.path()))
        .await
        .expect("engine open")
}

/// One melody sample at absolute time `t`
///
/// A sequence of 0.25 s notes whose pitches are drawn from a scrambled
/// 128-step scale above `base`, spaced by `step`. The scramble keeps
/// every moment distinct without the pitch ever leaving the band
/// `[base, base + 127 * step]`, and frequency and phase depend only on
/// absolute time, so excerpts line up exactly with the full render.
fn melody_sample(base: f64, step: f64, t: f64) -> i16 {
    let note = (t / 0.25) as u32;
    let degree = (note.wrapping_mul(2_654_435_761) >> 16) & 0x7F;
    let freq = base + step * degree as f64;
    ((2.0 * std::f64::consts::PI * freq * t).sin() * 0.5 * 32767.0) as i16
}

/// Render a melody excerpt [start, start + seconds) as WAV bytes
pub fn melody_wav_bytes(base: f64, step: f64, start: f64, seconds: f64) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut buf = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut buf, spec).expect("wav writer");
        let first = (start * SAMPLE_RATE as f64) as usize;
        let frames = (seconds * SAMPLE_RATE as f64) as usize;
        for i in first..first + frames {
            let t = i as f64 / SAMPLE_RATE as f64;
            writer
                .write_sample(melody_sample(base, step, t))
                .expect("wav sample");
        }
        writer.finalize().expect("wav finalize");
    }
    buf.into_inner()
}

/// Write a full melody track to disk
pub fn write_melody_wav(path: &Path, base: f64, step: f64, seconds: f64) {
    std::fs::write(path, melody_wav_bytes(base, step, 0.0, seconds)).expect("write wav");
}
