//! Exact-lane landmark fingerprints
//!
//! Extraction turns low-rate PCM into packed (f1, f2, dt) hashes anchored
//! at STFT frames; the store is the inverted index those hashes live in.

pub mod landmark;
pub mod store;

pub use landmark::{
    frames_to_seconds, pack_hash, Landmark, LandmarkExtractor, HOP_SIZE, WINDOW_SIZE,
};
pub use store::{FingerprintIndex, HashHit, SqliteFingerprintIndex, WriterGuard, WriterToken};
