//! Canonical audio byte storage
//!
//! The vault keeps one copy of every ingested file, addressed by content
//! hash, so re-indexing never depends on the original path still
//! existing. Layout is two-level: `vault/<first two hash chars>/<hash>.<ext>`.

use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::{Error, Result};

/// Content-addressed store of ingested audio bytes
///
/// Paths handed out (and stored on track rows) are relative to the vault
/// root, so the library survives the root being moved.
#[derive(Debug, Clone)]
pub struct AudioVault {
    root: PathBuf,
}

impl AudioVault {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute location of a stored entry
    pub fn resolve(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }

    /// Store canonical bytes under the content hash
    ///
    /// Returns the relative vault path. Already-present entries are left
    /// untouched; the write goes through a temp sibling and a rename so a
    /// crash never leaves a half-written entry under the final name.
    pub async fn store(&self, content_hash: &str, bytes: &[u8]) -> Result<String> {
        let relative = self.relative_path(content_hash, bytes);
        let target = self.root.join(&relative);

        if tokio::fs::try_exists(&target).await? {
            tracing::debug!(path = %relative, "Vault entry already present");
            return Ok(relative);
        }

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Unique temp sibling per writer: parallel stores of one hash
        // write identical bytes, and the renames may land in any order
        let tmp = target.with_extension(format!("tmp-{}", Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &target).await?;

        tracing::debug!(path = %relative, bytes = bytes.len(), "Stored canonical audio");
        Ok(relative)
    }

    /// Read a stored entry back
    pub async fn read(&self, relative: &str) -> Result<Vec<u8>> {
        let path = self.resolve(relative);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::NotFound(format!(
                "Vault entry missing: {}",
                relative
            ))),
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Remove a stored entry; returns false when it was already gone
    pub async fn remove(&self, relative: &str) -> Result<bool> {
        let path = self.resolve(relative);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Relative path for a hash: two-char fan-out directory plus the full
    /// hash, extension sniffed from the container bytes
    fn relative_path(&self, content_hash: &str, bytes: &[u8]) -> String {
        let prefix = if content_hash.len() >= 2 {
            &content_hash[..2]
        } else {
            "00"
        };
        let ext = infer::get(bytes)
            .map(|kind| kind.extension())
            .unwrap_or("bin");
        format!("{}/{}.{}", prefix, content_hash, ext)
    }
}

/// Whether the leading bytes look like an audio (or audio-bearing video)
/// container
///
/// Extension checks alone trust the filename; this trusts the bytes.
/// MP4-family containers pass because m4a audio ships in them.
pub fn looks_like_audio(header: &[u8]) -> bool {
    match infer::get(header) {
        Some(kind) => {
            kind.matcher_type() == infer::MatcherType::Audio
                || kind.mime_type() == "video/mp4"
        }
        // Headerless formats (raw AAC, some MP3 without ID3) fall through
        // to the decoder, which is the real arbiter
        None => true,
    }
}
