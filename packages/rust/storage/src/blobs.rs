//! Content-addressed blob storage and atomic file writes.

use std::path::{Path, PathBuf};

use tracing::debug;
use uuid::Uuid;
use vaultgate_shared::{Fingerprint, Result, VaultgateError};

/// Write `bytes` to `target` atomically: write a temp file in `scratch`, then
/// rename it into place. `scratch` must be on the same filesystem as `target`.
pub async fn write_atomic(scratch: &Path, target: &Path, bytes: &[u8]) -> Result<()> {
    tokio::fs::create_dir_all(scratch)
        .await
        .map_err(|e| VaultgateError::io(scratch, e))?;
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| VaultgateError::io(parent, e))?;
    }

    let temp = scratch.join(format!(".{}.tmp", Uuid::now_v7()));
    tokio::fs::write(&temp, bytes)
        .await
        .map_err(|e| VaultgateError::io(&temp, e))?;

    if let Err(e) = tokio::fs::rename(&temp, target).await {
        let _ = tokio::fs::remove_file(&temp).await;
        return Err(VaultgateError::io(target, e));
    }
    Ok(())
}

/// Immutable blobs addressed by the SHA-256 of their content
/// (`<root>/<first two hex chars>/<fingerprint>`).
#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
    scratch: PathBuf,
}

impl BlobStore {
    pub fn new(root: impl Into<PathBuf>, scratch: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            scratch: scratch.into(),
        }
    }

    /// Reference string for a fingerprint, relative to the store root.
    pub fn reference(fingerprint: &Fingerprint) -> String {
        let fp = fingerprint.as_str();
        format!("{}/{fp}", &fp[..fp.len().min(2)])
    }

    /// Absolute path of a reference.
    pub fn path(&self, reference: &str) -> PathBuf {
        self.root.join(reference)
    }

    /// Store `bytes`, returning its fingerprint and reference. Storing the same
    /// content twice is a no-op.
    pub async fn put(&self, bytes: &[u8]) -> Result<(Fingerprint, String)> {
        let fingerprint = Fingerprint::of(bytes);
        let reference = Self::reference(&fingerprint);
        let path = self.path(&reference);

        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            debug!(blob = %fingerprint.short(), "blob already stored");
            return Ok((fingerprint, reference));
        }
        write_atomic(&self.scratch, &path, bytes).await?;
        debug!(blob = %fingerprint.short(), size = bytes.len(), "stored blob");
        Ok((fingerprint, reference))
    }

    /// Read a blob, verifying its content against the reference.
    pub async fn get(&self, reference: &str) -> Result<Vec<u8>> {
        let path = self.path(reference);
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| VaultgateError::io(&path, e))?;

        let expected = reference.rsplit('/').next().unwrap_or(reference);
        let actual = Fingerprint::of(&bytes);
        if actual.as_str() != expected {
            return Err(VaultgateError::Store(format!(
                "blob {reference} is corrupt (content hash {})",
                actual.short()
            )));
        }
        Ok(bytes)
    }

    pub async fn contains(&self, reference: &str) -> bool {
        tokio::fs::try_exists(self.path(reference))
            .await
            .unwrap_or(false)
    }
}
