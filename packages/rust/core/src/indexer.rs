//! Indexer: derives one vector index entry per vault artifact.
//!
//! Index entries are derived data. Re-indexing overwrites the single entry
//! of an artifact, so at-least-once delivery is enough.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};
use tracing::{info, instrument, warn};

use vaultgate_shared::{
    Fingerprint, OpKind, Result, StorageLayout, VaultgateError, VectorIndexEntry,
};
use vaultgate_storage::Storage;

use crate::abandon;
use crate::report::RunReport;

/// Narrow interface to an embedding service.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Model identifier stored with every entry.
    fn model_name(&self) -> &str;

    /// Length of the vectors returned by [`Embedder::embed`].
    fn dims(&self) -> usize;

    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Deterministic SHA-256-derived embedding, used when no embedding service
/// is configured. Identical text (ignoring case and surrounding whitespace)
/// always maps to the same vector; values lie in `[-1, 1]`.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dims: usize,
    model: String,
}

impl HashEmbedder {
    pub fn new(dims: usize) -> Self {
        let dims = dims.max(1);
        Self {
            dims,
            model: format!("hash-{dims}"),
        }
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(384)
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let normalized = text.trim().to_lowercase();
        let mut out = Vec::with_capacity(self.dims);
        let mut block = 0u32;
        while out.len() < self.dims {
            let mut hasher = Sha256::new();
            hasher.update(normalized.as_bytes());
            hasher.update(block.to_le_bytes());
            let digest = hasher.finalize();
            out.extend(
                digest
                    .iter()
                    .take(self.dims - out.len())
                    .map(|b| f32::from(*b) / 127.5 - 1.0),
            );
            block += 1;
        }
        Ok(out)
    }
}

pub struct Indexer {
    storage: Arc<Storage>,
    layout: StorageLayout,
    embedder: Arc<dyn Embedder>,
}

impl Indexer {
    pub fn new(storage: Arc<Storage>, layout: StorageLayout, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            storage,
            layout,
            embedder,
        }
    }

    /// Compute and register the index entry of a vault artifact.
    #[instrument(skip_all, fields(vault_id = %vault_id))]
    pub async fn index(&self, vault_id: &str) -> Result<VectorIndexEntry> {
        let vault = self
            .storage
            .get_vault_artifact(vault_id)
            .await?
            .ok_or_else(|| VaultgateError::NotFound(format!("vault artifact {vault_id}")))?;
        let path = self.layout.vault_dir().join(&vault.path);
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| VaultgateError::io(&path, e))?;

        let op = self.storage.wal().begin(OpKind::Index, vault_id, None).await?;
        let embedding = match self.embedder.embed(&content).await {
            Ok(v) if v.len() == self.embedder.dims() => v,
            Ok(v) => {
                let err = VaultgateError::Index(format!(
                    "{} returned {} dimensions, expected {}",
                    self.embedder.model_name(),
                    v.len(),
                    self.embedder.dims()
                ));
                return Err(abandon(&self.storage, &op, err).await);
            }
            Err(e) => {
                let err = VaultgateError::Index(format!("embedding failed: {e}"));
                return Err(abandon(&self.storage, &op, err).await);
            }
        };

        let entry = VectorIndexEntry {
            vault_artifact_id: vault.id.clone(),
            partition: vault.category.partition(),
            model: self.embedder.model_name().to_string(),
            dims: embedding.len(),
            embedding,
            content_hash: Fingerprint::of(content.as_bytes()),
            indexed_at: Utc::now(),
        };
        if let Err(e) = self.storage.upsert_index_entry(&entry, &op).await {
            return Err(abandon(&self.storage, &op, e).await);
        }

        info!(partition = entry.partition.as_str(), model = %entry.model, "vault artifact indexed");
        Ok(entry)
    }

    /// Index every vault artifact that has no entry yet.
    pub async fn index_missing(&self) -> Result<RunReport> {
        let mut report = RunReport::default();
        for vault in self.storage.unindexed_vault_artifacts().await? {
            match self.index(&vault.id).await {
                Ok(_) => report.indexed += 1,
                Err(e) => {
                    warn!(vault_id = %vault.id, error = %e, "indexing failed");
                    report.record_error(&e);
                }
            }
        }
        Ok(report)
    }
}
