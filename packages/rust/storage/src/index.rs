//! Vector index entries, one per vault artifact.

use libsql::params;
use tracing::debug;
use vaultgate_shared::{
    Fingerprint, OperationId, Outcome, Result, VaultArtifact, VaultgateError, VectorIndexEntry,
};

use crate::wal::append_terminal;
use crate::{Storage, db_err, int, parse_ts, text, ts};

/// Encode an embedding as little-endian `f32` bytes.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    vec.iter().flat_map(|f| f.to_le_bytes()).collect()
}

/// Decode little-endian `f32` bytes.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

impl Storage {
    /// Insert or overwrite the index entry of a vault artifact and commit the
    /// index operation `op`, in one transaction.
    pub async fn upsert_index_entry(
        &self,
        entry: &VectorIndexEntry,
        op: &OperationId,
    ) -> Result<()> {
        let tx = self.write_tx().await?;

        let mut rows = tx
            .query(
                "SELECT 1 FROM vault_artifacts WHERE id = ?1",
                params![entry.vault_artifact_id.as_str()],
            )
            .await
            .map_err(db_err)?;
        let exists = rows.next().await.map_err(db_err)?.is_some();
        drop(rows);
        if !exists {
            tx.rollback().await.map_err(db_err)?;
            return Err(VaultgateError::NotFound(format!(
                "vault artifact {}",
                entry.vault_artifact_id
            )));
        }

        tx.execute(
            "INSERT INTO index_entries
                (vault_artifact_id, index_partition, model, dims, embedding, content_hash, indexed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(vault_artifact_id) DO UPDATE SET
               index_partition = excluded.index_partition,
               model = excluded.model,
               dims = excluded.dims,
               embedding = excluded.embedding,
               content_hash = excluded.content_hash,
               indexed_at = excluded.indexed_at",
            params![
                entry.vault_artifact_id.as_str(),
                entry.partition.as_str(),
                entry.model.as_str(),
                entry.dims as i64,
                vec_to_blob(&entry.embedding),
                entry.content_hash.as_str(),
                ts(entry.indexed_at),
            ],
        )
        .await
        .map_err(|e| VaultgateError::Index(e.to_string()))?;
        append_terminal(&tx, op, Outcome::Completed, None).await?;
        tx.commit().await.map_err(db_err)?;

        debug!(vault_id = %entry.vault_artifact_id, partition = entry.partition.as_str(), "index entry stored");
        Ok(())
    }

    pub async fn get_index_entry(&self, vault_artifact_id: &str) -> Result<Option<VectorIndexEntry>> {
        let mut rows = self
            .conn
            .query(
                "SELECT vault_artifact_id, index_partition, model, dims, embedding, content_hash, indexed_at
                 FROM index_entries WHERE vault_artifact_id = ?1",
                params![vault_artifact_id],
            )
            .await
            .map_err(db_err)?;
        match rows.next().await.map_err(db_err)? {
            Some(row) => {
                let blob: Vec<u8> = row.get(4).map_err(db_err)?;
                Ok(Some(VectorIndexEntry {
                    vault_artifact_id: text(&row, 0)?,
                    partition: text(&row, 1)?.parse()?,
                    model: text(&row, 2)?,
                    dims: int(&row, 3)? as usize,
                    embedding: blob_to_vec(&blob),
                    content_hash: Fingerprint(text(&row, 5)?),
                    indexed_at: parse_ts(&text(&row, 6)?)?,
                }))
            }
            None => Ok(None),
        }
    }

    /// Vault artifacts without an index entry, oldest first.
    pub async fn unindexed_vault_artifacts(&self) -> Result<Vec<VaultArtifact>> {
        self.query_vault(
            "SELECT v.id, v.source_artifact_id, v.document, v.category, v.title, v.slug, v.path,
                    v.fingerprint, v.supersedes, v.created_at
             FROM vault_artifacts v
             LEFT JOIN index_entries i ON i.vault_artifact_id = v.id
             WHERE i.vault_artifact_id IS NULL
             ORDER BY v.created_at",
            params![],
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::tests::staged;
    use crate::stage::StageStore;
    use crate::test_support::test_storage;
    use crate::vault::tests::vault_for;
    use chrono::Utc;
    use std::sync::Arc;
    use vaultgate_shared::{Bucket, IndexPartition, OpKind, Phase};

    fn entry(vault_id: &str, value: f32) -> VectorIndexEntry {
        VectorIndexEntry {
            vault_artifact_id: vault_id.to_string(),
            partition: IndexPartition::Artifact,
            model: "hash-384".into(),
            dims: 3,
            embedding: vec![value, -value, 0.5],
            content_hash: Fingerprint::of(b"body"),
            indexed_at: Utc::now(),
        }
    }

    #[test]
    fn blob_roundtrip() {
        let v = vec![1.0f32, -0.25, 0.0];
        assert_eq!(blob_to_vec(&vec_to_blob(&v)), v);
    }

    #[tokio::test]
    async fn reindexing_overwrites_the_single_entry() {
        let storage = Arc::new(test_storage().await);
        let stage = StageStore::new(storage.clone());
        let (_, artifacts) = staged(&storage, "doc", 1).await;
        stage
            .move_artifact(&artifacts[0].id, Bucket::Pending, Bucket::Approved, None)
            .await
            .unwrap();
        let wal = storage.wal();
        let op = wal.begin(OpKind::Promote(Phase::Two), &artifacts[0].id, None).await.unwrap();
        let v = storage
            .record_vault_artifact(&vault_for(&artifacts[0], "body"), &op)
            .await
            .unwrap();
        assert_eq!(storage.unindexed_vault_artifacts().await.unwrap().len(), 1);

        let op = wal.begin(OpKind::Index, &v.id, None).await.unwrap();
        storage.upsert_index_entry(&entry(&v.id, 1.0), &op).await.unwrap();
        let op = wal.begin(OpKind::Index, &v.id, None).await.unwrap();
        storage.upsert_index_entry(&entry(&v.id, 0.25), &op).await.unwrap();

        let stored = storage.get_index_entry(&v.id).await.unwrap().unwrap();
        assert_eq!(stored.embedding, vec![0.25, -0.25, 0.5]);
        assert!(storage.unindexed_vault_artifacts().await.unwrap().is_empty());
        let stats = storage.vault_stats().await.unwrap();
        assert_eq!(stats.per_partition, vec![(IndexPartition::Artifact, 1)]);
    }

    #[tokio::test]
    async fn indexing_unknown_vault_artifact_is_not_found() {
        let storage = test_storage().await;
        let op = storage.wal().begin(OpKind::Index, "v_missing", None).await.unwrap();
        let err = storage
            .upsert_index_entry(&entry("v_missing", 1.0), &op)
            .await
            .unwrap_err();
        assert!(matches!(err, VaultgateError::NotFound(_)));
    }
}
