//! Promotions and the permanent vault registry.
//!
//! Both promotion paths re-check the staging record inside the promotion
//! transaction: nothing is promoted unless its bucket is `approved` at the
//! moment the promotion commits.

use libsql::{Connection, params};
use serde::Serialize;
use tracing::info;
use vaultgate_shared::{
    Artifact, Bucket, Fingerprint, IndexPartition, OperationId, Outcome, Phase, Result,
    VaultArtifact, VaultCategory, VaultgateError, WorkUnit,
};

use crate::wal::append_terminal;
use crate::work_units::{insert_work_unit, live_work_unit_on};
use crate::{Storage, db_err, int, now_ts, opt_col, parse_ts, text, ts};

const VAULT_COLUMNS: &str = "id, source_artifact_id, document, category, title, slug, path, \
     fingerprint, supersedes, created_at";

/// Vault and index sizes.
#[derive(Debug, Clone, Default, Serialize)]
pub struct VaultStats {
    pub per_category: Vec<(VaultCategory, u64)>,
    pub per_partition: Vec<(IndexPartition, u64)>,
}

impl Storage {
    /// Enqueue the phase-2 work unit for an approved phase-1 artifact and
    /// commit the promotion operation `op`, in one transaction.
    ///
    /// Promoting an artifact twice returns the unit created the first time.
    pub async fn promote_to_phase2(
        &self,
        artifact: &Artifact,
        document: &Fingerprint,
        op: &OperationId,
    ) -> Result<WorkUnit> {
        if artifact.phase != Phase::One {
            return Err(VaultgateError::validation(format!(
                "artifact {} is not a phase-1 artifact",
                artifact.id
            )));
        }
        let tx = self.write_tx().await?;

        let note = match require_approved(&tx, &artifact.id).await {
            Ok(note) => note,
            Err(e) => {
                tx.rollback().await.map_err(db_err)?;
                return Err(e);
            }
        };

        let unit = match promotion_target_on(&tx, &artifact.id).await? {
            Some(unit_id) => {
                tx.rollback().await.map_err(db_err)?;
                self.wal().commit(op).await?;
                return self
                    .get_work_unit(&unit_id)
                    .await?
                    .ok_or_else(|| VaultgateError::NotFound(format!("work unit {unit_id}")));
            }
            None => match live_work_unit_on(&tx, &artifact.id, Phase::Two).await? {
                Some(existing) => existing,
                None => {
                    insert_work_unit(
                        &tx,
                        document,
                        Phase::Two,
                        &artifact.id,
                        &artifact.payload_ref,
                        note.as_deref(),
                    )
                    .await?
                }
            },
        };

        insert_promotion(&tx, &artifact.id, Phase::One, &unit.id, op).await?;
        append_terminal(&tx, op, Outcome::Completed, None).await?;
        tx.commit().await.map_err(db_err)?;

        info!(artifact = %artifact.id, work_unit = %unit.id, "promoted to phase 2");
        Ok(unit)
    }

    /// Register a vault artifact for an approved phase-2 artifact and commit
    /// the promotion operation `op`, in one transaction.
    ///
    /// Vault ids are content-addressed: registering content that is already
    /// in the vault links the artifact to the existing entry.
    pub async fn record_vault_artifact(
        &self,
        vault: &VaultArtifact,
        op: &OperationId,
    ) -> Result<VaultArtifact> {
        let tx = self.write_tx().await?;

        if let Err(e) = require_approved(&tx, &vault.source_artifact_id).await {
            tx.rollback().await.map_err(db_err)?;
            return Err(e);
        }

        let target = match promotion_target_on(&tx, &vault.source_artifact_id).await? {
            Some(existing) => {
                tx.rollback().await.map_err(db_err)?;
                self.wal().commit(op).await?;
                existing
            }
            None => {
                tx.execute(
                    &format!(
                        "INSERT OR IGNORE INTO vault_artifacts ({VAULT_COLUMNS})
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
                    ),
                    params![
                        vault.id.as_str(),
                        vault.source_artifact_id.as_str(),
                        vault.document.as_str(),
                        vault.category.as_str(),
                        vault.title.as_str(),
                        vault.slug.as_str(),
                        vault.path.as_str(),
                        vault.fingerprint.as_str(),
                        vault.supersedes.as_deref(),
                        ts(vault.created_at),
                    ],
                )
                .await
                .map_err(db_err)?;
                insert_promotion(&tx, &vault.source_artifact_id, Phase::Two, &vault.id, op)
                    .await?;
                append_terminal(&tx, op, Outcome::Completed, None).await?;
                tx.commit().await.map_err(db_err)?;
                info!(
                    artifact = %vault.source_artifact_id,
                    vault_id = %vault.id,
                    category = %vault.category,
                    "promoted to vault"
                );
                vault.id.clone()
            }
        };

        self.get_vault_artifact(&target)
            .await?
            .ok_or_else(|| VaultgateError::NotFound(format!("vault artifact {target}")))
    }

    /// Where an artifact was promoted to, if it was.
    pub async fn promotion_target(&self, artifact_id: &str) -> Result<Option<String>> {
        promotion_target_on(&self.conn, artifact_id).await
    }

    pub async fn get_vault_artifact(&self, id: &str) -> Result<Option<VaultArtifact>> {
        let mut vaults = self
            .query_vault(
                &format!("SELECT {VAULT_COLUMNS} FROM vault_artifacts WHERE id = ?1"),
                params![id],
            )
            .await?;
        Ok(vaults.pop())
    }

    /// The newest vault artifact filed under `slug` in `category`.
    pub async fn latest_vault_by_slug(
        &self,
        category: VaultCategory,
        slug: &str,
    ) -> Result<Option<VaultArtifact>> {
        let mut vaults = self
            .query_vault(
                &format!(
                    "SELECT {VAULT_COLUMNS} FROM vault_artifacts
                     WHERE category = ?1 AND slug = ?2 ORDER BY created_at DESC LIMIT 1"
                ),
                params![category.as_str(), slug],
            )
            .await?;
        Ok(vaults.pop())
    }

    /// Every vault artifact, oldest first.
    pub async fn list_vault_artifacts(&self) -> Result<Vec<VaultArtifact>> {
        self.query_vault(
            &format!("SELECT {VAULT_COLUMNS} FROM vault_artifacts ORDER BY created_at"),
            params![],
        )
        .await
    }

    /// Vault artifacts descended from a document.
    pub async fn vault_artifacts_for_document(
        &self,
        document: &Fingerprint,
    ) -> Result<Vec<VaultArtifact>> {
        self.query_vault(
            &format!(
                "SELECT {VAULT_COLUMNS} FROM vault_artifacts WHERE document = ?1 ORDER BY created_at"
            ),
            params![document.as_str()],
        )
        .await
    }

    pub async fn vault_stats(&self) -> Result<VaultStats> {
        let mut stats = VaultStats::default();

        let mut rows = self
            .conn
            .query(
                "SELECT category, COUNT(*) FROM vault_artifacts GROUP BY category ORDER BY category",
                params![],
            )
            .await
            .map_err(db_err)?;
        while let Some(row) = rows.next().await.map_err(db_err)? {
            stats
                .per_category
                .push((text(&row, 0)?.parse()?, int(&row, 1)? as u64));
        }

        let mut rows = self
            .conn
            .query(
                "SELECT index_partition, COUNT(*) FROM index_entries
                 GROUP BY index_partition ORDER BY index_partition",
                params![],
            )
            .await
            .map_err(db_err)?;
        while let Some(row) = rows.next().await.map_err(db_err)? {
            stats
                .per_partition
                .push((text(&row, 0)?.parse()?, int(&row, 1)? as u64));
        }
        Ok(stats)
    }

    pub(crate) async fn query_vault(
        &self,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<VaultArtifact>> {
        let mut rows = self.conn.query(sql, params).await.map_err(db_err)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            out.push(row_to_vault(&row)?);
        }
        Ok(out)
    }
}

/// Returns the reviewer note of an approved artifact, or a conflict if the
/// artifact is not approved.
async fn require_approved(conn: &Connection, artifact_id: &str) -> Result<Option<String>> {
    let mut rows = conn
        .query(
            "SELECT bucket, note FROM staging WHERE artifact_id = ?1",
            params![artifact_id],
        )
        .await
        .map_err(db_err)?;
    match rows.next().await.map_err(db_err)? {
        Some(row) => {
            let bucket: Bucket = text(&row, 0)?.parse()?;
            if bucket == Bucket::Approved {
                Ok(opt_col(&row, 1))
            } else {
                Err(VaultgateError::conflict(format!(
                    "artifact {artifact_id} is {bucket}, only approved artifacts are promoted"
                )))
            }
        }
        None => Err(VaultgateError::NotFound(format!(
            "staged artifact {artifact_id}"
        ))),
    }
}

async fn promotion_target_on(conn: &Connection, artifact_id: &str) -> Result<Option<String>> {
    let mut rows = conn
        .query(
            "SELECT target FROM promotions WHERE artifact_id = ?1",
            params![artifact_id],
        )
        .await
        .map_err(db_err)?;
    match rows.next().await.map_err(db_err)? {
        Some(row) => Ok(Some(text(&row, 0)?)),
        None => Ok(None),
    }
}

async fn insert_promotion(
    conn: &Connection,
    artifact_id: &str,
    phase: Phase,
    target: &str,
    op: &OperationId,
) -> Result<()> {
    conn.execute(
        "INSERT INTO promotions (artifact_id, phase, target, op_id, promoted_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            artifact_id,
            i64::from(phase.number()),
            target,
            op.as_str(),
            now_ts()
        ],
    )
    .await
    .map_err(db_err)?;
    Ok(())
}

fn row_to_vault(row: &libsql::Row) -> Result<VaultArtifact> {
    Ok(VaultArtifact {
        id: text(row, 0)?,
        source_artifact_id: text(row, 1)?,
        document: Fingerprint(text(row, 2)?),
        category: text(row, 3)?.parse()?,
        title: text(row, 4)?,
        slug: text(row, 5)?,
        path: text(row, 6)?,
        fingerprint: Fingerprint(text(row, 7)?),
        supersedes: opt_col(row, 8),
        created_at: parse_ts(&text(row, 9)?)?,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::artifacts::tests::staged;
    use crate::stage::StageStore;
    use crate::test_support::test_storage;
    use chrono::Utc;
    use std::sync::Arc;
    use vaultgate_shared::{OpKind, WorkStatus, vault_id};

    pub(crate) fn vault_for(artifact: &Artifact, body: &str) -> VaultArtifact {
        let fingerprint = Fingerprint::of(body.as_bytes());
        VaultArtifact {
            id: vault_id(&fingerprint),
            source_artifact_id: artifact.id.clone(),
            document: Fingerprint::of(b"doc"),
            category: VaultCategory::Note,
            title: "Ownership".into(),
            slug: "ownership".into(),
            path: format!("notes/ownership-{}.md", &fingerprint.as_str()[..8]),
            fingerprint,
            supersedes: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn phase1_promotion_enqueues_one_phase2_unit() {
        let storage = Arc::new(test_storage().await);
        let stage = StageStore::new(storage.clone());
        let (unit, artifacts) = staged(&storage, "doc", 1).await;
        let a = &artifacts[0];
        stage
            .move_artifact(&a.id, Bucket::Pending, Bucket::Approved, Some("focus on traits"))
            .await
            .unwrap();

        let wal = storage.wal();
        let op = wal.begin(OpKind::Promote(Phase::One), &a.id, None).await.unwrap();
        let p2 = storage.promote_to_phase2(a, &unit.document, &op).await.unwrap();
        assert_eq!(p2.phase, Phase::Two);
        assert_eq!(p2.status, WorkStatus::Queued);
        assert_eq!(p2.subject, a.id);
        assert_eq!(p2.note.as_deref(), Some("focus on traits"));
        assert_eq!(p2.input_ref, a.payload_ref);

        // Promoting again is a no-op returning the same unit.
        let op2 = wal.begin(OpKind::Promote(Phase::One), &a.id, None).await.unwrap();
        let again = storage.promote_to_phase2(a, &unit.document, &op2).await.unwrap();
        assert_eq!(again.id, p2.id);
        assert_eq!(storage.promotion_target(&a.id).await.unwrap(), Some(p2.id));
        assert!(storage.approved_unpromoted(Phase::One).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejected_artifacts_are_never_promoted() {
        let storage = Arc::new(test_storage().await);
        let stage = StageStore::new(storage.clone());
        let (unit, artifacts) = staged(&storage, "doc", 1).await;
        let a = &artifacts[0];
        stage
            .move_artifact(&a.id, Bucket::Pending, Bucket::Rejected, None)
            .await
            .unwrap();

        let op = storage
            .wal()
            .begin(OpKind::Promote(Phase::One), &a.id, None)
            .await
            .unwrap();
        let err = storage.promote_to_phase2(a, &unit.document, &op).await.unwrap_err();
        assert!(err.is_conflict());
        assert!(storage.live_work_unit(&a.id, Phase::Two).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn vault_registration_requires_approval_and_is_content_addressed() {
        let storage = Arc::new(test_storage().await);
        let stage = StageStore::new(storage.clone());
        let (_, artifacts) = staged(&storage, "doc", 2).await;
        let wal = storage.wal();

        // Pending: refused.
        let op = wal.begin(OpKind::Promote(Phase::Two), &artifacts[0].id, None).await.unwrap();
        let err = storage
            .record_vault_artifact(&vault_for(&artifacts[0], "body"), &op)
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        assert!(storage.list_vault_artifacts().await.unwrap().is_empty());

        for a in &artifacts {
            stage
                .move_artifact(&a.id, Bucket::Pending, Bucket::Approved, None)
                .await
                .unwrap();
        }
        let op = wal.begin(OpKind::Promote(Phase::Two), &artifacts[0].id, None).await.unwrap();
        let v1 = storage
            .record_vault_artifact(&vault_for(&artifacts[0], "body"), &op)
            .await
            .unwrap();
        // Identical content from another artifact links to the same entry.
        let op = wal.begin(OpKind::Promote(Phase::Two), &artifacts[1].id, None).await.unwrap();
        let v2 = storage
            .record_vault_artifact(&vault_for(&artifacts[1], "body"), &op)
            .await
            .unwrap();
        assert_eq!(v1.id, v2.id);
        assert_eq!(v2.source_artifact_id, artifacts[0].id);
        assert_eq!(storage.list_vault_artifacts().await.unwrap().len(), 1);
        assert_eq!(storage.promotion_target(&artifacts[1].id).await.unwrap(), Some(v1.id.clone()));

        let latest = storage
            .latest_vault_by_slug(VaultCategory::Note, "ownership")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.id, v1.id);

        let stats = storage.vault_stats().await.unwrap();
        assert_eq!(stats.per_category, vec![(VaultCategory::Note, 1)]);
        assert!(stats.per_partition.is_empty());
    }
}
