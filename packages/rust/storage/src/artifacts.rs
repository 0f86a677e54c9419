//! Artifact persistence and the atomic "stage the outputs of a work unit" step.

use libsql::params;
use tracing::info;
use vaultgate_shared::{
    Artifact, Bucket, Fingerprint, OperationId, Outcome, Phase, Result, StagingRecord,
    VaultCategory, VaultgateError, WorkUnit, artifact_id,
};

use crate::stage::{insert_staging, row_to_staging};
use crate::wal::append_terminal;
use crate::{Storage, db_err, int, now_ts, opt_col, parse_ts, text};

const ARTIFACT_COLUMNS: &str = "a.id, a.work_unit_id, a.phase, a.ordinal, a.fingerprint, \
     a.payload_ref, a.title, a.category, a.created_at";

const STAGED_SELECT: &str = "SELECT a.id, a.work_unit_id, a.phase, a.ordinal, a.fingerprint,
            a.payload_ref, a.title, a.category, a.created_at,
            s.artifact_id, s.phase, s.bucket, s.note, s.updated_at,
            p.target
     FROM artifacts a
     JOIN staging s ON s.artifact_id = a.id
     LEFT JOIN promotions p ON p.artifact_id = a.id";

/// One output of a transformation, ready to be persisted.
#[derive(Debug, Clone)]
pub struct NewArtifact {
    pub ordinal: u32,
    pub fingerprint: Fingerprint,
    pub payload_ref: String,
    pub title: Option<String>,
    pub category: Option<VaultCategory>,
}

/// An artifact with its current bucket and, if promoted, the promotion target.
#[derive(Debug, Clone)]
pub struct StagedArtifact {
    pub artifact: Artifact,
    pub staging: StagingRecord,
    /// Phase-2 work unit id (phase 1) or vault id (phase 2).
    pub promoted_to: Option<String>,
}

impl Storage {
    /// Persist the outputs of a running work unit and place each in its
    /// phase's `pending` bucket, moving the unit `running → staged` and
    /// committing the process operation `op`, all in one transaction.
    pub async fn stage_artifacts(
        &self,
        unit: &WorkUnit,
        drafts: &[NewArtifact],
        op: &OperationId,
    ) -> Result<Vec<Artifact>> {
        let tx = self.write_tx().await?;
        let now = now_ts();

        let changed = tx
            .execute(
                "UPDATE work_units SET status = 'staged', updated_at = ?2
                 WHERE id = ?1 AND status = 'running'",
                params![unit.id.as_str(), now.as_str()],
            )
            .await
            .map_err(db_err)?;
        if changed == 0 {
            tx.rollback().await.map_err(db_err)?;
            return Err(VaultgateError::conflict(format!(
                "work unit {} is no longer running",
                unit.id
            )));
        }

        let mut artifacts = Vec::with_capacity(drafts.len());
        for draft in drafts {
            let id = artifact_id(&unit.id, draft.ordinal);
            tx.execute(
                "INSERT INTO artifacts
                    (id, work_unit_id, document, phase, ordinal, fingerprint, payload_ref,
                     title, category, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    id.as_str(),
                    unit.id.as_str(),
                    unit.document.as_str(),
                    i64::from(unit.phase.number()),
                    i64::from(draft.ordinal),
                    draft.fingerprint.as_str(),
                    draft.payload_ref.as_str(),
                    draft.title.as_deref(),
                    draft.category.map(|c| c.as_str()),
                    now.as_str(),
                ],
            )
            .await
            .map_err(db_err)?;
            insert_staging(&tx, &id, unit.phase, Bucket::Pending).await?;

            artifacts.push(Artifact {
                id,
                work_unit_id: unit.id.clone(),
                phase: unit.phase,
                ordinal: draft.ordinal,
                fingerprint: draft.fingerprint.clone(),
                payload_ref: draft.payload_ref.clone(),
                title: draft.title.clone(),
                category: draft.category,
                created_at: parse_ts(&now)?,
            });
        }

        append_terminal(&tx, op, Outcome::Completed, None).await?;
        tx.commit().await.map_err(db_err)?;

        info!(
            work_unit = %unit.id,
            phase = %unit.phase,
            artifacts = artifacts.len(),
            "artifacts staged pending"
        );
        Ok(artifacts)
    }

    pub async fn get_artifact(&self, id: &str) -> Result<Option<Artifact>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {ARTIFACT_COLUMNS} FROM artifacts a WHERE a.id = ?1"),
                params![id],
            )
            .await
            .map_err(db_err)?;
        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(Some(row_to_artifact(&row)?)),
            None => Ok(None),
        }
    }

    /// Outputs of one work unit in ordinal order.
    pub async fn artifacts_for_work_unit(&self, work_unit_id: &str) -> Result<Vec<Artifact>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {ARTIFACT_COLUMNS} FROM artifacts a
                     WHERE a.work_unit_id = ?1 ORDER BY a.ordinal"
                ),
                params![work_unit_id],
            )
            .await
            .map_err(db_err)?;
        let mut artifacts = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            artifacts.push(row_to_artifact(&row)?);
        }
        Ok(artifacts)
    }

    /// Every staged artifact descended from a document, across both phases.
    pub async fn artifacts_for_document(
        &self,
        document: &Fingerprint,
    ) -> Result<Vec<StagedArtifact>> {
        self.query_staged(
            &format!("{STAGED_SELECT} WHERE a.document = ?1 ORDER BY a.phase, a.created_at, a.ordinal"),
            params![document.as_str()],
        )
        .await
    }

    /// Artifacts currently in `bucket`, optionally restricted to one phase.
    pub async fn staged_artifacts(
        &self,
        phase: Option<Phase>,
        bucket: Bucket,
    ) -> Result<Vec<StagedArtifact>> {
        match phase {
            Some(p) => {
                self.query_staged(
                    &format!(
                        "{STAGED_SELECT} WHERE s.bucket = ?1 AND s.phase = ?2
                         ORDER BY a.created_at, a.ordinal"
                    ),
                    params![bucket.as_str(), i64::from(p.number())],
                )
                .await
            }
            None => {
                self.query_staged(
                    &format!(
                        "{STAGED_SELECT} WHERE s.bucket = ?1 ORDER BY a.phase, a.created_at, a.ordinal"
                    ),
                    params![bucket.as_str()],
                )
                .await
            }
        }
    }

    /// Approved artifacts of `phase` that have not been promoted yet.
    pub async fn approved_unpromoted(&self, phase: Phase) -> Result<Vec<Artifact>> {
        Ok(self
            .staged_artifacts(Some(phase), Bucket::Approved)
            .await?
            .into_iter()
            .filter(|s| s.promoted_to.is_none())
            .map(|s| s.artifact)
            .collect())
    }

    async fn query_staged(
        &self,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<StagedArtifact>> {
        let mut rows = self.conn.query(sql, params).await.map_err(db_err)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            out.push(StagedArtifact {
                artifact: row_to_artifact(&row)?,
                staging: row_to_staging(&row, 9)?,
                promoted_to: opt_col(&row, 14),
            });
        }
        Ok(out)
    }
}

fn row_to_artifact(row: &libsql::Row) -> Result<Artifact> {
    let phase_num = int(row, 2)?;
    let category = match opt_col(row, 7) {
        Some(c) => Some(c.parse::<VaultCategory>()?),
        None => None,
    };
    Ok(Artifact {
        id: text(row, 0)?,
        work_unit_id: text(row, 1)?,
        phase: Phase::from_number(phase_num)
            .ok_or_else(|| VaultgateError::Store(format!("invalid phase {phase_num}")))?,
        ordinal: int(row, 3)? as u32,
        fingerprint: Fingerprint(text(row, 4)?),
        payload_ref: text(row, 5)?,
        title: opt_col(row, 6),
        category,
        created_at: parse_ts(&text(row, 8)?)?,
    })
}
