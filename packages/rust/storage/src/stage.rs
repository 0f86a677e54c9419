//! Stage Store: the single current bucket of each artifact.
//!
//! The `staging` table holds exactly one row per staged artifact, so an
//! artifact is always in exactly one bucket. A move is one compare-and-set
//! `UPDATE` committed together with its log record: an interrupted move
//! leaves the row in either the old or the new bucket, never both.

use std::sync::Arc;

use libsql::{Connection, params};
use tracing::{info, instrument};
use vaultgate_shared::{
    Bucket, OpKind, Outcome, Phase, Result, StagingRecord, VaultgateError,
};

use crate::artifacts::StagedArtifact;
use crate::locks::KeyedLocks;
use crate::wal::append_terminal;
use crate::work_units::settle_work_unit;
use crate::{Storage, db_err, int, now_ts, opt_col, parse_ts, text};

/// Bucket transitions for staged artifacts.
#[derive(Clone)]
pub struct StageStore {
    storage: Arc<Storage>,
    locks: KeyedLocks,
}

impl StageStore {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self {
            storage,
            locks: KeyedLocks::new(),
        }
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    /// Place an artifact that has no bucket yet.
    #[instrument(skip_all, fields(artifact = artifact_id, bucket = %bucket))]
    pub async fn place(&self, artifact_id: &str, bucket: Bucket) -> Result<StagingRecord> {
        let _guard = self.locks.lock(artifact_id).await;
        let artifact = self
            .storage
            .get_artifact(artifact_id)
            .await?
            .ok_or_else(|| VaultgateError::NotFound(format!("artifact {artifact_id}")))?;

        let detail = format!("place:{bucket}");
        let op = self
            .storage
            .wal()
            .begin(OpKind::Stage, artifact_id, Some(&detail))
            .await?;

        let tx = self.storage.write_tx().await?;
        if !insert_staging(&tx, artifact_id, artifact.phase, bucket).await? {
            tx.rollback().await.map_err(db_err)?;
            self.storage.wal().fail(&op, "artifact already placed").await?;
            return Err(VaultgateError::conflict(format!(
                "artifact {artifact_id} already has a bucket"
            )));
        }
        append_terminal(&tx, &op, Outcome::Completed, None).await?;
        tx.commit().await.map_err(db_err)?;

        self.bucket_of(artifact_id)
            .await?
            .ok_or_else(|| VaultgateError::Store(format!("staging row for {artifact_id} vanished")))
    }

    /// Move an artifact from `from` to `to`, recording `note` with the move.
    ///
    /// Fails with a conflict if the artifact is not currently in `from` or the
    /// transition is not allowed. Holds the artifact's lock for the duration;
    /// other artifacts move concurrently.
    #[instrument(skip_all, fields(artifact = artifact_id, from = %from, to = %to))]
    pub async fn move_artifact(
        &self,
        artifact_id: &str,
        from: Bucket,
        to: Bucket,
        note: Option<&str>,
    ) -> Result<StagingRecord> {
        let _guard = self.locks.lock(artifact_id).await;

        let current = self
            .bucket_of(artifact_id)
            .await?
            .ok_or_else(|| VaultgateError::NotFound(format!("staged artifact {artifact_id}")))?;
        if current.bucket != from {
            return Err(VaultgateError::conflict(format!(
                "artifact {artifact_id} is {}, not {from}",
                current.bucket
            )));
        }
        if !from.can_move_to(to) {
            return Err(VaultgateError::conflict(format!(
                "illegal transition {from} -> {to} for artifact {artifact_id}"
            )));
        }

        let detail = format!("{from}->{to}");
        let op = self
            .storage
            .wal()
            .begin(OpKind::Stage, artifact_id, Some(&detail))
            .await?;

        let tx = self.storage.write_tx().await?;
        let moved = tx
            .execute(
                "UPDATE staging SET bucket = ?2, note = ?3, updated_at = ?4
                 WHERE artifact_id = ?1 AND bucket = ?5",
                params![artifact_id, to.as_str(), note, now_ts(), from.as_str()],
            )
            .await
            .map_err(db_err)?;
        if moved == 0 {
            // Another process moved it between our read and the write lock.
            tx.rollback().await.map_err(db_err)?;
            self.storage
                .wal()
                .fail(&op, "bucket changed concurrently")
                .await?;
            return Err(VaultgateError::conflict(format!(
                "artifact {artifact_id} left {from} concurrently"
            )));
        }
        let work_unit_id = artifact_work_unit(&tx, artifact_id).await?;
        settle_work_unit(&tx, &work_unit_id).await?;
        append_terminal(&tx, &op, Outcome::Completed, None).await?;
        tx.commit().await.map_err(db_err)?;

        info!(phase = %current.phase, "artifact moved");
        self.bucket_of(artifact_id)
            .await?
            .ok_or_else(|| VaultgateError::Store(format!("staging row for {artifact_id} vanished")))
    }

    /// Current staging record of an artifact.
    pub async fn bucket_of(&self, artifact_id: &str) -> Result<Option<StagingRecord>> {
        self.storage.get_staging(artifact_id).await
    }

    /// Artifacts in a bucket (the logical `phaseN_<bucket>` / `rejected` areas).
    pub async fn list(&self, phase: Option<Phase>, bucket: Bucket) -> Result<Vec<StagedArtifact>> {
        self.storage.staged_artifacts(phase, bucket).await
    }
}

impl Storage {
    pub async fn get_staging(&self, artifact_id: &str) -> Result<Option<StagingRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT artifact_id, phase, bucket, note, updated_at
                 FROM staging WHERE artifact_id = ?1",
                params![artifact_id],
            )
            .await
            .map_err(db_err)?;
        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(Some(row_to_staging(&row, 0)?)),
            None => Ok(None),
        }
    }
}

/// Insert the first staging row of an artifact. Returns `false` if the
/// artifact already has one.
pub(crate) async fn insert_staging(
    conn: &Connection,
    artifact_id: &str,
    phase: Phase,
    bucket: Bucket,
) -> Result<bool> {
    let inserted = conn
        .execute(
            "INSERT OR IGNORE INTO staging (artifact_id, phase, bucket, note, updated_at)
             VALUES (?1, ?2, ?3, NULL, ?4)",
            params![
                artifact_id,
                i64::from(phase.number()),
                bucket.as_str(),
                now_ts()
            ],
        )
        .await
        .map_err(db_err)?;
    Ok(inserted == 1)
}

async fn artifact_work_unit(conn: &Connection, artifact_id: &str) -> Result<String> {
    let mut rows = conn
        .query(
            "SELECT work_unit_id FROM artifacts WHERE id = ?1",
            params![artifact_id],
        )
        .await
        .map_err(db_err)?;
    match rows.next().await.map_err(db_err)? {
        Some(row) => text(&row, 0),
        None => Err(VaultgateError::NotFound(format!("artifact {artifact_id}"))),
    }
}

/// Read a staging record starting at column `offset`.
pub(crate) fn row_to_staging(row: &libsql::Row, offset: i32) -> Result<StagingRecord> {
    let phase_num = int(row, offset + 1)?;
    Ok(StagingRecord {
        artifact_id: text(row, offset)?,
        phase: Phase::from_number(phase_num)
            .ok_or_else(|| VaultgateError::Store(format!("invalid phase {phase_num}")))?,
        bucket: text(row, offset + 2)?.parse()?,
        note: opt_col(row, offset + 3),
        updated_at: parse_ts(&text(row, offset + 4)?)?,
    })
}
