//! Source document registry and the ingestion hand-off.

use libsql::params;
use tracing::info;
use vaultgate_shared::{
    Fingerprint, OperationId, Outcome, Phase, Result, SourceDocument, VaultgateError, WorkUnit,
};

use crate::wal::append_terminal;
use crate::work_units::{failed_phase2_units_on, insert_work_unit, live_work_unit_on};
use crate::{Storage, db_err, int, parse_ts, text, ts};

impl Storage {
    pub async fn get_source_document(
        &self,
        fingerprint: &Fingerprint,
    ) -> Result<Option<SourceDocument>> {
        let mut rows = self
            .conn
            .query(
                "SELECT fingerprint, original_path, blob_ref, size_bytes, ingested_at
                 FROM source_documents WHERE fingerprint = ?1",
                params![fingerprint.as_str()],
            )
            .await
            .map_err(db_err)?;
        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(Some(row_to_document(&row)?)),
            None => Ok(None),
        }
    }

    /// All ingested documents, oldest first.
    pub async fn list_source_documents(&self) -> Result<Vec<SourceDocument>> {
        let mut rows = self
            .conn
            .query(
                "SELECT fingerprint, original_path, blob_ref, size_bytes, ingested_at
                 FROM source_documents ORDER BY ingested_at",
                params![],
            )
            .await
            .map_err(db_err)?;
        let mut docs = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            docs.push(row_to_document(&row)?);
        }
        Ok(docs)
    }

    /// Register a document and enqueue its phase-1 work unit, committing the
    /// ingest operation `op` in the same transaction.
    ///
    /// A document already registered by an earlier (failed) attempt keeps its
    /// original record. Fails with a conflict if a live phase-1 unit exists.
    pub async fn register_ingest(
        &self,
        doc: &SourceDocument,
        op: &OperationId,
    ) -> Result<WorkUnit> {
        let tx = self.write_tx().await?;

        if let Some(live) = live_work_unit_on(&tx, doc.fingerprint.as_str(), Phase::One).await? {
            tx.rollback().await.map_err(db_err)?;
            return Err(VaultgateError::conflict(format!(
                "document {} already has live work unit {}",
                doc.fingerprint.short(),
                live.id
            )));
        }

        tx.execute(
            "INSERT OR IGNORE INTO source_documents
                (fingerprint, original_path, blob_ref, size_bytes, ingested_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                doc.fingerprint.as_str(),
                doc.original_path.as_str(),
                doc.blob_ref.as_str(),
                doc.size_bytes as i64,
                ts(doc.ingested_at),
            ],
        )
        .await
        .map_err(db_err)?;

        let unit = insert_work_unit(
            &tx,
            &doc.fingerprint,
            Phase::One,
            doc.fingerprint.as_str(),
            &doc.blob_ref,
            None,
        )
        .await?;
        append_terminal(&tx, op, Outcome::Completed, None).await?;
        tx.commit().await.map_err(db_err)?;

        info!(
            fingerprint = %doc.fingerprint.short(),
            work_unit = %unit.id,
            attempt = unit.attempt,
            "document enqueued"
        );
        Ok(unit)
    }

    /// Queue a new phase-2 attempt for every subject of `document` whose
    /// latest phase-2 attempt failed, committing the ingest operation `op`
    /// in the same transaction.
    ///
    /// Returns no units, and leaves `op` open, when nothing is left to retry
    /// (another process got there first).
    pub async fn retry_failed_phase2(
        &self,
        document: &Fingerprint,
        op: &OperationId,
    ) -> Result<Vec<WorkUnit>> {
        let tx = self.write_tx().await?;

        let failed = failed_phase2_units_on(&tx, document).await?;
        if failed.is_empty() {
            tx.rollback().await.map_err(db_err)?;
            return Ok(Vec::new());
        }

        let mut retried = Vec::with_capacity(failed.len());
        for unit in &failed {
            retried.push(
                insert_work_unit(
                    &tx,
                    document,
                    Phase::Two,
                    &unit.subject,
                    &unit.input_ref,
                    unit.note.as_deref(),
                )
                .await?,
            );
        }
        append_terminal(&tx, op, Outcome::Completed, None).await?;
        tx.commit().await.map_err(db_err)?;

        info!(
            fingerprint = %document.short(),
            retried = retried.len(),
            "failed phase-2 work requeued"
        );
        Ok(retried)
    }
}

fn row_to_document(row: &libsql::Row) -> Result<SourceDocument> {
    Ok(SourceDocument {
        fingerprint: Fingerprint(text(row, 0)?),
        original_path: text(row, 1)?,
        blob_ref: text(row, 2)?,
        size_bytes: int(row, 3)? as u64,
        ingested_at: parse_ts(&text(row, 4)?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_storage;
    use chrono::Utc;
    use vaultgate_shared::{OpKind, WorkStatus};

    fn doc(content: &[u8]) -> SourceDocument {
        let fingerprint = Fingerprint::of(content);
        SourceDocument {
            blob_ref: format!("{}/{}", &fingerprint.as_str()[..2], fingerprint),
            fingerprint,
            original_path: "inbox/raw/notes.md".into(),
            size_bytes: content.len() as u64,
            ingested_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn register_commits_the_ingest_operation() {
        let storage = test_storage().await;
        let d = doc(b"# Title\n\nbody");
        let op = storage
            .wal()
            .begin(OpKind::Ingest, d.fingerprint.as_str(), None)
            .await
            .unwrap();

        let unit = storage.register_ingest(&d, &op).await.unwrap();
        assert_eq!(unit.status, WorkStatus::Queued);
        assert_eq!(unit.subject, d.fingerprint.as_str());

        let entry = storage.wal().get(&op).await.unwrap().unwrap();
        assert_eq!(entry.outcome, Some(Outcome::Completed));
        let stored = storage.get_source_document(&d.fingerprint).await.unwrap().unwrap();
        assert_eq!(stored.size_bytes, d.size_bytes);
        assert_eq!(storage.list_source_documents().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn second_registration_while_live_conflicts_and_leaves_op_open() {
        let storage = test_storage().await;
        let d = doc(b"same bytes");
        let wal = storage.wal();

        let op1 = wal.begin(OpKind::Ingest, d.fingerprint.as_str(), None).await.unwrap();
        storage.register_ingest(&d, &op1).await.unwrap();

        let op2 = wal.begin(OpKind::Ingest, d.fingerprint.as_str(), None).await.unwrap();
        let err = storage.register_ingest(&d, &op2).await.unwrap_err();
        assert!(err.is_conflict());
        // Nothing was committed for the losing attempt.
        assert!(wal.get(&op2).await.unwrap().unwrap().is_in_doubt());
        assert_eq!(
            storage.work_units_for_document(&d.fingerprint).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn failed_phase_two_attempt_is_requeued_once() {
        let storage = test_storage().await;
        let d = doc(b"retry me");
        let broken = insert_work_unit(
            &storage.conn,
            &d.fingerprint,
            Phase::Two,
            "art-1",
            "ab/payload",
            Some("keep"),
        )
        .await
        .unwrap();
        insert_work_unit(&storage.conn, &d.fingerprint, Phase::Two, "art-2", "cd/payload", None)
            .await
            .unwrap();
        assert!(storage.fail_work_unit(&broken.id, "model refused").await.unwrap());

        let wal = storage.wal();
        let op = wal.begin(OpKind::Ingest, d.fingerprint.as_str(), None).await.unwrap();
        let retried = storage.retry_failed_phase2(&d.fingerprint, &op).await.unwrap();
        assert_eq!(retried.len(), 1);
        assert_eq!(retried[0].subject, "art-1");
        assert_eq!(retried[0].attempt, 2);
        assert_eq!(retried[0].input_ref, "ab/payload");
        assert_eq!(retried[0].note.as_deref(), Some("keep"));
        assert_eq!(wal.get(&op).await.unwrap().unwrap().outcome, Some(Outcome::Completed));

        // The new attempt is now the latest one for the subject.
        assert!(storage.failed_phase2_units(&d.fingerprint).await.unwrap().is_empty());
        let again = wal.begin(OpKind::Ingest, d.fingerprint.as_str(), None).await.unwrap();
        assert!(storage.retry_failed_phase2(&d.fingerprint, &again).await.unwrap().is_empty());
        assert!(wal.get(&again).await.unwrap().unwrap().is_in_doubt());
    }
}
