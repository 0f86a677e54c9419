//! Durable operation log.
//!
//! Every operation is one `begin` row plus, once finished, exactly one
//! terminal row (`completed` or `failed`). Rows are only ever appended; the
//! retention sweep is the single code path that deletes them. An operation
//! with a `begin` row and no terminal row is in-doubt; it is orphaned once
//! the process lease recorded as its owner is gone.

use chrono::{DateTime, Utc};
use libsql::{Connection, params};
use tracing::{debug, warn};
use vaultgate_shared::{OpKind, OperationId, Outcome, Result, VaultgateError, WalEntry};

use crate::{Storage, int, now_ts, opt_col, parse_ts, text, ts};

const ENTRY_SELECT: &str = "SELECT b.op_id, b.kind, b.target, b.detail, b.recorded_at,
            t.event, t.reason, t.recorded_at, b.owner
     FROM wal_entries b
     LEFT JOIN wal_entries t ON t.op_id = b.op_id AND t.event <> 'begin'
     WHERE b.event = 'begin'";

fn wal_err(e: libsql::Error) -> VaultgateError {
    VaultgateError::WalWrite(e.to_string())
}

/// Handle to the durable log of a [`Storage`].
#[derive(Clone, Copy)]
pub struct Wal<'a> {
    storage: &'a Storage,
}

impl<'a> Wal<'a> {
    pub(crate) fn new(storage: &'a Storage) -> Self {
        Self { storage }
    }

    /// Durably record the start of an operation, owned by this handle's
    /// lease. Must return before the operation's side effect starts.
    pub async fn begin(
        &self,
        kind: OpKind,
        target: &str,
        detail: Option<&str>,
    ) -> Result<OperationId> {
        self.storage.check_writable()?;
        let op = OperationId::new();
        self.storage
            .conn
            .execute(
                "INSERT INTO wal_entries (op_id, kind, target, detail, event, recorded_at, owner)
                 VALUES (?1, ?2, ?3, ?4, 'begin', ?5, ?6)",
                params![
                    op.as_str(),
                    kind.as_str(),
                    target,
                    detail,
                    now_ts(),
                    self.storage.owner()
                ],
            )
            .await
            .map_err(wal_err)?;
        debug!(op = %op, %kind, target, "wal begin");
        Ok(op)
    }

    /// Record successful completion of an operation.
    pub async fn commit(&self, op: &OperationId) -> Result<()> {
        self.storage.check_writable()?;
        append_terminal(&self.storage.conn, op, Outcome::Completed, None).await
    }

    /// Record that an operation failed. The operation moves to the `failed`
    /// partition for inspection.
    pub async fn fail(&self, op: &OperationId, reason: &str) -> Result<()> {
        self.storage.check_writable()?;
        append_terminal(&self.storage.conn, op, Outcome::Failed, Some(reason)).await?;
        warn!(op = %op, reason, "wal fail");
        Ok(())
    }

    /// Look up one operation.
    pub async fn get(&self, op: &OperationId) -> Result<Option<WalEntry>> {
        let sql = format!("{ENTRY_SELECT} AND b.op_id = ?1");
        let mut entries = self.query_entries(&sql, params![op.as_str()]).await?;
        Ok(entries.pop())
    }

    /// Operations that have begun but have no terminal record, oldest first.
    pub async fn in_doubt(&self) -> Result<Vec<WalEntry>> {
        let sql = format!("{ENTRY_SELECT} AND t.op_id IS NULL ORDER BY b.seq");
        self.query_entries(&sql, params![]).await
    }

    /// In-doubt operations of the given kinds that no live process owns:
    /// operations begun without an owner, or by a lease that expired or was
    /// released. Operations of this handle are never orphaned.
    pub async fn orphaned_of(&self, kinds: &[OpKind]) -> Result<Vec<WalEntry>> {
        let sql = format!(
            "{ENTRY_SELECT} AND t.op_id IS NULL
               AND (b.owner IS NULL OR (b.owner <> ?1 AND NOT EXISTS (
                    SELECT 1 FROM leases l WHERE l.owner = b.owner AND l.expires_at > ?2)))
             ORDER BY b.seq"
        );
        let own = self.storage.owner().unwrap_or_default();
        Ok(self
            .query_entries(&sql, params![own, now_ts()])
            .await?
            .into_iter()
            .filter(|e| kinds.contains(&e.kind))
            .collect())
    }

    /// Most recent finished operations of one partition.
    pub async fn partition(&self, outcome: Outcome, limit: u32) -> Result<Vec<WalEntry>> {
        let sql = format!("{ENTRY_SELECT} AND t.event = ?1 ORDER BY t.seq DESC LIMIT ?2");
        self.query_entries(&sql, params![outcome.as_str(), i64::from(limit)])
            .await
    }

    /// The latest completed operation of `kind` against `target`, if any.
    pub async fn latest_completed(&self, kind: OpKind, target: &str) -> Result<Option<WalEntry>> {
        let sql = format!(
            "{ENTRY_SELECT} AND b.kind = ?1 AND b.target = ?2 AND t.event = 'completed'
             ORDER BY t.seq DESC LIMIT 1"
        );
        let mut entries = self
            .query_entries(&sql, params![kind.as_str(), target])
            .await?;
        Ok(entries.pop())
    }

    /// Full history of operations against `target`, oldest first.
    pub async fn history(&self, target: &str) -> Result<Vec<WalEntry>> {
        let sql = format!("{ENTRY_SELECT} AND b.target = ?1 ORDER BY b.seq");
        self.query_entries(&sql, params![target]).await
    }

    /// Delete finished operations whose terminal record is older than `cutoff`.
    ///
    /// Failed operations are only removed with `include_failed`. In-doubt
    /// operations are never removed. Returns the number of operations deleted.
    pub async fn sweep(&self, cutoff: DateTime<Utc>, include_failed: bool) -> Result<u64> {
        let events = if include_failed {
            "('completed', 'failed')"
        } else {
            "('completed')"
        };
        let selector = format!(
            "SELECT op_id FROM wal_entries WHERE event IN {events} AND recorded_at < ?1"
        );
        let cutoff = ts(cutoff);

        let tx = self.storage.write_tx().await?;
        let mut rows = tx
            .query(
                &format!("SELECT COUNT(*) FROM ({selector})"),
                params![cutoff.as_str()],
            )
            .await
            .map_err(wal_err)?;
        let swept = match rows.next().await.map_err(wal_err)? {
            Some(row) => int(&row, 0)? as u64,
            None => 0,
        };
        drop(rows);
        tx.execute(
            &format!("DELETE FROM wal_entries WHERE op_id IN ({selector})"),
            params![cutoff.as_str()],
        )
        .await
        .map_err(wal_err)?;
        tx.commit().await.map_err(wal_err)?;

        tracing::info!(swept, include_failed, "wal retention sweep");
        Ok(swept)
    }

    async fn query_entries(
        &self,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<WalEntry>> {
        let mut rows = self
            .storage
            .conn
            .query(sql, params)
            .await
            .map_err(crate::db_err)?;
        let mut entries = Vec::new();
        while let Some(row) = rows.next().await.map_err(crate::db_err)? {
            entries.push(row_to_entry(&row)?);
        }
        Ok(entries)
    }
}

/// Append the terminal record of `op` on `conn`, which may be an open
/// transaction so the record commits together with the operation's effect.
///
/// Re-recording the same outcome is a no-op; recording a different outcome
/// than the one already logged is a conflict.
pub(crate) async fn append_terminal(
    conn: &Connection,
    op: &OperationId,
    outcome: Outcome,
    reason: Option<&str>,
) -> Result<()> {
    let inserted = conn
        .execute(
            "INSERT INTO wal_entries (op_id, kind, target, event, reason, recorded_at)
             SELECT op_id, kind, target, ?2, ?3, ?4 FROM wal_entries
             WHERE op_id = ?1 AND event = 'begin'
               AND NOT EXISTS (SELECT 1 FROM wal_entries WHERE op_id = ?1 AND event <> 'begin')",
            params![op.as_str(), outcome.as_str(), reason, now_ts()],
        )
        .await
        .map_err(wal_err)?;
    if inserted == 1 {
        debug!(op = %op, outcome = outcome.as_str(), "wal terminal");
        return Ok(());
    }

    let mut rows = conn
        .query(
            "SELECT event FROM wal_entries WHERE op_id = ?1 AND event <> 'begin'",
            params![op.as_str()],
        )
        .await
        .map_err(wal_err)?;
    match rows.next().await.map_err(wal_err)? {
        Some(row) => {
            let recorded: Outcome = text(&row, 0)?.parse()?;
            if recorded == outcome {
                Ok(())
            } else {
                Err(VaultgateError::conflict(format!(
                    "operation {op} already {}, cannot record {}",
                    recorded.as_str(),
                    outcome.as_str()
                )))
            }
        }
        None => Err(VaultgateError::NotFound(format!("wal operation {op}"))),
    }
}

fn row_to_entry(row: &libsql::Row) -> Result<WalEntry> {
    let outcome = match opt_col(row, 5) {
        Some(event) => Some(event.parse::<Outcome>()?),
        None => None,
    };
    let finished_at = match opt_col(row, 7) {
        Some(s) => Some(parse_ts(&s)?),
        None => None,
    };
    Ok(WalEntry {
        op_id: OperationId(text(row, 0)?),
        kind: text(row, 1)?.parse()?,
        target: text(row, 2)?,
        detail: opt_col(row, 3),
        begun_at: parse_ts(&text(row, 4)?)?,
        outcome,
        reason: opt_col(row, 6),
        finished_at,
        owner: opt_col(row, 8),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_storage;
    use std::time::Duration;
    use vaultgate_shared::Phase;

    #[tokio::test]
    async fn begin_then_commit_is_completed() {
        let storage = test_storage().await;
        let wal = storage.wal();

        let op = wal.begin(OpKind::Ingest, "fp1", None).await.unwrap();
        assert_eq!(wal.in_doubt().await.unwrap().len(), 1);

        wal.commit(&op).await.unwrap();
        let entry = wal.get(&op).await.unwrap().expect("entry");
        assert_eq!(entry.outcome, Some(Outcome::Completed));
        assert!(entry.finished_at.is_some());
        assert!(wal.in_doubt().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn terminal_record_is_written_once() {
        let storage = test_storage().await;
        let wal = storage.wal();
        let op = wal
            .begin(OpKind::Process(Phase::One), "wu1", Some("fp1"))
            .await
            .unwrap();

        wal.commit(&op).await.unwrap();
        // Same outcome again: no-op.
        wal.commit(&op).await.unwrap();
        // Contradicting outcome: conflict.
        let err = wal.fail(&op, "late failure").await.unwrap_err();
        assert!(err.is_conflict());

        let history = wal.history("wu1").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].outcome, Some(Outcome::Completed));
    }

    #[tokio::test]
    async fn commit_of_unknown_operation_is_not_found() {
        let storage = test_storage().await;
        let err = storage
            .wal()
            .commit(&OperationId::new())
            .await
            .unwrap_err();
        assert!(matches!(err, VaultgateError::NotFound(_)));
    }

    #[tokio::test]
    async fn partitions_and_in_doubt() {
        let storage = test_storage().await;
        let wal = storage.wal();

        let ok = wal.begin(OpKind::Stage, "a1", Some("pending->approved")).await.unwrap();
        wal.commit(&ok).await.unwrap();
        let bad = wal.begin(OpKind::Promote(Phase::Two), "a2", None).await.unwrap();
        wal.fail(&bad, "vault write failed").await.unwrap();
        let _open = wal.begin(OpKind::Index, "v_1", None).await.unwrap();

        let completed = wal.partition(Outcome::Completed, 10).await.unwrap();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].detail.as_deref(), Some("pending->approved"));

        let failed = wal.partition(Outcome::Failed, 10).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].reason.as_deref(), Some("vault write failed"));

        let open = wal.in_doubt().await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].kind, OpKind::Index);
    }

    #[tokio::test]
    async fn only_operations_of_gone_owners_are_orphaned() {
        let storage = test_storage().await;
        let live = Storage::open(storage.path()).await.unwrap();
        let dead = Storage::open_with_lease(storage.path(), Duration::ZERO)
            .await
            .unwrap();

        let own = storage.wal().begin(OpKind::Stage, "a1", None).await.unwrap();
        let running = live.wal().begin(OpKind::Stage, "a2", None).await.unwrap();
        let crashed = dead.wal().begin(OpKind::Stage, "a3", None).await.unwrap();

        let entry = storage.wal().get(&running).await.unwrap().unwrap();
        assert_eq!(entry.owner.as_deref(), live.owner());
        assert_eq!(storage.wal().in_doubt().await.unwrap().len(), 3);

        let orphaned: Vec<_> = storage
            .wal()
            .orphaned_of(&[OpKind::Stage])
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.op_id)
            .collect();
        assert_eq!(orphaned, vec![crashed.clone()]);

        // A released lease orphans its operations at once.
        live.release().await.unwrap();
        let orphaned = storage.wal().orphaned_of(&[OpKind::Stage]).await.unwrap();
        assert_eq!(orphaned.len(), 2);
        assert!(orphaned.iter().all(|e| e.op_id != own));
        assert!(storage.wal().orphaned_of(&[OpKind::Index]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn latest_completed_ignores_failed_attempts() {
        let storage = test_storage().await;
        let wal = storage.wal();
        let kind = OpKind::Process(Phase::One);

        let first = wal.begin(kind, "wu1", None).await.unwrap();
        wal.fail(&first, "timeout").await.unwrap();
        assert!(wal.latest_completed(kind, "wu1").await.unwrap().is_none());

        let second = wal.begin(kind, "wu1", None).await.unwrap();
        wal.commit(&second).await.unwrap();
        let latest = wal.latest_completed(kind, "wu1").await.unwrap().unwrap();
        assert_eq!(latest.op_id, second);
    }

    #[tokio::test]
    async fn sweep_keeps_failed_and_in_doubt_by_default() {
        let storage = test_storage().await;
        let wal = storage.wal();

        let done = wal.begin(OpKind::Ingest, "fp1", None).await.unwrap();
        wal.commit(&done).await.unwrap();
        let failed = wal.begin(OpKind::Ingest, "fp2", None).await.unwrap();
        wal.fail(&failed, "unreadable").await.unwrap();
        let open = wal.begin(OpKind::Ingest, "fp3", None).await.unwrap();

        let future = Utc::now() + chrono::Duration::days(1);
        assert_eq!(wal.sweep(future, false).await.unwrap(), 1);
        assert!(wal.get(&done).await.unwrap().is_none());
        assert!(wal.get(&failed).await.unwrap().is_some());
        assert!(wal.get(&open).await.unwrap().is_some());

        assert_eq!(wal.sweep(future, true).await.unwrap(), 1);
        assert!(wal.get(&failed).await.unwrap().is_none());
        assert_eq!(wal.in_doubt().await.unwrap().len(), 1);
    }
}
