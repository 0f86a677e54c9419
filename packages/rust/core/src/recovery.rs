//! Startup recovery of in-doubt operations.
//!
//! An operation is in-doubt when its `begin` record has no terminal record.
//! Recovery never trusts the log alone: it inspects the target's current
//! state. If the side effect is present the operation is committed;
//! otherwise it is failed and the target is left where the normal scheduler
//! picks it up again (a running work unit is requeued, an approved artifact
//! stays approved and unpromoted, an intake file stays in the intake area).
//!
//! Only orphaned operations are considered: those whose owning process lease
//! has expired or been released. Work another live process is doing is left
//! alone, as are this process's own open operations.

use serde::Serialize;
use tracing::{info, instrument, warn};

use vaultgate_shared::{Bucket, Fingerprint, OpKind, Result, WalEntry, WorkStatus};
use vaultgate_storage::Storage;

/// What a recovery pass did.
#[derive(Debug, Default, Clone, Serialize)]
pub struct RecoveryReport {
    /// Operations whose effect was found and that were committed.
    pub committed: usize,
    /// Operations whose effect was absent and that were failed.
    pub failed: usize,
    /// Interrupted work units put back in the queue.
    pub requeued: usize,
}

impl RecoveryReport {
    pub fn merge(&mut self, other: RecoveryReport) {
        self.committed += other.committed;
        self.failed += other.failed;
        self.requeued += other.requeued;
    }

    pub fn is_empty(&self) -> bool {
        self.committed == 0 && self.failed == 0
    }
}

enum Resolution {
    Commit,
    Fail(String),
}

/// Resolve every in-doubt operation of the given kinds.
#[instrument(skip_all, fields(kinds = kinds.len()))]
pub async fn recover(storage: &Storage, kinds: &[OpKind]) -> Result<RecoveryReport> {
    let wal = storage.wal();
    let mut report = RecoveryReport::default();

    for entry in wal.orphaned_of(kinds).await? {
        let resolution = match entry.kind {
            OpKind::Ingest => resolve_ingest(storage, &entry).await?,
            OpKind::Process(_) => resolve_process(storage, &entry, &mut report).await?,
            OpKind::Stage => resolve_stage(storage, &entry).await?,
            OpKind::Promote(_) => resolve_promote(storage, &entry).await?,
            OpKind::Index => resolve_index(storage, &entry).await?,
        };

        match resolution {
            Resolution::Commit => {
                wal.commit(&entry.op_id).await?;
                report.committed += 1;
                info!(op = %entry.op_id, kind = %entry.kind, target = %entry.target, "in-doubt operation committed");
            }
            Resolution::Fail(reason) => {
                wal.fail(&entry.op_id, &reason).await?;
                report.failed += 1;
                warn!(op = %entry.op_id, kind = %entry.kind, target = %entry.target, %reason, "in-doubt operation failed");
            }
        }
    }

    if !report.is_empty() {
        info!(
            committed = report.committed,
            failed = report.failed,
            requeued = report.requeued,
            "recovery complete"
        );
    }
    Ok(report)
}

/// An ingest enqueues a phase-1 unit, or retries failed phase-2 units, of
/// the fingerprint it targets.
async fn resolve_ingest(storage: &Storage, entry: &WalEntry) -> Result<Resolution> {
    let enqueued = storage
        .work_units_for_document(&Fingerprint(entry.target.clone()))
        .await?
        .iter()
        .any(|u| u.created_at >= entry.begun_at);
    Ok(if enqueued {
        Resolution::Commit
    } else {
        Resolution::Fail("interrupted: no work unit was enqueued".into())
    })
}

async fn resolve_process(
    storage: &Storage,
    entry: &WalEntry,
    report: &mut RecoveryReport,
) -> Result<Resolution> {
    let Some(unit) = storage.get_work_unit(&entry.target).await? else {
        return Ok(Resolution::Fail("interrupted: work unit no longer exists".into()));
    };
    Ok(match unit.status {
        WorkStatus::Staged | WorkStatus::Approved | WorkStatus::Rejected => Resolution::Commit,
        WorkStatus::Running => {
            if storage.requeue_work_unit(&unit.id).await? {
                report.requeued += 1;
            }
            Resolution::Fail("interrupted: work unit requeued".into())
        }
        WorkStatus::Queued => Resolution::Fail("interrupted before the work unit was claimed".into()),
        WorkStatus::Failed => Resolution::Fail("interrupted: work unit already failed".into()),
    })
}

/// Target bucket encoded in a stage operation's detail (`from->to` or `place:to`).
fn intended_bucket(detail: Option<&str>) -> Option<Bucket> {
    let detail = detail?;
    let target = detail
        .split_once("->")
        .map(|(_, to)| to)
        .or_else(|| detail.strip_prefix("place:"))?;
    target.parse().ok()
}

async fn resolve_stage(storage: &Storage, entry: &WalEntry) -> Result<Resolution> {
    let Some(target) = intended_bucket(entry.detail.as_deref()) else {
        return Ok(Resolution::Fail("interrupted: unknown intended bucket".into()));
    };
    let current = storage.get_staging(&entry.target).await?.map(|s| s.bucket);
    Ok(if current == Some(target) {
        Resolution::Commit
    } else {
        Resolution::Fail(format!("interrupted: artifact did not reach {target}"))
    })
}

async fn resolve_promote(storage: &Storage, entry: &WalEntry) -> Result<Resolution> {
    Ok(match storage.promotion_target(&entry.target).await? {
        Some(_) => Resolution::Commit,
        None => Resolution::Fail("interrupted: promotion not recorded".into()),
    })
}

async fn resolve_index(storage: &Storage, entry: &WalEntry) -> Result<Resolution> {
    let indexed = storage
        .get_index_entry(&entry.target)
        .await?
        .is_some_and(|e| e.indexed_at >= entry.begun_at);
    Ok(if indexed {
        Resolution::Commit
    } else {
        Resolution::Fail("interrupted: index entry not written".into())
    })
}
