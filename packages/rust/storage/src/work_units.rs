//! Work unit persistence and status transitions.
//!
//! Every status change is a compare-and-set on the current status, so two
//! workers racing on the same unit cannot both win.

use libsql::{Connection, params};
use tracing::debug;
use vaultgate_shared::{
    Fingerprint, Phase, Result, VaultgateError, WorkStatus, WorkUnit, new_work_unit_id,
};

use crate::{Storage, db_err, int, now_ts, opt_col, parse_ts, text};

pub(crate) const UNIT_COLUMNS: &str = "id, document, phase, subject, attempt, status, input_ref, \
     note, error, created_at, updated_at";

impl Storage {
    pub async fn get_work_unit(&self, id: &str) -> Result<Option<WorkUnit>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {UNIT_COLUMNS} FROM work_units WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(db_err)?;
        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(Some(row_to_work_unit(&row)?)),
            None => Ok(None),
        }
    }

    /// The latest non-failed unit for `(subject, phase)`, if any.
    pub async fn live_work_unit(&self, subject: &str, phase: Phase) -> Result<Option<WorkUnit>> {
        live_work_unit_on(&self.conn, subject, phase).await
    }

    /// Phase-2 units of `document` whose subject's latest attempt failed.
    pub async fn failed_phase2_units(&self, document: &Fingerprint) -> Result<Vec<WorkUnit>> {
        failed_phase2_units_on(&self.conn, document).await
    }

    /// All attempts for a document across both phases, oldest first.
    pub async fn work_units_for_document(&self, document: &Fingerprint) -> Result<Vec<WorkUnit>> {
        self.query_units(
            &format!(
                "SELECT {UNIT_COLUMNS} FROM work_units WHERE document = ?1 ORDER BY phase, created_at"
            ),
            params![document.as_str()],
        )
        .await
    }

    /// Units of one phase in one status, oldest first.
    pub async fn list_work_units(&self, phase: Phase, status: WorkStatus) -> Result<Vec<WorkUnit>> {
        self.query_units(
            &format!(
                "SELECT {UNIT_COLUMNS} FROM work_units WHERE phase = ?1 AND status = ?2
                 ORDER BY created_at"
            ),
            params![i64::from(phase.number()), status.as_str()],
        )
        .await
    }

    /// `queued → running`. Returns `false` if the unit was not queued.
    ///
    /// Fails with a conflict when another unit for the same subject and phase
    /// is already running.
    pub async fn claim_work_unit(&self, id: &str) -> Result<bool> {
        self.check_writable()?;
        let changed = self
            .conn
            .execute(
                "UPDATE work_units SET status = 'running', updated_at = ?2
                 WHERE id = ?1 AND status = 'queued'",
                params![id, now_ts()],
            )
            .await
            .map_err(|e| {
                let msg = e.to_string();
                if msg.contains("UNIQUE constraint failed") {
                    VaultgateError::conflict(format!(
                        "another work unit for the same subject is already running ({id})"
                    ))
                } else {
                    VaultgateError::Store(msg)
                }
            })?;
        debug!(work_unit = id, claimed = changed == 1, "claim");
        Ok(changed == 1)
    }

    /// `queued | running → failed`, recording the error.
    pub async fn fail_work_unit(&self, id: &str, error: &str) -> Result<bool> {
        self.check_writable()?;
        let changed = self
            .conn
            .execute(
                "UPDATE work_units SET status = 'failed', error = ?2, updated_at = ?3
                 WHERE id = ?1 AND status IN ('queued', 'running')",
                params![id, error, now_ts()],
            )
            .await
            .map_err(db_err)?;
        Ok(changed == 1)
    }

    /// `running → queued`, used by recovery for interrupted attempts.
    pub async fn requeue_work_unit(&self, id: &str) -> Result<bool> {
        self.check_writable()?;
        let changed = self
            .conn
            .execute(
                "UPDATE work_units SET status = 'queued', updated_at = ?2
                 WHERE id = ?1 AND status = 'running'",
                params![id, now_ts()],
            )
            .await
            .map_err(db_err)?;
        Ok(changed == 1)
    }

    async fn query_units(
        &self,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<WorkUnit>> {
        let mut rows = self.conn.query(sql, params).await.map_err(db_err)?;
        let mut units = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            units.push(row_to_work_unit(&row)?);
        }
        Ok(units)
    }
}

pub(crate) async fn live_work_unit_on(
    conn: &Connection,
    subject: &str,
    phase: Phase,
) -> Result<Option<WorkUnit>> {
    let mut rows = conn
        .query(
            &format!(
                "SELECT {UNIT_COLUMNS} FROM work_units
                 WHERE subject = ?1 AND phase = ?2 AND status <> 'failed'
                 ORDER BY attempt DESC LIMIT 1"
            ),
            params![subject, i64::from(phase.number())],
        )
        .await
        .map_err(db_err)?;
    match rows.next().await.map_err(db_err)? {
        Some(row) => Ok(Some(row_to_work_unit(&row)?)),
        None => Ok(None),
    }
}

pub(crate) async fn failed_phase2_units_on(
    conn: &Connection,
    document: &Fingerprint,
) -> Result<Vec<WorkUnit>> {
    let mut rows = conn
        .query(
            &format!(
                "SELECT {UNIT_COLUMNS} FROM work_units w
                 WHERE w.document = ?1 AND w.phase = 2 AND w.status = 'failed'
                   AND w.attempt = (SELECT MAX(attempt) FROM work_units
                                    WHERE subject = w.subject AND phase = 2)
                 ORDER BY w.created_at"
            ),
            params![document.as_str()],
        )
        .await
        .map_err(db_err)?;
    let mut units = Vec::new();
    while let Some(row) = rows.next().await.map_err(db_err)? {
        units.push(row_to_work_unit(&row)?);
    }
    Ok(units)
}

/// Insert a queued unit for `(subject, phase)` with the next attempt number.
pub(crate) async fn insert_work_unit(
    conn: &Connection,
    document: &Fingerprint,
    phase: Phase,
    subject: &str,
    input_ref: &str,
    note: Option<&str>,
) -> Result<WorkUnit> {
    let mut rows = conn
        .query(
            "SELECT COALESCE(MAX(attempt), 0) FROM work_units WHERE subject = ?1 AND phase = ?2",
            params![subject, i64::from(phase.number())],
        )
        .await
        .map_err(db_err)?;
    let last_attempt = match rows.next().await.map_err(db_err)? {
        Some(row) => int(&row, 0)?,
        None => 0,
    };
    drop(rows);

    let id = new_work_unit_id();
    let now = now_ts();
    conn.execute(
        &format!(
            "INSERT INTO work_units ({UNIT_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, 'queued', ?6, ?7, NULL, ?8, ?8)"
        ),
        params![
            id.as_str(),
            document.as_str(),
            i64::from(phase.number()),
            subject,
            last_attempt + 1,
            input_ref,
            note,
            now.as_str(),
        ],
    )
    .await
    .map_err(db_err)?;

    let created = parse_ts(&now)?;
    Ok(WorkUnit {
        id,
        document: document.clone(),
        phase,
        subject: subject.to_string(),
        attempt: (last_attempt + 1) as u32,
        status: WorkStatus::Queued,
        input_ref: input_ref.to_string(),
        note: note.map(str::to_string),
        error: None,
        created_at: created,
        updated_at: created,
    })
}

/// Move a staged unit to `approved`/`rejected` once none of its artifacts
/// is pending any more. Units that produced no artifacts stay `staged`.
pub(crate) async fn settle_work_unit(conn: &Connection, id: &str) -> Result<()> {
    conn.execute(
        "UPDATE work_units SET
            status = CASE WHEN EXISTS (
                SELECT 1 FROM artifacts a JOIN staging s ON s.artifact_id = a.id
                WHERE a.work_unit_id = ?1 AND s.bucket = 'approved')
              THEN 'approved' ELSE 'rejected' END,
            updated_at = ?2
         WHERE id = ?1 AND status = 'staged'
           AND EXISTS (SELECT 1 FROM artifacts WHERE work_unit_id = ?1)
           AND NOT EXISTS (
                SELECT 1 FROM artifacts a JOIN staging s ON s.artifact_id = a.id
                WHERE a.work_unit_id = ?1 AND s.bucket = 'pending')",
        params![id, now_ts()],
    )
    .await
    .map_err(db_err)?;
    Ok(())
}

pub(crate) fn row_to_work_unit(row: &libsql::Row) -> Result<WorkUnit> {
    let phase_num = int(row, 2)?;
    Ok(WorkUnit {
        id: text(row, 0)?,
        document: Fingerprint(text(row, 1)?),
        phase: Phase::from_number(phase_num)
            .ok_or_else(|| VaultgateError::Store(format!("invalid phase {phase_num}")))?,
        subject: text(row, 3)?,
        attempt: int(row, 4)? as u32,
        status: text(row, 5)?.parse()?,
        input_ref: text(row, 6)?,
        note: opt_col(row, 7),
        error: opt_col(row, 8),
        created_at: parse_ts(&text(row, 9)?)?,
        updated_at: parse_ts(&text(row, 10)?)?,
    })
}
