//! libSQL state database and blob storage for the vaultgate pipeline.
//!
//! The [`Storage`] struct wraps a local libSQL database holding every piece of
//! coordination state: source documents, work units, artifacts, staging
//! records, vault registry, index entries and the durable log.
//!
//! **Access rules:**
//! - pipeline workers: read-write via [`Storage::open`]
//! - listing/audit commands: read-only via [`Storage::open_readonly`]
//!
//! Single statements run on the shared connection. Every multi-statement
//! state transition runs in an `IMMEDIATE` transaction on its own connection,
//! and the log's terminal record is written inside that same transaction.

mod artifacts;
pub mod blobs;
mod documents;
mod index;
mod leases;
pub mod locks;
mod migrations;
pub mod stage;
mod vault;
pub mod wal;
mod work_units;

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database, Transaction, TransactionBehavior, params};
use vaultgate_shared::{Result, VaultgateError};

use crate::leases::Lease;

pub use artifacts::{NewArtifact, StagedArtifact};
pub use blobs::{BlobStore, write_atomic};
pub use locks::KeyedLocks;
pub use stage::StageStore;
pub use index::{blob_to_vec, vec_to_blob};
pub use leases::DEFAULT_LEASE_TTL;
pub use vault::VaultStats;
pub use wal::Wal;

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    db: Database,
    conn: Connection,
    path: PathBuf,
    readonly: bool,
    lease: Option<Lease>,
}

impl Storage {
    /// Open or create a database at `path` in read-write mode, holding a
    /// lease of [`DEFAULT_LEASE_TTL`].
    pub async fn open(path: &Path) -> Result<Self> {
        Self::open_with_lease(path, DEFAULT_LEASE_TTL).await
    }

    /// Open or create a database at `path` in read-write mode. The handle's
    /// lease lapses `lease_ttl` after its last renewal.
    pub async fn open_with_lease(path: &Path, lease_ttl: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| VaultgateError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;
        let conn = db.connect().map_err(db_err)?;
        pragma(&conn, "PRAGMA journal_mode = WAL").await?;
        pragma(&conn, "PRAGMA busy_timeout = 5000").await?;

        let mut storage = Self {
            db,
            conn,
            path: path.to_path_buf(),
            readonly: false,
            lease: None,
        };
        storage.run_migrations().await?;
        let renew_on = storage.db.connect().map_err(db_err)?;
        storage.lease = Some(Lease::acquire(&storage.conn, renew_on, lease_ttl).await?);
        Ok(storage)
    }

    /// Open an existing database at `path` in read-only mode.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(VaultgateError::NotFound(format!(
                "state database {}",
                path.display()
            )));
        }
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;
        let conn = db.connect().map_err(db_err)?;
        pragma(&conn, "PRAGMA busy_timeout = 5000").await?;

        Ok(Self {
            db,
            conn,
            path: path.to_path_buf(),
            readonly: true,
            lease: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Handle to the durable log.
    pub fn wal(&self) -> Wal<'_> {
        Wal::new(self)
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn.execute_batch(migration.sql).await.map_err(|e| {
                    VaultgateError::Store(format!("migration v{} failed: {e}", migration.version))
                })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(VaultgateError::Store(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    /// Start an `IMMEDIATE` transaction on a dedicated connection.
    ///
    /// The write lock is taken up front, so compare-and-set updates inside the
    /// transaction cannot interleave with another writer.
    async fn write_tx(&self) -> Result<Transaction> {
        self.check_writable()?;
        let conn = self.db.connect().map_err(db_err)?;
        pragma(&conn, "PRAGMA busy_timeout = 5000").await?;
        conn.transaction_with_behavior(TransactionBehavior::Immediate)
            .await
            .map_err(db_err)
    }
}

/// Run a PRAGMA and drain its (optional) result row.
async fn pragma(conn: &Connection, sql: &str) -> Result<()> {
    let mut rows = conn.query(sql, params![]).await.map_err(db_err)?;
    rows.next().await.map_err(db_err)?;
    Ok(())
}

pub(crate) fn db_err(e: libsql::Error) -> VaultgateError {
    VaultgateError::Store(e.to_string())
}

/// Timestamp format used for every stored time: fixed-width UTC RFC 3339,
/// so lexical order equals chronological order.
pub(crate) fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn now_ts() -> String {
    ts(Utc::now())
}

pub(crate) fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| VaultgateError::Store(format!("invalid date '{s}': {e}")))
}

pub(crate) fn text(row: &libsql::Row, idx: i32) -> Result<String> {
    row.get::<String>(idx).map_err(db_err)
}

pub(crate) fn int(row: &libsql::Row, idx: i32) -> Result<i64> {
    row.get::<i64>(idx).map_err(db_err)
}

/// Nullable text column.
pub(crate) fn opt_col(row: &libsql::Row, idx: i32) -> Option<String> {
    row.get::<String>(idx).ok()
}
