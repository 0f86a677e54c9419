//! Process leases.
//!
//! Every read-write [`Storage`] holds a lease row naming it as the owner of
//! the operations it begins. A background task pushes the expiry forward
//! while the handle is alive. An in-doubt operation is only orphaned once
//! its owner's lease has expired or been released, so recovery in one
//! process never touches work another live process is still doing.

use std::time::Duration;

use chrono::Utc;
use libsql::{Connection, params};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;
use vaultgate_shared::Result;

use crate::{Storage, db_err, now_ts, ts};

/// Lease lifetime used by [`Storage::open`].
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(60);

pub(crate) struct Lease {
    owner: String,
    renewal: Option<JoinHandle<()>>,
}

impl Lease {
    /// Register a new owner and start renewing it every third of `ttl`.
    /// A zero `ttl` registers a lease that is already expired.
    pub(crate) async fn acquire(
        conn: &Connection,
        renew_on: Connection,
        ttl: Duration,
    ) -> Result<Self> {
        let owner = Uuid::now_v7().to_string();
        conn.execute(
            "INSERT INTO leases (owner, pid, acquired_at, expires_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                owner.as_str(),
                i64::from(std::process::id()),
                now_ts(),
                expiry(ttl)
            ],
        )
        .await
        .map_err(db_err)?;

        let renewal = (!ttl.is_zero()).then(|| {
            let owner = owner.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval((ttl / 3).max(Duration::from_millis(1)));
                interval.tick().await;
                loop {
                    interval.tick().await;
                    if let Err(e) = renew_on
                        .execute(
                            "UPDATE leases SET expires_at = ?2 WHERE owner = ?1",
                            params![owner.as_str(), expiry(ttl)],
                        )
                        .await
                    {
                        warn!(owner = %owner, error = %e, "lease renewal failed");
                    }
                }
            })
        });

        debug!(owner = %owner, ttl_ms = ttl.as_millis() as u64, "lease acquired");
        Ok(Self { owner, renewal })
    }

    pub(crate) fn owner(&self) -> &str {
        &self.owner
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(task) = self.renewal.take() {
            task.abort();
        }
    }
}

fn expiry(ttl: Duration) -> String {
    let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(365));
    ts(Utc::now() + ttl)
}

impl Storage {
    /// Owner id recorded on every operation this handle begins. `None` for
    /// read-only handles.
    pub fn owner(&self) -> Option<&str> {
        self.lease.as_ref().map(Lease::owner)
    }

    /// Give up this handle's lease. Operations it left in-doubt become
    /// recoverable by any process straight away.
    pub async fn release(&self) -> Result<()> {
        let Some(owner) = self.owner() else {
            return Ok(());
        };
        self.conn
            .execute("DELETE FROM leases WHERE owner = ?1", params![owner])
            .await
            .map_err(db_err)?;
        info!(owner, "lease released");
        Ok(())
    }

    /// Whether `owner` still holds an unexpired lease.
    pub async fn lease_is_live(&self, owner: &str) -> Result<bool> {
        let mut rows = self
            .conn
            .query(
                "SELECT 1 FROM leases WHERE owner = ?1 AND expires_at > ?2",
                params![owner, now_ts()],
            )
            .await
            .map_err(db_err)?;
        Ok(rows.next().await.map_err(db_err)?.is_some())
    }
}
