//! Physical storage layout rooted at a base directory.

use std::path::{Path, PathBuf};

use crate::error::{Result, VaultgateError};
use crate::types::{Phase, VaultCategory};

/// Every area the pipeline reads or writes, derived from one base directory.
#[derive(Debug, Clone)]
pub struct StorageLayout {
    base: PathBuf,
}

impl StorageLayout {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Intake area watched for raw documents.
    pub fn intake(&self) -> PathBuf {
        self.base.join("inbox").join("raw")
    }

    /// Archived originals after a successful hand-off.
    pub fn intake_processed(&self) -> PathBuf {
        self.base.join("inbox").join("processed")
    }

    /// Quarantine for unreadable or empty sources.
    pub fn intake_rejected(&self) -> PathBuf {
        self.base.join("inbox").join("rejected")
    }

    /// Scratch space for in-flight writes of a phase.
    pub fn work_dir(&self, phase: Phase) -> PathBuf {
        self.base.join("work").join(phase.to_string())
    }

    /// Scratch space used by the watcher and the promoter.
    pub fn scratch_dir(&self) -> PathBuf {
        self.base.join("work").join("tmp")
    }

    pub fn ordered_dir(&self) -> PathBuf {
        self.base.join("content").join("ordered")
    }

    pub fn chunks_dir(&self) -> PathBuf {
        self.base.join("content").join("chunks")
    }

    pub fn sources_dir(&self) -> PathBuf {
        self.base.join("store").join("sources")
    }

    pub fn payloads_dir(&self) -> PathBuf {
        self.base.join("store").join("payloads")
    }

    pub fn vault_dir(&self) -> PathBuf {
        self.base.join("vault")
    }

    pub fn vault_category_dir(&self, category: VaultCategory) -> PathBuf {
        self.vault_dir().join(category.dir_name())
    }

    pub fn state_dir(&self) -> PathBuf {
        self.base.join("state")
    }

    /// The libSQL state database (WAL, staging, work units, vault registry, index).
    pub fn db_path(&self) -> PathBuf {
        self.state_dir().join("vaultgate.db")
    }

    /// Create every directory of the layout. Safe to call repeatedly.
    pub fn ensure(&self) -> Result<()> {
        let mut dirs = vec![
            self.intake(),
            self.intake_processed(),
            self.intake_rejected(),
            self.scratch_dir(),
            self.ordered_dir(),
            self.chunks_dir(),
            self.sources_dir(),
            self.payloads_dir(),
            self.state_dir(),
        ];
        dirs.extend(Phase::ALL.into_iter().map(|p| self.work_dir(p)));
        dirs.extend(VaultCategory::ALL.into_iter().map(|c| self.vault_category_dir(c)));

        for dir in dirs {
            std::fs::create_dir_all(&dir).map_err(|e| VaultgateError::io(&dir, e))?;
        }
        tracing::debug!(base = %self.base.display(), "storage layout ready");
        Ok(())
    }
}
