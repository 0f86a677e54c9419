//! Source Watcher: turns files in the intake area into queued phase-1 work.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use vaultgate_shared::{
    Fingerprint, OpKind, Phase, PipelineSettings, Result, SourceDocument, StorageLayout,
    VaultgateError, WorkUnit,
};
use vaultgate_storage::{BlobStore, Storage};

use crate::abandon;
use crate::pipeline::ProgressReporter;
use crate::report::RunReport;

/// Result of ingesting one intake file.
#[derive(Debug, Clone)]
pub enum IngestOutcome {
    /// A new phase-1 work unit was queued.
    Enqueued(WorkUnit),
    /// The document's failed phase-2 attempts were queued again.
    Retried(Vec<WorkUnit>),
    /// The fingerprint already has a live work unit; nothing was created.
    Duplicate {
        fingerprint: Fingerprint,
        work_unit: Option<String>,
    },
}

pub struct Watcher {
    storage: Arc<Storage>,
    layout: StorageLayout,
    sources: BlobStore,
    extensions: Vec<String>,
}

impl Watcher {
    pub fn new(storage: Arc<Storage>, layout: StorageLayout, settings: &PipelineSettings) -> Self {
        let sources = BlobStore::new(layout.sources_dir(), layout.scratch_dir());
        Self {
            storage,
            layout,
            sources,
            extensions: settings.extensions.clone(),
        }
    }

    /// Candidate files currently in the intake area, in name order.
    pub async fn scan(&self) -> Result<Vec<PathBuf>> {
        let intake = self.layout.intake();
        let mut entries = match tokio::fs::read_dir(&intake).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(VaultgateError::io(&intake, e)),
        };

        let mut files = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| VaultgateError::io(&intake, e))?
        {
            let path = entry.path();
            let is_file = entry.file_type().await.map(|t| t.is_file()).unwrap_or(false);
            if is_file && self.accepts(&path) {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    fn accepts(&self, path: &Path) -> bool {
        let hidden = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_none_or(|n| n.starts_with('.'));
        if hidden {
            return false;
        }
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        match ext {
            Some(ext) => self.extensions.iter().any(|allowed| *allowed == ext),
            None => false,
        }
    }

    /// Ingest one intake file.
    ///
    /// Identical content that already has a live work unit is archived and
    /// reported as a duplicate, unless its latest phase-2 attempts failed:
    /// those are queued again. Unreadable or empty files are quarantined.
    #[instrument(skip_all, fields(path = %path.display()))]
    pub async fn ingest_file(&self, path: &Path) -> Result<IngestOutcome> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                self.quarantine(path).await?;
                return Err(VaultgateError::ingestion(path, e.to_string()));
            }
        };
        if bytes.is_empty() {
            self.quarantine(path).await?;
            return Err(VaultgateError::ingestion(path, "document is empty"));
        }

        let fingerprint = Fingerprint::of(&bytes);
        if let Some(live) = self
            .storage
            .live_work_unit(fingerprint.as_str(), Phase::One)
            .await?
        {
            if !self.storage.failed_phase2_units(&fingerprint).await?.is_empty() {
                return self.retry(path, fingerprint).await;
            }
            debug!(fingerprint = %fingerprint.short(), work_unit = %live.id, "already ingested");
            self.archive(path, &fingerprint).await?;
            return Ok(IngestOutcome::Duplicate {
                fingerprint,
                work_unit: Some(live.id),
            });
        }

        let wal = self.storage.wal();
        let original_path = path.to_string_lossy().to_string();
        let op = wal
            .begin(OpKind::Ingest, fingerprint.as_str(), Some(&original_path))
            .await?;

        let (_, blob_ref) = self.sources.put(&bytes).await?;
        let doc = SourceDocument {
            fingerprint: fingerprint.clone(),
            original_path,
            blob_ref,
            size_bytes: bytes.len() as u64,
            ingested_at: Utc::now(),
        };

        let outcome = match self.storage.register_ingest(&doc, &op).await {
            Ok(unit) => IngestOutcome::Enqueued(unit),
            Err(e) if e.is_conflict() => {
                wal.fail(&op, &e.to_string()).await?;
                IngestOutcome::Duplicate {
                    fingerprint: fingerprint.clone(),
                    work_unit: None,
                }
            }
            Err(e) => return Err(e),
        };

        self.archive(path, &fingerprint).await?;
        Ok(outcome)
    }

    async fn retry(&self, path: &Path, fingerprint: Fingerprint) -> Result<IngestOutcome> {
        let original_path = path.to_string_lossy().to_string();
        let op = self
            .storage
            .wal()
            .begin(OpKind::Ingest, fingerprint.as_str(), Some(&original_path))
            .await?;

        let retried = match self.storage.retry_failed_phase2(&fingerprint, &op).await {
            Ok(units) => units,
            Err(e) => return Err(abandon(&self.storage, &op, e).await),
        };
        let outcome = if retried.is_empty() {
            self.storage
                .wal()
                .fail(&op, "no failed phase-2 work left to retry")
                .await?;
            IngestOutcome::Duplicate {
                fingerprint: fingerprint.clone(),
                work_unit: None,
            }
        } else {
            IngestOutcome::Retried(retried)
        };

        self.archive(path, &fingerprint).await?;
        Ok(outcome)
    }

    /// Process the current intake backlog once.
    pub async fn run_once(&self, progress: &dyn ProgressReporter) -> Result<RunReport> {
        let files = self.scan().await?;
        let mut report = RunReport::default();
        if files.is_empty() {
            return Ok(report);
        }

        progress.phase("Ingesting sources");
        let total = files.len();
        for (i, path) in files.iter().enumerate() {
            progress.item(&path.display().to_string(), i + 1, total);
            match self.ingest_file(path).await {
                Ok(IngestOutcome::Enqueued(unit)) => {
                    report.ingested += 1;
                    report.touch(&unit.document);
                }
                Ok(IngestOutcome::Retried(units)) => {
                    report.ingested += 1;
                    if let Some(unit) = units.first() {
                        report.touch(&unit.document);
                    }
                }
                Ok(IngestOutcome::Duplicate { .. }) => report.duplicates += 1,
                Err(e @ VaultgateError::Ingestion { .. }) => {
                    warn!(error = %e, "source quarantined");
                    report.quarantined += 1;
                    report.record_error(&e);
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "ingestion left in-doubt");
                    report.record_error(&e);
                }
            }
        }

        info!(
            ingested = report.ingested,
            duplicates = report.duplicates,
            quarantined = report.quarantined,
            "intake scan complete"
        );
        Ok(report)
    }

    /// Move an ingested original to the processed area. A different file
    /// already holding the name gets the fingerprint appended; an identical
    /// one means the original was archived before and is simply removed.
    async fn archive(&self, path: &Path, fingerprint: &Fingerprint) -> Result<()> {
        let dir = self.layout.intake_processed();
        let name = file_name(path);
        let mut target = dir.join(&name);

        if tokio::fs::try_exists(&target).await.unwrap_or(false) {
            let existing = tokio::fs::read(&target)
                .await
                .map_err(|e| VaultgateError::io(&target, e))?;
            if Fingerprint::of(&existing) == *fingerprint {
                return remove(path).await;
            }
            let stem = path
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|| "document".into());
            let suffixed = match path.extension() {
                Some(ext) => format!("{stem}-{}.{}", &fingerprint.as_str()[..8], ext.to_string_lossy()),
                None => format!("{stem}-{}", &fingerprint.as_str()[..8]),
            };
            target = dir.join(suffixed);
            if tokio::fs::try_exists(&target).await.unwrap_or(false) {
                return remove(path).await;
            }
        }

        move_file(path, &target).await?;
        debug!(to = %target.display(), "original archived");
        Ok(())
    }

    async fn quarantine(&self, path: &Path) -> Result<()> {
        let target = self
            .layout
            .intake_rejected()
            .join(format!("{}-{}", Utc::now().format("%Y%m%dT%H%M%S%.3f"), file_name(path)));
        move_file(path, &target).await?;
        warn!(to = %target.display(), "source moved to quarantine");
        Ok(())
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "document".into())
}

async fn move_file(from: &Path, to: &Path) -> Result<()> {
    if let Some(parent) = to.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| VaultgateError::io(parent, e))?;
    }
    tokio::fs::rename(from, to)
        .await
        .map_err(|e| VaultgateError::io(from, e))
}

async fn remove(path: &Path) -> Result<()> {
    tokio::fs::remove_file(path)
        .await
        .map_err(|e| VaultgateError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::SilentProgress;
    use uuid::Uuid;
    use vaultgate_shared::WorkStatus;

    async fn watcher() -> (Watcher, StorageLayout) {
        let base = std::env::temp_dir().join(format!("vg_watch_{}", Uuid::now_v7()));
        let layout = StorageLayout::new(&base);
        layout.ensure().unwrap();
        let storage = Arc::new(Storage::open(&layout.db_path()).await.unwrap());
        let w = Watcher::new(storage, layout.clone(), &PipelineSettings::default());
        (w, layout)
    }

    #[tokio::test]
    async fn scan_filters_extensions_and_hidden_files() {
        let (w, layout) = watcher().await;
        for name in ["b.md", "a.TXT", "c.pdf", ".hidden.md"] {
            std::fs::write(layout.intake().join(name), "x").unwrap();
        }
        let names: Vec<String> = w.scan().await.unwrap().iter().map(|p| file_name(p)).collect();
        assert_eq!(names, vec!["a.TXT", "b.md"]);
    }

    #[tokio::test]
    async fn ingest_enqueues_and_archives() {
        let (w, layout) = watcher().await;
        let path = layout.intake().join("doc.md");
        std::fs::write(&path, "# Title\nbody").unwrap();

        let IngestOutcome::Enqueued(unit) = w.ingest_file(&path).await.unwrap() else {
            panic!("expected a new work unit");
        };
        assert_eq!(unit.status, WorkStatus::Queued);
        assert_eq!(unit.phase, Phase::One);
        assert!(!path.exists());
        assert!(layout.intake_processed().join("doc.md").exists());

        let history = w.storage.wal().history(unit.document.as_str()).await.unwrap();
        assert_eq!(history.len(), 1);
        assert!(!history[0].is_in_doubt());
    }

    #[tokio::test]
    async fn identical_content_is_a_duplicate() {
        let (w, layout) = watcher().await;
        std::fs::write(layout.intake().join("one.md"), "same").unwrap();
        std::fs::write(layout.intake().join("two.md"), "same").unwrap();

        let report = w.run_once(&SilentProgress).await.unwrap();
        assert_eq!(report.ingested, 1);
        assert_eq!(report.duplicates, 1);
        assert!(w.scan().await.unwrap().is_empty());
        assert_eq!(w.storage.list_source_documents().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn empty_sources_are_quarantined() {
        let (w, layout) = watcher().await;
        std::fs::write(layout.intake().join("empty.md"), "").unwrap();
        std::fs::write(layout.intake().join("ok.md"), "content").unwrap();

        let report = w.run_once(&SilentProgress).await.unwrap();
        assert_eq!(report.ingested, 1);
        assert_eq!(report.quarantined, 1);
        assert!(!report.is_success());
        assert_eq!(std::fs::read_dir(layout.intake_rejected()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn name_collision_in_archive_keeps_both() {
        let (w, layout) = watcher().await;
        std::fs::write(layout.intake_processed().join("doc.md"), "older").unwrap();
        let path = layout.intake().join("doc.md");
        std::fs::write(&path, "newer").unwrap();

        w.ingest_file(&path).await.unwrap();
        let fp = Fingerprint::of(b"newer");
        let archived = layout
            .intake_processed()
            .join(format!("doc-{}.md", &fp.as_str()[..8]));
        assert!(archived.exists());
        assert_eq!(std::fs::read_to_string(layout.intake_processed().join("doc.md")).unwrap(), "older");
    }
}
