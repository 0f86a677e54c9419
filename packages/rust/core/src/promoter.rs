//! Promoter: reacts to `approved` artifacts.
//!
//! Phase 1 → a phase-2 work unit is enqueued from the approved artifact.
//! Phase 2 → a vault artifact is written and handed to the indexer.
//!
//! A failed promotion leaves the artifact `approved` and unpromoted, so the
//! next pass retries it without a new approval.

use std::sync::Arc;

use tracing::{info, instrument, warn};

use vaultgate_shared::{
    Artifact, Bucket, Fingerprint, OpKind, Phase, Result, StorageLayout, VaultArtifact,
    VaultgateError, WorkUnit,
};
use vaultgate_storage::{BlobStore, Storage};

use crate::abandon;
use crate::indexer::Indexer;
use crate::pipeline::ProgressReporter;
use crate::report::RunReport;
use crate::vault::VaultWriter;

#[derive(Debug, Clone)]
pub enum PromoteOutcome {
    /// Phase 1: the phase-2 work unit now queued for the artifact.
    Enqueued(WorkUnit),
    /// Phase 2: the vault artifact now registered for the artifact, and
    /// whether its index entry was written in the same pass.
    Vaulted { vault: VaultArtifact, indexed: bool },
    /// The artifact was promoted before; the recorded target is returned.
    AlreadyPromoted(String),
}

pub struct Promoter {
    storage: Arc<Storage>,
    payloads: BlobStore,
    vault: VaultWriter,
    indexer: Arc<Indexer>,
}

impl Promoter {
    pub fn new(storage: Arc<Storage>, layout: StorageLayout, indexer: Arc<Indexer>) -> Self {
        Self {
            payloads: BlobStore::new(layout.payloads_dir(), layout.scratch_dir()),
            vault: VaultWriter::new(layout),
            storage,
            indexer,
        }
    }

    pub fn indexer(&self) -> &Arc<Indexer> {
        &self.indexer
    }

    /// Promote one approved artifact according to its phase.
    #[instrument(skip_all, fields(artifact = artifact_id))]
    pub async fn promote(&self, artifact_id: &str) -> Result<PromoteOutcome> {
        let artifact = self
            .storage
            .get_artifact(artifact_id)
            .await?
            .ok_or_else(|| VaultgateError::NotFound(format!("artifact {artifact_id}")))?;

        let staging = self
            .storage
            .get_staging(artifact_id)
            .await?
            .ok_or_else(|| VaultgateError::NotFound(format!("staged artifact {artifact_id}")))?;
        if staging.bucket != Bucket::Approved {
            return Err(VaultgateError::conflict(format!(
                "artifact {artifact_id} is {}, only approved artifacts are promoted",
                staging.bucket
            )));
        }
        if let Some(target) = self.storage.promotion_target(artifact_id).await? {
            return Ok(PromoteOutcome::AlreadyPromoted(target));
        }

        let document = self.document_of(&artifact).await?;
        match artifact.phase.next() {
            Some(_) => self.promote_to_phase2(&artifact, &document).await,
            None => self.promote_to_vault(&artifact, &document).await,
        }
    }

    async fn promote_to_phase2(
        &self,
        artifact: &Artifact,
        document: &Fingerprint,
    ) -> Result<PromoteOutcome> {
        let op = self
            .storage
            .wal()
            .begin(OpKind::Promote(Phase::One), &artifact.id, None)
            .await?;
        match self.storage.promote_to_phase2(artifact, document, &op).await {
            Ok(unit) => Ok(PromoteOutcome::Enqueued(unit)),
            Err(e) => Err(abandon(&self.storage, &op, e).await),
        }
    }

    async fn promote_to_vault(
        &self,
        artifact: &Artifact,
        document: &Fingerprint,
    ) -> Result<PromoteOutcome> {
        let op = self
            .storage
            .wal()
            .begin(OpKind::Promote(Phase::Two), &artifact.id, None)
            .await?;

        let (vault, fresh) = match self.write_vault(artifact, document).await {
            Ok(written) => written,
            Err(e) => return Err(abandon(&self.storage, &op, e).await),
        };
        let vault = match self.storage.record_vault_artifact(&vault, &op).await {
            Ok(vault) => vault,
            Err(e) => {
                if fresh && !e.is_escalated() {
                    self.discard_unregistered(&vault).await;
                }
                return Err(abandon(&self.storage, &op, e).await);
            }
        };

        // The promotion is durable; an indexing failure is retried later.
        let indexed = match self.indexer.index(&vault.id).await {
            Ok(_) => true,
            Err(e) => {
                warn!(vault_id = %vault.id, error = %e, "indexing deferred");
                false
            }
        };
        Ok(PromoteOutcome::Vaulted { vault, indexed })
    }

    /// Remove a file written for a registration that was refused, unless the
    /// same content got registered by someone else in the meantime.
    async fn discard_unregistered(&self, vault: &VaultArtifact) {
        let removal = match self.storage.get_vault_artifact(&vault.id).await {
            Ok(Some(_)) => return,
            Ok(None) => self.vault.remove(vault).await,
            Err(e) => Err(e),
        };
        if let Err(e) = removal {
            warn!(vault_id = %vault.id, path = %vault.path, error = %e, "unregistered vault file left behind");
        }
    }

    async fn write_vault(
        &self,
        artifact: &Artifact,
        document: &Fingerprint,
    ) -> Result<(VaultArtifact, bool)> {
        let bytes = self.payloads.get(&artifact.payload_ref).await?;
        let body = String::from_utf8_lossy(&bytes);
        self.vault.write(&self.storage, artifact, document, &body).await
    }

    async fn document_of(&self, artifact: &Artifact) -> Result<Fingerprint> {
        self.storage
            .get_work_unit(&artifact.work_unit_id)
            .await?
            .map(|u| u.document)
            .ok_or_else(|| VaultgateError::NotFound(format!("work unit {}", artifact.work_unit_id)))
    }

    /// Promote every approved, unpromoted artifact of `phase` once.
    pub async fn run_once(&self, phase: Phase, progress: &dyn ProgressReporter) -> Result<RunReport> {
        let mut report = RunReport::default();
        let approved = self.storage.approved_unpromoted(phase).await?;

        if !approved.is_empty() {
            progress.phase(&format!("Promoting {phase} approvals"));
        }
        let total = approved.len();
        for (i, artifact) in approved.iter().enumerate() {
            progress.item(&artifact.id, i + 1, total);
            if let Ok(doc) = self.document_of(artifact).await {
                report.touch(&doc);
            }
            match self.promote(&artifact.id).await {
                Ok(PromoteOutcome::Vaulted { indexed, .. }) => {
                    report.promoted += 1;
                    report.indexed += usize::from(indexed);
                }
                Ok(_) => report.promoted += 1,
                Err(e) => {
                    warn!(artifact = %artifact.id, error = %e, "promotion failed");
                    report.record_error(&e);
                }
            }
        }

        if phase == Phase::Two {
            report.merge(self.indexer.index_missing().await?);
        }
        if report.promoted > 0 {
            info!(%phase, promoted = report.promoted, "promotion pass complete");
        }
        Ok(report)
    }
}
