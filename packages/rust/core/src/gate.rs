//! Approval Gate: the only path by which an artifact leaves `pending`.

use tracing::{info, instrument};

use vaultgate_shared::{Bucket, Decision, Result, StagingRecord, VaultgateError};
use vaultgate_storage::StageStore;

#[derive(Debug, Clone)]
pub enum DecideOutcome {
    /// The decision moved the artifact out of `pending`.
    Applied(StagingRecord),
    /// The same decision was already recorded; nothing changed.
    AlreadyRecorded(StagingRecord),
}

impl DecideOutcome {
    pub fn record(&self) -> &StagingRecord {
        match self {
            Self::Applied(r) | Self::AlreadyRecorded(r) => r,
        }
    }
}

#[derive(Clone)]
pub struct ApprovalGate {
    stage: StageStore,
}

impl ApprovalGate {
    pub fn new(stage: StageStore) -> Self {
        Self { stage }
    }

    /// Apply an approval decision to a staged artifact.
    ///
    /// Re-submitting the recorded decision is a no-op; a contradicting one
    /// is a conflict and leaves the artifact where it is.
    #[instrument(skip_all, fields(artifact = artifact_id, decision = ?decision))]
    pub async fn decide(
        &self,
        artifact_id: &str,
        decision: Decision,
        note: Option<&str>,
    ) -> Result<DecideOutcome> {
        let target = decision.target_bucket();
        let current = self
            .stage
            .bucket_of(artifact_id)
            .await?
            .ok_or_else(|| VaultgateError::NotFound(format!("staged artifact {artifact_id}")))?;

        if current.bucket != Bucket::Pending {
            return already_decided(artifact_id, current, target);
        }

        match self
            .stage
            .move_artifact(artifact_id, Bucket::Pending, target, note)
            .await
        {
            Ok(record) => {
                info!(phase = %record.phase, bucket = %record.bucket, "decision applied");
                Ok(DecideOutcome::Applied(record))
            }
            Err(e) if e.is_conflict() => {
                // Lost a race with another decision; judge against the winner.
                let current = self.stage.bucket_of(artifact_id).await?.ok_or_else(|| {
                    VaultgateError::NotFound(format!("staged artifact {artifact_id}"))
                })?;
                already_decided(artifact_id, current, target)
            }
            Err(e) => Err(e),
        }
    }
}

fn already_decided(
    artifact_id: &str,
    current: StagingRecord,
    target: Bucket,
) -> Result<DecideOutcome> {
    if current.bucket == target {
        Ok(DecideOutcome::AlreadyRecorded(current))
    } else {
        Err(VaultgateError::conflict(format!(
            "artifact {artifact_id} is already {}; cannot move it to {target}",
            current.bucket
        )))
    }
}
