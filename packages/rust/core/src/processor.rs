//! Phase Processor: one instance per phase, driving queued work units
//! through the phase transformation into the phase's `pending` bucket.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};

use vaultgate_shared::{
    Artifact, Fingerprint, OpKind, OperationId, Phase, PipelineSettings, Result, StorageLayout,
    VaultgateError, WorkStatus, WorkUnit, artifact_id,
};
use vaultgate_storage::{BlobStore, NewArtifact, Storage, write_atomic};

use crate::abandon;
use crate::pipeline::ProgressReporter;
use crate::report::RunReport;
use crate::transform::{Transform, TransformInput, TransformOutput};

/// Result of processing one work unit.
#[derive(Debug, Clone)]
pub enum ProcessOutcome {
    /// The transformation ran and its outputs are pending review.
    Staged(Vec<Artifact>),
    /// The unit was processed before; its existing outputs are returned.
    Cached(Vec<Artifact>),
}

/// Phase-1 chunk manifest written to the chunked-content area.
#[derive(Debug, Serialize)]
struct ChunkManifest<'a> {
    document: &'a Fingerprint,
    work_unit: &'a str,
    chunks: Vec<ChunkEntry<'a>>,
}

#[derive(Debug, Serialize)]
struct ChunkEntry<'a> {
    id: String,
    ordinal: u32,
    title: Option<&'a str>,
    fingerprint: &'a Fingerprint,
}

#[derive(Clone)]
pub struct Processor {
    phase: Phase,
    storage: Arc<Storage>,
    layout: StorageLayout,
    sources: BlobStore,
    payloads: BlobStore,
    transform: Arc<dyn Transform>,
    timeout: Duration,
    concurrency: usize,
}

impl Processor {
    pub fn new(
        phase: Phase,
        storage: Arc<Storage>,
        layout: StorageLayout,
        transform: Arc<dyn Transform>,
        settings: &PipelineSettings,
    ) -> Self {
        let scratch = layout.work_dir(phase);
        Self {
            phase,
            sources: BlobStore::new(layout.sources_dir(), &scratch),
            payloads: BlobStore::new(layout.payloads_dir(), &scratch),
            storage,
            layout,
            transform,
            timeout: settings.transform_timeout,
            concurrency: settings.concurrency.max(1),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Run the phase transformation for one queued work unit and stage its
    /// outputs as `pending`.
    ///
    /// A unit that was already processed returns its existing artifacts
    /// without running the transformation again.
    #[instrument(skip_all, fields(phase = %self.phase, work_unit = %unit.id))]
    pub async fn process(&self, unit: &WorkUnit) -> Result<ProcessOutcome> {
        if unit.phase != self.phase {
            return Err(VaultgateError::validation(format!(
                "work unit {} belongs to {}, not {}",
                unit.id, unit.phase, self.phase
            )));
        }

        let wal = self.storage.wal();
        let kind = OpKind::Process(self.phase);
        let current = self
            .storage
            .get_work_unit(&unit.id)
            .await?
            .ok_or_else(|| VaultgateError::NotFound(format!("work unit {}", unit.id)))?;
        let done = matches!(
            current.status,
            WorkStatus::Staged | WorkStatus::Approved | WorkStatus::Rejected
        );
        if done || wal.latest_completed(kind, &unit.id).await?.is_some() {
            debug!("already processed");
            let artifacts = self.storage.artifacts_for_work_unit(&unit.id).await?;
            return Ok(ProcessOutcome::Cached(artifacts));
        }

        let op = wal.begin(kind, &unit.id, Some(&unit.subject)).await?;
        match self.storage.claim_work_unit(&unit.id).await {
            Ok(true) => {}
            Ok(false) => {
                let err = VaultgateError::conflict(format!(
                    "work unit {} is {}, not queued",
                    unit.id, current.status
                ));
                wal.fail(&op, &err.to_string()).await?;
                return Err(err);
            }
            Err(e) => return Err(abandon(&self.storage, &op, e).await),
        }

        match self.run_claimed(&current, &op).await {
            Ok(artifacts) => Ok(ProcessOutcome::Staged(artifacts)),
            Err(e) => {
                if !e.is_escalated() && !e.is_conflict() {
                    if let Err(store) = self.storage.fail_work_unit(&unit.id, &e.to_string()).await {
                        return Err(store);
                    }
                }
                Err(abandon(&self.storage, &op, e).await)
            }
        }
    }

    async fn run_claimed(&self, unit: &WorkUnit, op: &OperationId) -> Result<Vec<Artifact>> {
        let input = self.load_input(unit).await?;

        let output = match tokio::time::timeout(self.timeout, self.transform.transform(&input)).await
        {
            Ok(Ok(output)) => output,
            Ok(Err(e @ VaultgateError::Transform { .. })) => return Err(e),
            Ok(Err(e)) => return Err(VaultgateError::transform(&unit.id, e.to_string())),
            Err(_) => {
                return Err(VaultgateError::transform(
                    &unit.id,
                    format!(
                        "{} timed out after {}s",
                        self.transform.name(),
                        self.timeout.as_secs_f64()
                    ),
                ));
            }
        };

        let drafts = self.persist_payloads(&output).await?;
        if self.phase == Phase::One {
            self.write_phase1_outputs(unit, &output, &drafts).await?;
        }

        let artifacts = self.storage.stage_artifacts(unit, &drafts, op).await?;
        info!(
            transform = self.transform.name(),
            artifacts = artifacts.len(),
            "work unit staged"
        );
        Ok(artifacts)
    }

    async fn load_input(&self, unit: &WorkUnit) -> Result<TransformInput> {
        let doc = self
            .storage
            .get_source_document(&unit.document)
            .await?
            .ok_or_else(|| VaultgateError::NotFound(format!("source document {}", unit.document)))?;
        let source = Path::new(&doc.original_path);
        let source_name = source
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| doc.original_path.clone());

        let (bytes, title) = match self.phase {
            Phase::One => {
                let stem = source.file_stem().map(|s| s.to_string_lossy().to_string());
                (self.sources.get(&unit.input_ref).await?, stem)
            }
            Phase::Two => {
                let upstream = self.storage.get_artifact(&unit.subject).await?;
                (
                    self.payloads.get(&unit.input_ref).await?,
                    upstream.and_then(|a| a.title),
                )
            }
        };

        Ok(TransformInput {
            work_unit_id: unit.id.clone(),
            phase: self.phase,
            document: unit.document.clone(),
            source_name,
            title,
            content: String::from_utf8_lossy(&bytes).into_owned(),
            note: unit.note.clone(),
        })
    }

    async fn persist_payloads(&self, output: &TransformOutput) -> Result<Vec<NewArtifact>> {
        let mut drafts = Vec::with_capacity(output.artifacts.len());
        for (ordinal, draft) in (0u32..).zip(&output.artifacts) {
            let (fingerprint, payload_ref) = self.payloads.put(draft.body.as_bytes()).await?;
            drafts.push(NewArtifact {
                ordinal,
                fingerprint,
                payload_ref,
                title: draft.title.clone(),
                category: if self.phase == Phase::Two {
                    draft.category
                } else {
                    None
                },
            });
        }
        Ok(drafts)
    }

    /// Ordered rendering and chunk manifest. Both are overwritten by a later
    /// attempt for the same document.
    async fn write_phase1_outputs(
        &self,
        unit: &WorkUnit,
        output: &TransformOutput,
        drafts: &[NewArtifact],
    ) -> Result<()> {
        let scratch = self.layout.work_dir(self.phase);
        let fp = unit.document.as_str();

        if let Some(ordered) = &output.ordered {
            let target = self.layout.ordered_dir().join(format!("{fp}.md"));
            write_atomic(&scratch, &target, ordered.as_bytes()).await?;
        }

        let manifest = ChunkManifest {
            document: &unit.document,
            work_unit: &unit.id,
            chunks: drafts
                .iter()
                .map(|d| ChunkEntry {
                    id: artifact_id(&unit.id, d.ordinal),
                    ordinal: d.ordinal,
                    title: d.title.as_deref(),
                    fingerprint: &d.fingerprint,
                })
                .collect(),
        };
        let json = serde_json::to_vec_pretty(&manifest)
            .map_err(|e| VaultgateError::validation(format!("chunk manifest: {e}")))?;
        let target = self.layout.chunks_dir().join(format!("{fp}.json"));
        write_atomic(&scratch, &target, &json).await
    }

    /// Process every queued unit of this phase, including units queued while
    /// the pass is running, until none is left.
    pub async fn run_once(&self, progress: &dyn ProgressReporter) -> Result<RunReport> {
        let mut report = RunReport::default();
        let mut attempted: HashSet<String> = HashSet::new();
        let semaphore = Arc::new(Semaphore::new(self.concurrency));

        loop {
            let batch: Vec<WorkUnit> = self
                .storage
                .list_work_units(self.phase, WorkStatus::Queued)
                .await?
                .into_iter()
                .filter(|u| !attempted.contains(&u.id))
                .collect();
            if batch.is_empty() {
                break;
            }

            progress.phase(&format!("Processing {}", self.phase));
            let total = batch.len();
            let mut handles = Vec::with_capacity(total);
            for unit in batch {
                attempted.insert(unit.id.clone());
                let Ok(permit) = semaphore.clone().acquire_owned().await else {
                    break;
                };
                let this = self.clone();
                handles.push(tokio::spawn(async move {
                    let _permit = permit;
                    let result = this.process(&unit).await;
                    (unit, result)
                }));
            }

            for (i, handle) in handles.into_iter().enumerate() {
                let (unit, result) = match handle.await {
                    Ok(pair) => pair,
                    Err(e) => {
                        report.record_error(&VaultgateError::Store(format!(
                            "processing task panicked: {e}"
                        )));
                        continue;
                    }
                };
                progress.item(&unit.id, i + 1, total);
                report.touch(&unit.document);
                match result {
                    Ok(ProcessOutcome::Staged(_)) => report.processed += 1,
                    Ok(ProcessOutcome::Cached(_)) => report.cached += 1,
                    Err(e) => {
                        warn!(work_unit = %unit.id, error = %e, "work unit not staged");
                        report.record_error(&e);
                    }
                }
            }
        }

        if report.processed + report.cached > 0 {
            info!(
                phase = %self.phase,
                processed = report.processed,
                cached = report.cached,
                "processing pass complete"
            );
        }
        Ok(report)
    }
}
