//! Worker scheduling: the watcher, the two processors and the promoter run
//! as independent loops that only coordinate through the state database.
//!
//! Every worker has two modes. [`RunMode::Once`] drains the current backlog
//! and returns. [`RunMode::Continuous`] repeats the same pass every poll
//! interval until the shutdown signal flips; a pass in flight always
//! finishes first, so no operation is abandoned mid-way.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info, instrument};

use vaultgate_shared::{
    Decision, OpKind, Phase, PipelineSettings, Result, StorageLayout, TransformsConfig,
};
use vaultgate_storage::{StageStore, Storage};

use crate::gate::{ApprovalGate, DecideOutcome};
use crate::indexer::{Embedder, HashEmbedder, Indexer};
use crate::processor::Processor;
use crate::promoter::Promoter;
use crate::recovery::{self, RecoveryReport};
use crate::report::{DocumentReport, RunReport, describe_documents};
use crate::transform::{Transform, build_transform};
use crate::watcher::Watcher;

/// Progress callback for reporting worker activity.
pub trait ProgressReporter: Send + Sync {
    /// Called when a worker starts a pass over a batch.
    fn phase(&self, name: &str);
    /// Called for each item of the current batch.
    fn item(&self, label: &str, current: usize, total: usize);
    /// Called when a worker invocation returns.
    fn done(&self, report: &RunReport);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _name: &str) {}
    fn item(&self, _label: &str, _current: usize, _total: usize) {}
    fn done(&self, _report: &RunReport) {}
}

/// How long a worker keeps going.
#[derive(Debug, Clone)]
pub enum RunMode {
    /// Process the current backlog, then return.
    Once,
    /// Poll until the receiver observes `true`.
    Continuous(watch::Receiver<bool>),
}

/// Operation kinds each worker resolves at startup. Each kind belongs to
/// exactly one worker.
const WATCHER_KINDS: &[OpKind] = &[OpKind::Ingest];
const PHASE1_KINDS: &[OpKind] = &[OpKind::Process(Phase::One)];
const PHASE2_KINDS: &[OpKind] = &[OpKind::Process(Phase::Two), OpKind::Promote(Phase::One)];
const PROMOTER_KINDS: &[OpKind] = &[OpKind::Promote(Phase::Two), OpKind::Index, OpKind::Stage];

pub struct Pipeline {
    settings: PipelineSettings,
    layout: StorageLayout,
    storage: Arc<Storage>,
    watcher: Watcher,
    phase1: Processor,
    phase2: Processor,
    gate: ApprovalGate,
    promoter: Promoter,
}

impl Pipeline {
    /// Open the pipeline rooted at `settings.base_dir` with the configured
    /// transformations and the built-in hash embedder.
    pub async fn open(settings: PipelineSettings, transforms: &TransformsConfig) -> Result<Self> {
        let layout = StorageLayout::new(&settings.base_dir);
        layout.ensure()?;
        let storage = Arc::new(Storage::open_with_lease(&layout.db_path(), settings.lease_ttl).await?);

        let phase1 = build_transform(transforms.for_phase(Phase::One), Phase::One)?;
        let phase2 = build_transform(transforms.for_phase(Phase::Two), Phase::Two)?;
        let embedder = Arc::new(HashEmbedder::new(settings.embedding_dims));

        info!(base = %layout.base().display(), "pipeline opened");
        Ok(Self::with_components(
            settings, layout, storage, phase1, phase2, embedder,
        ))
    }

    /// Assemble a pipeline from explicit collaborators.
    pub fn with_components(
        settings: PipelineSettings,
        layout: StorageLayout,
        storage: Arc<Storage>,
        phase1: Arc<dyn Transform>,
        phase2: Arc<dyn Transform>,
        embedder: Arc<dyn Embedder>,
    ) -> Self {
        let indexer = Arc::new(Indexer::new(storage.clone(), layout.clone(), embedder));
        Self {
            watcher: Watcher::new(storage.clone(), layout.clone(), &settings),
            phase1: Processor::new(Phase::One, storage.clone(), layout.clone(), phase1, &settings),
            phase2: Processor::new(Phase::Two, storage.clone(), layout.clone(), phase2, &settings),
            gate: ApprovalGate::new(StageStore::new(storage.clone())),
            promoter: Promoter::new(storage.clone(), layout.clone(), indexer),
            settings,
            layout,
            storage,
        }
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    /// Source Watcher.
    #[instrument(skip_all, name = "watcher")]
    pub async fn run_watcher(
        &self,
        mode: RunMode,
        progress: &dyn ProgressReporter,
    ) -> Result<RunReport> {
        self.supervise(WATCHER_KINDS, mode, progress, || self.watcher.run_once(progress))
            .await
    }

    /// Phase Processor. Phase 2 first turns phase-1 approvals into phase-2
    /// work units, so a single pass carries them through.
    #[instrument(skip_all, name = "processor", fields(phase = %phase))]
    pub async fn run_processor(
        &self,
        phase: Phase,
        mode: RunMode,
        progress: &dyn ProgressReporter,
    ) -> Result<RunReport> {
        match phase {
            Phase::One => {
                self.supervise(PHASE1_KINDS, mode, progress, || self.phase1.run_once(progress))
                    .await
            }
            Phase::Two => {
                self.supervise(PHASE2_KINDS, mode, progress, || self.phase2_pass(progress))
                    .await
            }
        }
    }

    /// Promoter for phase-2 approvals (vault + index).
    #[instrument(skip_all, name = "promoter")]
    pub async fn run_promoter(
        &self,
        mode: RunMode,
        progress: &dyn ProgressReporter,
    ) -> Result<RunReport> {
        self.supervise(PROMOTER_KINDS, mode, progress, || {
            self.promoter.run_once(Phase::Two, progress)
        })
        .await
    }

    /// Every worker. `Once` runs them in pipeline order so a document moves
    /// as far as approvals allow; `Continuous` runs them side by side.
    #[instrument(skip_all, name = "pipeline")]
    pub async fn run_all(&self, mode: RunMode, progress: &dyn ProgressReporter) -> Result<RunReport> {
        let mut report = RunReport::default();
        report.recovered = recovery::recover(&self.storage, &OpKind::ALL).await?;

        match mode {
            RunMode::Once => report.merge(self.full_pass(progress).await?),
            RunMode::Continuous(shutdown) => {
                let (watcher, phase1, phase2, promoter) = tokio::join!(
                    self.drive(RunMode::Continuous(shutdown.clone()), || self
                        .watcher
                        .run_once(progress)),
                    self.drive(RunMode::Continuous(shutdown.clone()), || self
                        .phase1
                        .run_once(progress)),
                    self.drive(RunMode::Continuous(shutdown.clone()), || self
                        .phase2_pass(progress)),
                    self.drive(RunMode::Continuous(shutdown), || self
                        .promoter
                        .run_once(Phase::Two, progress)),
                );
                for worker in [watcher, phase1, phase2, promoter] {
                    report.merge(worker?);
                }
            }
        }

        report.finish(&self.storage).await?;
        progress.done(&report);
        Ok(report)
    }

    /// Resolve every in-doubt operation, whatever its kind.
    pub async fn recover_all(&self) -> Result<RecoveryReport> {
        recovery::recover(&self.storage, &OpKind::ALL).await
    }

    /// Apply an approval decision. Interrupted moves are left to the
    /// recovery of a worker run; the bucket row alone decides the outcome.
    pub async fn decide(
        &self,
        artifact_id: &str,
        decision: Decision,
        note: Option<&str>,
    ) -> Result<DecideOutcome> {
        self.gate.decide(artifact_id, decision, note).await
    }

    /// Release this process's lease so anything it left in-doubt can be
    /// recovered without waiting for the lease to lapse.
    pub async fn close(&self) -> Result<()> {
        self.storage.release().await
    }

    /// State of every known document.
    pub async fn status(&self) -> Result<Vec<DocumentReport>> {
        let docs = self.storage.list_source_documents().await?;
        describe_documents(&self.storage, &docs).await
    }

    async fn phase2_pass(&self, progress: &dyn ProgressReporter) -> Result<RunReport> {
        let mut report = self.promoter.run_once(Phase::One, progress).await?;
        report.merge(self.phase2.run_once(progress).await?);
        Ok(report)
    }

    async fn full_pass(&self, progress: &dyn ProgressReporter) -> Result<RunReport> {
        let mut report = self.watcher.run_once(progress).await?;
        report.merge(self.phase1.run_once(progress).await?);
        report.merge(self.phase2_pass(progress).await?);
        report.merge(self.promoter.run_once(Phase::Two, progress).await?);
        Ok(report)
    }

    /// Recover the worker's own operation kinds, run it, and describe the
    /// documents it touched.
    async fn supervise<F, Fut>(
        &self,
        kinds: &[OpKind],
        mode: RunMode,
        progress: &dyn ProgressReporter,
        step: F,
    ) -> Result<RunReport>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<RunReport>>,
    {
        let mut report = RunReport::default();
        report.recovered = recovery::recover(&self.storage, kinds).await?;
        report.merge(self.drive(mode, step).await?);
        report.finish(&self.storage).await?;
        progress.done(&report);
        Ok(report)
    }

    async fn drive<F, Fut>(&self, mode: RunMode, mut step: F) -> Result<RunReport>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<RunReport>>,
    {
        let mut shutdown = match mode {
            RunMode::Once => return step().await,
            RunMode::Continuous(shutdown) => shutdown,
        };

        let mut report = RunReport::default();
        loop {
            if *shutdown.borrow() {
                break;
            }
            match step().await {
                Ok(pass) => report.merge(pass),
                Err(e) => {
                    error!(error = %e, "worker pass failed");
                    report.record_error(&e);
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("worker stopped");
        Ok(report)
    }
}
