//! End-to-end runs over a temporary base directory.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use uuid::Uuid;

use vaultgate_shared::{
    Bucket, Decision, Fingerprint, OpKind, Outcome, Phase, PipelineSettings, Result,
    StorageLayout, VaultgateError, WorkStatus,
};
use vaultgate_storage::{StagedArtifact, Storage};

use crate::indexer::{HashEmbedder, Indexer};
use crate::pipeline::{Pipeline, RunMode, SilentProgress};
use crate::report::DocumentState;
use crate::transform::{NoteWriter, SectionChunker, Transform, TransformInput, TransformOutput};

pub(crate) const DOC: &str = "# C1\nalpha paragraph\n\n# C2\nbeta paragraph\n";

struct Broken;

#[async_trait]
impl Transform for Broken {
    fn name(&self) -> &str {
        "broken"
    }

    async fn transform(&self, input: &TransformInput) -> Result<TransformOutput> {
        Err(VaultgateError::transform(&input.work_unit_id, "model refused"))
    }
}

struct Stalled;

#[async_trait]
impl Transform for Stalled {
    fn name(&self) -> &str {
        "stalled"
    }

    async fn transform(&self, _input: &TransformInput) -> Result<TransformOutput> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(TransformOutput::default())
    }
}

/// Fails its first call, then behaves like [`NoteWriter`].
#[derive(Default)]
struct FailsOnce {
    failed: AtomicBool,
}

#[async_trait]
impl Transform for FailsOnce {
    fn name(&self) -> &str {
        "fails-once"
    }

    async fn transform(&self, input: &TransformInput) -> Result<TransformOutput> {
        if !self.failed.swap(true, Ordering::SeqCst) {
            return Err(VaultgateError::transform(&input.work_unit_id, "model refused"));
        }
        NoteWriter.transform(input).await
    }
}

fn settings() -> PipelineSettings {
    PipelineSettings {
        base_dir: std::env::temp_dir().join(format!("vg_e2e_{}", Uuid::now_v7())),
        poll_interval: Duration::from_millis(20),
        transform_timeout: Duration::from_millis(200),
        embedding_dims: 16,
        ..PipelineSettings::default()
    }
}

async fn pipeline_with(phase1: Arc<dyn Transform>) -> Pipeline {
    pipeline_with_phases(phase1, Arc::new(NoteWriter)).await
}

async fn pipeline_with_phases(phase1: Arc<dyn Transform>, phase2: Arc<dyn Transform>) -> Pipeline {
    let settings = settings();
    let layout = StorageLayout::new(&settings.base_dir);
    layout.ensure().unwrap();
    let storage = Arc::new(Storage::open(&layout.db_path()).await.unwrap());
    Pipeline::with_components(
        settings,
        layout,
        storage,
        phase1,
        phase2,
        Arc::new(HashEmbedder::new(16)),
    )
}

pub(crate) async fn pipeline() -> Pipeline {
    pipeline_with(Arc::new(SectionChunker::new(4000))).await
}

pub(crate) fn drop_in_intake(p: &Pipeline, name: &str, content: &str) {
    std::fs::write(p.layout().intake().join(name), content).unwrap();
}

pub(crate) async fn staged(p: &Pipeline, phase: Phase, bucket: Bucket) -> Vec<StagedArtifact> {
    p.storage().staged_artifacts(Some(phase), bucket).await.unwrap()
}

/// A second handle on the same state database whose lease lapsed at once:
/// whatever it leaves open looks like the work of a crashed process.
pub(crate) async fn crashed_process(p: &Pipeline) -> Storage {
    Storage::open_with_lease(&p.layout().db_path(), Duration::ZERO)
        .await
        .unwrap()
}

/// Ingest DOC and run phase 1, returning its two pending chunks.
pub(crate) async fn chunked(p: &Pipeline) -> (String, String) {
    drop_in_intake(p, "d.md", DOC);
    p.run_watcher(RunMode::Once, &SilentProgress).await.unwrap();
    p.run_processor(Phase::One, RunMode::Once, &SilentProgress)
        .await
        .unwrap();
    let pending = staged(p, Phase::One, Bucket::Pending).await;
    assert_eq!(pending.len(), 2);
    (pending[0].artifact.id.clone(), pending[1].artifact.id.clone())
}

#[tokio::test]
async fn approved_chunk_alone_reaches_phase_two() {
    let p = pipeline().await;
    let (c1, c2) = chunked(&p).await;
    let titles: Vec<_> = staged(&p, Phase::One, Bucket::Pending)
        .await
        .into_iter()
        .filter_map(|s| s.artifact.title)
        .collect();
    assert_eq!(titles, vec!["C1", "C2"]);

    p.decide(&c1, Decision::Approve, Some("keep this")).await.unwrap();
    p.decide(&c2, Decision::Reject, None).await.unwrap();

    let report = p
        .run_processor(Phase::Two, RunMode::Once, &SilentProgress)
        .await
        .unwrap();
    assert_eq!(report.promoted, 1);
    assert_eq!(report.processed, 1);

    let pending = staged(&p, Phase::Two, Bucket::Pending).await;
    assert_eq!(pending.len(), 1);
    let unit = p
        .storage()
        .get_work_unit(&pending[0].artifact.work_unit_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(unit.subject, c1);
    assert_eq!(unit.note.as_deref(), Some("keep this"));
    assert!(p.storage().live_work_unit(&c2, Phase::Two).await.unwrap().is_none());
}

#[tokio::test]
async fn phase_two_approval_is_vaulted_and_indexed_once() {
    let p = pipeline().await;
    let (c1, c2) = chunked(&p).await;
    p.decide(&c1, Decision::Approve, Some("keep this")).await.unwrap();
    p.decide(&c2, Decision::Reject, None).await.unwrap();
    p.run_processor(Phase::Two, RunMode::Once, &SilentProgress)
        .await
        .unwrap();

    let note = staged(&p, Phase::Two, Bucket::Pending).await.remove(0);
    p.decide(&note.artifact.id, Decision::Approve, None).await.unwrap();
    let report = p.run_promoter(RunMode::Once, &SilentProgress).await.unwrap();
    assert_eq!(report.promoted, 1);
    assert_eq!(report.indexed, 1);
    assert!(report.is_success());

    let vault = p.storage().list_vault_artifacts().await.unwrap();
    assert_eq!(vault.len(), 1);
    assert_eq!(vault[0].title, "C1");
    let text = std::fs::read_to_string(p.layout().vault_dir().join(&vault[0].path)).unwrap();
    assert!(text.contains("alpha paragraph"));
    assert!(text.contains("> Reviewer note: keep this"));

    let entry = p.storage().get_index_entry(&vault[0].id).await.unwrap().unwrap();
    assert_eq!(entry.dims, 16);

    // A second pass finds nothing new to promote or index.
    let again = p.run_promoter(RunMode::Once, &SilentProgress).await.unwrap();
    assert_eq!(again.promoted, 0);
    assert_eq!(again.indexed, 0);
    assert_eq!(p.storage().list_vault_artifacts().await.unwrap().len(), 1);

    let status = p.status().await.unwrap();
    assert!(matches!(
        &status[0].state,
        DocumentState::Promoted { vault_artifacts } if vault_artifacts.len() == 1
    ));
}

#[tokio::test]
async fn reingesting_unchanged_document_creates_nothing() {
    let p = pipeline().await;
    let (c1, _) = chunked(&p).await;
    p.decide(&c1, Decision::Approve, None).await.unwrap();

    drop_in_intake(&p, "copy-of-d.md", DOC);
    let report = p.run_watcher(RunMode::Once, &SilentProgress).await.unwrap();
    assert_eq!(report.ingested, 0);
    assert_eq!(report.duplicates, 1);

    let docs = p.storage().list_source_documents().await.unwrap();
    assert_eq!(docs.len(), 1);
    let units = p
        .storage()
        .work_units_for_document(&docs[0].fingerprint)
        .await
        .unwrap();
    assert_eq!(units.len(), 1);
    assert_eq!(units[0].status, WorkStatus::Staged);
    let record = p.storage().get_staging(&c1).await.unwrap().unwrap();
    assert_eq!(record.bucket, Bucket::Approved);
}

#[tokio::test]
async fn interrupted_processing_is_retried_exactly_once() {
    let p = pipeline().await;
    drop_in_intake(&p, "d.md", DOC);
    p.run_watcher(RunMode::Once, &SilentProgress).await.unwrap();
    let unit = p
        .storage()
        .list_work_units(Phase::One, WorkStatus::Queued)
        .await
        .unwrap()
        .remove(0);

    // Crash after begin + claim, before the outputs were staged.
    let dead = crashed_process(&p).await;
    let op = dead
        .wal()
        .begin(OpKind::Process(Phase::One), &unit.id, Some(&unit.subject))
        .await
        .unwrap();
    assert!(dead.claim_work_unit(&unit.id).await.unwrap());

    let report = p
        .run_processor(Phase::One, RunMode::Once, &SilentProgress)
        .await
        .unwrap();
    assert_eq!(report.recovered.requeued, 1);
    assert_eq!(report.recovered.failed, 1);
    assert_eq!(report.processed, 1);

    let crashed = p.storage().wal().get(&op).await.unwrap().unwrap();
    assert_eq!(crashed.outcome, Some(Outcome::Failed));
    let history = p.storage().wal().history(&unit.id).await.unwrap();
    let completed = history
        .iter()
        .filter(|e| e.outcome == Some(Outcome::Completed))
        .count();
    assert_eq!(completed, 1);
    assert!(history.iter().all(|e| !e.is_in_doubt()));
    assert_eq!(
        p.storage().artifacts_for_work_unit(&unit.id).await.unwrap().len(),
        2
    );

    // Nothing is left for a further run.
    let again = p
        .run_processor(Phase::One, RunMode::Once, &SilentProgress)
        .await
        .unwrap();
    assert!(again.recovered.is_empty());
    assert_eq!(again.processed, 0);
}

#[tokio::test]
async fn contradicting_decision_is_a_conflict() {
    let p = pipeline().await;
    let (_, c2) = chunked(&p).await;
    p.decide(&c2, Decision::Reject, None).await.unwrap();

    let err = p.decide(&c2, Decision::Approve, None).await.unwrap_err();
    assert!(err.is_conflict());
    let record = p.storage().get_staging(&c2).await.unwrap().unwrap();
    assert_eq!(record.bucket, Bucket::Rejected);

    // The same decision again is accepted without change.
    let repeat = p.decide(&c2, Decision::Reject, None).await.unwrap();
    assert!(matches!(repeat, crate::gate::DecideOutcome::AlreadyRecorded(_)));
}

#[tokio::test]
async fn rejected_artifacts_never_reach_the_vault() {
    let p = pipeline().await;
    let (c1, c2) = chunked(&p).await;
    p.decide(&c1, Decision::Reject, None).await.unwrap();
    p.decide(&c2, Decision::Reject, None).await.unwrap();

    let report = p.run_all(RunMode::Once, &SilentProgress).await.unwrap();
    assert_eq!(report.promoted, 0);
    assert!(p.storage().list_vault_artifacts().await.unwrap().is_empty());
    assert!(p.storage().promotion_target(&c1).await.unwrap().is_none());

    let status = p.status().await.unwrap();
    assert_eq!(status[0].state, DocumentState::Rejected);
}

#[tokio::test]
async fn interrupted_promotion_is_redone_without_duplicates() {
    let p = pipeline().await;
    let (c1, c2) = chunked(&p).await;
    p.decide(&c1, Decision::Approve, None).await.unwrap();
    p.decide(&c2, Decision::Reject, None).await.unwrap();
    p.run_processor(Phase::Two, RunMode::Once, &SilentProgress)
        .await
        .unwrap();
    let note = staged(&p, Phase::Two, Bucket::Pending).await.remove(0);

    // Nothing reaches the vault before the phase-2 approval.
    p.run_promoter(RunMode::Once, &SilentProgress).await.unwrap();
    assert!(p.storage().list_vault_artifacts().await.unwrap().is_empty());

    p.decide(&note.artifact.id, Decision::Approve, None).await.unwrap();
    let op = crashed_process(&p)
        .await
        .wal()
        .begin(OpKind::Promote(Phase::Two), &note.artifact.id, None)
        .await
        .unwrap();

    let report = p.run_promoter(RunMode::Once, &SilentProgress).await.unwrap();
    assert_eq!(report.recovered.failed, 1);
    assert_eq!(report.promoted, 1);
    let crashed = p.storage().wal().get(&op).await.unwrap().unwrap();
    assert_eq!(crashed.outcome, Some(Outcome::Failed));
    assert_eq!(p.storage().list_vault_artifacts().await.unwrap().len(), 1);
    assert!(p.storage().wal().in_doubt().await.unwrap().is_empty());
}

#[tokio::test]
async fn every_artifact_sits_in_exactly_one_bucket() {
    let p = pipeline().await;
    let (c1, c2) = chunked(&p).await;
    p.decide(&c1, Decision::Approve, None).await.unwrap();
    p.decide(&c2, Decision::Reject, None).await.unwrap();
    p.run_all(RunMode::Once, &SilentProgress).await.unwrap();

    let mut seen = Vec::new();
    for phase in Phase::ALL {
        for bucket in [Bucket::Pending, Bucket::Approved, Bucket::Rejected] {
            seen.extend(staged(&p, phase, bucket).await.into_iter().map(|s| s.artifact.id));
        }
    }
    let total = seen.len();
    seen.sort();
    seen.dedup();
    assert_eq!(seen.len(), total);
    assert_eq!(total, 3);
}

#[tokio::test]
async fn failing_transform_marks_the_document_failed() {
    let p = pipeline_with(Arc::new(Broken)).await;
    drop_in_intake(&p, "d.md", DOC);
    p.run_watcher(RunMode::Once, &SilentProgress).await.unwrap();

    let report = p
        .run_processor(Phase::One, RunMode::Once, &SilentProgress)
        .await
        .unwrap();
    assert_eq!(report.processed, 0);
    assert_eq!(report.errors.len(), 1);
    assert!(!report.escalated);
    assert!(!report.is_success());
    assert!(matches!(
        &report.documents[0].state,
        DocumentState::Failed { phase: Phase::One, error } if error.contains("model refused")
    ));
    assert!(p.storage().wal().in_doubt().await.unwrap().is_empty());
}

#[tokio::test]
async fn stalled_transform_times_out() {
    let p = pipeline_with(Arc::new(Stalled)).await;
    drop_in_intake(&p, "d.md", DOC);
    p.run_watcher(RunMode::Once, &SilentProgress).await.unwrap();

    let report = p
        .run_processor(Phase::One, RunMode::Once, &SilentProgress)
        .await
        .unwrap();
    assert!(report.errors[0].contains("timed out"));
    let unit = p
        .storage()
        .list_work_units(Phase::One, WorkStatus::Failed)
        .await
        .unwrap();
    assert_eq!(unit.len(), 1);
}

#[tokio::test]
async fn continuous_watcher_stops_on_shutdown() {
    let p = pipeline().await;
    let (tx, rx) = watch::channel(false);

    let feeder = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop_in_intake(&p, "late.md", "# Late\narrived while running\n");
        for _ in 0..100 {
            if p.storage().list_source_documents().await.unwrap().len() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        tx.send(true).unwrap();
    };
    let (report, ()) = tokio::join!(
        p.run_watcher(RunMode::Continuous(rx), &SilentProgress),
        feeder
    );

    let report = report.unwrap();
    assert_eq!(report.ingested, 1);
    assert_eq!(report.documents.len(), 1);
    assert_eq!(
        report.documents[0].state,
        DocumentState::Queued { phase: Phase::One }
    );
}

#[tokio::test]
async fn decisions_leave_moves_of_live_processes_alone() {
    let p = pipeline().await;
    let (c1, c2) = chunked(&p).await;

    // Another worker process, still alive, is half-way through moving c1.
    let other = Storage::open(&p.layout().db_path()).await.unwrap();
    let moving = other
        .wal()
        .begin(OpKind::Stage, &c1, Some("pending->approved"))
        .await
        .unwrap();

    p.decide(&c2, Decision::Reject, None).await.unwrap();
    assert!(p.recover_all().await.unwrap().is_empty());
    let entry = p.storage().wal().get(&moving).await.unwrap().unwrap();
    assert!(entry.is_in_doubt());
    assert_eq!(entry.owner.as_deref(), other.owner());

    // Its terminal record still lands.
    other.wal().commit(&moving).await.unwrap();

    // Once it is gone, what it left open is recovered.
    let abandoned = other
        .wal()
        .begin(OpKind::Stage, &c1, Some("pending->approved"))
        .await
        .unwrap();
    other.release().await.unwrap();
    let report = p.recover_all().await.unwrap();
    assert_eq!(report.failed, 1);
    let entry = p.storage().wal().get(&abandoned).await.unwrap().unwrap();
    assert_eq!(entry.outcome, Some(Outcome::Failed));
}

#[tokio::test]
async fn reingesting_after_a_phase_two_failure_retries_it() {
    let p = pipeline_with_phases(
        Arc::new(SectionChunker::new(4000)),
        Arc::new(FailsOnce::default()),
    )
    .await;
    let (c1, c2) = chunked(&p).await;
    p.decide(&c1, Decision::Approve, Some("keep this")).await.unwrap();
    p.decide(&c2, Decision::Reject, None).await.unwrap();

    let report = p
        .run_processor(Phase::Two, RunMode::Once, &SilentProgress)
        .await
        .unwrap();
    assert!(matches!(
        &report.documents[0].state,
        DocumentState::Failed { phase: Phase::Two, .. }
    ));

    drop_in_intake(&p, "d.md", DOC);
    let report = p.run_watcher(RunMode::Once, &SilentProgress).await.unwrap();
    assert_eq!(report.ingested, 1);
    assert_eq!(report.duplicates, 0);
    assert_eq!(
        report.documents[0].state,
        DocumentState::Queued { phase: Phase::Two }
    );

    let report = p
        .run_processor(Phase::Two, RunMode::Once, &SilentProgress)
        .await
        .unwrap();
    assert_eq!(report.processed, 1);
    assert!(report.is_success());

    let fingerprint = Fingerprint::of(DOC.as_bytes());
    let phase2: Vec<_> = p
        .storage()
        .work_units_for_document(&fingerprint)
        .await
        .unwrap()
        .into_iter()
        .filter(|u| u.phase == Phase::Two)
        .collect();
    assert_eq!(phase2.len(), 2);
    assert_eq!(phase2[1].subject, c1);
    assert_eq!(phase2[1].attempt, 2);
    assert_eq!(phase2[1].note.as_deref(), Some("keep this"));
    assert_eq!(
        p.status().await.unwrap()[0].state,
        DocumentState::AwaitingReview { phase: Phase::Two, pending: 1 }
    );

    // Nothing failed any more: the same file is a plain duplicate again.
    drop_in_intake(&p, "d.md", DOC);
    let report = p.run_watcher(RunMode::Once, &SilentProgress).await.unwrap();
    assert_eq!(report.ingested, 0);
    assert_eq!(report.duplicates, 1);
    assert!(p.storage().wal().in_doubt().await.unwrap().is_empty());
}

#[tokio::test]
async fn interrupted_ingest_is_failed_and_the_file_ingested_once() {
    let p = pipeline().await;
    let fingerprint = Fingerprint::of(DOC.as_bytes());

    // Crash after begin, before the document was registered.
    let op = crashed_process(&p)
        .await
        .wal()
        .begin(OpKind::Ingest, fingerprint.as_str(), Some("d.md"))
        .await
        .unwrap();
    drop_in_intake(&p, "d.md", DOC);

    let report = p.run_watcher(RunMode::Once, &SilentProgress).await.unwrap();
    assert_eq!(report.recovered.failed, 1);
    assert_eq!(report.ingested, 1);

    let entry = p.storage().wal().get(&op).await.unwrap().unwrap();
    assert_eq!(entry.outcome, Some(Outcome::Failed));
    assert_eq!(
        p.storage()
            .work_units_for_document(&fingerprint)
            .await
            .unwrap()
            .len(),
        1
    );
    assert!(p.storage().wal().in_doubt().await.unwrap().is_empty());
}

#[tokio::test]
async fn interrupted_moves_resolve_against_the_bucket() {
    let p = pipeline().await;
    let (c1, c2) = chunked(&p).await;

    let dead = crashed_process(&p).await;
    let lost = dead
        .wal()
        .begin(OpKind::Stage, &c1, Some("pending->approved"))
        .await
        .unwrap();
    let landed = dead
        .wal()
        .begin(OpKind::Stage, &c2, Some("pending->rejected"))
        .await
        .unwrap();
    p.decide(&c2, Decision::Reject, None).await.unwrap();

    let report = p.recover_all().await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(report.committed, 1);

    let wal = p.storage().wal();
    assert_eq!(wal.get(&lost).await.unwrap().unwrap().outcome, Some(Outcome::Failed));
    assert_eq!(wal.get(&landed).await.unwrap().unwrap().outcome, Some(Outcome::Completed));
    let record = p.storage().get_staging(&c1).await.unwrap().unwrap();
    assert_eq!(record.bucket, Bucket::Pending);

    // The artifact whose move was lost is still decidable.
    p.decide(&c1, Decision::Approve, None).await.unwrap();
    assert!(wal.in_doubt().await.unwrap().is_empty());
}

#[tokio::test]
async fn interrupted_phase_one_promotion_enqueues_one_unit() {
    let p = pipeline().await;
    let (c1, c2) = chunked(&p).await;
    p.decide(&c1, Decision::Approve, None).await.unwrap();
    p.decide(&c2, Decision::Reject, None).await.unwrap();

    let dead = crashed_process(&p).await;
    let before = dead
        .wal()
        .begin(OpKind::Promote(Phase::One), &c1, None)
        .await
        .unwrap();

    let report = p
        .run_processor(Phase::Two, RunMode::Once, &SilentProgress)
        .await
        .unwrap();
    assert_eq!(report.recovered.failed, 1);
    assert_eq!(report.promoted, 1);

    // A crash after the promotion was recorded resolves as done.
    let after = dead
        .wal()
        .begin(OpKind::Promote(Phase::One), &c1, None)
        .await
        .unwrap();
    let recovered = p.recover_all().await.unwrap();
    assert_eq!(recovered.committed, 1);
    assert_eq!(recovered.failed, 0);

    let wal = p.storage().wal();
    assert_eq!(wal.get(&before).await.unwrap().unwrap().outcome, Some(Outcome::Failed));
    assert_eq!(wal.get(&after).await.unwrap().unwrap().outcome, Some(Outcome::Completed));

    let phase2 = p
        .storage()
        .work_units_for_document(&Fingerprint::of(DOC.as_bytes()))
        .await
        .unwrap()
        .into_iter()
        .filter(|u| u.phase == Phase::Two)
        .count();
    assert_eq!(phase2, 1);
}

#[tokio::test]
async fn interrupted_indexing_keeps_a_single_entry() {
    let p = pipeline().await;
    let (c1, c2) = chunked(&p).await;
    p.decide(&c1, Decision::Approve, None).await.unwrap();
    p.decide(&c2, Decision::Reject, None).await.unwrap();
    p.run_processor(Phase::Two, RunMode::Once, &SilentProgress)
        .await
        .unwrap();
    let note = staged(&p, Phase::Two, Bucket::Pending).await.remove(0);
    p.decide(&note.artifact.id, Decision::Approve, None).await.unwrap();
    p.run_promoter(RunMode::Once, &SilentProgress).await.unwrap();
    let vault = p.storage().list_vault_artifacts().await.unwrap().remove(0);

    let dead = crashed_process(&p).await;
    let rewritten = dead.wal().begin(OpKind::Index, &vault.id, None).await.unwrap();
    let indexer = Indexer::new(
        p.storage().clone(),
        p.layout().clone(),
        Arc::new(HashEmbedder::new(16)),
    );
    indexer.index(&vault.id).await.unwrap();
    let lost = dead.wal().begin(OpKind::Index, &vault.id, None).await.unwrap();

    let report = p.run_promoter(RunMode::Once, &SilentProgress).await.unwrap();
    assert_eq!(report.recovered.committed, 1);
    assert_eq!(report.recovered.failed, 1);
    assert_eq!(report.indexed, 0);

    let wal = p.storage().wal();
    assert_eq!(wal.get(&rewritten).await.unwrap().unwrap().outcome, Some(Outcome::Completed));
    assert_eq!(wal.get(&lost).await.unwrap().unwrap().outcome, Some(Outcome::Failed));
    assert!(p.storage().get_index_entry(&vault.id).await.unwrap().is_some());
    assert!(p.storage().unindexed_vault_artifacts().await.unwrap().is_empty());
    assert!(wal.in_doubt().await.unwrap().is_empty());
}
