//! Run reports and per-document terminal states.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;

use serde::Serialize;

use vaultgate_shared::{
    Bucket, Fingerprint, Phase, Result, SourceDocument, VaultArtifact, VaultgateError, WalEntry,
    WorkStatus, WorkUnit,
};
use vaultgate_storage::{StagedArtifact, Storage};

use crate::recovery::RecoveryReport;

/// Where a document's lineage currently stands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "kebab-case")]
pub enum DocumentState {
    InDoubt { operations: Vec<String> },
    Failed { phase: Phase, error: String },
    Running { phase: Phase },
    Queued { phase: Phase },
    AwaitingReview { phase: Phase, pending: usize },
    Approved { phase: Phase },
    Promoted { vault_artifacts: Vec<String> },
    Rejected,
}

impl DocumentState {
    /// States that make a run exit non-zero.
    pub fn is_blocking(&self) -> bool {
        matches!(self, Self::InDoubt { .. } | Self::Failed { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::InDoubt { .. } => "in-doubt",
            Self::Failed { .. } => "failed",
            Self::Running { .. } => "running",
            Self::Queued { .. } => "queued",
            Self::AwaitingReview { .. } => "awaiting-review",
            Self::Approved { .. } => "approved",
            Self::Promoted { .. } => "promoted",
            Self::Rejected => "rejected",
        }
    }
}

impl fmt::Display for DocumentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InDoubt { operations } => write!(f, "in-doubt ({} open)", operations.len()),
            Self::Failed { phase, error } => write!(f, "failed in {phase}: {error}"),
            Self::Running { phase } => write!(f, "running {phase}"),
            Self::Queued { phase } => write!(f, "queued for {phase}"),
            Self::AwaitingReview { phase, pending } => {
                write!(f, "awaiting-review ({phase}, {pending} pending)")
            }
            Self::Approved { phase } => write!(f, "approved in {phase}, not yet promoted"),
            Self::Promoted { vault_artifacts } => {
                write!(f, "promoted ({} vault artifacts)", vault_artifacts.len())
            }
            Self::Rejected => f.write_str("rejected"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DocumentReport {
    pub fingerprint: Fingerprint,
    pub original_path: String,
    pub state: DocumentState,
    pub work_units: usize,
    pub artifacts: usize,
}

/// Describe every document in `docs`.
pub async fn describe_documents(
    storage: &Storage,
    docs: &[SourceDocument],
) -> Result<Vec<DocumentReport>> {
    let in_doubt = storage.wal().in_doubt().await?;
    let mut reports = Vec::with_capacity(docs.len());
    for doc in docs {
        reports.push(describe_document(storage, doc, &in_doubt).await?);
    }
    Ok(reports)
}

async fn describe_document(
    storage: &Storage,
    doc: &SourceDocument,
    in_doubt: &[WalEntry],
) -> Result<DocumentReport> {
    let units = storage.work_units_for_document(&doc.fingerprint).await?;
    let artifacts = storage.artifacts_for_document(&doc.fingerprint).await?;
    let vault = storage.vault_artifacts_for_document(&doc.fingerprint).await?;

    let mut targets: HashSet<&str> = HashSet::new();
    targets.insert(doc.fingerprint.as_str());
    targets.extend(units.iter().map(|u| u.id.as_str()));
    targets.extend(artifacts.iter().map(|a| a.artifact.id.as_str()));
    targets.extend(vault.iter().map(|v| v.id.as_str()));
    let open: Vec<String> = in_doubt
        .iter()
        .filter(|e| targets.contains(e.target.as_str()))
        .map(|e| format!("{} {} ({})", e.kind, e.target, e.op_id))
        .collect();

    Ok(DocumentReport {
        fingerprint: doc.fingerprint.clone(),
        original_path: doc.original_path.clone(),
        state: derive_state(&units, &artifacts, &vault, open),
        work_units: units.len(),
        artifacts: artifacts.len(),
    })
}

/// Collapse a lineage into one state. Only the latest attempt per subject
/// and phase counts; earlier failed attempts are history.
pub(crate) fn derive_state(
    units: &[WorkUnit],
    artifacts: &[StagedArtifact],
    vault: &[VaultArtifact],
    open_operations: Vec<String>,
) -> DocumentState {
    if !open_operations.is_empty() {
        return DocumentState::InDoubt {
            operations: open_operations,
        };
    }

    let mut latest: HashMap<(&str, Phase), &WorkUnit> = HashMap::new();
    for unit in units {
        let slot = latest.entry((unit.subject.as_str(), unit.phase)).or_insert(unit);
        if unit.attempt > slot.attempt {
            *slot = unit;
        }
    }
    let mut latest: Vec<&WorkUnit> = latest.into_values().collect();
    latest.sort_by_key(|u| (u.phase, u.created_at));

    if let Some(failed) = latest.iter().find(|u| u.status == WorkStatus::Failed) {
        return DocumentState::Failed {
            phase: failed.phase,
            error: failed.error.clone().unwrap_or_else(|| "unknown error".into()),
        };
    }
    if let Some(unit) = latest.iter().find(|u| u.status == WorkStatus::Running) {
        return DocumentState::Running { phase: unit.phase };
    }
    if let Some(unit) = latest.iter().find(|u| u.status == WorkStatus::Queued) {
        return DocumentState::Queued { phase: unit.phase };
    }

    let pending: Vec<&StagedArtifact> = artifacts
        .iter()
        .filter(|a| a.staging.bucket == Bucket::Pending)
        .collect();
    if let Some(first) = pending.first() {
        return DocumentState::AwaitingReview {
            phase: first.staging.phase,
            pending: pending.len(),
        };
    }
    if let Some(empty) = latest.iter().find(|u| {
        u.status == WorkStatus::Staged && !artifacts.iter().any(|a| a.artifact.work_unit_id == u.id)
    }) {
        return DocumentState::AwaitingReview {
            phase: empty.phase,
            pending: 0,
        };
    }

    if let Some(approved) = artifacts
        .iter()
        .find(|a| a.staging.bucket == Bucket::Approved && a.promoted_to.is_none())
    {
        return DocumentState::Approved {
            phase: approved.staging.phase,
        };
    }
    if !vault.is_empty() {
        return DocumentState::Promoted {
            vault_artifacts: vault.iter().map(|v| v.id.clone()).collect(),
        };
    }
    DocumentState::Rejected
}

/// Outcome of one worker invocation (or several, merged).
#[derive(Debug, Default, Clone, Serialize)]
pub struct RunReport {
    pub ingested: usize,
    pub duplicates: usize,
    /// Sources moved to quarantine because they were unreadable or empty.
    pub quarantined: usize,
    pub processed: usize,
    pub cached: usize,
    pub promoted: usize,
    pub indexed: usize,
    pub conflicts: usize,
    pub errors: Vec<String>,
    /// A store or log write failed; some operation was left in-doubt.
    pub escalated: bool,
    pub recovered: RecoveryReport,
    pub documents: Vec<DocumentReport>,
    #[serde(skip)]
    touched: BTreeSet<Fingerprint>,
}

impl RunReport {
    /// Remember a document whose state this run changed.
    pub fn touch(&mut self, document: &Fingerprint) {
        self.touched.insert(document.clone());
    }

    pub fn touched(&self) -> impl Iterator<Item = &Fingerprint> {
        self.touched.iter()
    }

    pub fn record_error(&mut self, err: &VaultgateError) {
        if err.is_conflict() {
            self.conflicts += 1;
            return;
        }
        if err.is_escalated() {
            self.escalated = true;
        }
        self.errors.push(err.to_string());
    }

    pub fn merge(&mut self, other: RunReport) {
        self.ingested += other.ingested;
        self.duplicates += other.duplicates;
        self.quarantined += other.quarantined;
        self.processed += other.processed;
        self.cached += other.cached;
        self.promoted += other.promoted;
        self.indexed += other.indexed;
        self.conflicts += other.conflicts;
        self.errors.extend(other.errors);
        self.escalated |= other.escalated;
        self.recovered.merge(other.recovered);
        self.documents.extend(other.documents);
        self.touched.extend(other.touched);
    }

    /// Fill in the terminal state of every touched document.
    pub async fn finish(&mut self, storage: &Storage) -> Result<()> {
        let mut docs = Vec::new();
        for fp in &self.touched {
            if let Some(doc) = storage.get_source_document(fp).await? {
                docs.push(doc);
            }
        }
        self.documents = describe_documents(storage, &docs).await?;
        Ok(())
    }

    /// Exit status: every touched document reached a non-blocking state and
    /// no store or log write failed.
    pub fn is_success(&self) -> bool {
        !self.escalated
            && self.quarantined == 0
            && self.documents.iter().all(|d| !d.state.is_blocking())
    }
}
