//! Core domain types for the ingestion → staging → approval → vault pipeline.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::VaultgateError;

// ---------------------------------------------------------------------------
// Fingerprint
// ---------------------------------------------------------------------------

/// SHA-256 content fingerprint (lowercase hex).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(pub String);

impl Fingerprint {
    /// Fingerprint raw bytes.
    pub fn of(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self(format!("{:x}", hasher.finalize()))
    }

    /// First 12 hex characters, for log lines and file names.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Phase
// ---------------------------------------------------------------------------

/// One of the two sequential processing phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    One,
    Two,
}

impl Phase {
    pub const ALL: [Phase; 2] = [Phase::One, Phase::Two];

    pub fn number(self) -> u8 {
        match self {
            Self::One => 1,
            Self::Two => 2,
        }
    }

    pub fn from_number(n: i64) -> Option<Self> {
        match n {
            1 => Some(Self::One),
            2 => Some(Self::Two),
            _ => None,
        }
    }

    /// The phase an approved artifact is promoted into, if any.
    pub fn next(self) -> Option<Self> {
        match self {
            Self::One => Some(Self::Two),
            Self::Two => None,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "phase{}", self.number())
    }
}

impl FromStr for Phase {
    type Err = VaultgateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.trim_start_matches("phase");
        digits
            .parse::<i64>()
            .ok()
            .and_then(Self::from_number)
            .ok_or_else(|| VaultgateError::validation(format!("unknown phase '{s}'")))
    }
}

// ---------------------------------------------------------------------------
// Staging buckets
// ---------------------------------------------------------------------------

/// Holding state of an artifact before promotion.
///
/// Transitions are one-directional: `Pending → Approved` or `Pending → Rejected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Bucket {
    Pending,
    Approved,
    Rejected,
}

impl Bucket {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    /// Whether a move from `self` to `to` is a legal transition.
    pub fn can_move_to(self, to: Bucket) -> bool {
        matches!(
            (self, to),
            (Self::Pending, Self::Approved) | (Self::Pending, Self::Rejected)
        )
    }

    /// Physical bucket name: per-phase pending/approved, one shared rejected.
    pub fn logical_name(self, phase: Phase) -> String {
        match self {
            Self::Rejected => "rejected".to_string(),
            other => format!("{phase}_{}", other.as_str()),
        }
    }
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Bucket {
    type Err = VaultgateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            other => Err(VaultgateError::validation(format!("unknown bucket '{other}'"))),
        }
    }
}

/// An external approval decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approve,
    Reject,
}

impl Decision {
    /// Bucket the artifact lands in when this decision is applied.
    pub fn target_bucket(self) -> Bucket {
        match self {
            Self::Approve => Bucket::Approved,
            Self::Reject => Bucket::Rejected,
        }
    }
}

impl FromStr for Decision {
    type Err = VaultgateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approve" | "approved" => Ok(Self::Approve),
            "reject" | "rejected" => Ok(Self::Reject),
            other => Err(VaultgateError::validation(format!(
                "unknown decision '{other}': expected 'approve' or 'reject'"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Work units
// ---------------------------------------------------------------------------

/// Lifecycle status of a [`WorkUnit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    Queued,
    Running,
    Staged,
    Approved,
    Rejected,
    Failed,
}

impl WorkStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Staged => "staged",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for WorkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkStatus {
    type Err = VaultgateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "staged" => Ok(Self::Staged),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            "failed" => Ok(Self::Failed),
            other => Err(VaultgateError::validation(format!(
                "unknown work unit status '{other}'"
            ))),
        }
    }
}

/// A discovered source document. Immutable once ingested.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceDocument {
    pub fingerprint: Fingerprint,
    /// Path the document was discovered at.
    pub original_path: String,
    /// Content-addressed location of the raw bytes.
    pub blob_ref: String,
    pub size_bytes: u64,
    pub ingested_at: DateTime<Utc>,
}

/// A document (or an approved artifact of it) bound to one phase attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkUnit {
    /// UUID v7 (time-sortable).
    pub id: String,
    /// Fingerprint of the source document this lineage started from.
    pub document: Fingerprint,
    pub phase: Phase,
    /// Mutual-exclusion subject: the document fingerprint for phase 1,
    /// the approved phase-1 artifact id for phase 2.
    pub subject: String,
    /// Monotonic per (subject, phase).
    pub attempt: u32,
    pub status: WorkStatus,
    /// Blob reference of the transformation input.
    pub input_ref: String,
    /// Reviewer note carried over from the upstream approval.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Generate a new time-sortable work unit identifier.
pub fn new_work_unit_id() -> String {
    Uuid::now_v7().to_string()
}

// ---------------------------------------------------------------------------
// Artifacts & staging
// ---------------------------------------------------------------------------

/// A discrete output of a phase transformation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub id: String,
    pub work_unit_id: String,
    pub phase: Phase,
    pub ordinal: u32,
    /// Fingerprint of the payload bytes.
    pub fingerprint: Fingerprint,
    /// Content-addressed payload location.
    pub payload_ref: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Vault category requested by the transformation (phase 2 only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<VaultCategory>,
    pub created_at: DateTime<Utc>,
}

/// Deterministic artifact identifier: `<work unit id>.<ordinal>`.
pub fn artifact_id(work_unit_id: &str, ordinal: u32) -> String {
    format!("{work_unit_id}.{ordinal}")
}

/// The single current bucket of an artifact within its phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagingRecord {
    pub artifact_id: String,
    pub phase: Phase,
    pub bucket: Bucket,
    /// Reviewer note recorded with the decision.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Durable log
// ---------------------------------------------------------------------------

/// Identifier of a logged operation (UUID v7).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(pub String);

impl OperationId {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of a logged operation. The phase is part of the kind so recovery can
/// be scoped to the worker that owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpKind {
    Ingest,
    Process(Phase),
    Stage,
    Promote(Phase),
    Index,
}

impl OpKind {
    pub const ALL: [OpKind; 7] = [
        OpKind::Ingest,
        OpKind::Process(Phase::One),
        OpKind::Process(Phase::Two),
        OpKind::Stage,
        OpKind::Promote(Phase::One),
        OpKind::Promote(Phase::Two),
        OpKind::Index,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ingest => "ingest",
            Self::Process(Phase::One) => "process:1",
            Self::Process(Phase::Two) => "process:2",
            Self::Stage => "stage",
            Self::Promote(Phase::One) => "promote:1",
            Self::Promote(Phase::Two) => "promote:2",
            Self::Index => "index",
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OpKind {
    type Err = VaultgateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| VaultgateError::validation(format!("unknown operation kind '{s}'")))
    }
}

/// Terminal outcome of a logged operation; also the name of its log partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Completed,
    Failed,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for Outcome {
    type Err = VaultgateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(VaultgateError::validation(format!("unknown outcome '{other}'"))),
        }
    }
}

/// A logged operation as seen by readers: its begin record plus, once
/// finished, its terminal outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalEntry {
    pub op_id: OperationId,
    pub kind: OpKind,
    /// Work unit, artifact, fingerprint or vault id the operation targets.
    pub target: String,
    /// Free-form detail recorded with `begin` (e.g. the intended move).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub begun_at: DateTime<Utc>,
    /// `None` while the operation is in-doubt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Outcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Lease of the process that began the operation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
}

impl WalEntry {
    pub fn is_in_doubt(&self) -> bool {
        self.outcome.is_none()
    }
}

// ---------------------------------------------------------------------------
// Vault & index
// ---------------------------------------------------------------------------

/// Category a vault artifact is filed under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VaultCategory {
    Note,
    Reference,
    Summary,
}

impl VaultCategory {
    pub const ALL: [VaultCategory; 3] = [Self::Note, Self::Reference, Self::Summary];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Note => "note",
            Self::Reference => "reference",
            Self::Summary => "summary",
        }
    }

    /// Vault subdirectory for this category.
    pub fn dir_name(self) -> &'static str {
        match self {
            Self::Note => "notes",
            Self::Reference => "references",
            Self::Summary => "summaries",
        }
    }

    /// References are evidence-grade excerpts and live in the chunk partition.
    pub fn partition(self) -> IndexPartition {
        match self {
            Self::Reference => IndexPartition::Chunk,
            Self::Note | Self::Summary => IndexPartition::Artifact,
        }
    }
}

impl fmt::Display for VaultCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VaultCategory {
    type Err = VaultgateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "note" => Ok(Self::Note),
            "reference" => Ok(Self::Reference),
            "summary" => Ok(Self::Summary),
            other => Err(VaultgateError::validation(format!(
                "unknown vault category '{other}'"
            ))),
        }
    }
}

/// A permanently promoted artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultArtifact {
    /// Content-addressed id (see [`vault_id`]).
    pub id: String,
    /// The approved phase-2 artifact this was promoted from.
    pub source_artifact_id: String,
    pub document: Fingerprint,
    pub category: VaultCategory,
    pub title: String,
    pub slug: String,
    /// Path relative to the vault root.
    pub path: String,
    pub fingerprint: Fingerprint,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supersedes: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Content-addressed vault identifier.
pub fn vault_id(fingerprint: &Fingerprint) -> String {
    format!("v_{}", &fingerprint.0[..fingerprint.0.len().min(24)])
}

/// Retrieval partition of a vector index entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexPartition {
    Chunk,
    Artifact,
}

impl IndexPartition {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Chunk => "chunk",
            Self::Artifact => "artifact",
        }
    }
}

impl FromStr for IndexPartition {
    type Err = VaultgateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "chunk" => Ok(Self::Chunk),
            "artifact" => Ok(Self::Artifact),
            other => Err(VaultgateError::validation(format!(
                "unknown index partition '{other}'"
            ))),
        }
    }
}

/// Derived retrieval representation of a vault artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorIndexEntry {
    pub vault_artifact_id: String,
    pub partition: IndexPartition,
    pub model: String,
    pub dims: usize,
    /// Embedding as little-endian `f32` values.
    #[serde(skip)]
    pub embedding: Vec<f32>,
    /// Fingerprint of the content that was embedded.
    pub content_hash: Fingerprint,
    pub indexed_at: DateTime<Utc>,
}

/// Lowercase ASCII slug for file names (`"Ownership & Borrowing"` → `"ownership-borrowing"`).
pub fn slugify(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    let mut dash = false;
    for c in title.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            dash = false;
        } else if !dash && !slug.is_empty() {
            slug.push('-');
            dash = true;
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    slug.truncate(64);
    if slug.is_empty() {
        "untitled".to_string()
    } else {
        slug
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_sha256_hex() {
        let fp = Fingerprint::of(b"hello");
        assert_eq!(
            fp.as_str(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert_eq!(fp.short(), "2cf24dba5fb0");
    }

    #[test]
    fn bucket_transitions_are_one_directional() {
        assert!(Bucket::Pending.can_move_to(Bucket::Approved));
        assert!(Bucket::Pending.can_move_to(Bucket::Rejected));
        assert!(!Bucket::Approved.can_move_to(Bucket::Pending));
        assert!(!Bucket::Rejected.can_move_to(Bucket::Approved));
        assert!(!Bucket::Approved.can_move_to(Bucket::Rejected));
        assert!(!Bucket::Pending.can_move_to(Bucket::Pending));
    }

    #[test]
    fn bucket_logical_names() {
        assert_eq!(Bucket::Pending.logical_name(Phase::One), "phase1_pending");
        assert_eq!(Bucket::Approved.logical_name(Phase::Two), "phase2_approved");
        assert_eq!(Bucket::Rejected.logical_name(Phase::Two), "rejected");
    }

    #[test]
    fn op_kind_parses_its_own_labels() {
        for kind in OpKind::ALL {
            let parsed: OpKind = kind.as_str().parse().expect("parse kind");
            assert_eq!(parsed, kind);
        }
        assert!("process:3".parse::<OpKind>().is_err());
    }

    #[test]
    fn phase_parsing() {
        assert_eq!("1".parse::<Phase>().unwrap(), Phase::One);
        assert_eq!("phase2".parse::<Phase>().unwrap(), Phase::Two);
        assert!("3".parse::<Phase>().is_err());
        assert_eq!(Phase::One.next(), Some(Phase::Two));
        assert_eq!(Phase::Two.next(), None);
    }

    #[test]
    fn decision_targets() {
        assert_eq!("approve".parse::<Decision>().unwrap().target_bucket(), Bucket::Approved);
        assert_eq!("reject".parse::<Decision>().unwrap().target_bucket(), Bucket::Rejected);
        assert!("maybe".parse::<Decision>().is_err());
    }

    #[test]
    fn slugify_titles() {
        assert_eq!(slugify("Ownership & Borrowing"), "ownership-borrowing");
        assert_eq!(slugify("  --  "), "untitled");
        assert_eq!(slugify("Día 3: Traits"), "d-a-3-traits");
    }

    #[test]
    fn reference_category_indexes_at_chunk_level() {
        assert_eq!(VaultCategory::Reference.partition(), IndexPartition::Chunk);
        assert_eq!(VaultCategory::Note.partition(), IndexPartition::Artifact);
        assert_eq!(VaultCategory::Summary.partition(), IndexPartition::Artifact);
    }

    #[test]
    fn vault_id_is_content_addressed() {
        let a = Fingerprint::of(b"same");
        let b = Fingerprint::of(b"same");
        assert_eq!(vault_id(&a), vault_id(&b));
        assert_eq!(vault_id(&a).len(), 2 + 24);
    }

    #[test]
    fn work_unit_serialization() {
        let unit = WorkUnit {
            id: new_work_unit_id(),
            document: Fingerprint::of(b"doc"),
            phase: Phase::One,
            subject: Fingerprint::of(b"doc").0,
            attempt: 1,
            status: WorkStatus::Queued,
            input_ref: "ab/abcd".into(),
            note: None,
            error: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let json = serde_json::to_string(&unit).expect("serialize");
        assert!(!json.contains("\"error\""));
        let parsed: WorkUnit = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed.status, WorkStatus::Queued);
        assert_eq!(parsed.phase, Phase::One);
    }
}
