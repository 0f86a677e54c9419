//! Core pipeline orchestration for vaultgate.
//!
//! This crate ties the state database to the workers that move a document
//! through its lifeline: intake → phase 1 → approval → phase 2 → approval →
//! vault + index.

pub mod gate;
pub mod indexer;
pub mod pipeline;
pub mod processor;
pub mod promoter;
pub mod recovery;
pub mod report;
pub mod transform;
pub mod vault;
pub mod watcher;

#[cfg(test)]
mod scenarios;

use vaultgate_shared::{OperationId, VaultgateError};
use vaultgate_storage::Storage;

pub use gate::{ApprovalGate, DecideOutcome};
pub use indexer::{Embedder, HashEmbedder, Indexer};
pub use pipeline::{Pipeline, ProgressReporter, RunMode, SilentProgress};
pub use processor::{ProcessOutcome, Processor};
pub use promoter::{PromoteOutcome, Promoter};
pub use recovery::{RecoveryReport, recover};
pub use report::{DocumentReport, DocumentState, RunReport, describe_documents};
pub use transform::{
    ArtifactDraft, CommandTransform, NoteWriter, SectionChunker, Transform, TransformInput,
    TransformOutput, build_transform,
};
pub use watcher::{IngestOutcome, Watcher};

/// Settle an operation whose side effect did not happen.
///
/// Escalated errors leave the operation in-doubt for recovery; anything
/// else records it as failed. Returns the error to propagate.
pub(crate) async fn abandon(storage: &Storage, op: &OperationId, err: VaultgateError) -> VaultgateError {
    if err.is_escalated() {
        return err;
    }
    match storage.wal().fail(op, &err.to_string()).await {
        Ok(()) => err,
        Err(log_err) => log_err,
    }
}
