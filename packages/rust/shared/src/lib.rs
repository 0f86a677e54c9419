//! Shared types, error model, and configuration for vaultgate.
//!
//! This crate is the foundation depended on by all other vaultgate crates.
//! It provides:
//! - [`VaultgateError`]: the unified error type
//! - Domain types ([`WorkUnit`], [`Artifact`], [`StagingRecord`], [`WalEntry`], ...)
//! - Configuration ([`AppConfig`], [`PipelineSettings`], config loading)
//! - The physical [`StorageLayout`]

pub mod config;
pub mod error;
pub mod layout;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, IndexerConfig, PipelineSettings, ProcessorConfig, StorageConfig, TransformConfig,
    TransformKind, TransformsConfig, WalConfig, WatcherConfig, config_dir, config_file_path,
    init_config, load_config, load_config_from, validate_config,
};
pub use error::{Result, VaultgateError};
pub use layout::StorageLayout;
pub use types::{
    Artifact, Bucket, Decision, Fingerprint, IndexPartition, OpKind, OperationId, Outcome, Phase,
    SourceDocument, StagingRecord, VaultArtifact, VaultCategory, VectorIndexEntry, WalEntry,
    WorkStatus, WorkUnit, artifact_id, new_work_unit_id, slugify, vault_id,
};
