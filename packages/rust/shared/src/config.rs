//! Application configuration for vaultgate.
//!
//! User config lives at `~/.vaultgate/vaultgate.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, VaultgateError};
use crate::types::Phase;

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "vaultgate.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".vaultgate";

// ---------------------------------------------------------------------------
// Config structs (matching vaultgate.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub watcher: WatcherConfig,

    #[serde(default)]
    pub processor: ProcessorConfig,

    /// Per-phase transformation capabilities.
    #[serde(default)]
    pub transform: TransformsConfig,

    #[serde(default)]
    pub indexer: IndexerConfig,

    #[serde(default)]
    pub wal: WalConfig,
}

/// `[storage]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Base directory every storage area is rooted at.
    #[serde(default = "default_base_dir")]
    pub base_dir: String,

    /// Seconds a worker process's lease outlives its last renewal. Work
    /// left in-doubt by a process is only recovered after its lease ends.
    #[serde(default = "default_lease_ttl")]
    pub lease_ttl_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            lease_ttl_secs: default_lease_ttl(),
        }
    }
}

fn default_lease_ttl() -> u64 {
    60
}

fn default_base_dir() -> String {
    "./data".into()
}

/// `[watcher]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherConfig {
    /// Seconds between intake scans in continuous mode.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// File extensions (without dot) accepted from the intake area.
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            extensions: default_extensions(),
        }
    }
}

fn default_poll_interval() -> u64 {
    2
}
fn default_extensions() -> Vec<String> {
    vec!["md".into(), "txt".into()]
}

/// `[processor]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorConfig {
    /// Maximum work units transformed concurrently per phase.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Upper bound on one transformation invocation.
    #[serde(default = "default_transform_timeout")]
    pub transform_timeout_secs: u64,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            transform_timeout_secs: default_transform_timeout(),
        }
    }
}

fn default_concurrency() -> usize {
    4
}
fn default_transform_timeout() -> u64 {
    120
}

/// `[transform]` section with one table per phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformsConfig {
    #[serde(default = "default_phase1_transform")]
    pub phase1: TransformConfig,

    #[serde(default = "default_phase2_transform")]
    pub phase2: TransformConfig,
}

impl Default for TransformsConfig {
    fn default() -> Self {
        Self {
            phase1: default_phase1_transform(),
            phase2: default_phase2_transform(),
        }
    }
}

impl TransformsConfig {
    pub fn for_phase(&self, phase: Phase) -> &TransformConfig {
        match phase {
            Phase::One => &self.phase1,
            Phase::Two => &self.phase2,
        }
    }
}

/// How a phase transformation is supplied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformKind {
    /// The in-process default (section chunker / note writer).
    Builtin,
    /// An external program speaking JSON over stdin/stdout.
    Command,
}

/// `[transform.phaseN]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformConfig {
    #[serde(default = "default_transform_kind")]
    pub kind: TransformKind,

    /// Program and arguments, required when `kind = "command"`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,

    /// Upper bound on the size of one chunk (builtin chunker).
    #[serde(default = "default_max_chunk_chars")]
    pub max_chunk_chars: usize,
}

fn default_transform_kind() -> TransformKind {
    TransformKind::Builtin
}
fn default_max_chunk_chars() -> usize {
    4000
}
fn default_phase1_transform() -> TransformConfig {
    TransformConfig {
        kind: TransformKind::Builtin,
        command: Vec::new(),
        max_chunk_chars: default_max_chunk_chars(),
    }
}
fn default_phase2_transform() -> TransformConfig {
    default_phase1_transform()
}

/// `[indexer]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexerConfig {
    /// Embedding dimension of the built-in hash embedder.
    #[serde(default = "default_dims")]
    pub dims: usize,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            dims: default_dims(),
        }
    }
}

fn default_dims() -> usize {
    384
}

/// `[wal]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalConfig {
    /// Default age cutoff for `wal sweep`.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            retention_days: default_retention_days(),
        }
    }
}

fn default_retention_days() -> u32 {
    30
}

// ---------------------------------------------------------------------------
// Pipeline settings (runtime, merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// Runtime pipeline configuration, merged from config file + CLI flags.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub base_dir: PathBuf,
    pub poll_interval: Duration,
    pub extensions: Vec<String>,
    pub concurrency: usize,
    pub transform_timeout: Duration,
    pub embedding_dims: usize,
    pub lease_ttl: Duration,
}

impl From<&AppConfig> for PipelineSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            base_dir: PathBuf::from(&config.storage.base_dir),
            poll_interval: Duration::from_secs(config.watcher.poll_interval_secs.max(1)),
            extensions: config
                .watcher
                .extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
            concurrency: config.processor.concurrency.max(1),
            transform_timeout: Duration::from_secs(config.processor.transform_timeout_secs.max(1)),
            embedding_dims: config.indexer.dims,
            lease_ttl: Duration::from_secs(config.storage.lease_ttl_secs.max(3)),
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.vaultgate/`).
pub fn config_dir() -> Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| VaultgateError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.vaultgate/vaultgate.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| VaultgateError::io(path, e))?;

    let config: AppConfig = toml::from_str(&content).map_err(|e| {
        VaultgateError::config(format!("failed to parse {}: {e}", path.display()))
    })?;
    validate_config(&config)?;
    Ok(config)
}

/// Reject configurations that cannot be turned into a running pipeline.
pub fn validate_config(config: &AppConfig) -> Result<()> {
    for phase in Phase::ALL {
        let t = config.transform.for_phase(phase);
        if t.kind == TransformKind::Command && t.command.is_empty() {
            return Err(VaultgateError::config(format!(
                "[transform.{phase}] kind = \"command\" requires a non-empty `command`"
            )));
        }
        if t.max_chunk_chars == 0 {
            return Err(VaultgateError::config(format!(
                "[transform.{phase}] max_chunk_chars must be positive"
            )));
        }
    }
    if config.indexer.dims == 0 {
        return Err(VaultgateError::config("[indexer] dims must be positive"));
    }
    Ok(())
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| VaultgateError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| VaultgateError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| VaultgateError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("base_dir"));
        assert!(toml_str.contains("transform_timeout_secs"));
        assert!(toml_str.contains("[transform.phase1]"));
    }

    #[test]
    fn config_roundtrip() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        let parsed: AppConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.processor.concurrency, 4);
        assert_eq!(parsed.indexer.dims, 384);
        assert_eq!(parsed.transform.phase2.kind, TransformKind::Builtin);
    }

    #[test]
    fn config_with_command_transform() {
        let toml_str = r#"
[storage]
base_dir = "/srv/vault"

[transform.phase2]
kind = "command"
command = ["python3", "summarize.py"]
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.storage.base_dir, "/srv/vault");
        assert_eq!(config.transform.phase1.kind, TransformKind::Builtin);
        assert_eq!(config.transform.phase2.command.len(), 2);
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn command_transform_without_program_is_rejected() {
        let toml_str = r#"
[transform.phase1]
kind = "command"
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("phase1"));
    }

    #[test]
    fn pipeline_settings_from_app_config() {
        let mut app = AppConfig::default();
        app.watcher.extensions = vec![".MD".into(), "txt".into()];
        app.processor.concurrency = 0;
        let settings = PipelineSettings::from(&app);
        assert_eq!(settings.extensions, vec!["md", "txt"]);
        assert_eq!(settings.concurrency, 1);
        assert_eq!(settings.transform_timeout, Duration::from_secs(120));
        assert_eq!(settings.base_dir, PathBuf::from("./data"));
        assert_eq!(settings.lease_ttl, Duration::from_secs(60));
    }

    #[test]
    fn load_config_from_missing_file_is_io_error() {
        let path = std::env::temp_dir().join(format!("vg_missing_{}.toml", uuid::Uuid::now_v7()));
        let err = load_config_from(&path).unwrap_err();
        assert!(matches!(err, VaultgateError::Io { .. }));
    }
}
