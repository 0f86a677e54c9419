//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::watch;
use tracing::info;

use vaultgate_core::{
    DecideOutcome, Pipeline, ProgressReporter, RunMode, RunReport, describe_documents,
};
use vaultgate_shared::{
    AppConfig, Bucket, Decision, Outcome, Phase, PipelineSettings, StorageLayout, init_config,
    load_config, load_config_from, validate_config,
};
use vaultgate_storage::Storage;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// vaultgate: a staged, human-gated document pipeline.
#[derive(Parser)]
#[command(
    name = "vaultgate",
    version,
    about = "Move documents through chunking, review and refinement into a searchable vault.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Base directory of every storage area (overrides `[storage] base_dir`).
    #[arg(long, global = true, env = "VAULTGATE_BASE")]
    pub base: Option<PathBuf>,

    /// Config file to load instead of `~/.vaultgate/vaultgate.toml`.
    #[arg(long, global = true, env = "VAULTGATE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Watch the intake area and enqueue new documents.
    RunWatcher {
        /// Process the current intake backlog and exit.
        #[arg(long)]
        once: bool,
    },

    /// Run a phase processor (phase 2 first promotes phase-1 approvals).
    RunProcessor {
        /// Phase number: 1 or 2.
        phase: Phase,

        /// Drain the current queue and exit.
        #[arg(long)]
        once: bool,
    },

    /// Promote phase-2 approvals into the vault and index them.
    RunPromoter {
        #[arg(long)]
        once: bool,
    },

    /// Run every worker.
    Run {
        /// One pass of every worker in pipeline order, then exit.
        #[arg(long)]
        once: bool,
    },

    /// Resolve every in-doubt operation in the durable log.
    Recover,

    /// Approve or reject a pending artifact.
    Decide {
        /// Artifact id as shown by `pending`.
        artifact: String,

        /// `approve` or `reject`.
        decision: Decision,

        /// Reviewer note carried into the next phase.
        #[arg(long)]
        note: Option<String>,
    },

    /// List artifacts awaiting a decision.
    Pending {
        /// Restrict to one phase.
        #[arg(long)]
        phase: Option<Phase>,
    },

    /// Show the state of every known document.
    Status {
        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },

    /// Inspect or prune the durable log.
    Wal {
        #[command(subcommand)]
        action: WalAction,
    },

    /// Inspect the vault.
    Vault {
        #[command(subcommand)]
        action: VaultAction,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Durable log subcommands.
#[derive(Subcommand)]
pub(crate) enum WalAction {
    /// List finished operations, newest first.
    List {
        /// Show the failed partition instead of the completed one.
        #[arg(long, conflicts_with = "completed")]
        failed: bool,

        #[arg(long)]
        completed: bool,

        #[arg(long, default_value = "50")]
        limit: u32,
    },
    /// List operations that began but never finished.
    InDoubt,
    /// Delete finished entries older than the cutoff.
    Sweep {
        /// Age cutoff in days (defaults to `[wal] retention_days`).
        #[arg(long)]
        older_than_days: Option<u32>,

        /// Also delete failed entries.
        #[arg(long)]
        include_failed: bool,
    },
}

/// Vault subcommands.
#[derive(Subcommand)]
pub(crate) enum VaultAction {
    /// List vault artifacts.
    List,
    /// Count vault artifacts per category and index entries per partition.
    Stats,
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "vaultgate=info",
        1 => "vaultgate=debug",
        _ => "vaultgate=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<ExitCode> {
    // Init writes the file the other commands would load.
    if let Command::Config {
        action: ConfigAction::Init,
    } = &cli.command
    {
        return cmd_config_init(cli.config.as_deref());
    }

    let config = resolve_config(&cli)?;
    let settings = PipelineSettings::from(&config);

    match cli.command {
        Command::RunWatcher { once } => {
            let pipeline = Pipeline::open(settings, &config.transform).await?;
            let progress = CliProgress::new();
            let report = pipeline.run_watcher(run_mode(once), &progress).await?;
            pipeline.close().await?;
            Ok(finish_run("Watcher", &report))
        }
        Command::RunProcessor { phase, once } => {
            let pipeline = Pipeline::open(settings, &config.transform).await?;
            let progress = CliProgress::new();
            let report = pipeline
                .run_processor(phase, run_mode(once), &progress)
                .await?;
            pipeline.close().await?;
            Ok(finish_run(&format!("Processor {phase}"), &report))
        }
        Command::RunPromoter { once } => {
            let pipeline = Pipeline::open(settings, &config.transform).await?;
            let progress = CliProgress::new();
            let report = pipeline.run_promoter(run_mode(once), &progress).await?;
            pipeline.close().await?;
            Ok(finish_run("Promoter", &report))
        }
        Command::Run { once } => {
            let pipeline = Pipeline::open(settings, &config.transform).await?;
            let progress = CliProgress::new();
            let report = pipeline.run_all(run_mode(once), &progress).await?;
            pipeline.close().await?;
            Ok(finish_run("Pipeline", &report))
        }
        Command::Recover => cmd_recover(settings, &config).await,
        Command::Decide {
            artifact,
            decision,
            note,
        } => cmd_decide(settings, &config, &artifact, decision, note.as_deref()).await,
        Command::Pending { phase } => cmd_pending(&settings, phase).await,
        Command::Status { json } => cmd_status(&settings, json).await,
        Command::Wal { action } => match action {
            WalAction::List { failed, limit, .. } => cmd_wal_list(&settings, failed, limit).await,
            WalAction::InDoubt => cmd_wal_in_doubt(&settings).await,
            WalAction::Sweep {
                older_than_days,
                include_failed,
            } => {
                let days = older_than_days.unwrap_or(config.wal.retention_days);
                cmd_wal_sweep(&settings, days, include_failed).await
            }
        },
        Command::Vault { action } => match action {
            VaultAction::List => cmd_vault_list(&settings).await,
            VaultAction::Stats => cmd_vault_stats(&settings).await,
        },
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(cli.config.as_deref()),
            ConfigAction::Show => cmd_config_show(&config),
        },
    }
}

/// Config file (or defaults) with CLI flags applied on top.
fn resolve_config(cli: &Cli) -> Result<AppConfig> {
    let mut config = match &cli.config {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };
    if let Some(base) = &cli.base {
        config.storage.base_dir = base.to_string_lossy().to_string();
    }
    validate_config(&config)?;
    Ok(config)
}

/// `Continuous` modes stop on Ctrl-C once in-flight work has settled.
fn run_mode(once: bool) -> RunMode {
    if once {
        return RunMode::Once;
    }
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested, finishing in-flight work");
            let _ = tx.send(true);
        }
    });
    RunMode::Continuous(rx)
}

async fn open_readonly(settings: &PipelineSettings) -> Result<Storage> {
    let layout = StorageLayout::new(&settings.base_dir);
    let db = layout.db_path();
    if !db.exists() {
        return Err(eyre!(
            "no state database at '{}' (nothing has run here yet)",
            db.display()
        ));
    }
    Ok(Storage::open_readonly(&db).await?)
}

// ---------------------------------------------------------------------------
// Worker summaries
// ---------------------------------------------------------------------------

fn finish_run(worker: &str, report: &RunReport) -> ExitCode {
    println!();
    println!("  {worker} finished");
    let recovered = &report.recovered;
    if !recovered.is_empty() {
        println!(
            "  Recovered:   {} committed, {} failed, {} requeued",
            recovered.committed, recovered.failed, recovered.requeued
        );
    }
    println!(
        "  Ingested:    {} ({} duplicates, {} quarantined)",
        report.ingested, report.duplicates, report.quarantined
    );
    println!(
        "  Processed:   {} ({} already done)",
        report.processed, report.cached
    );
    println!("  Promoted:    {}", report.promoted);
    println!("  Indexed:     {}", report.indexed);
    if report.conflicts > 0 {
        println!("  Conflicts:   {}", report.conflicts);
    }
    for err in &report.errors {
        println!("  Error:       {err}");
    }
    for doc in &report.documents {
        println!(
            "  {}  {:<16} {}",
            doc.fingerprint.short(),
            doc.state.label(),
            doc.original_path
        );
    }
    println!();

    if report.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { spinner }
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, name: &str) {
        self.spinner.set_message(name.to_string());
    }

    fn item(&self, label: &str, current: usize, total: usize) {
        self.spinner.set_message(format!("[{current}/{total}] {label}"));
    }

    fn done(&self, _report: &RunReport) {
        self.spinner.finish_and_clear();
    }
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_recover(settings: PipelineSettings, config: &AppConfig) -> Result<ExitCode> {
    let pipeline = Pipeline::open(settings, &config.transform).await?;
    let report = pipeline.recover_all().await?;
    pipeline.close().await?;
    println!("  Committed:  {}", report.committed);
    println!("  Failed:     {}", report.failed);
    println!("  Requeued:   {}", report.requeued);
    Ok(ExitCode::SUCCESS)
}

async fn cmd_decide(
    settings: PipelineSettings,
    config: &AppConfig,
    artifact: &str,
    decision: Decision,
    note: Option<&str>,
) -> Result<ExitCode> {
    let pipeline = Pipeline::open(settings, &config.transform).await?;
    let outcome = pipeline.decide(artifact, decision, note).await;
    pipeline.close().await?;
    match outcome? {
        DecideOutcome::Applied(record) => {
            println!("{artifact}: {} ({})", record.bucket, record.phase);
        }
        DecideOutcome::AlreadyRecorded(record) => {
            println!("{artifact}: already {} ({})", record.bucket, record.phase);
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn cmd_pending(settings: &PipelineSettings, phase: Option<Phase>) -> Result<ExitCode> {
    let storage = open_readonly(settings).await?;
    let pending = storage.staged_artifacts(phase, Bucket::Pending).await?;
    if pending.is_empty() {
        println!("Nothing awaits a decision.");
        return Ok(ExitCode::SUCCESS);
    }
    for staged in pending {
        let a = &staged.artifact;
        println!(
            "{:<40} {:<16} {}  {}",
            a.id,
            Bucket::Pending.logical_name(a.phase),
            a.created_at.format("%Y-%m-%d %H:%M"),
            a.title.as_deref().unwrap_or("(untitled)")
        );
    }
    Ok(ExitCode::SUCCESS)
}

async fn cmd_status(settings: &PipelineSettings, json: bool) -> Result<ExitCode> {
    let storage = open_readonly(settings).await?;
    let docs = storage.list_source_documents().await?;
    let reports = describe_documents(&storage, &docs).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    } else {
        for doc in &reports {
            println!(
                "{}  {:<40} {}",
                doc.fingerprint.short(),
                doc.state.to_string(),
                doc.original_path
            );
        }
    }

    if reports.iter().any(|d| d.state.is_blocking()) {
        Ok(ExitCode::FAILURE)
    } else {
        Ok(ExitCode::SUCCESS)
    }
}

async fn cmd_wal_list(settings: &PipelineSettings, failed: bool, limit: u32) -> Result<ExitCode> {
    let storage = open_readonly(settings).await?;
    let outcome = if failed {
        Outcome::Failed
    } else {
        Outcome::Completed
    };
    for entry in storage.wal().partition(outcome, limit).await? {
        let finished = entry
            .finished_at
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_default();
        println!(
            "{}  {:<10} {:<40} {}",
            finished,
            entry.kind.as_str(),
            entry.target,
            entry.reason.as_deref().unwrap_or("")
        );
    }
    Ok(ExitCode::SUCCESS)
}

async fn cmd_wal_in_doubt(settings: &PipelineSettings) -> Result<ExitCode> {
    let storage = open_readonly(settings).await?;
    let open = storage.wal().in_doubt().await?;
    if open.is_empty() {
        println!("No in-doubt operations.");
        return Ok(ExitCode::SUCCESS);
    }
    for entry in &open {
        let owner = match entry.owner.as_deref() {
            Some(owner) if storage.lease_is_live(owner).await? => "running",
            _ => "orphaned",
        };
        println!(
            "{}  {}  {:<10} {:<40} {}",
            entry.op_id,
            entry.begun_at.format("%Y-%m-%d %H:%M:%S"),
            entry.kind.as_str(),
            entry.target,
            owner
        );
    }
    Ok(ExitCode::FAILURE)
}

async fn cmd_wal_sweep(
    settings: &PipelineSettings,
    older_than_days: u32,
    include_failed: bool,
) -> Result<ExitCode> {
    let layout = StorageLayout::new(&settings.base_dir);
    let storage = Storage::open(&layout.db_path()).await?;
    let cutoff = chrono::Utc::now() - chrono::Duration::days(i64::from(older_than_days));
    let removed = storage.wal().sweep(cutoff, include_failed).await?;
    info!(removed, older_than_days, include_failed, "log swept");
    println!("Removed {removed} finished log entries older than {older_than_days} days.");
    Ok(ExitCode::SUCCESS)
}

async fn cmd_vault_list(settings: &PipelineSettings) -> Result<ExitCode> {
    let storage = open_readonly(settings).await?;
    for vault in storage.list_vault_artifacts().await? {
        let marker = if vault.supersedes.is_some() { "*" } else { " " };
        println!(
            "{} {:<10} {:<40} {}",
            marker,
            vault.category.as_str(),
            vault.title,
            vault.path
        );
    }
    Ok(ExitCode::SUCCESS)
}

async fn cmd_vault_stats(settings: &PipelineSettings) -> Result<ExitCode> {
    let storage = open_readonly(settings).await?;
    let stats = storage.vault_stats().await?;
    println!("  Vault artifacts:");
    for (category, count) in &stats.per_category {
        println!("    {:<10} {count}", category.as_str());
    }
    println!("  Index entries:");
    for (partition, count) in &stats.per_partition {
        println!("    {:<10} {count}", partition.as_str());
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_config_init(path: Option<&Path>) -> Result<ExitCode> {
    let path = match path {
        Some(path) => {
            let content = toml::to_string_pretty(&AppConfig::default())?;
            std::fs::write(path, content)?;
            path.to_path_buf()
        }
        None => init_config()?,
    };
    println!("Config initialized at: {}", path.display());
    Ok(ExitCode::SUCCESS)
}

fn cmd_config_show(config: &AppConfig) -> Result<ExitCode> {
    let toml_str = toml::to_string_pretty(config)?;
    println!("{toml_str}");
    Ok(ExitCode::SUCCESS)
}
