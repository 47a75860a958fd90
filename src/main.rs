//! `openalex-sync` command line.
//!
//! Exit status: `0` on success, `1` when a file failed to convert (`run`) or
//! the trees are inconsistent (`check`), `2` when the command itself could
//! not run (ledger unavailable, bad configuration).

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use openalex_sync::logging::{LogConfig, LogFormat, LogLevel, init_logging};
use openalex_sync::{
    ArrowConverter, EntityCategory, ExecMode, NormalizationPolicy, ProcessingLedger, SyncConfig,
    SyncEngine, integrity_report,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Debug, Parser)]
#[command(name = "openalex-sync", version, about = "Incremental JSONL.gz to Parquet sync")]
struct Cli {
    /// Project root holding data/, state/, logs/ and config/.
    #[arg(long, env = "OPENALEX_SYNC_ROOT", default_value = ".", global = true)]
    root: PathBuf,

    /// Source tree (default: <root>/data/source).
    #[arg(long, env = "OPENALEX_SYNC_SOURCE", global = true)]
    source: Option<PathBuf>,

    /// Destination tree (default: <root>/data/parquet).
    #[arg(long, env = "OPENALEX_SYNC_DEST", global = true)]
    dest: Option<PathBuf>,

    /// Ledger database (default: <root>/state/etl_state.db).
    #[arg(long, env = "OPENALEX_SYNC_LEDGER", global = true)]
    ledger: Option<PathBuf>,

    /// Normalization rules (default: <root>/config/schema_normalization.json).
    #[arg(long, env = "OPENALEX_SYNC_NORMALIZATION", global = true)]
    normalization: Option<PathBuf>,

    /// Restrict to these categories (comma separated).
    #[arg(long, value_delimiter = ',', global = true)]
    categories: Vec<EntityCategory>,

    /// Log level; overrides RUST_LOG.
    #[arg(long, env = "OPENALEX_SYNC_LOG_LEVEL", global = true)]
    log_level: Option<LogLevel>,

    #[arg(long, default_value = "text", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Convert new and changed files, then sweep orphans.
    Run {
        /// Clear the ledger of a category before the pass.
        #[arg(long = "force", value_name = "CATEGORY")]
        force: Vec<EntityCategory>,

        /// Convert files of a category on N threads (0 = one per CPU).
        #[arg(long, value_name = "N")]
        parallel: Option<usize>,

        /// Per-file conversion deadline in seconds.
        #[arg(long, value_name = "SECS")]
        timeout: Option<u64>,

        /// Records sampled for column introspection (default: all).
        #[arg(long, value_name = "ROWS")]
        sample_rows: Option<usize>,

        /// Skip the orphan sweep.
        #[arg(long)]
        no_reconcile: bool,

        /// Keep ledger rows of sources whose orphaned output was removed.
        #[arg(long)]
        keep_ledger_rows: bool,
    },
    /// Show per-category ledger aggregates.
    Stats,
    /// List files whose last conversion failed.
    Failures {
        #[arg(long)]
        category: Option<EntityCategory>,
    },
    /// Drop every ledger row of a category.
    Clear { category: EntityCategory },
    /// Compare source and destination trees without changing them.
    Check,
}

impl Cli {
    fn sync_config(&self) -> SyncConfig {
        let mut config = SyncConfig::from_project_root(&self.root);
        if let Some(source) = &self.source {
            config.source_root.clone_from(source);
        }
        if let Some(dest) = &self.dest {
            config.dest_root.clone_from(dest);
        }
        if let Some(ledger) = &self.ledger {
            config.ledger_path.clone_from(ledger);
        }
        if let Some(rules) = &self.normalization {
            config.normalization_path.clone_from(rules);
        }
        if !self.categories.is_empty() {
            config.categories.clone_from(&self.categories);
        }
        if let Command::Run {
            force,
            parallel,
            timeout,
            sample_rows,
            no_reconcile,
            keep_ledger_rows,
        } = &self.command
        {
            config.force_categories.clone_from(force);
            if let Some(n) = parallel {
                config.exec_mode = ExecMode::Parallel {
                    threads: (*n > 0).then_some(*n),
                };
            }
            config.file_timeout = timeout.map(Duration::from_secs);
            config.introspection_sample_rows = *sample_rows;
            config.reconcile_orphans = !no_reconcile;
            config.invalidate_orphan_ledger_rows = !keep_ledger_rows;
        }
        config
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = cli.sync_config();

    let log = LogConfig {
        level: cli.log_level,
        format: cli.log_format,
        file: matches!(cli.command, Command::Run { .. }).then(|| config.process_log.clone()),
    };
    let _guard = match init_logging(&log) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("warning: logging disabled: {e:#}");
            None
        }
    };

    match execute(&cli.command, config) {
        Ok(code) => code,
        Err(e) => {
            error!(error = %format!("{e:#}"), "command failed");
            ExitCode::from(2)
        }
    }
}

fn execute(command: &Command, config: SyncConfig) -> Result<ExitCode> {
    match command {
        Command::Run { .. } => run(config),
        Command::Stats => stats(&config),
        Command::Failures { category } => failures(&config, *category),
        Command::Clear { category } => {
            let ledger = ProcessingLedger::open(&config.ledger_path)?;
            let removed = ledger.clear_category(*category)?;
            info!(%category, rows = removed, "category cleared");
            Ok(ExitCode::SUCCESS)
        }
        Command::Check => check(&config),
    }
}

fn run(config: SyncConfig) -> Result<ExitCode> {
    let ledger = ProcessingLedger::open(&config.ledger_path)?;
    let policy = NormalizationPolicy::load(&config.normalization_path)?;
    let converter = ArrowConverter::new().with_sample_rows(config.introspection_sample_rows);

    let engine = SyncEngine::new(config, ledger, policy, converter);
    let report = engine.run().context("sync run aborted")?;

    let totals = report.stats.totals();
    if totals.failed > 0 {
        warn!(
            failed = totals.failed,
            error_log = %engine.config().error_log.display(),
            "some files failed to convert"
        );
    }
    Ok(ExitCode::from(u8::try_from(report.exit_code()).unwrap_or(1)))
}

fn stats(config: &SyncConfig) -> Result<ExitCode> {
    let ledger = ProcessingLedger::open(&config.ledger_path)?;
    let stats = ledger.stats()?;
    for (category, s) in &stats.categories {
        info!(
            %category,
            files = s.files,
            records = s.records,
            bytes = s.bytes,
            failures = s.failures,
            "ledger"
        );
    }
    info!(
        files = stats.total_files(),
        records = stats.total_records(),
        failures = stats.total_failures(),
        "ledger total"
    );
    Ok(ExitCode::SUCCESS)
}

fn failures(config: &SyncConfig, category: Option<EntityCategory>) -> Result<ExitCode> {
    let ledger = ProcessingLedger::open(&config.ledger_path)?;
    let entries = ledger.failures(category)?;
    for f in &entries {
        info!(
            path = %f.path.display(),
            category = %f.category,
            retries = f.retry_count,
            failed_at = %f.failed_at.to_rfc3339(),
            error = %f.message,
            "failed file"
        );
    }
    info!(count = entries.len(), "failures listed");
    Ok(ExitCode::SUCCESS)
}

fn check(config: &SyncConfig) -> Result<ExitCode> {
    let report = integrity_report(&config.path_mapper(), &config.categories)?;
    for c in &report.categories {
        info!(
            category = %c.category,
            sources = c.sources,
            outputs = c.outputs,
            orphans = c.orphans.len(),
            missing = c.missing_outputs.len(),
            "integrity"
        );
        for orphan in &c.orphans {
            warn!(path = %orphan.display(), "orphaned output");
        }
        for missing in &c.missing_outputs {
            warn!(path = %missing.display(), "missing output");
        }
    }
    if report.is_consistent() {
        info!("source and destination trees are consistent");
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::from(1))
    }
}
