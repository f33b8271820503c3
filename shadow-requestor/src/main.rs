//! Shadow Requestor - Main entry point
//!
//! Backs up writer components through a snapshot service and restores them
//! from the saved files and backup document.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use shadow_requestor::catalog::{BackupDocument, BackupType, WriterMetadata};
use shadow_requestor::daemon::ShutdownCoordinator;
use shadow_requestor::executor::{BackupCoordinator, RestoreCoordinator, RestoreHooks, RunReport};
use shadow_requestor::selection::SelectionModel;
use shadow_requestor::service::PassthroughService;
use shadow_requestor::transfer::{apply_pending_moves, RebootJournal};
use shadow_requestor::{utils, Config};

const DOCUMENT_FILE: &str = "backup-document.json";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Only back up
    #[arg(short = 'b', long, conflicts_with = "restore_only")]
    backup_only: bool,

    /// Only restore, from an existing backup document
    #[arg(short = 'r', long)]
    restore_only: bool,

    /// Backup type (full, differential, incremental, log, copy, other)
    #[arg(short = 't', long)]
    backup_type: Option<BackupType>,

    /// Component selection file
    #[arg(short, long, value_name = "FILE")]
    selection: Option<PathBuf>,

    /// Backup document to write (backup) or read (restore-only)
    #[arg(short, long, value_name = "FILE")]
    document: Option<PathBuf>,

    /// Directory backed-up files are saved to and restored from
    #[arg(long, value_name = "DIR")]
    save_dir: Option<PathBuf>,

    /// Writer definition directory for the passthrough snapshot service
    #[arg(short, long, value_name = "DIR")]
    writers_dir: Option<PathBuf>,

    /// Backup document of the previous backup, for differential and incremental backups
    #[arg(short, long, value_name = "FILE")]
    previous: Option<PathBuf>,

    /// Abort on the first writer or component failure
    #[arg(long)]
    stop_on_first_failure: bool,

    /// Snapshot the volume holding this path and exit, without saving files
    #[arg(long, value_name = "PATH", conflicts_with_all = ["restore_only", "selection"])]
    snapshot_volume: Option<String>,

    /// Write the default configuration to this file and exit
    #[arg(long, value_name = "FILE")]
    write_default_config: Option<PathBuf>,

    /// Complete the renames recorded in this pending-move journal and exit
    #[arg(long, value_name = "FILE")]
    apply_pending_moves: Option<PathBuf>,
}

impl Args {
    /// Command-line values override the configuration.
    fn apply(&self, config: &mut Config) {
        if let Some(backup_type) = self.backup_type {
            config.operation.backup_type = backup_type;
        }
        if self.stop_on_first_failure {
            config.operation.stop_on_first_failure = true;
        }
        if let Some(save_dir) = &self.save_dir {
            config.paths.save_dir = save_dir.clone();
        }
        if let Some(writers_dir) = &self.writers_dir {
            config.paths.writers_dir = writers_dir.clone();
        }
    }

    fn document_path(&self, config: &Config) -> PathBuf {
        self.document
            .clone()
            .unwrap_or_else(|| config.paths.save_dir.join(DOCUMENT_FILE))
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    if let Some(path) = &args.write_default_config {
        Config::write_default(path)?;
        println!("Wrote default configuration to {}", path.display());
        return Ok(ExitCode::SUCCESS);
    }

    // Load configuration
    let mut config = Config::load(args.config.as_deref()).context("Failed to load configuration")?;
    args.apply(&mut config);

    // Initialize logging
    utils::logger::init(utils::logger::level(args.log_level.as_deref(), &config.log.level));

    tracing::info!("Starting shadow-requestor v{}", env!("CARGO_PKG_VERSION"));

    if let Some(path) = &args.apply_pending_moves {
        let applied = apply_pending_moves(&RebootJournal::new(path))?;
        println!("Applied {} pending moves from {}", applied, path.display());
        return Ok(ExitCode::SUCCESS);
    }

    let shutdown = ShutdownCoordinator::new();
    let listener = shutdown.spawn_listener();

    let selection = match &args.selection {
        Some(path) => Some(SelectionModel::load_file(path)?),
        None => None,
    };
    let settings = config.coordinator_settings();
    let document_path = args.document_path(&config);
    let mut succeeded = true;

    let document = if args.restore_only {
        BackupDocument::load_file(&document_path)
            .with_context(|| format!("Failed to read backup document {}", document_path.display()))?
    } else {
        let service = PassthroughService::from_dir(&config.paths.writers_dir);
        let mut coordinator = BackupCoordinator::new(service, settings.clone(), shutdown.token());

        let run = if let Some(path) = &args.snapshot_volume {
            let volume = settings.volumes.volume_of(path)?;
            coordinator.snapshot_volume(volume).await
        } else {
            let previous = match &args.previous {
                Some(path) => Some(BackupDocument::load_file(path)?),
                None => None,
            };
            coordinator.run(selection.as_ref(), previous.as_ref()).await
        };

        print_report(&run.report);
        succeeded &= run.report.succeeded();

        let Some(document) = run.document else {
            shutdown.trigger();
            let _ = listener.await;
            return Ok(ExitCode::FAILURE);
        };
        if args.snapshot_volume.is_none() {
            save_document(&document, &document_path)?;
        }
        document
    };

    if !args.backup_only && args.snapshot_volume.is_none() {
        if shutdown.is_shutting_down() {
            bail!("Interrupted before restore");
        }

        let saved = load_saved_catalogs(&settings.save_dir)?;
        let service = PassthroughService::from_dir(&config.paths.writers_dir);
        let hooks = RestoreHooks::from_commands(&config.hooks);
        let mut coordinator = RestoreCoordinator::new(service, settings, hooks, shutdown.token());

        let run = coordinator.run(document, selection.as_ref(), &saved).await;
        print_report(&run.report);
        succeeded &= run.report.succeeded();
    }

    shutdown.trigger();
    let _ = listener.await;

    Ok(if succeeded { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

fn print_report(report: &RunReport) {
    println!("{}", report);
}

fn save_document(document: &BackupDocument, path: &Path) -> Result<()> {
    document.save_file(path)?;
    tracing::info!("Saved backup document to {}", path.display());
    Ok(())
}

fn load_saved_catalogs(save_dir: &Path) -> Result<Vec<WriterMetadata>> {
    if !save_dir.is_dir() {
        return Ok(Vec::new());
    }
    Ok(WriterMetadata::load_all_from_dir(save_dir)?)
}
