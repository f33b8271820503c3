//! Backup and restore coordination.
//!
//! A [`BackupCoordinator`] or [`RestoreCoordinator`] drives one operation
//! through its phases against a [`SnapshotService`]. Writer failures are
//! recorded per writer and isolate only that writer's components, unless
//! stop-on-first-failure is configured. File transfers run on the blocking
//! pool, one component at a time.

pub mod backup;
pub mod hooks;
pub mod policy;
pub mod report;
pub mod restore;
pub mod rules;

pub use backup::{BackupCoordinator, BackupPhase, BackupRun};
pub use hooks::{CommandHook, RestoreHook, RestoreHooks};
pub use policy::{run_with_fallback, FallbackOutcome};
pub use report::{BackupReport, ComponentOutcome, ComponentStatus, Operation, RestoreReport, RunReport, WriterOutcome};
pub use restore::{RestoreCoordinator, RestorePhase, RestoreRun};
pub use rules::{select_components, Inclusion, InclusionReason, Purpose};

use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::catalog::{BackupType, CatalogError, ComponentInfo, WriterMetadata};
use crate::fs::walker::WalkOptions;
use crate::paths::{mirror_path, SaveArea, Volume, VolumeError, VolumeResolver};
use crate::service::{
    wait_for, AsyncOperation, OperationStatus, ServiceError, SnapshotService, WaitOutcome, WaitPolicy,
    WriterState, WriterStatusReport,
};
use crate::transfer::{ByteRange, ExcludeSet, MaterializeMode, TransferError, TransferPlan, TransferStats};

/// Settings shared by both coordinators for one run.
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub backup_type: BackupType,
    pub stop_on_first_failure: bool,
    pub additional_restores: bool,
    pub backup_options: Option<String>,
    pub restore_options: Option<String>,
    /// Leave the snapshot set in place after the backup completes.
    pub keep_snapshots: bool,
    pub partial_file_support: bool,
    pub bootable_system_state: bool,
    pub wait: WaitPolicy,
    /// Extra attempts at starting a snapshot set while another is in progress.
    pub start_retries: u32,
    pub start_retry_delay: Duration,
    pub save_dir: PathBuf,
    /// Required for restores that stage files for the next boot.
    pub reboot_journal: Option<PathBuf>,
    pub volumes: VolumeResolver,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            backup_type: BackupType::Full,
            stop_on_first_failure: false,
            additional_restores: false,
            backup_options: None,
            restore_options: None,
            keep_snapshots: false,
            partial_file_support: true,
            bootable_system_state: false,
            wait: WaitPolicy::default(),
            start_retries: 3,
            start_retry_delay: Duration::from_secs(5),
            save_dir: PathBuf::from("saved-files"),
            reboot_journal: None,
            volumes: VolumeResolver::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("{operation} is not allowed in phase {phase}")]
    InvalidPhase { operation: &'static str, phase: String },

    #[error("{phase} failed: {message}")]
    PhaseFailed { phase: String, message: String },

    #[error("{0} timed out")]
    TimedOut(String),

    #[error("{0} was interrupted")]
    Interrupted(String),

    #[error("Writer {writer} {state}")]
    WriterFailed { writer: String, state: WriterState },

    #[error("Component {component} failed: {message}")]
    ComponentFailed { component: String, message: String },

    #[error("Snapshot service error: {0}")]
    Service(#[from] ServiceError),

    #[error("Writer document error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("Transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error("Volume error: {0}")]
    Volume(#[from] VolumeError),

    #[error("Background task failed: {0}")]
    Task(String),
}

/// Drive `operation` to completion and require success.
///
/// A timed-out operation that still reports success at the final status query
/// is accepted.
pub(crate) async fn complete(
    mut operation: Box<dyn AsyncOperation>,
    policy: &WaitPolicy,
    cancel: &CancellationToken,
    phase: &str,
) -> Result<(), CoordinatorError> {
    match wait_for(operation.as_mut(), policy, cancel, phase).await? {
        WaitOutcome::Finished(OperationStatus::Succeeded) => Ok(()),
        WaitOutcome::TimedOut(OperationStatus::Succeeded) => {
            warn!("{} completed after its deadline", phase);
            Ok(())
        }
        WaitOutcome::TimedOut(_) => Err(CoordinatorError::TimedOut(phase.to_string())),
        WaitOutcome::Interrupted(_) => Err(CoordinatorError::Interrupted(phase.to_string())),
        WaitOutcome::Finished(status) => Err(CoordinatorError::PhaseFailed {
            phase: phase.to_string(),
            message: match status {
                OperationStatus::Failed(message) => message,
                other => format!("{other:?}"),
            },
        }),
    }
}

/// Gather writer statuses and return them.
pub(crate) async fn gather_statuses<S: SnapshotService>(
    service: &mut S,
    policy: &WaitPolicy,
    cancel: &CancellationToken,
) -> Result<Vec<WriterStatusReport>, CoordinatorError> {
    let operation = service.gather_writer_status()?;
    complete(operation, policy, cancel, "GatherWriterStatus").await?;
    Ok(service.writer_status()?)
}

/// Run blocking work on the blocking pool.
pub(crate) async fn blocking<T, F>(work: F) -> Result<T, CoordinatorError>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| CoordinatorError::Task(e.to_string()))
}

pub(crate) fn find_component<'a>(
    writers: &'a [WriterMetadata],
    inclusion: &Inclusion,
) -> Option<(&'a WriterMetadata, &'a ComponentInfo)> {
    let writer = writers.iter().find(|w| w.instance_id == inclusion.instance_id)?;
    let component = writer.component(&inclusion.key)?;
    Some((writer, component))
}

/// Location of a declared path inside the save tree.
pub(crate) fn mirror(save_dir: &Path, area: SaveArea, volume: &Volume, path: &str) -> Result<PathBuf, VolumeError> {
    mirror_path(save_dir, area, volume, path).ok_or_else(|| VolumeError::NoVolume(path.to_string()))
}

/// One directory tree to copy.
#[derive(Debug, Clone)]
pub(crate) struct TreeCopy {
    pub source_dir: PathBuf,
    pub destination_dir: PathBuf,
    /// Declared directory the source stands for.
    pub origin_dir: String,
    pub options: WalkOptions,
    pub exclude: ExcludeSet,
}

#[derive(Debug, Clone)]
pub(crate) struct FileCopy {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub ranges: Vec<ByteRange>,
}

/// Everything one component transfers, resolved up front.
#[derive(Debug, Clone, Default)]
pub(crate) struct TransferJob {
    pub trees: Vec<TreeCopy>,
    pub files: Vec<FileCopy>,
}

impl TransferJob {
    pub fn plan(&self) -> Result<TransferPlan, TransferError> {
        let mut plan = TransferPlan::new();
        for file in &self.files {
            plan.add_file(file.source.clone(), file.destination.clone(), file.ranges.clone());
        }
        for tree in &self.trees {
            plan.add_tree(&tree.source_dir, &tree.destination_dir, &tree.origin_dir, &tree.options, &tree.exclude)?;
        }
        Ok(plan)
    }

    /// Plan and execute on the blocking pool.
    pub async fn run(self, mode: MaterializeMode) -> Result<TransferStats, CoordinatorError> {
        let stats = blocking(move || self.plan()?.execute(mode, None)).await??;
        Ok(stats)
    }
}
