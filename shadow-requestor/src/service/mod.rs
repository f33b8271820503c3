//! The snapshot service seam.
//!
//! Coordinators talk to the snapshot engine and its writers only through
//! [`SnapshotService`]. Long-running calls return an [`AsyncOperation`]
//! handle which is driven to completion by [`wait::wait_for`].

pub mod passthrough;
pub mod wait;

pub use passthrough::{ComponentAnnotation, PassthroughService, WriterDefinition};
pub use wait::{wait_for, WaitOutcome, WaitPolicy};

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

use crate::catalog::{
    BackupDocument, BackupType, CatalogError, ComponentInfo, ComponentKey, FileRestoreStatus, InstanceId,
    RestoreTarget, WriterId, WriterMetadata,
};
use crate::paths::{Volume, VolumeError};
use crate::selection::NewTarget;

pub type SnapshotSetId = Uuid;
pub type SnapshotId = Uuid;

/// State of a long-running operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationStatus {
    Pending,
    Succeeded,
    Failed(String),
    Cancelled,
}

impl OperationStatus {
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }
}

/// Handle to a long-running snapshot service call.
pub trait AsyncOperation: Send {
    /// Current status; does not block.
    fn status(&mut self) -> Result<OperationStatus, ServiceError>;

    /// Request cancellation. Advisory: the operation may still complete.
    fn cancel(&mut self) -> Result<(), ServiceError>;
}

/// An operation that has already finished.
#[derive(Debug, Clone)]
pub struct CompletedOperation {
    status: OperationStatus,
}

impl CompletedOperation {
    pub fn succeeded() -> Box<dyn AsyncOperation> {
        Box::new(Self {
            status: OperationStatus::Succeeded,
        })
    }

    pub fn failed(message: impl Into<String>) -> Box<dyn AsyncOperation> {
        Box::new(Self {
            status: OperationStatus::Failed(message.into()),
        })
    }
}

impl AsyncOperation for CompletedOperation {
    fn status(&mut self) -> Result<OperationStatus, ServiceError> {
        Ok(self.status.clone())
    }

    fn cancel(&mut self) -> Result<(), ServiceError> {
        Ok(())
    }
}

/// Writer state as reported by a status gather.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriterState {
    Stable,
    WaitingForFreeze,
    WaitingForThaw,
    WaitingForPostSnapshot,
    WaitingForBackupComplete,
    FailedAtIdentify,
    FailedAtPrepareBackup,
    FailedAtPrepareSnapshot,
    FailedAtFreeze,
    FailedAtThaw,
    FailedAtPostSnapshot,
    FailedAtBackupComplete,
    FailedAtPreRestore,
    FailedAtPostRestore,
}

impl WriterState {
    pub fn is_failed(self) -> bool {
        matches!(
            self,
            Self::FailedAtIdentify
                | Self::FailedAtPrepareBackup
                | Self::FailedAtPrepareSnapshot
                | Self::FailedAtFreeze
                | Self::FailedAtThaw
                | Self::FailedAtPostSnapshot
                | Self::FailedAtBackupComplete
                | Self::FailedAtPreRestore
                | Self::FailedAtPostRestore
        )
    }

    pub fn is_transient(self) -> bool {
        matches!(
            self,
            Self::WaitingForFreeze
                | Self::WaitingForThaw
                | Self::WaitingForPostSnapshot
                | Self::WaitingForBackupComplete
        )
    }
}

impl fmt::Display for WriterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Stable => "stable",
            Self::WaitingForFreeze => "waiting for freeze",
            Self::WaitingForThaw => "waiting for thaw",
            Self::WaitingForPostSnapshot => "waiting for post-snapshot",
            Self::WaitingForBackupComplete => "waiting for backup complete",
            Self::FailedAtIdentify => "failed at identify",
            Self::FailedAtPrepareBackup => "failed at prepare backup",
            Self::FailedAtPrepareSnapshot => "failed at prepare snapshot",
            Self::FailedAtFreeze => "failed at freeze",
            Self::FailedAtThaw => "failed at thaw",
            Self::FailedAtPostSnapshot => "failed at post-snapshot",
            Self::FailedAtBackupComplete => "failed at backup complete",
            Self::FailedAtPreRestore => "failed at pre-restore",
            Self::FailedAtPostRestore => "failed at post-restore",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriterStatusReport {
    pub instance_id: InstanceId,
    pub writer_id: WriterId,
    pub writer_name: String,
    pub state: WriterState,
    /// Writer-reported failure code, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotProperties {
    pub snapshot_id: SnapshotId,
    pub set_id: SnapshotSetId,
    pub original_volume: Volume,
    /// Root under which the snapshot contents of the volume are readable.
    pub device_root: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exposed_share: Option<String>,
}

/// Operation-wide settings handed to the service before snapshotting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackupContext {
    pub backup_type: BackupType,
    pub select_components: bool,
    pub bootable_system_state: bool,
    pub partial_file_support: bool,
}

/// Snapshot service capability consumed by the coordinators.
pub trait SnapshotService {
    fn gather_writer_metadata(&mut self) -> Result<Box<dyn AsyncOperation>, ServiceError>;
    fn gather_writer_status(&mut self) -> Result<Box<dyn AsyncOperation>, ServiceError>;
    fn writer_metadata(&self) -> Result<Vec<WriterMetadata>, ServiceError>;
    fn writer_status(&self) -> Result<Vec<WriterStatusReport>, ServiceError>;

    /// Start a fresh backup document, optionally seeded from an earlier one.
    fn initialize_for_backup(&mut self, document: Option<BackupDocument>) -> Result<(), ServiceError>;
    fn initialize_for_restore(&mut self, document: BackupDocument) -> Result<(), ServiceError>;
    fn set_backup_state(&mut self, context: BackupContext) -> Result<(), ServiceError>;

    fn start_snapshot_set(&mut self) -> Result<SnapshotSetId, ServiceError>;
    fn add_to_snapshot_set(&mut self, volume: &Volume) -> Result<SnapshotId, ServiceError>;
    fn do_snapshot_set(&mut self) -> Result<Box<dyn AsyncOperation>, ServiceError>;
    fn snapshot_properties(&self, snapshot_id: SnapshotId) -> Result<SnapshotProperties, ServiceError>;
    /// Delete every snapshot of a set; returns how many were deleted.
    fn delete_snapshots(&mut self, set_id: SnapshotSetId) -> Result<usize, ServiceError>;

    fn prepare_for_backup(&mut self) -> Result<Box<dyn AsyncOperation>, ServiceError>;
    fn backup_complete(&mut self) -> Result<Box<dyn AsyncOperation>, ServiceError>;
    fn pre_restore(&mut self) -> Result<Box<dyn AsyncOperation>, ServiceError>;
    fn post_restore(&mut self) -> Result<Box<dyn AsyncOperation>, ServiceError>;

    fn add_component(&mut self, writer: &WriterMetadata, component: &ComponentInfo) -> Result<(), ServiceError>;
    fn set_backup_options(&mut self, instance: InstanceId, key: &ComponentKey, options: &str) -> Result<(), ServiceError>;
    fn set_previous_backup_stamp(&mut self, instance: InstanceId, key: &ComponentKey, stamp: &str) -> Result<(), ServiceError>;
    fn set_backup_succeeded(&mut self, instance: InstanceId, key: &ComponentKey, succeeded: bool) -> Result<(), ServiceError>;
    fn set_selected_for_restore(&mut self, instance: InstanceId, key: &ComponentKey, selected: bool) -> Result<(), ServiceError>;
    fn set_additional_restores(&mut self, instance: InstanceId, key: &ComponentKey, additional: bool) -> Result<(), ServiceError>;
    fn set_restore_options(&mut self, instance: InstanceId, key: &ComponentKey, options: &str) -> Result<(), ServiceError>;
    fn set_restore_target(&mut self, instance: InstanceId, key: &ComponentKey, target: RestoreTarget) -> Result<(), ServiceError>;
    fn add_new_target(&mut self, instance: InstanceId, key: &ComponentKey, target: &NewTarget) -> Result<(), ServiceError>;
    fn add_restore_subcomponent(&mut self, instance: InstanceId, key: &ComponentKey, subcomponent: &ComponentKey) -> Result<(), ServiceError>;
    fn set_file_restore_status(&mut self, instance: InstanceId, key: &ComponentKey, status: FileRestoreStatus) -> Result<(), ServiceError>;

    /// The current operation state as a portable document.
    fn backup_document(&self) -> Result<BackupDocument, ServiceError>;
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Another snapshot set is already in progress")]
    SnapshotSetInProgress,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Operation failed: {0}")]
    OperationFailed(String),

    #[error("Writer document error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("Volume error: {0}")]
    Volume(#[from] VolumeError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
