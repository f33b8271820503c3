//! Enumerations and bit masks shared by writer metadata and backup documents.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of a writer component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentType {
    Database,
    FileGroup,
}

/// Backup type requested for the whole operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupType {
    Full,
    Differential,
    Incremental,
    Log,
    Copy,
    Other,
}

impl BackupType {
    /// Whether this backup type builds on a previous backup and carries its stamp forward.
    pub fn uses_previous_stamp(self) -> bool {
        matches!(self, Self::Differential | Self::Incremental)
    }
}

impl fmt::Display for BackupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Full => "full",
            Self::Differential => "differential",
            Self::Incremental => "incremental",
            Self::Log => "log",
            Self::Copy => "copy",
            Self::Other => "other",
        };
        f.write_str(name)
    }
}

impl FromStr for BackupType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "full" => Ok(Self::Full),
            "differential" | "diff" => Ok(Self::Differential),
            "incremental" | "inc" => Ok(Self::Incremental),
            "log" => Ok(Self::Log),
            "copy" => Ok(Self::Copy),
            "other" => Ok(Self::Other),
            _ => Err(format!("invalid backup type '{s}'")),
        }
    }
}

/// Per-file declaration of which backup types need the file copied and which
/// need its volume snapshotted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileBackupMask(pub u32);

impl FileBackupMask {
    pub const FULL_BACKUP_REQUIRED: u32 = 0x0001;
    pub const DIFFERENTIAL_BACKUP_REQUIRED: u32 = 0x0002;
    pub const INCREMENTAL_BACKUP_REQUIRED: u32 = 0x0004;
    pub const LOG_BACKUP_REQUIRED: u32 = 0x0008;
    pub const FULL_SNAPSHOT_REQUIRED: u32 = 0x0100;
    pub const DIFFERENTIAL_SNAPSHOT_REQUIRED: u32 = 0x0200;
    pub const INCREMENTAL_SNAPSHOT_REQUIRED: u32 = 0x0400;
    pub const LOG_SNAPSHOT_REQUIRED: u32 = 0x0800;
    pub const CREATED_DURING_BACKUP: u32 = 0x10000;
    pub const ALL_BACKUP_REQUIRED: u32 = 0x000F;
    pub const ALL_SNAPSHOT_REQUIRED: u32 = 0x0F00;

    pub fn new(bits: u32) -> Self {
        Self(bits)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    /// Whether files with this mask must be copied for `backup_type`.
    pub fn backup_required(self, backup_type: BackupType) -> bool {
        self.0 & Self::backup_bit(backup_type) != 0
    }

    /// Whether files with this mask must be read from the snapshot for `backup_type`.
    pub fn snapshot_required(self, backup_type: BackupType) -> bool {
        self.0 & (Self::backup_bit(backup_type) << 8) != 0
    }

    fn backup_bit(backup_type: BackupType) -> u32 {
        match backup_type {
            BackupType::Full | BackupType::Copy | BackupType::Other => Self::FULL_BACKUP_REQUIRED,
            BackupType::Differential => Self::DIFFERENTIAL_BACKUP_REQUIRED,
            BackupType::Incremental => Self::INCREMENTAL_BACKUP_REQUIRED,
            BackupType::Log => Self::LOG_BACKUP_REQUIRED,
        }
    }
}

impl Default for FileBackupMask {
    fn default() -> Self {
        Self(Self::ALL_BACKUP_REQUIRED | Self::ALL_SNAPSHOT_REQUIRED)
    }
}

/// Component flag bits reported by writers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ComponentFlags(pub u32);

impl ComponentFlags {
    pub const BACKUP_RECOVERY: u32 = 0x1;
    pub const APP_ROLLBACK_RECOVERY: u32 = 0x2;
    pub const NOT_AUTO_RECOVERABLE: u32 = 0x4;

    pub fn contains(self, flag: u32) -> bool {
        self.0 & flag == flag
    }
}

/// How a writer wants its files placed on restore.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreMethod {
    #[default]
    Undefined,
    RestoreIfNotThere,
    RestoreIfCanReplace,
    StopRestoreStart,
    RestoreToAlternateLocation,
    RestoreAtReboot,
    RestoreAtRebootIfCannotReplace,
    Custom,
    RestoreStopStart,
}

impl RestoreMethod {
    /// Methods that stop a named service around file materialisation.
    pub fn stops_service(self) -> bool {
        matches!(self, Self::StopRestoreStart | Self::RestoreStopStart)
    }
}

/// Whether the writer takes part in restore notifications.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriterRestorePolicy {
    #[default]
    Undefined,
    Never,
    IfReplaceFails,
    Always,
}

/// Writer usage classification, carried for reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageType {
    #[default]
    Undefined,
    BootableSystemState,
    SystemService,
    UserData,
    Other,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_mask_requires_everything() {
        let mask = FileBackupMask::default();
        for backup_type in [
            BackupType::Full,
            BackupType::Differential,
            BackupType::Incremental,
            BackupType::Log,
            BackupType::Copy,
        ] {
            assert!(mask.backup_required(backup_type));
            assert!(mask.snapshot_required(backup_type));
        }
    }

    #[test]
    fn test_log_only_without_snapshot() {
        let mask = FileBackupMask::new(FileBackupMask::LOG_BACKUP_REQUIRED);
        assert!(mask.backup_required(BackupType::Log));
        assert!(!mask.snapshot_required(BackupType::Log));
        assert!(!mask.backup_required(BackupType::Full));
    }

    #[test]
    fn test_copy_follows_full_bits() {
        let mask = FileBackupMask::new(
            FileBackupMask::FULL_BACKUP_REQUIRED | FileBackupMask::FULL_SNAPSHOT_REQUIRED,
        );
        assert!(mask.backup_required(BackupType::Copy));
        assert!(mask.snapshot_required(BackupType::Other));
        assert!(!mask.backup_required(BackupType::Incremental));
    }

    #[test]
    fn test_backup_type_parsing() {
        assert_eq!("Incremental".parse::<BackupType>().unwrap(), BackupType::Incremental);
        assert_eq!("diff".parse::<BackupType>().unwrap(), BackupType::Differential);
        assert!("weekly".parse::<BackupType>().is_err());
    }
}
