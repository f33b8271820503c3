//! The backup document: serialized operation state shared between a backup
//! run and a later restore run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use uuid::Uuid;

use super::types::{BackupType, ComponentType};
use super::{read_bounded, CatalogError, ComponentKey, InstanceId, WriterId};
use crate::selection::NewTarget;
use crate::service::SnapshotSetId;

pub const DOCUMENT_VERSION: u32 = 1;

/// Where a component's files go on restore.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreTarget {
    #[default]
    Original,
    Alternate,
    Directed,
}

/// Aggregate outcome of materialising a component's files.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileRestoreStatus {
    #[default]
    None,
    All,
    Failed,
}

/// A file of which only some byte ranges are carried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialFile {
    pub path: String,
    pub filename: String,
    /// Comma-separated `offset:length` list.
    pub ranges: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<String>,
}

/// A file set selected by last-modify time or log sequence number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DifferencedFile {
    pub path: String,
    pub filespec: String,
    #[serde(default)]
    pub recursive: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modify_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lsn: Option<String>,
}

/// A directed restore target, carried through unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectedTarget {
    pub source_path: String,
    pub source_filename: String,
    pub source_ranges: String,
    pub destination_path: String,
    pub destination_filename: String,
    pub destination_ranges: String,
}

/// Per-component runtime annotations for one operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentRecord {
    pub component_type: ComponentType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logical_path: Option<String>,
    pub name: String,
    #[serde(default)]
    pub backup_succeeded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_stamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_backup_stamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_options: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore_options: Option<String>,
    #[serde(default)]
    pub selected_for_restore: bool,
    #[serde(default)]
    pub additional_restores: bool,
    #[serde(default)]
    pub restore_target: RestoreTarget,
    #[serde(default)]
    pub directed_targets: Vec<DirectedTarget>,
    #[serde(default)]
    pub new_targets: Vec<NewTarget>,
    #[serde(default)]
    pub restore_subcomponents: Vec<ComponentKey>,
    #[serde(default)]
    pub partial_files: Vec<PartialFile>,
    #[serde(default)]
    pub differenced_files: Vec<DifferencedFile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_restore_failure: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_restore_failure: Option<String>,
    #[serde(default)]
    pub file_restore_status: FileRestoreStatus,
}

impl ComponentRecord {
    pub fn new(component_type: ComponentType, key: &ComponentKey) -> Self {
        Self {
            component_type,
            logical_path: key.logical_path.clone(),
            name: key.name.clone(),
            backup_succeeded: false,
            backup_stamp: None,
            previous_backup_stamp: None,
            backup_options: None,
            restore_options: None,
            selected_for_restore: false,
            additional_restores: false,
            restore_target: RestoreTarget::Original,
            directed_targets: Vec::new(),
            new_targets: Vec::new(),
            restore_subcomponents: Vec::new(),
            partial_files: Vec::new(),
            differenced_files: Vec::new(),
            pre_restore_failure: None,
            post_restore_failure: None,
            file_restore_status: FileRestoreStatus::None,
        }
    }

    pub fn key(&self) -> ComponentKey {
        ComponentKey::new(self.logical_path.as_deref(), &self.name)
    }
}

/// Components added to the operation for one writer instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriterRecord {
    pub writer_id: WriterId,
    pub instance_id: InstanceId,
    pub writer_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    #[serde(default)]
    pub components: Vec<ComponentRecord>,
}

impl WriterRecord {
    pub fn component(&self, key: &ComponentKey) -> Option<&ComponentRecord> {
        self.components.iter().find(|c| c.key().same_as(key))
    }

    pub fn component_mut(&mut self, key: &ComponentKey) -> Option<&mut ComponentRecord> {
        self.components.iter_mut().find(|c| c.key().same_as(key))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupDocument {
    pub version: u32,
    pub backup_id: Uuid,
    pub backup_type: BackupType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_set_id: Option<SnapshotSetId>,
    pub originating_machine: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub bootable_system_state: bool,
    #[serde(default)]
    pub partial_file_support: bool,
    #[serde(default)]
    pub writers: Vec<WriterRecord>,
}

impl BackupDocument {
    pub fn new(backup_type: BackupType) -> Self {
        Self {
            version: DOCUMENT_VERSION,
            backup_id: Uuid::new_v4(),
            backup_type,
            snapshot_set_id: None,
            originating_machine: local_machine_name(),
            created_at: Utc::now(),
            bootable_system_state: false,
            partial_file_support: false,
            writers: Vec::new(),
        }
    }

    pub fn load(text: &str) -> Result<Self, CatalogError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn serialize(&self) -> Result<String, CatalogError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn load_file(path: &Path) -> Result<Self, CatalogError> {
        let text = read_bounded(path)?;
        Self::load(&text)
    }

    pub fn save_file(&self, path: &Path) -> Result<(), CatalogError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| CatalogError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        fs::write(path, self.serialize()?).map_err(|source| CatalogError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn writer(&self, instance_id: InstanceId) -> Option<&WriterRecord> {
        self.writers.iter().find(|w| w.instance_id == instance_id)
    }

    pub fn writer_mut(&mut self, instance_id: InstanceId) -> Option<&mut WriterRecord> {
        self.writers.iter_mut().find(|w| w.instance_id == instance_id)
    }

    /// Add a component to the operation, creating the writer record on first use.
    ///
    /// Adding the same component twice keeps the existing record.
    pub fn add_component(
        &mut self,
        writer_id: WriterId,
        instance_id: InstanceId,
        writer_name: &str,
        component_type: ComponentType,
        key: &ComponentKey,
    ) -> &mut ComponentRecord {
        let index = match self.writers.iter().position(|w| w.instance_id == instance_id) {
            Some(index) => index,
            None => {
                self.writers.push(WriterRecord {
                    writer_id,
                    instance_id,
                    writer_name: writer_name.to_string(),
                    failure: None,
                    components: Vec::new(),
                });
                self.writers.len() - 1
            }
        };

        let writer = &mut self.writers[index];
        let position = match writer.components.iter().position(|c| c.key().same_as(key)) {
            Some(position) => position,
            None => {
                writer.components.push(ComponentRecord::new(component_type, key));
                writer.components.len() - 1
            }
        };
        &mut writer.components[position]
    }

    pub fn component(&self, instance_id: InstanceId, key: &ComponentKey) -> Option<&ComponentRecord> {
        self.writer(instance_id).and_then(|w| w.component(key))
    }

    pub fn component_mut(
        &mut self,
        instance_id: InstanceId,
        key: &ComponentKey,
    ) -> Option<&mut ComponentRecord> {
        self.writer_mut(instance_id).and_then(|w| w.component_mut(key))
    }

    /// Look a component up by writer class, preferring the same instance.
    ///
    /// Used against a previous backup document, where instance ids may have
    /// changed between runs.
    pub fn find_component(
        &self,
        writer_id: WriterId,
        instance_id: InstanceId,
        key: &ComponentKey,
    ) -> Option<&ComponentRecord> {
        self.component(instance_id, key).or_else(|| {
            self.writers
                .iter()
                .filter(|w| w.writer_id == writer_id)
                .find_map(|w| w.component(key))
        })
    }

    pub fn component_count(&self) -> usize {
        self.writers.iter().map(|w| w.components.len()).sum()
    }
}

fn local_machine_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}
