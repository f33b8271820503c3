//! A snapshot service without a snapshot engine.
//!
//! Writers are definition documents in a directory (or supplied directly);
//! every writer is always stable unless a failure is injected. Snapshots
//! expose the live volume root, so data is read in place without a freeze.
//! Asynchronous operations complete immediately.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use uuid::Uuid;

use super::{
    AsyncOperation, BackupContext, CompletedOperation, ServiceError, SnapshotId, SnapshotProperties,
    SnapshotService, SnapshotSetId, WriterState, WriterStatusReport,
};
use crate::catalog::{
    BackupDocument, BackupType, ComponentInfo, ComponentKey, ComponentRecord, DifferencedFile,
    FileRestoreStatus, InstanceId, PartialFile, RestoreTarget, WriterMetadata, MAX_DOCUMENT_BYTES,
};
use crate::paths::Volume;
use crate::selection::NewTarget;

/// Runtime annotations a writer attaches to one of its components.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentAnnotation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logical_path: Option<String>,
    pub name: String,
    #[serde(default)]
    pub partial_files: Vec<PartialFile>,
    #[serde(default)]
    pub differenced_files: Vec<DifferencedFile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_restore_failure: Option<String>,
}

impl ComponentAnnotation {
    pub fn key(&self) -> ComponentKey {
        ComponentKey::new(self.logical_path.as_deref(), &self.name)
    }
}

/// A writer as the passthrough service sees it: its metadata document plus
/// the annotations it reports during backup and restore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriterDefinition {
    #[serde(flatten)]
    pub metadata: WriterMetadata,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub annotations: Vec<ComponentAnnotation>,
}

impl WriterDefinition {
    pub fn new(metadata: WriterMetadata) -> Self {
        Self {
            metadata,
            annotations: Vec::new(),
        }
    }

    fn annotation(&self, key: &ComponentKey) -> Option<&ComponentAnnotation> {
        self.annotations.iter().find(|a| a.key().same_as(key))
    }
}

pub struct PassthroughService {
    writers_dir: Option<PathBuf>,
    definitions: Vec<WriterDefinition>,
    statuses: HashMap<InstanceId, WriterState>,
    injected_failures: HashMap<InstanceId, WriterState>,
    document: BackupDocument,
    context: Option<BackupContext>,
    current_set: Option<SnapshotSetId>,
    committed: bool,
    snapshots: HashMap<SnapshotId, SnapshotProperties>,
    busy_sets: usize,
}

impl PassthroughService {
    /// Writers are read from `*.json` definition files in `dir` at every metadata gather.
    pub fn from_dir(dir: impl Into<PathBuf>) -> Self {
        let mut service = Self::with_writers(Vec::new());
        service.writers_dir = Some(dir.into());
        service
    }

    pub fn with_writers(definitions: Vec<WriterDefinition>) -> Self {
        Self {
            writers_dir: None,
            definitions,
            statuses: HashMap::new(),
            injected_failures: HashMap::new(),
            document: BackupDocument::new(BackupType::Full),
            context: None,
            current_set: None,
            committed: false,
            snapshots: HashMap::new(),
            busy_sets: 0,
        }
    }

    /// Make a writer instance fail when the phase named by `state` runs.
    pub fn fail_writer_at(&mut self, instance: InstanceId, state: WriterState) {
        self.injected_failures.insert(instance, state);
    }

    /// Report the next `count` snapshot-set starts as already in progress.
    pub fn simulate_busy_snapshot_sets(&mut self, count: usize) {
        self.busy_sets = count;
    }

    pub fn definitions(&self) -> &[WriterDefinition] {
        &self.definitions
    }

    fn load_definitions(dir: &Path) -> Result<Vec<WriterDefinition>, ServiceError> {
        let mut paths = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|e| e == "json") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut definitions = Vec::with_capacity(paths.len());
        for path in paths {
            if fs::metadata(&path)?.len() > MAX_DOCUMENT_BYTES {
                return Err(ServiceError::InvalidState(format!(
                    "writer definition {} is too large",
                    path.display()
                )));
            }
            let text = fs::read_to_string(&path)?;
            let definition: WriterDefinition = serde_json::from_str(&text)
                .map_err(|e| ServiceError::Catalog(e.into()))?;
            debug!("Loaded writer {} from {}", definition.metadata.writer_name, path.display());
            definitions.push(definition);
        }
        Ok(definitions)
    }

    /// Apply injected failures belonging to the phases in `phase`.
    fn run_phase(&mut self, phase: &[WriterState]) {
        for definition in &self.definitions {
            let instance = definition.metadata.instance_id;
            if let Some(failure) = self.injected_failures.get(&instance) {
                if phase.contains(failure) {
                    info!("Writer {} {}", definition.metadata.writer_name, failure);
                    self.statuses.insert(instance, *failure);
                }
            }
        }
    }

    fn is_failed(&self, instance: InstanceId) -> bool {
        self.statuses.get(&instance).is_some_and(|s| s.is_failed())
    }

    fn record(&mut self, instance: InstanceId, key: &ComponentKey) -> Result<&mut ComponentRecord, ServiceError> {
        self.document
            .component_mut(instance, key)
            .ok_or_else(|| ServiceError::NotFound(format!("component {key} of writer instance {instance}")))
    }

    fn definition(&self, instance: InstanceId) -> Option<&WriterDefinition> {
        self.definitions.iter().find(|d| d.metadata.instance_id == instance)
    }
}

impl SnapshotService for PassthroughService {
    fn gather_writer_metadata(&mut self) -> Result<Box<dyn AsyncOperation>, ServiceError> {
        if let Some(dir) = &self.writers_dir {
            self.definitions = Self::load_definitions(dir)?;
        }
        self.statuses = self
            .definitions
            .iter()
            .map(|d| (d.metadata.instance_id, WriterState::Stable))
            .collect();
        self.run_phase(&[WriterState::FailedAtIdentify]);
        Ok(CompletedOperation::succeeded())
    }

    fn gather_writer_status(&mut self) -> Result<Box<dyn AsyncOperation>, ServiceError> {
        Ok(CompletedOperation::succeeded())
    }

    fn writer_metadata(&self) -> Result<Vec<WriterMetadata>, ServiceError> {
        Ok(self
            .definitions
            .iter()
            .filter(|d| self.statuses.get(&d.metadata.instance_id) != Some(&WriterState::FailedAtIdentify))
            .map(|d| d.metadata.clone())
            .collect())
    }

    fn writer_status(&self) -> Result<Vec<WriterStatusReport>, ServiceError> {
        Ok(self
            .definitions
            .iter()
            .map(|d| {
                let state = self
                    .statuses
                    .get(&d.metadata.instance_id)
                    .copied()
                    .unwrap_or(WriterState::Stable);
                WriterStatusReport {
                    instance_id: d.metadata.instance_id,
                    writer_id: d.metadata.writer_id,
                    writer_name: d.metadata.writer_name.clone(),
                    state,
                    failure: state.is_failed().then(|| "E_WRITER_FAILED".to_string()),
                }
            })
            .collect())
    }

    fn initialize_for_backup(&mut self, document: Option<BackupDocument>) -> Result<(), ServiceError> {
        self.document = document.unwrap_or_else(|| BackupDocument::new(BackupType::Full));
        self.context = None;
        Ok(())
    }

    fn initialize_for_restore(&mut self, document: BackupDocument) -> Result<(), ServiceError> {
        self.document = document;
        Ok(())
    }

    fn set_backup_state(&mut self, context: BackupContext) -> Result<(), ServiceError> {
        self.document.backup_type = context.backup_type;
        self.document.bootable_system_state = context.bootable_system_state;
        self.document.partial_file_support = context.partial_file_support;
        self.context = Some(context);
        Ok(())
    }

    fn start_snapshot_set(&mut self) -> Result<SnapshotSetId, ServiceError> {
        if self.busy_sets > 0 {
            self.busy_sets -= 1;
            return Err(ServiceError::SnapshotSetInProgress);
        }
        if self.current_set.is_some() {
            return Err(ServiceError::SnapshotSetInProgress);
        }
        let set_id = Uuid::new_v4();
        self.current_set = Some(set_id);
        self.committed = false;
        self.document.snapshot_set_id = Some(set_id);
        Ok(set_id)
    }

    fn add_to_snapshot_set(&mut self, volume: &Volume) -> Result<SnapshotId, ServiceError> {
        let set_id = self
            .current_set
            .ok_or_else(|| ServiceError::InvalidState("no snapshot set started".to_string()))?;
        if self.committed {
            return Err(ServiceError::InvalidState("snapshot set already committed".to_string()));
        }
        if self
            .snapshots
            .values()
            .any(|s| s.set_id == set_id && s.original_volume.key() == volume.key())
        {
            return Err(ServiceError::InvalidState(format!(
                "volume {} is already in the snapshot set",
                volume.root()
            )));
        }

        let snapshot_id = Uuid::new_v4();
        self.snapshots.insert(
            snapshot_id,
            SnapshotProperties {
                snapshot_id,
                set_id,
                original_volume: volume.clone(),
                device_root: volume.root(),
                exposed_share: volume.is_share().then(|| volume.root()),
            },
        );
        Ok(snapshot_id)
    }

    fn do_snapshot_set(&mut self) -> Result<Box<dyn AsyncOperation>, ServiceError> {
        if self.current_set.is_none() {
            return Err(ServiceError::InvalidState("no snapshot set started".to_string()));
        }
        self.run_phase(&[
            WriterState::FailedAtPrepareSnapshot,
            WriterState::FailedAtFreeze,
            WriterState::FailedAtThaw,
            WriterState::FailedAtPostSnapshot,
        ]);
        self.committed = true;
        Ok(CompletedOperation::succeeded())
    }

    fn snapshot_properties(&self, snapshot_id: SnapshotId) -> Result<SnapshotProperties, ServiceError> {
        let properties = self
            .snapshots
            .get(&snapshot_id)
            .ok_or_else(|| ServiceError::NotFound(format!("snapshot {snapshot_id}")))?;
        if Some(properties.set_id) == self.current_set && !self.committed {
            return Err(ServiceError::InvalidState(format!(
                "snapshot {snapshot_id} is not committed"
            )));
        }
        Ok(properties.clone())
    }

    fn delete_snapshots(&mut self, set_id: SnapshotSetId) -> Result<usize, ServiceError> {
        let before = self.snapshots.len();
        self.snapshots.retain(|_, s| s.set_id != set_id);
        if self.current_set == Some(set_id) {
            self.current_set = None;
            self.committed = false;
        }
        Ok(before - self.snapshots.len())
    }

    fn prepare_for_backup(&mut self) -> Result<Box<dyn AsyncOperation>, ServiceError> {
        if self.context.is_none() {
            return Err(ServiceError::InvalidState("backup state not set".to_string()));
        }
        self.run_phase(&[WriterState::FailedAtPrepareBackup]);

        let partial_support = self.document.partial_file_support;
        for writer in &mut self.document.writers {
            if self.statuses.get(&writer.instance_id).is_some_and(|s| s.is_failed()) {
                continue;
            }
            let Some(definition) = self
                .definitions
                .iter()
                .find(|d| d.metadata.instance_id == writer.instance_id)
            else {
                continue;
            };
            for component in &mut writer.components {
                if let Some(annotation) = definition.annotation(&component.key()) {
                    if partial_support {
                        component.partial_files = annotation.partial_files.clone();
                    }
                    component.differenced_files = annotation.differenced_files.clone();
                }
            }
        }
        Ok(CompletedOperation::succeeded())
    }

    fn backup_complete(&mut self) -> Result<Box<dyn AsyncOperation>, ServiceError> {
        self.run_phase(&[WriterState::FailedAtBackupComplete]);

        let stamp = Utc::now().to_rfc3339();
        let failed: Vec<InstanceId> = self
            .document
            .writers
            .iter()
            .map(|w| w.instance_id)
            .filter(|i| self.is_failed(*i))
            .collect();
        for writer in &mut self.document.writers {
            if failed.contains(&writer.instance_id) {
                continue;
            }
            for component in writer.components.iter_mut().filter(|c| c.backup_succeeded) {
                component.backup_stamp = Some(stamp.clone());
            }
        }
        Ok(CompletedOperation::succeeded())
    }

    fn pre_restore(&mut self) -> Result<Box<dyn AsyncOperation>, ServiceError> {
        self.run_phase(&[WriterState::FailedAtPreRestore]);

        let mut failures = Vec::new();
        for writer in &self.document.writers {
            let Some(definition) = self.definition(writer.instance_id) else {
                continue;
            };
            for component in writer.components.iter().filter(|c| c.selected_for_restore) {
                if let Some(message) = definition
                    .annotation(&component.key())
                    .and_then(|a| a.pre_restore_failure.clone())
                {
                    failures.push((writer.instance_id, component.key(), message));
                }
            }
        }
        for (instance, key, message) in failures {
            self.record(instance, &key)?.pre_restore_failure = Some(message);
        }
        Ok(CompletedOperation::succeeded())
    }

    fn post_restore(&mut self) -> Result<Box<dyn AsyncOperation>, ServiceError> {
        self.run_phase(&[WriterState::FailedAtPostRestore]);
        Ok(CompletedOperation::succeeded())
    }

    fn add_component(&mut self, writer: &WriterMetadata, component: &ComponentInfo) -> Result<(), ServiceError> {
        self.document.add_component(
            writer.writer_id,
            writer.instance_id,
            &writer.writer_name,
            component.component_type,
            &component.key(),
        );
        Ok(())
    }

    fn set_backup_options(&mut self, instance: InstanceId, key: &ComponentKey, options: &str) -> Result<(), ServiceError> {
        self.record(instance, key)?.backup_options = Some(options.to_string());
        Ok(())
    }

    fn set_previous_backup_stamp(&mut self, instance: InstanceId, key: &ComponentKey, stamp: &str) -> Result<(), ServiceError> {
        self.record(instance, key)?.previous_backup_stamp = Some(stamp.to_string());
        Ok(())
    }

    fn set_backup_succeeded(&mut self, instance: InstanceId, key: &ComponentKey, succeeded: bool) -> Result<(), ServiceError> {
        self.record(instance, key)?.backup_succeeded = succeeded;
        Ok(())
    }

    fn set_selected_for_restore(&mut self, instance: InstanceId, key: &ComponentKey, selected: bool) -> Result<(), ServiceError> {
        self.record(instance, key)?.selected_for_restore = selected;
        Ok(())
    }

    fn set_additional_restores(&mut self, instance: InstanceId, key: &ComponentKey, additional: bool) -> Result<(), ServiceError> {
        self.record(instance, key)?.additional_restores = additional;
        Ok(())
    }

    fn set_restore_options(&mut self, instance: InstanceId, key: &ComponentKey, options: &str) -> Result<(), ServiceError> {
        self.record(instance, key)?.restore_options = Some(options.to_string());
        Ok(())
    }

    fn set_restore_target(&mut self, instance: InstanceId, key: &ComponentKey, target: RestoreTarget) -> Result<(), ServiceError> {
        self.record(instance, key)?.restore_target = target;
        Ok(())
    }

    fn add_new_target(&mut self, instance: InstanceId, key: &ComponentKey, target: &NewTarget) -> Result<(), ServiceError> {
        self.record(instance, key)?.new_targets.push(target.clone());
        Ok(())
    }

    fn add_restore_subcomponent(
        &mut self,
        instance: InstanceId,
        key: &ComponentKey,
        subcomponent: &ComponentKey,
    ) -> Result<(), ServiceError> {
        let record = self.record(instance, key)?;
        if !record.restore_subcomponents.iter().any(|s| s.same_as(subcomponent)) {
            record.restore_subcomponents.push(subcomponent.clone());
        }
        Ok(())
    }

    fn set_file_restore_status(
        &mut self,
        instance: InstanceId,
        key: &ComponentKey,
        status: FileRestoreStatus,
    ) -> Result<(), ServiceError> {
        self.record(instance, key)?.file_restore_status = status;
        Ok(())
    }

    fn backup_document(&self) -> Result<BackupDocument, ServiceError> {
        Ok(self.document.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ComponentFlags, ComponentType, FileBackupMask, FileDescriptor};
    use tempfile::TempDir;

    fn metadata() -> WriterMetadata {
        WriterMetadata {
            writer_id: Uuid::new_v4(),
            instance_id: Uuid::new_v4(),
            writer_name: "AppWriter".into(),
            instance_name: String::new(),
            usage_type: Default::default(),
            restore_method: Default::default(),
            alternate_location_mappings: vec![],
            include_files: vec![],
            exclude_files: vec![],
            components: vec![ComponentInfo {
                component_type: ComponentType::FileGroup,
                logical_path: None,
                name: "data".into(),
                caption: String::new(),
                selectable: true,
                selectable_for_restore: true,
                flags: ComponentFlags::default(),
                dependencies: vec![],
                files: vec![FileDescriptor {
                    backup_mask: FileBackupMask::default(),
                    ..FileDescriptor::new("/srv/app", "*", true)
                }],
                database_files: vec![],
                log_files: vec![],
            }],
        }
    }

    fn context() -> BackupContext {
        BackupContext {
            backup_type: BackupType::Full,
            select_components: true,
            bootable_system_state: false,
            partial_file_support: true,
        }
    }

    #[test]
    fn test_load_definitions_from_dir() {
        let temp_dir = TempDir::new().unwrap();
        let writer = metadata();
        writer.save_to_dir(temp_dir.path()).unwrap();
        fs::write(temp_dir.path().join("notes.txt"), "ignored").unwrap();

        let mut service = PassthroughService::from_dir(temp_dir.path());
        service.gather_writer_metadata().unwrap();
        assert_eq!(service.writer_metadata().unwrap(), vec![writer]);
        assert!(service
            .writer_status()
            .unwrap()
            .iter()
            .all(|s| s.state == WriterState::Stable));
    }

    #[test]
    fn test_snapshot_set_lifecycle() {
        let mut service = PassthroughService::with_writers(vec![]);
        let volume = Volume::Local { root: "/".into() };

        assert!(service.add_to_snapshot_set(&volume).is_err());
        let set_id = service.start_snapshot_set().unwrap();
        assert!(matches!(
            service.start_snapshot_set(),
            Err(ServiceError::SnapshotSetInProgress)
        ));

        let snapshot_id = service.add_to_snapshot_set(&volume).unwrap();
        assert!(service.add_to_snapshot_set(&volume).is_err());
        assert!(service.snapshot_properties(snapshot_id).is_err());

        service.do_snapshot_set().unwrap();
        let properties = service.snapshot_properties(snapshot_id).unwrap();
        assert_eq!(properties.device_root, "/");
        assert_eq!(properties.exposed_share, None);

        assert_eq!(service.delete_snapshots(set_id).unwrap(), 1);
        assert!(service.start_snapshot_set().is_ok());
    }

    #[test]
    fn test_injected_failure_and_stamps() {
        let healthy = metadata();
        let failing = metadata();
        let mut service = PassthroughService::with_writers(vec![
            WriterDefinition::new(healthy.clone()),
            WriterDefinition::new(failing.clone()),
        ]);
        service.fail_writer_at(failing.instance_id, WriterState::FailedAtFreeze);

        service.gather_writer_metadata().unwrap();
        service.initialize_for_backup(None).unwrap();
        service.set_backup_state(context()).unwrap();
        for writer in [&healthy, &failing] {
            service.add_component(writer, &writer.components[0]).unwrap();
            service
                .set_backup_succeeded(writer.instance_id, &writer.components[0].key(), true)
                .unwrap();
        }

        service.prepare_for_backup().unwrap();
        service.start_snapshot_set().unwrap();
        service.do_snapshot_set().unwrap();

        let statuses = service.writer_status().unwrap();
        let failed = statuses.iter().find(|s| s.instance_id == failing.instance_id).unwrap();
        assert_eq!(failed.state, WriterState::FailedAtFreeze);
        assert!(failed.failure.is_some());

        service.backup_complete().unwrap();
        let document = service.backup_document().unwrap();
        let key = ComponentKey::new(None, "data");
        assert!(document.component(healthy.instance_id, &key).unwrap().backup_stamp.is_some());
        assert!(document.component(failing.instance_id, &key).unwrap().backup_stamp.is_none());
    }

    #[test]
    fn test_annotations_applied_during_prepare() {
        let writer = metadata();
        let mut definition = WriterDefinition::new(writer.clone());
        definition.annotations.push(ComponentAnnotation {
            name: "data".into(),
            partial_files: vec![PartialFile {
                path: "/srv/app".into(),
                filename: "big.bin".into(),
                ranges: "0:10".into(),
                metadata: None,
            }],
            ..Default::default()
        });

        let mut service = PassthroughService::with_writers(vec![definition]);
        service.gather_writer_metadata().unwrap();
        service.initialize_for_backup(None).unwrap();
        assert!(service.prepare_for_backup().is_err());

        service.set_backup_state(context()).unwrap();
        service.add_component(&writer, &writer.components[0]).unwrap();
        service.prepare_for_backup().unwrap();

        let document = service.backup_document().unwrap();
        let record = document.component(writer.instance_id, &ComponentKey::new(None, "data")).unwrap();
        assert_eq!(record.partial_files.len(), 1);
    }

    #[test]
    fn test_setters_require_added_component() {
        let mut service = PassthroughService::with_writers(vec![]);
        let result = service.set_selected_for_restore(Uuid::new_v4(), &ComponentKey::new(None, "x"), true);
        assert!(matches!(result, Err(ServiceError::NotFound(_))));
    }
}
