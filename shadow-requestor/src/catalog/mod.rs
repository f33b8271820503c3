//! Writer metadata documents.
//!
//! A [`WriterMetadata`] is the read-only view over what a writer reported at
//! metadata-gathering time: its identity, its components and their file
//! groups, and how it wants to be restored. The same document is persisted
//! next to the saved files so a later restore can run without the live writer.

pub mod document;
pub mod types;

pub use document::{
    BackupDocument, ComponentRecord, DifferencedFile, DirectedTarget, FileRestoreStatus,
    PartialFile, RestoreTarget, WriterRecord,
};
pub use types::{
    BackupType, ComponentFlags, ComponentType, FileBackupMask, RestoreMethod, UsageType,
    WriterRestorePolicy,
};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

use crate::paths;

/// Upper bound on a metadata or backup document read from disk.
pub const MAX_DOCUMENT_BYTES: u64 = 64 * 1024 * 1024;

/// Writer class identifier.
pub type WriterId = Uuid;

/// Writer instance identifier; one writer class may run several instances.
pub type InstanceId = Uuid;

/// Identity of a component inside a writer: logical path plus name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ComponentKey {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logical_path: Option<String>,
    pub name: String,
}

impl ComponentKey {
    pub fn new(logical_path: Option<&str>, name: &str) -> Self {
        let logical_path = logical_path
            .map(|p| p.trim_matches(['\\', '/']).to_string())
            .filter(|p| !p.is_empty());
        Self {
            logical_path,
            name: name.to_string(),
        }
    }

    /// `path\name`, or just `name` at the root.
    pub fn full_path(&self) -> String {
        match &self.logical_path {
            Some(path) => format!("{}\\{}", path, self.name),
            None => self.name.clone(),
        }
    }

    /// Number of logical-path segments above this component.
    pub fn depth(&self) -> usize {
        self.logical_path
            .as_deref()
            .map(|p| paths::segments(p).len())
            .unwrap_or(0)
    }

    /// Whether `self` is a strict ancestor of `other` by logical-path prefix.
    pub fn is_ancestor_of(&self, other: &ComponentKey) -> bool {
        match &other.logical_path {
            Some(path) => paths::strip_prefix(&self.full_path(), path).is_some(),
            None => false,
        }
    }

    /// Case-insensitive identity comparison.
    pub fn same_as(&self, other: &ComponentKey) -> bool {
        paths::same_path(&self.full_path(), &other.full_path())
    }
}

impl fmt::Display for ComponentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\\{}", self.full_path())
    }
}

/// A dependency of one component on another, possibly in a different writer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentDependency {
    pub writer_id: WriterId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logical_path: Option<String>,
    pub component_name: String,
}

impl ComponentDependency {
    pub fn key(&self) -> ComponentKey {
        ComponentKey::new(self.logical_path.as_deref(), &self.component_name)
    }
}

/// One declared file group entry: directory, filespec and flags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub path: String,
    pub filespec: String,
    #[serde(default)]
    pub recursive: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alternate_location: Option<String>,
    #[serde(default)]
    pub backup_mask: FileBackupMask,
}

impl FileDescriptor {
    pub fn new(path: &str, filespec: &str, recursive: bool) -> Self {
        Self {
            path: path.to_string(),
            filespec: filespec.to_string(),
            recursive,
            alternate_location: None,
            backup_mask: FileBackupMask::default(),
        }
    }

    /// Whether `file_path` (a concrete file) is covered by this descriptor.
    pub fn covers(&self, file_path: &str) -> bool {
        let Some((dir, name)) = paths::split_last(file_path) else {
            return false;
        };
        let dir_matches = if self.recursive {
            paths::strip_prefix(&self.path, dir).is_some()
        } else {
            paths::same_path(&self.path, dir)
        };
        dir_matches && paths::wildcard::matches(&self.filespec, name)
    }
}

/// Which list of a component a descriptor came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DescriptorKind {
    File,
    DatabaseFile,
    LogFile,
}

/// A writer component as reported in its metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentInfo {
    pub component_type: ComponentType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logical_path: Option<String>,
    pub name: String,
    #[serde(default)]
    pub caption: String,
    #[serde(default)]
    pub selectable: bool,
    #[serde(default)]
    pub selectable_for_restore: bool,
    #[serde(default)]
    pub flags: ComponentFlags,
    #[serde(default)]
    pub dependencies: Vec<ComponentDependency>,
    #[serde(default)]
    pub files: Vec<FileDescriptor>,
    #[serde(default)]
    pub database_files: Vec<FileDescriptor>,
    #[serde(default)]
    pub log_files: Vec<FileDescriptor>,
}

impl ComponentInfo {
    pub fn key(&self) -> ComponentKey {
        ComponentKey::new(self.logical_path.as_deref(), &self.name)
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn database_file_count(&self) -> usize {
        self.database_files.len()
    }

    pub fn log_file_count(&self) -> usize {
        self.log_files.len()
    }

    /// Every declared descriptor with the list it came from.
    pub fn descriptors(&self) -> impl Iterator<Item = (DescriptorKind, &FileDescriptor)> {
        self.files
            .iter()
            .map(|d| (DescriptorKind::File, d))
            .chain(self.database_files.iter().map(|d| (DescriptorKind::DatabaseFile, d)))
            .chain(self.log_files.iter().map(|d| (DescriptorKind::LogFile, d)))
    }
}

/// The writer's declared restore method.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreMethodDeclaration {
    pub method: RestoreMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_procedure: Option<String>,
    #[serde(default)]
    pub writer_restore: WriterRestorePolicy,
    #[serde(default)]
    pub reboot_required: bool,
    #[serde(default)]
    pub mapping_count: usize,
}

/// A writer's metadata document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriterMetadata {
    pub writer_id: WriterId,
    pub instance_id: InstanceId,
    pub writer_name: String,
    #[serde(default)]
    pub instance_name: String,
    #[serde(default)]
    pub usage_type: UsageType,
    #[serde(default)]
    pub restore_method: RestoreMethodDeclaration,
    #[serde(default)]
    pub alternate_location_mappings: Vec<FileDescriptor>,
    #[serde(default)]
    pub include_files: Vec<FileDescriptor>,
    #[serde(default)]
    pub exclude_files: Vec<FileDescriptor>,
    #[serde(default)]
    pub components: Vec<ComponentInfo>,
}

impl WriterMetadata {
    /// Parse a metadata document.
    pub fn load(text: &str) -> Result<Self, CatalogError> {
        let metadata: Self = serde_json::from_str(text)?;
        Ok(metadata)
    }

    /// Serialize back to document text; `load(serialize())` reproduces every field.
    pub fn serialize(&self) -> Result<String, CatalogError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Read a persisted metadata document.
    pub fn load_file(path: &Path) -> Result<Self, CatalogError> {
        let text = read_bounded(path)?;
        Self::load(&text)
    }

    /// Persist this document as `writer-<instance id>.json` inside `dir`.
    pub fn save_to_dir(&self, dir: &Path) -> Result<PathBuf, CatalogError> {
        fs::create_dir_all(dir).map_err(|source| CatalogError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = dir.join(Self::file_name(self.instance_id));
        fs::write(&path, self.serialize()?).map_err(|source| CatalogError::Io {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }

    /// File name of the persisted metadata for a writer instance.
    pub fn file_name(instance_id: InstanceId) -> String {
        format!("writer-{instance_id}.json")
    }

    /// Load every persisted metadata document (`writer-*.json`) in `dir`.
    pub fn load_all_from_dir(dir: &Path) -> Result<Vec<Self>, CatalogError> {
        let entries = fs::read_dir(dir).map_err(|source| CatalogError::Io {
            path: dir.to_path_buf(),
            source,
        })?;

        let mut paths = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| CatalogError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with("writer-") && name.ends_with(".json") {
                paths.push(entry.path());
            }
        }
        paths.sort();

        paths.iter().map(|path| Self::load_file(path)).collect()
    }

    pub fn components(&self) -> &[ComponentInfo] {
        &self.components
    }

    pub fn component(&self, key: &ComponentKey) -> Option<&ComponentInfo> {
        self.components.iter().find(|c| c.key().same_as(key))
    }

    pub fn include_files(&self) -> &[FileDescriptor] {
        &self.include_files
    }

    pub fn exclude_files(&self) -> &[FileDescriptor] {
        &self.exclude_files
    }

    pub fn restore_method(&self) -> &RestoreMethodDeclaration {
        &self.restore_method
    }

    pub fn alternate_location_mappings(&self) -> &[FileDescriptor] {
        &self.alternate_location_mappings
    }

    /// Components that are strict ancestors of `key`, nearest first.
    pub fn ancestors_of(&self, key: &ComponentKey) -> Vec<&ComponentInfo> {
        let mut ancestors: Vec<&ComponentInfo> = self
            .components
            .iter()
            .filter(|c| c.key().is_ancestor_of(key))
            .collect();
        ancestors.sort_by_key(|c| std::cmp::Reverse(c.key().depth()));
        ancestors
    }

    /// Whether `path` is excluded by this writer's exclude list.
    pub fn is_excluded(&self, path: &str) -> bool {
        self.exclude_files.iter().any(|d| d.covers(path))
    }
}

pub(crate) fn read_bounded(path: &Path) -> Result<String, CatalogError> {
    let metadata = fs::metadata(path).map_err(|source| CatalogError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    if metadata.len() > MAX_DOCUMENT_BYTES {
        return Err(CatalogError::TooLarge {
            path: path.to_path_buf(),
            size: metadata.len(),
        });
    }
    fs::read_to_string(path).map_err(|source| CatalogError::Io {
        path: path.to_path_buf(),
        source,
    })
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Malformed document: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Document {path} is {size} bytes, larger than the {MAX_DOCUMENT_BYTES} byte limit")]
    TooLarge { path: PathBuf, size: u64 },

    #[error("Failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    pub(crate) fn sample_metadata() -> WriterMetadata {
        let mut log_file = FileDescriptor::new("/srv/db/logs", "*.log", false);
        log_file.backup_mask = FileBackupMask::new(
            FileBackupMask::ALL_BACKUP_REQUIRED | FileBackupMask::FULL_SNAPSHOT_REQUIRED,
        );

        WriterMetadata {
            writer_id: Uuid::parse_str("a65faa63-5ea8-4ebc-9dbd-a0c4db26912a").unwrap(),
            instance_id: Uuid::parse_str("0f6e2c5a-1b1e-4d4b-9a59-3a9d7e3f2b10").unwrap(),
            writer_name: "SqlWriter".into(),
            instance_name: "main instance".into(),
            usage_type: UsageType::UserData,
            restore_method: RestoreMethodDeclaration {
                method: RestoreMethod::RestoreIfCanReplace,
                service: Some("sqlsvc".into()),
                user_procedure: None,
                writer_restore: WriterRestorePolicy::Always,
                reboot_required: false,
                mapping_count: 1,
            },
            alternate_location_mappings: vec![FileDescriptor {
                alternate_location: Some("/srv/alt".into()),
                ..FileDescriptor::new("/srv/db", "*", true)
            }],
            include_files: vec![],
            exclude_files: vec![FileDescriptor::new("/srv/db", "*.tmp", true)],
            components: vec![
                ComponentInfo {
                    component_type: ComponentType::Database,
                    logical_path: Some("db".into()),
                    name: "main".into(),
                    caption: "Main database".into(),
                    selectable: true,
                    selectable_for_restore: true,
                    flags: ComponentFlags(ComponentFlags::BACKUP_RECOVERY),
                    dependencies: vec![],
                    files: vec![],
                    database_files: vec![FileDescriptor::new("/srv/db", "main.db", false)],
                    log_files: vec![log_file],
                },
                ComponentInfo {
                    component_type: ComponentType::FileGroup,
                    logical_path: Some("db\\main".into()),
                    name: "logs".into(),
                    caption: String::new(),
                    selectable: false,
                    selectable_for_restore: false,
                    flags: ComponentFlags::default(),
                    dependencies: vec![],
                    files: vec![FileDescriptor::new("/srv/db/archive", "*", true)],
                    database_files: vec![],
                    log_files: vec![],
                },
            ],
        }
    }

    #[test]
    fn test_round_trip_preserves_every_field() {
        let metadata = sample_metadata();
        let text = metadata.serialize().unwrap();
        let reloaded = WriterMetadata::load(&text).unwrap();
        assert_eq!(reloaded, metadata);
        assert_eq!(reloaded.serialize().unwrap(), text);
    }

    #[test]
    fn test_malformed_document_fails_whole_load() {
        let result = WriterMetadata::load("{\"writer_id\": \"not-a-uuid\"}");
        assert!(matches!(result, Err(CatalogError::Parse(_))));
    }

    #[test]
    fn test_component_lookup_and_counts() {
        let metadata = sample_metadata();
        let main = metadata.component(&ComponentKey::new(Some("\\DB"), "Main")).unwrap();
        assert_eq!(main.database_file_count(), 1);
        assert_eq!(main.log_file_count(), 1);
        assert_eq!(main.file_count(), 0);
        assert_eq!(main.descriptors().count(), 2);
    }

    #[test]
    fn test_ancestry() {
        let metadata = sample_metadata();
        let logs = ComponentKey::new(Some("db\\main"), "logs");
        let main = ComponentKey::new(Some("db"), "main");
        assert!(main.is_ancestor_of(&logs));
        assert!(!logs.is_ancestor_of(&main));
        assert!(!main.is_ancestor_of(&main));

        let ancestors = metadata.ancestors_of(&logs);
        assert_eq!(ancestors.len(), 1);
        assert_eq!(ancestors[0].name, "main");
    }

    #[test]
    fn test_descriptor_coverage_and_excludes() {
        let metadata = sample_metadata();
        assert!(metadata.is_excluded("/srv/db/deep/scratch.tmp"));
        assert!(!metadata.is_excluded("/srv/db/main.db"));

        let flat = FileDescriptor::new("/srv/db", "*.db", false);
        assert!(flat.covers("/srv/db/main.db"));
        assert!(!flat.covers("/srv/db/nested/main.db"));
    }

    #[test]
    fn test_save_and_load_directory() {
        let temp_dir = TempDir::new().unwrap();
        let metadata = sample_metadata();
        let path = metadata.save_to_dir(temp_dir.path()).unwrap();
        assert!(path.ends_with(WriterMetadata::file_name(metadata.instance_id)));

        std::fs::write(temp_dir.path().join("unrelated.json"), "{}").unwrap();
        let loaded = WriterMetadata::load_all_from_dir(temp_dir.path()).unwrap();
        assert_eq!(loaded, vec![metadata]);
    }
}
