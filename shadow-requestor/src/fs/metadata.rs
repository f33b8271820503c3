//! File metadata carried across a copy.
//!
//! Restored files keep their source modification time so later
//! timestamp-based differencing compares against the original values.

use std::fs::{self, File};
use std::path::Path;
use std::time::SystemTime;

/// Metadata preserved when a file is copied
#[derive(Debug, Clone)]
pub struct FileMetadata {
    /// File size in bytes
    pub size: u64,

    /// Last modified time
    pub modified: SystemTime,

    /// Read-only attribute
    pub readonly: bool,

    /// File permissions (Unix mode bits)
    pub permissions: Option<u32>,
}

impl FileMetadata {
    /// Extract metadata from a file path
    pub fn from_path(path: &Path) -> std::io::Result<Self> {
        Self::from_metadata(&fs::metadata(path)?)
    }

    pub fn from_metadata(metadata: &fs::Metadata) -> std::io::Result<Self> {
        #[cfg(unix)]
        let permissions = {
            use std::os::unix::fs::PermissionsExt;
            Some(metadata.permissions().mode())
        };

        #[cfg(not(unix))]
        let permissions = None;

        Ok(Self {
            size: metadata.len(),
            modified: metadata.modified()?,
            readonly: metadata.permissions().readonly(),
            permissions,
        })
    }

    /// Apply this metadata to a file opened for writing.
    ///
    /// The modification time goes through the open handle before the
    /// permissions, which may take write access away.
    pub fn apply_to_file(&self, file: &File) -> std::io::Result<()> {
        file.set_modified(self.modified)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Some(mode) = self.permissions {
                return file.set_permissions(fs::Permissions::from_mode(mode));
            }
        }

        if self.readonly {
            let mut permissions = file.metadata()?.permissions();
            permissions.set_readonly(true);
            file.set_permissions(permissions)?;
        }

        Ok(())
    }
}

/// Whether an existing destination can be replaced without explicit permission.
pub fn is_replaceable(path: &Path) -> std::io::Result<bool> {
    match fs::symlink_metadata(path) {
        Ok(metadata) => Ok(!metadata.is_dir() && !metadata.permissions().readonly()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(true),
        Err(e) => Err(e),
    }
}

/// Give the owner write access to an existing file again.
pub fn clear_readonly(path: &Path) -> std::io::Result<()> {
    let metadata = match fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    if metadata.is_dir() || !metadata.permissions().readonly() {
        return Ok(());
    }

    let mut permissions = metadata.permissions();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        permissions.set_mode(permissions.mode() | 0o200);
    }
    #[cfg(not(unix))]
    permissions.set_readonly(false);
    fs::set_permissions(path, permissions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;
    use tempfile::{NamedTempFile, TempDir};

    #[test]
    fn test_extract_metadata() -> std::io::Result<()> {
        let mut temp_file = NamedTempFile::new()?;
        temp_file.write_all(b"test content")?;
        temp_file.flush()?;

        let metadata = FileMetadata::from_path(temp_file.path())?;

        assert_eq!(metadata.size, 12);
        assert!(!metadata.readonly);
        assert!(metadata.modified > SystemTime::UNIX_EPOCH);

        Ok(())
    }

    #[test]
    fn test_metadata_applied_through_handle() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let source = temp_dir.path().join("source");
        fs::write(&source, b"x")?;

        let earlier = SystemTime::now() - Duration::from_secs(86_400);
        fs::OpenOptions::new().write(true).open(&source)?.set_modified(earlier)?;
        let mut permissions = fs::metadata(&source)?.permissions();
        permissions.set_readonly(true);
        fs::set_permissions(&source, permissions)?;

        let target = temp_dir.path().join("target");
        let file = File::create(&target)?;
        FileMetadata::from_path(&source)?.apply_to_file(&file)?;
        drop(file);

        let applied = fs::metadata(&target)?;
        assert!(applied.permissions().readonly());
        let drift = applied
            .modified()?
            .duration_since(earlier)
            .unwrap_or_else(|e| e.duration());
        assert!(drift < Duration::from_secs(2));

        Ok(())
    }

    #[test]
    fn test_replaceable() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let missing = temp_dir.path().join("missing");
        assert!(is_replaceable(&missing)?);
        assert!(!is_replaceable(temp_dir.path())?);

        let file = temp_dir.path().join("file");
        fs::write(&file, b"x")?;
        assert!(is_replaceable(&file)?);

        let mut permissions = fs::metadata(&file)?.permissions();
        permissions.set_readonly(true);
        fs::set_permissions(&file, permissions)?;
        assert!(!is_replaceable(&file)?);

        clear_readonly(&file)?;
        assert!(is_replaceable(&file)?);
        clear_readonly(&missing)?;
        Ok(())
    }
}
