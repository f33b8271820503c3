//! Directory traversal for declared file groups.
//!
//! A file group is a directory, a filespec and a recursive flag. Files in the
//! directory itself come first, then each subdirectory in name order when
//! recursion is requested.

use std::path::{Path, PathBuf};
use std::time::SystemTime;
use walkdir::{DirEntry, WalkDir};

use crate::paths::wildcard;

/// Options for directory walking
#[derive(Debug, Clone)]
pub struct WalkOptions {
    /// Filespec matched against file names (`*`, `?`)
    pub filespec: String,

    /// Descend into subdirectories
    pub recursive: bool,

    /// Follow symbolic links
    pub follow_links: bool,

    /// Only report files modified at or after this instant
    pub modified_since: Option<SystemTime>,
}

impl WalkOptions {
    pub fn new(filespec: &str, recursive: bool) -> Self {
        Self {
            filespec: filespec.to_string(),
            recursive,
            ..Self::default()
        }
    }
}

impl Default for WalkOptions {
    fn default() -> Self {
        Self {
            filespec: "*".to_string(),
            recursive: false,
            follow_links: false,
            modified_since: None,
        }
    }
}

/// Information about a file discovered during walking
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// Full path to the file
    pub path: PathBuf,

    /// Relative path from the root
    pub relative_path: PathBuf,

    /// File size in bytes
    pub size: u64,

    /// Last modification time
    pub modified: SystemTime,

    /// Is this a symlink?
    pub is_symlink: bool,

    /// File depth from root
    pub depth: usize,
}

impl FileInfo {
    /// Create FileInfo from a DirEntry.
    /// For symlinks, resolves to the target to get the real file size.
    /// Returns None if the symlink target is a directory or cannot be resolved.
    fn from_entry(entry: &DirEntry, root: &Path) -> std::io::Result<Option<Self>> {
        let raw_metadata = entry.metadata()?;
        let path = entry.path().to_path_buf();
        let relative_path = path.strip_prefix(root).unwrap_or(&path).to_path_buf();
        let is_symlink = raw_metadata.is_symlink();

        let metadata = if is_symlink {
            match std::fs::metadata(&path) {
                Ok(resolved) if !resolved.is_dir() => resolved,
                _ => return Ok(None),
            }
        } else {
            raw_metadata
        };

        Ok(Some(Self {
            path,
            relative_path,
            size: metadata.len(),
            modified: metadata.modified()?,
            is_symlink,
            depth: entry.depth(),
        }))
    }
}

/// Walk a file group and collect the matching files.
///
/// A missing root yields no files; a declared directory that does not exist
/// on this machine has nothing to copy.
pub fn walk_directory(root: &Path, options: &WalkOptions) -> std::io::Result<Vec<FileInfo>> {
    let mut files = Vec::new();
    walk_directory_with_callback(root, options, |file| files.push(file.clone()))?;
    Ok(files)
}

/// Walk a file group with a callback for each matching file.
pub fn walk_directory_with_callback<F>(
    root: &Path,
    options: &WalkOptions,
    mut callback: F,
) -> std::io::Result<()>
where
    F: FnMut(&FileInfo),
{
    if !root.is_dir() {
        return Ok(());
    }

    let mut walker = WalkDir::new(root)
        .follow_links(options.follow_links)
        .min_depth(1)
        .sort_by(|a, b| {
            let a_dir = a.file_type().is_dir();
            let b_dir = b.file_type().is_dir();
            a_dir.cmp(&b_dir).then_with(|| a.file_name().cmp(b.file_name()))
        });

    if !options.recursive {
        walker = walker.max_depth(1);
    }

    for entry in walker {
        let entry = entry?;

        if entry.file_type().is_dir() {
            continue;
        }

        let name = entry.file_name().to_string_lossy();
        if !wildcard::matches(&options.filespec, &name) {
            continue;
        }

        let Some(file_info) = FileInfo::from_entry(&entry, root)? else {
            continue;
        };

        if let Some(cutoff) = options.modified_since {
            if file_info.modified < cutoff {
                continue;
            }
        }

        callback(&file_info);
    }

    Ok(())
}
