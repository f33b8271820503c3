//! Planned transfers.
//!
//! A component's files are collected into a [`TransferPlan`] first, checked
//! for conflicts under the materialisation mode, and only then written. A
//! conflict found during the check leaves the destination untouched.

use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::partial::copy_partial;
use super::ranges::ByteRange;
use super::reboot::{staged_path, PendingMove, RebootJournal};
use super::stats::TransferStats;
use super::{ExcludeSet, TransferError};
use crate::fs::metadata::{clear_readonly, is_replaceable};
use crate::fs::walker::{walk_directory, WalkOptions};
use crate::paths;

/// How restored files are placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaterializeMode {
    /// Fail if any destination exists.
    CreateOnly,
    /// Replace destinations in place.
    Overwrite,
    /// Replace destinations below alternate-location directories.
    AlternateLocation,
    /// Stage next to existing destinations and replace them at next boot.
    AtReboot,
    /// Replace files the requestor wrote earlier, read-only ones included.
    Replace,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedCopy {
    pub source: PathBuf,
    pub destination: PathBuf,
    /// Empty for a whole-file copy.
    pub ranges: Vec<ByteRange>,
    pub size: u64,
}

impl PlannedCopy {
    pub fn is_partial(&self) -> bool {
        !self.ranges.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct TransferPlan {
    entries: Vec<PlannedCopy>,
    skipped: usize,
}

impl TransferPlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add every file of a file group.
    ///
    /// `origin_dir` is the declared directory `source_dir` stands for; files
    /// whose declared path is in `exclude` are skipped. Returns the number of
    /// files added.
    pub fn add_tree(
        &mut self,
        source_dir: &Path,
        destination_dir: &Path,
        origin_dir: &str,
        options: &WalkOptions,
        exclude: &ExcludeSet,
    ) -> Result<usize, TransferError> {
        let files = walk_directory(source_dir, options).map_err(|e| TransferError::io(source_dir, e))?;

        let mut added = 0;
        for file in files {
            let relative: Vec<String> = file
                .relative_path
                .components()
                .map(|c| c.as_os_str().to_string_lossy().to_string())
                .collect();
            let relative_refs: Vec<&str> = relative.iter().map(String::as_str).collect();

            if exclude.contains(&paths::join(origin_dir, &relative_refs)) {
                debug!("Skipping excluded file {}", file.path.display());
                self.skipped += 1;
                continue;
            }

            self.entries.push(PlannedCopy {
                destination: destination_dir.join(&file.relative_path),
                source: file.path,
                ranges: Vec::new(),
                size: file.size,
            });
            added += 1;
        }
        Ok(added)
    }

    /// Add a single file, whole when `ranges` is empty.
    pub fn add_file(&mut self, source: PathBuf, destination: PathBuf, ranges: Vec<ByteRange>) {
        let size = if ranges.is_empty() {
            fs::metadata(&source).map(|m| m.len()).unwrap_or(0)
        } else {
            ranges.iter().map(|r| r.length).sum()
        };
        self.entries.push(PlannedCopy {
            source,
            destination,
            ranges,
            size,
        });
    }

    pub fn entries(&self) -> &[PlannedCopy] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.entries.iter().map(|e| e.size).sum()
    }

    /// Find the first destination that `mode` may not write.
    pub fn check(&self, mode: MaterializeMode) -> Result<(), TransferError> {
        for entry in &self.entries {
            let destination = &entry.destination;
            let conflict = match mode {
                MaterializeMode::CreateOnly => destination.exists(),
                MaterializeMode::Overwrite | MaterializeMode::AlternateLocation => {
                    !is_replaceable(destination).map_err(|e| TransferError::io(destination, e))?
                }
                MaterializeMode::AtReboot | MaterializeMode::Replace => destination.is_dir(),
            };
            if conflict {
                return Err(TransferError::Conflict {
                    path: destination.clone(),
                });
            }
        }
        Ok(())
    }

    /// Check, then write every entry in plan order.
    ///
    /// `AtReboot` stages files whose destination exists and records them in
    /// `journal`, which must be given for that mode.
    pub fn execute(
        &self,
        mode: MaterializeMode,
        journal: Option<&RebootJournal>,
    ) -> Result<TransferStats, TransferError> {
        self.check(mode)?;
        if mode == MaterializeMode::AtReboot
            && journal.is_none()
            && self.entries.iter().any(|e| e.destination.exists())
        {
            return Err(TransferError::Journal(
                "files must be staged but no pending-move journal is configured".to_string(),
            ));
        }

        let mut stats = TransferStats::default();
        for _ in 0..self.skipped {
            stats.record_skipped();
        }
        let mut pending = Vec::new();

        for entry in &self.entries {
            let stage = mode == MaterializeMode::AtReboot && entry.destination.exists();
            let target = if stage {
                staged_path(&entry.destination)
            } else {
                entry.destination.clone()
            };

            if mode == MaterializeMode::Replace {
                clear_readonly(&target).map_err(|e| TransferError::io(&target, e))?;
            }

            let bytes = copy_partial(&entry.source, &target, &entry.ranges)?;
            if entry.is_partial() {
                stats.record_partial(bytes);
            } else if stage {
                stats.record_staged(bytes);
            } else {
                stats.record_file(bytes);
            }

            if stage {
                pending.push(PendingMove {
                    staged: target,
                    destination: entry.destination.clone(),
                });
            } else {
                debug!("Copied {} -> {}", entry.source.display(), target.display());
            }
        }

        if let Some(journal) = journal {
            journal.append(&pending)?;
        }

        Ok(stats)
    }
}

/// Copy one file group from `source_dir` to `destination_dir`, replacing
/// existing files.
pub fn copy_tree(
    source_dir: &Path,
    destination_dir: &Path,
    origin_dir: &str,
    options: &WalkOptions,
    exclude: &ExcludeSet,
) -> Result<TransferStats, TransferError> {
    let mut plan = TransferPlan::new();
    plan.add_tree(source_dir, destination_dir, origin_dir, options, exclude)?;
    plan.execute(MaterializeMode::Overwrite, None)
}
