//! File transfer: enumeration, conflict checks, whole and partial copies.

pub mod engine;
pub mod partial;
pub mod ranges;
pub mod reboot;
pub mod stats;

pub use engine::{copy_tree, MaterializeMode, PlannedCopy, TransferPlan};
pub use partial::copy_partial;
pub use ranges::ByteRange;
pub use reboot::{apply_pending_moves, PendingMove, RebootJournal};
pub use stats::TransferStats;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::catalog::FileDescriptor;
use crate::paths;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("Destination {path} exists and may not be replaced")]
    Conflict { path: PathBuf },

    #[error("Malformed range list \"{0}\"")]
    MalformedRanges(String),

    #[error("Short read from {path}: range at offset {offset} wanted {expected} bytes, got {actual}")]
    ShortRead {
        path: PathBuf,
        offset: u64,
        expected: u64,
        actual: u64,
    },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Pending-move journal error: {0}")]
    Journal(String),

    #[error("Cannot place {0}")]
    Unresolved(String),
}

impl TransferError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// Declared file paths that a tree copy must skip.
///
/// Holds exact files (partial files handled separately) and descriptor
/// patterns (writer excludes, differenced file sets). Paths are compared in
/// their declared form, independent of where the bytes are read from.
#[derive(Debug, Clone, Default)]
pub struct ExcludeSet {
    files: HashSet<String>,
    patterns: Vec<FileDescriptor>,
}

impl ExcludeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_file(&mut self, declared_path: &str) {
        self.files.insert(normalize(declared_path));
    }

    pub fn add_pattern(&mut self, descriptor: FileDescriptor) {
        self.patterns.push(descriptor);
    }

    pub fn contains(&self, declared_path: &str) -> bool {
        self.files.contains(&normalize(declared_path))
            || self.patterns.iter().any(|d| d.covers(declared_path))
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.patterns.is_empty()
    }
}

fn normalize(path: &str) -> String {
    paths::segments(path)
        .iter()
        .map(|s| s.to_ascii_lowercase())
        .collect::<Vec<_>>()
        .join("/")
}
