//! Files staged for replacement at next boot.
//!
//! A staged payload sits next to its destination as `<name>.pending-restore`.
//! The journal records each `{staged, destination}` pair; applying it renames
//! the staged files over their destinations.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::TransferError;

pub const STAGED_SUFFIX: &str = ".pending-restore";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingMove {
    pub staged: PathBuf,
    pub destination: PathBuf,
}

/// Staging path for `destination`.
pub fn staged_path(destination: &Path) -> PathBuf {
    let mut name = destination
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(STAGED_SUFFIX);
    destination.with_file_name(name)
}

/// JSON list of pending moves.
#[derive(Debug, Clone)]
pub struct RebootJournal {
    path: PathBuf,
}

impl RebootJournal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Entries currently recorded; a missing journal is empty.
    pub fn entries(&self) -> Result<Vec<PendingMove>, TransferError> {
        match fs::read_to_string(&self.path) {
            Ok(text) => serde_json::from_str(&text)
                .map_err(|e| TransferError::Journal(format!("{}: {e}", self.path.display()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(TransferError::io(&self.path, e)),
        }
    }

    pub fn append(&self, moves: &[PendingMove]) -> Result<(), TransferError> {
        if moves.is_empty() {
            return Ok(());
        }
        let mut entries = self.entries()?;
        entries.extend(moves.iter().cloned());
        self.write(&entries)
    }

    fn write(&self, entries: &[PendingMove]) -> Result<(), TransferError> {
        if entries.is_empty() {
            return match fs::remove_file(&self.path) {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(TransferError::io(&self.path, e)),
                _ => Ok(()),
            };
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| TransferError::io(parent, e))?;
        }
        let text = serde_json::to_string_pretty(entries)
            .map_err(|e| TransferError::Journal(e.to_string()))?;
        fs::write(&self.path, text).map_err(|e| TransferError::io(&self.path, e))
    }
}

/// Rename every staged file over its destination.
///
/// Moves that fail stay in the journal for the next attempt. Returns the
/// number of moves completed.
pub fn apply_pending_moves(journal: &RebootJournal) -> Result<usize, TransferError> {
    let entries = journal.entries()?;
    let mut remaining = Vec::new();
    let mut applied = 0;

    for entry in entries {
        match fs::rename(&entry.staged, &entry.destination) {
            Ok(()) => {
                info!(
                    "Applied pending restore {} -> {}",
                    entry.staged.display(),
                    entry.destination.display()
                );
                applied += 1;
            }
            Err(e) => {
                warn!("Pending restore of {} failed: {}", entry.destination.display(), e);
                remaining.push(entry);
            }
        }
    }

    journal.write(&remaining)?;
    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_staged_path() {
        assert_eq!(
            staged_path(Path::new("/srv/db/main.db")),
            PathBuf::from("/srv/db/main.db.pending-restore")
        );
    }

    #[test]
    fn test_append_and_apply() {
        let temp_dir = TempDir::new().unwrap();
        let journal = RebootJournal::new(temp_dir.path().join("state").join("pending.json"));
        assert!(journal.entries().unwrap().is_empty());

        let destination = temp_dir.path().join("main.db");
        fs::write(&destination, b"old").unwrap();
        let staged = staged_path(&destination);
        fs::write(&staged, b"new").unwrap();

        let missing = temp_dir.path().join("gone.db");
        journal
            .append(&[
                PendingMove {
                    staged: staged.clone(),
                    destination: destination.clone(),
                },
                PendingMove {
                    staged: staged_path(&missing),
                    destination: missing.clone(),
                },
            ])
            .unwrap();
        assert_eq!(journal.entries().unwrap().len(), 2);

        assert_eq!(apply_pending_moves(&journal).unwrap(), 1);
        assert_eq!(fs::read(&destination).unwrap(), b"new");
        assert!(!staged.exists());

        let remaining = journal.entries().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].destination, missing);
    }

    #[test]
    fn test_empty_journal_is_removed() {
        let temp_dir = TempDir::new().unwrap();
        let journal = RebootJournal::new(temp_dir.path().join("pending.json"));
        fs::write(journal.path(), "[]").unwrap();
        assert_eq!(apply_pending_moves(&journal).unwrap(), 0);
        assert!(!journal.path().exists());
    }
}
