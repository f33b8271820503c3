//! Layout of the saved-files directory.
//!
//! Whole files are mirrored under `<save>/<volume>/<path below volume root>`.
//! Partial-file and differenced-file payloads use the same layout below two
//! reserved directories whose leading dot keeps them apart from volume names.

use std::path::{Path, PathBuf};

use super::Volume;

/// Reserved directory holding partial-file payloads.
pub const PARTIAL_DIR: &str = ".partial";

/// Reserved directory holding differenced-file payloads.
pub const DIFFERENCED_DIR: &str = ".differenced";

/// Which part of the save tree a payload belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveArea {
    Main,
    Partial,
    Differenced,
}

/// Location of `path` (owned by `volume`) inside the save tree.
///
/// Returns `None` when `path` is not below the volume root.
pub fn mirror_path(save_dir: &Path, area: SaveArea, volume: &Volume, path: &str) -> Option<PathBuf> {
    let relative = volume.relative(path)?;

    let mut mirrored = save_dir.to_path_buf();
    match area {
        SaveArea::Main => {}
        SaveArea::Partial => mirrored.push(PARTIAL_DIR),
        SaveArea::Differenced => mirrored.push(DIFFERENCED_DIR),
    }
    mirrored.push(volume.mirror_name());
    for segment in relative {
        mirrored.push(segment);
    }
    Some(mirrored)
}
