//! Whole-file and byte-range copies.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use super::ranges::ByteRange;
use super::TransferError;
use crate::fs::metadata::FileMetadata;

const BUFFER_SIZE: usize = 64 * 1024;

/// Copy `ranges` of `source` into the same offsets of `destination`.
///
/// An empty range list copies the whole file. Otherwise the destination is
/// truncated to the end of the last range; bytes outside the ranges are not
/// written. Returns the number of bytes copied.
pub fn copy_partial(source: &Path, destination: &Path, ranges: &[ByteRange]) -> Result<u64, TransferError> {
    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent).map_err(|e| TransferError::io(parent, e))?;
    }

    if ranges.is_empty() {
        return copy_whole(source, destination);
    }

    let mut input = File::open(source).map_err(|e| TransferError::io(source, e))?;
    let mut output = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(destination)
        .map_err(|e| TransferError::io(destination, e))?;

    let mut copied = 0u64;
    let mut extent = 0u64;
    let mut buffer = vec![0u8; BUFFER_SIZE];

    for range in ranges {
        input
            .seek(SeekFrom::Start(range.offset))
            .map_err(|e| TransferError::io(source, e))?;
        output
            .seek(SeekFrom::Start(range.offset))
            .map_err(|e| TransferError::io(destination, e))?;

        let mut remaining = range.length;
        while remaining > 0 {
            let want = remaining.min(BUFFER_SIZE as u64) as usize;
            let read = input
                .read(&mut buffer[..want])
                .map_err(|e| TransferError::io(source, e))?;
            if read == 0 {
                return Err(TransferError::ShortRead {
                    path: source.to_path_buf(),
                    offset: range.offset,
                    expected: range.length,
                    actual: range.length - remaining,
                });
            }
            output
                .write_all(&buffer[..read])
                .map_err(|e| TransferError::io(destination, e))?;
            remaining -= read as u64;
        }

        copied += range.length;
        extent = range.offset + range.length;
    }

    output
        .set_len(extent)
        .and_then(|_| output.flush())
        .map_err(|e| TransferError::io(destination, e))?;

    Ok(copied)
}

/// Copy a whole file, carrying over its modification time and permissions.
fn copy_whole(source: &Path, destination: &Path) -> Result<u64, TransferError> {
    let mut input = File::open(source).map_err(|e| TransferError::io(source, e))?;
    let metadata = input
        .metadata()
        .and_then(|m| FileMetadata::from_metadata(&m))
        .map_err(|e| TransferError::io(source, e))?;

    let mut output = File::create(destination).map_err(|e| TransferError::io(destination, e))?;
    let copied = io::copy(&mut input, &mut output).map_err(|e| TransferError::io(destination, e))?;
    metadata
        .apply_to_file(&output)
        .map_err(|e| TransferError::io(destination, e))?;

    Ok(copied)
}
