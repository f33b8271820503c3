//! Filesystem helpers: file-group enumeration and metadata preservation.

pub mod metadata;
pub mod walker;
