//! Shadow-copy backup and restore requestor.
//!
//! Selects writer components, drives a snapshot service through the backup
//! and restore phases, and moves files between snapshots, the save area and
//! their restore destinations.

pub mod catalog;
pub mod config;
pub mod daemon;
pub mod executor;
pub mod fs;
pub mod paths;
pub mod selection;
pub mod service;
pub mod transfer;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use utils::errors::{ErrorKind, RequestorError};
pub type Result<T> = std::result::Result<T, RequestorError>;
