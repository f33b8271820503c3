//! Utility modules for the requestor.

pub mod errors;
pub mod logger;

pub use errors::{ErrorKind, RequestorError, Result};
