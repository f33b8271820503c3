//! Crate-level error type for the requestor.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

use crate::catalog::CatalogError;
use crate::executor::CoordinatorError;
use crate::paths::VolumeError;
use crate::selection::SelectionError;
use crate::service::ServiceError;
use crate::transfer::TransferError;

#[derive(Error, Debug)]
pub enum RequestorError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Selection error: {0}")]
    Selection(#[from] SelectionError),

    #[error("Writer document error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("Transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error("Snapshot service error: {0}")]
    Service(#[from] ServiceError),

    #[error("{0}")]
    Coordinator(#[from] CoordinatorError),

    #[error("Volume error: {0}")]
    Volume(#[from] VolumeError),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl From<config::ConfigError> for RequestorError {
    fn from(e: config::ConfigError) -> Self {
        Self::Config(e.to_string())
    }
}

/// Broad classes of failure, for exit codes and reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Parse,
    NotFound,
    Conflict,
    ResourceExhausted,
    ExternalFailure,
    Io,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Parse => "parse",
            Self::NotFound => "not found",
            Self::Conflict => "conflict",
            Self::ResourceExhausted => "resource exhausted",
            Self::ExternalFailure => "external failure",
            Self::Io => "I/O",
        };
        f.write_str(name)
    }
}

fn io_kind(e: &std::io::Error) -> ErrorKind {
    match e.kind() {
        std::io::ErrorKind::NotFound => ErrorKind::NotFound,
        std::io::ErrorKind::AlreadyExists => ErrorKind::Conflict,
        _ => ErrorKind::Io,
    }
}

fn selection_kind(e: &SelectionError) -> ErrorKind {
    match e {
        SelectionError::TooLarge { .. } => ErrorKind::ResourceExhausted,
        SelectionError::Io { source, .. } => io_kind(source),
        _ => ErrorKind::Parse,
    }
}

fn catalog_kind(e: &CatalogError) -> ErrorKind {
    match e {
        CatalogError::Parse(_) => ErrorKind::Parse,
        CatalogError::TooLarge { .. } => ErrorKind::ResourceExhausted,
        CatalogError::Io { source, .. } => io_kind(source),
    }
}

fn transfer_kind(e: &TransferError) -> ErrorKind {
    match e {
        TransferError::Conflict { .. } => ErrorKind::Conflict,
        TransferError::MalformedRanges(_) => ErrorKind::Parse,
        TransferError::Unresolved(_) => ErrorKind::NotFound,
        TransferError::Io { source, .. } => io_kind(source),
        TransferError::ShortRead { .. } | TransferError::Journal(_) => ErrorKind::Io,
    }
}

fn volume_kind(e: &VolumeError) -> ErrorKind {
    match e {
        VolumeError::MalformedShare(_) => ErrorKind::Parse,
        VolumeError::NoVolume(_) | VolumeError::NotInSnapshot(_) => ErrorKind::NotFound,
    }
}

fn service_kind(e: &ServiceError) -> ErrorKind {
    match e {
        ServiceError::SnapshotSetInProgress => ErrorKind::ResourceExhausted,
        ServiceError::NotFound(_) => ErrorKind::NotFound,
        ServiceError::InvalidState(_) | ServiceError::OperationFailed(_) => ErrorKind::ExternalFailure,
        ServiceError::Catalog(e) => catalog_kind(e),
        ServiceError::Volume(e) => volume_kind(e),
        ServiceError::Io(e) => io_kind(e),
    }
}

fn coordinator_kind(e: &CoordinatorError) -> ErrorKind {
    match e {
        CoordinatorError::Service(e) => service_kind(e),
        CoordinatorError::Catalog(e) => catalog_kind(e),
        CoordinatorError::Transfer(e) => transfer_kind(e),
        CoordinatorError::Volume(e) => volume_kind(e),
        _ => ErrorKind::ExternalFailure,
    }
}

impl RequestorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) => ErrorKind::Parse,
            Self::Selection(e) => selection_kind(e),
            Self::Catalog(e) => catalog_kind(e),
            Self::Transfer(e) => transfer_kind(e),
            Self::Service(e) => service_kind(e),
            Self::Coordinator(e) => coordinator_kind(e),
            Self::Volume(e) => volume_kind(e),
            Self::Io { source, .. } => io_kind(source),
        }
    }
}

pub type Result<T> = std::result::Result<T, RequestorError>;
