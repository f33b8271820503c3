//! Owning-volume resolution for declared paths.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{segments, strip_prefix};

/// A snapshot-able unit: a local volume root or a remote file share.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Volume {
    Local { root: String },
    Share { host: String, share: String },
}

impl Volume {
    /// The root as it is handed to the snapshot service.
    pub fn root(&self) -> String {
        match self {
            Self::Local { root } => root.clone(),
            Self::Share { host, share } => format!("\\\\{host}\\{share}\\"),
        }
    }

    pub fn is_share(&self) -> bool {
        matches!(self, Self::Share { .. })
    }

    /// Identity used to keep exactly one snapshot entry per volume.
    pub fn key(&self) -> String {
        match self {
            Self::Local { root } => {
                let parts: Vec<String> = segments(root).iter().map(|s| s.to_ascii_lowercase()).collect();
                format!("local:/{}", parts.join("/"))
            }
            Self::Share { host, share } => {
                format!("share://{}/{}", host.to_ascii_lowercase(), share.to_ascii_lowercase())
            }
        }
    }

    /// Directory name used for this volume inside a save tree.
    pub fn mirror_name(&self) -> String {
        let raw = match self {
            Self::Local { root } => {
                let parts = segments(root);
                if parts.is_empty() {
                    "root".to_string()
                } else {
                    parts.join("_").trim_end_matches(':').to_string()
                }
            }
            Self::Share { host, share } => format!("unc_{host}_{share}"),
        };
        raw.chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect()
    }

    /// Segments of `path` below this volume's root.
    pub fn relative<'a>(&self, path: &'a str) -> Option<Vec<&'a str>> {
        strip_prefix(&self.root(), path)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VolumeError {
    #[error("no configured volume contains {0}")]
    NoVolume(String),

    #[error("share path {0} is missing its share name")]
    MalformedShare(String),

    #[error("volume {0} is not part of the snapshot set")]
    NotInSnapshot(String),
}

/// Maps declared paths to the volume that owns them.
#[derive(Debug, Clone)]
pub struct VolumeResolver {
    roots: Vec<String>,
}

impl VolumeResolver {
    /// Create a resolver over local mount roots (e.g. `/`, `/srv`, `D:\`).
    pub fn new<I, R>(roots: I) -> Self
    where
        I: IntoIterator<Item = R>,
        R: Into<String>,
    {
        Self {
            roots: roots.into_iter().map(Into::into).collect(),
        }
    }

    /// Resolve the owning volume of `path`.
    ///
    /// UNC paths always resolve to a share; drive-letter paths to their drive
    /// root; anything else to the longest configured root that prefixes it.
    pub fn volume_of(&self, path: &str) -> Result<Volume, VolumeError> {
        if path.starts_with("\\\\") || path.starts_with("//") {
            let parts = segments(path);
            return match parts.as_slice() {
                [host, share, ..] => Ok(Volume::Share {
                    host: host.to_string(),
                    share: share.to_string(),
                }),
                _ => Err(VolumeError::MalformedShare(path.to_string())),
            };
        }

        if let Some(first) = segments(path).first() {
            let bytes = first.as_bytes();
            if bytes.len() == 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic() {
                return Ok(Volume::Local {
                    root: format!("{}\\", first.to_ascii_uppercase()),
                });
            }
        }

        self.roots
            .iter()
            .filter(|root| strip_prefix(root, path).is_some())
            .max_by_key(|root| segments(root).len())
            .map(|root| Volume::Local { root: root.clone() })
            .ok_or_else(|| VolumeError::NoVolume(path.to_string()))
    }
}

impl Default for VolumeResolver {
    fn default() -> Self {
        Self::new(["/"])
    }
}
