//! Source and destination resolution for declared file entries.

use std::collections::HashMap;

use super::{expand_env, join, same_path, strip_prefix, wildcard, Volume, VolumeError, VolumeResolver};
use crate::catalog::FileDescriptor;
use crate::selection::NewTarget;

/// Snapshot device roots keyed by the volume they shadow.
#[derive(Debug, Clone, Default)]
pub struct SnapshotMap {
    devices: HashMap<String, String>,
}

impl SnapshotMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, volume: &Volume, device_root: impl Into<String>) {
        self.devices.insert(volume.key(), device_root.into());
    }

    pub fn device_for(&self, volume: &Volume) -> Option<&str> {
        self.devices.get(&volume.key()).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

/// Where to read a declared directory from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSource {
    /// The declared directory with placeholders expanded.
    pub original: String,
    pub volume: Volume,
    /// Directory to read from: below the snapshot device, or `original`.
    pub directory: String,
    pub from_snapshot: bool,
}

/// Whether the restore method allows alternate-location mappings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestinationRule {
    InPlace,
    AlternateLocation,
}

/// What decided a resolved destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestinationOrigin {
    NewTarget,
    AlternateMapping,
    Original,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedDestination {
    pub directory: String,
    pub origin: DestinationOrigin,
}

/// Resolves declared file entries against volumes, snapshots and redirections.
#[derive(Debug, Clone, Default)]
pub struct PathResolver {
    volumes: VolumeResolver,
}

impl PathResolver {
    pub fn new(volumes: VolumeResolver) -> Self {
        Self { volumes }
    }

    pub fn volumes(&self) -> &VolumeResolver {
        &self.volumes
    }

    /// Owning volume of a declared directory, placeholders expanded.
    pub fn volume_of(&self, declared: &str) -> Result<Volume, VolumeError> {
        self.volumes.volume_of(&expand_env(declared))
    }

    /// Resolve where to read `descriptor` from.
    ///
    /// When `from_snapshot` is set the volume must be in `snapshots` and the
    /// directory is rebased onto its device root; otherwise the live path is
    /// passed through.
    pub fn resolve_source(
        &self,
        descriptor: &FileDescriptor,
        from_snapshot: bool,
        snapshots: &SnapshotMap,
    ) -> Result<ResolvedSource, VolumeError> {
        let original = expand_env(&descriptor.path);
        let volume = self.volumes.volume_of(&original)?;

        if !from_snapshot {
            return Ok(ResolvedSource {
                directory: original.clone(),
                original,
                volume,
                from_snapshot: false,
            });
        }

        let device = snapshots
            .device_for(&volume)
            .ok_or_else(|| VolumeError::NotInSnapshot(volume.root()))?;
        let relative = volume
            .relative(&original)
            .ok_or_else(|| VolumeError::NoVolume(original.clone()))?;

        Ok(ResolvedSource {
            directory: join(device, &relative),
            original,
            volume,
            from_snapshot: true,
        })
    }

    /// Resolve where files of `descriptor` are restored to.
    ///
    /// New targets are tried first in the order given (most recent first),
    /// then alternate-location mappings when `rule` allows them, then the
    /// original directory.
    pub fn resolve_destination(
        &self,
        descriptor: &FileDescriptor,
        new_targets: &[NewTarget],
        alternate_mappings: &[FileDescriptor],
        rule: DestinationRule,
    ) -> ResolvedDestination {
        let directory = expand_env(&descriptor.path);

        for target in new_targets {
            if let Some(rest) = redirect(
                &target.source_directory,
                &target.source_filespec,
                target.recursive,
                &directory,
                &descriptor.filespec,
            ) {
                return ResolvedDestination {
                    directory: join(&expand_env(&target.destination_directory), &rest),
                    origin: DestinationOrigin::NewTarget,
                };
            }
        }

        if rule == DestinationRule::AlternateLocation {
            for mapping in alternate_mappings {
                let Some(alternate) = mapping.alternate_location.as_deref() else {
                    continue;
                };
                if let Some(rest) = redirect(
                    &mapping.path,
                    &mapping.filespec,
                    mapping.recursive,
                    &directory,
                    &descriptor.filespec,
                ) {
                    return ResolvedDestination {
                        directory: join(&expand_env(alternate), &rest),
                        origin: DestinationOrigin::AlternateMapping,
                    };
                }
            }
        }

        ResolvedDestination {
            directory,
            origin: DestinationOrigin::Original,
        }
    }
}

/// Segments of `directory` below `rule_dir` if the rule applies to it.
fn redirect<'a>(
    rule_dir: &str,
    rule_filespec: &str,
    recursive: bool,
    directory: &'a str,
    filespec: &str,
) -> Option<Vec<&'a str>> {
    let rule_dir = expand_env(rule_dir);
    let rest = if recursive {
        strip_prefix(&rule_dir, directory)?
    } else if same_path(&rule_dir, directory) {
        Vec::new()
    } else {
        return None;
    };

    wildcard::matches(rule_filespec, filespec).then_some(rest)
}
