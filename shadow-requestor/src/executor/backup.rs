//! Backup coordination.

use std::fmt;
use std::path::Path;
use std::time::SystemTime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::report::{BackupReport, ComponentOutcome, ComponentStatus, Operation};
use super::rules::{self, Inclusion, Purpose};
use super::{
    complete, find_component, gather_statuses, mirror, CoordinatorError, CoordinatorSettings, FileCopy,
    TransferJob, TreeCopy,
};
use crate::catalog::{BackupDocument, BackupType, ComponentInfo, ComponentRecord, FileDescriptor, InstanceId, WriterMetadata};
use crate::fs::walker::WalkOptions;
use crate::paths::{join, to_native, PathResolver, SaveArea, SnapshotMap, Volume};
use crate::selection::SelectionModel;
use crate::service::{BackupContext, ServiceError, SnapshotId, SnapshotProperties, SnapshotService, SnapshotSetId};
use crate::transfer::stats::{format_bytes, format_speed, TransferTimer};
use crate::transfer::{ranges, ExcludeSet, MaterializeMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupPhase {
    Init,
    MetadataGathered,
    ContextSet,
    SnapshotSetStarted,
    PreparedForBackup,
    SnapshotCommitted,
    FilesSaved,
    BackupCompleted,
    Aborted,
}

impl BackupPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::BackupCompleted | Self::Aborted)
    }
}

impl fmt::Display for BackupPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// What a backup run produced.
#[derive(Debug, Clone)]
pub struct BackupRun {
    pub report: BackupReport,
    /// The backup document, when the run completed.
    pub document: Option<BackupDocument>,
}

pub struct BackupCoordinator<S: SnapshotService> {
    service: S,
    settings: CoordinatorSettings,
    resolver: PathResolver,
    cancel: CancellationToken,
    phase: BackupPhase,
    writers: Vec<WriterMetadata>,
    included: Vec<Inclusion>,
    pending_volumes: Vec<Volume>,
    snapshot_set: Option<SnapshotSetId>,
    snapshots: Vec<SnapshotId>,
    report: BackupReport,
    timer: TransferTimer,
}

impl<S: SnapshotService> BackupCoordinator<S> {
    pub fn new(service: S, settings: CoordinatorSettings, cancel: CancellationToken) -> Self {
        Self {
            service,
            resolver: PathResolver::new(settings.volumes.clone()),
            settings,
            cancel,
            phase: BackupPhase::Init,
            writers: Vec::new(),
            included: Vec::new(),
            pending_volumes: Vec::new(),
            snapshot_set: None,
            snapshots: Vec::new(),
            report: BackupReport::new(Operation::Backup),
            timer: TransferTimer::start(),
        }
    }

    pub fn phase(&self) -> BackupPhase {
        self.phase
    }

    pub fn service(&self) -> &S {
        &self.service
    }

    pub fn report(&self) -> &BackupReport {
        &self.report
    }

    pub fn writers(&self) -> &[WriterMetadata] {
        &self.writers
    }

    pub fn included(&self) -> &[Inclusion] {
        &self.included
    }

    pub fn pending_volumes(&self) -> &[Volume] {
        &self.pending_volumes
    }

    fn expect_phase(&self, expected: BackupPhase, operation: &'static str) -> Result<(), CoordinatorError> {
        if self.phase != expected {
            return Err(CoordinatorError::InvalidPhase {
                operation,
                phase: self.phase.to_string(),
            });
        }
        if self.cancel.is_cancelled() {
            return Err(CoordinatorError::Interrupted(operation.to_string()));
        }
        Ok(())
    }

    fn is_writer_failed(&self, instance_id: InstanceId) -> bool {
        self.report.writer(instance_id).is_some_and(|w| w.is_failed())
    }

    /// Query writer statuses after `phase`; newly failed writers are recorded.
    async fn check_writers(&mut self, phase: &str) -> Result<(), CoordinatorError> {
        let statuses = gather_statuses(&mut self.service, &self.settings.wait, &self.cancel).await?;
        for status in statuses {
            let newly_failed = status.state.is_failed() && !self.is_writer_failed(status.instance_id);
            self.report.record_status(&status);
            if !newly_failed {
                continue;
            }

            warn!(
                "Writer {} {} after {} ({})",
                status.writer_name,
                status.state,
                phase,
                status.failure.as_deref().unwrap_or("no failure code")
            );
            if self.settings.stop_on_first_failure {
                return Err(CoordinatorError::WriterFailed {
                    writer: status.writer_name,
                    state: status.state,
                });
            }
        }
        Ok(())
    }

    /// Collect metadata from every writer.
    pub async fn gather_metadata(&mut self) -> Result<(), CoordinatorError> {
        self.expect_phase(BackupPhase::Init, "GatherMetadata")?;
        info!("Gathering writer metadata");

        let operation = self.service.gather_writer_metadata()?;
        complete(operation, &self.settings.wait, &self.cancel, "GatherWriterMetadata").await?;
        self.writers = self.service.writer_metadata()?;

        for writer in &self.writers {
            info!(
                "Writer {} ({}): {} components",
                writer.writer_name,
                writer.instance_id,
                writer.components.len()
            );
            self.report
                .writer_mut(writer.instance_id, writer.writer_id, &writer.writer_name);
        }
        self.check_writers("GatherWriterMetadata").await?;

        self.phase = BackupPhase::MetadataGathered;
        Ok(())
    }

    /// Decide the included components and the volumes to snapshot.
    ///
    /// Returns `false`, and aborts the backup without touching the service,
    /// when no component or no volume is selected.
    pub fn select_components(
        &mut self,
        selection: Option<&SelectionModel>,
        previous: Option<&BackupDocument>,
    ) -> Result<bool, CoordinatorError> {
        self.expect_phase(BackupPhase::MetadataGathered, "SelectComponents")?;
        let backup_type = self.settings.backup_type;

        let included = rules::select_components(&self.writers, selection, Purpose::Backup);
        let mut volumes: Vec<Volume> = Vec::new();
        for inclusion in &included {
            let Some((_, component)) = find_component(&self.writers, inclusion) else {
                continue;
            };
            for (_, descriptor) in component.descriptors() {
                if !descriptor.backup_mask.backup_required(backup_type) {
                    continue;
                }
                match self.resolver.volume_of(&descriptor.path) {
                    Ok(volume) => {
                        if !volumes.iter().any(|v| v.key() == volume.key()) {
                            volumes.push(volume);
                        }
                    }
                    Err(e) => warn!("Ignoring {} of {}: {}", descriptor.path, inclusion.key, e),
                }
            }
        }

        if included.is_empty() || volumes.is_empty() {
            warn!(
                "Nothing to back up ({} components, {} volumes)",
                included.len(),
                volumes.len()
            );
            self.phase = BackupPhase::Aborted;
            self.report.aborted = Some("no component or volume selected".to_string());
            return Ok(false);
        }

        self.service.initialize_for_backup(None)?;
        self.service.set_backup_state(BackupContext {
            backup_type,
            select_components: selection.is_some(),
            bootable_system_state: self.settings.bootable_system_state,
            partial_file_support: self.settings.partial_file_support,
        })?;

        for inclusion in &included {
            let Some((writer, component)) = find_component(&self.writers, inclusion) else {
                continue;
            };
            let key = &inclusion.key;
            self.service.add_component(writer, component)?;
            debug!("Included {} of {} ({:?})", key, writer.writer_name, inclusion.reason);

            if let Some(options) = &self.settings.backup_options {
                self.service.set_backup_options(writer.instance_id, key, options)?;
            }

            if backup_type.uses_previous_stamp() {
                let stamp = previous
                    .and_then(|doc| doc.find_component(writer.writer_id, writer.instance_id, key))
                    .and_then(|record| record.backup_stamp.as_deref());
                match stamp {
                    Some(stamp) => self.service.set_previous_backup_stamp(writer.instance_id, key, stamp)?,
                    None => debug!("No previous backup stamp for {}", key),
                }
            }
        }

        info!(
            "Selected {} components on {} volumes for a {} backup",
            included.len(),
            volumes.len(),
            backup_type
        );
        self.included = included;
        self.pending_volumes = volumes;
        self.phase = BackupPhase::ContextSet;
        Ok(true)
    }

    /// Start the snapshot set and add every pending volume to it.
    pub async fn start_snapshot_set(&mut self) -> Result<SnapshotSetId, CoordinatorError> {
        self.expect_phase(BackupPhase::ContextSet, "StartSnapshotSet")?;

        let retries = self.settings.start_retries;
        let delay = self.settings.start_retry_delay;
        let mut attempt = 0;
        let set_id = loop {
            match self.service.start_snapshot_set() {
                Ok(set_id) => break set_id,
                Err(ServiceError::SnapshotSetInProgress) if attempt < retries => {
                    attempt += 1;
                    warn!(
                        "Another snapshot set is in progress, retrying in {:?} ({}/{})",
                        delay, attempt, retries
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.cancel.cancelled() => {
                            return Err(CoordinatorError::Interrupted("StartSnapshotSet".to_string()));
                        }
                    }
                }
                Err(e) => return Err(e.into()),
            }
        };
        self.snapshot_set = Some(set_id);
        info!("Started snapshot set {}", set_id);

        for volume in &self.pending_volumes {
            let snapshot_id = self.service.add_to_snapshot_set(volume)?;
            info!("Added volume {} to snapshot set", volume.root());
            self.snapshots.push(snapshot_id);
        }

        self.phase = BackupPhase::SnapshotSetStarted;
        Ok(set_id)
    }

    pub async fn prepare_for_backup(&mut self) -> Result<(), CoordinatorError> {
        self.expect_phase(BackupPhase::SnapshotSetStarted, "PrepareForBackup")?;
        info!("Preparing writers for backup");

        let operation = self.service.prepare_for_backup()?;
        complete(operation, &self.settings.wait, &self.cancel, "PrepareForBackup").await?;
        self.check_writers("PrepareForBackup").await?;

        self.phase = BackupPhase::PreparedForBackup;
        Ok(())
    }

    /// Commit the snapshot set and return the properties of its snapshots.
    pub async fn create_snapshot(&mut self) -> Result<Vec<SnapshotProperties>, CoordinatorError> {
        self.expect_phase(BackupPhase::PreparedForBackup, "CreateSnapshot")?;
        info!("Creating snapshot set");

        let operation = self.service.do_snapshot_set()?;
        complete(operation, &self.settings.wait, &self.cancel, "DoSnapshotSet").await?;
        self.check_writers("DoSnapshotSet").await?;

        let mut properties = Vec::with_capacity(self.snapshots.len());
        for snapshot_id in &self.snapshots {
            let snapshot = self.service.snapshot_properties(*snapshot_id)?;
            info!(
                "Snapshot {} of {} at {}",
                snapshot.snapshot_id,
                snapshot.original_volume.root(),
                snapshot.device_root
            );
            properties.push(snapshot);
        }

        self.phase = BackupPhase::SnapshotCommitted;
        Ok(properties)
    }

    /// Copy every included component's files into the save directory and
    /// persist the metadata of the writers involved.
    pub async fn save_files(&mut self, snapshots: &[SnapshotProperties]) -> Result<(), CoordinatorError> {
        self.expect_phase(BackupPhase::SnapshotCommitted, "SaveFiles")?;

        let mut devices = SnapshotMap::new();
        for snapshot in snapshots {
            devices.insert(&snapshot.original_volume, snapshot.device_root.clone());
        }
        let document = self.service.backup_document()?;
        let save_dir = self.settings.save_dir.clone();
        let mut persisted: Vec<InstanceId> = Vec::new();

        for inclusion in self.included.clone() {
            let Some((writer, component)) = find_component(&self.writers, &inclusion) else {
                continue;
            };
            let instance_id = writer.instance_id;
            let key = &inclusion.key;

            let (status, stats) = if self.report.writer(instance_id).is_some_and(|w| w.is_failed()) {
                (ComponentStatus::Skipped("writer failed".to_string()), Default::default())
            } else {
                let job = backup_job(
                    &self.resolver,
                    &save_dir,
                    self.settings.backup_type,
                    writer,
                    component,
                    document.component(instance_id, key),
                    &devices,
                );
                let result = match job {
                    Ok(job) => job.run(MaterializeMode::Replace).await,
                    Err(e) => Err(e),
                };
                match result {
                    Ok(stats) => {
                        info!("Saved {}: {} files, {}", key, stats.total_files(), format_bytes(stats.bytes));
                        (ComponentStatus::Succeeded, stats)
                    }
                    Err(e) => {
                        warn!("Saving {} failed: {}", key, e);
                        (ComponentStatus::Failed(e.to_string()), Default::default())
                    }
                }
            };

            let succeeded = status == ComponentStatus::Succeeded;
            self.service.set_backup_succeeded(instance_id, key, succeeded)?;
            let failure = match &status {
                ComponentStatus::Failed(message) => Some(message.clone()),
                _ => None,
            };
            self.report
                .writer_mut(instance_id, writer.writer_id, &writer.writer_name)
                .components
                .push(ComponentOutcome::new(key, status, stats, &[]));

            if !persisted.contains(&instance_id) {
                let path = writer.save_to_dir(&save_dir)?;
                debug!("Saved metadata of {} to {}", writer.writer_name, path.display());
                persisted.push(instance_id);
            }

            if let (Some(message), true) = (failure, self.settings.stop_on_first_failure) {
                return Err(CoordinatorError::ComponentFailed {
                    component: key.to_string(),
                    message,
                });
            }
        }

        self.phase = BackupPhase::FilesSaved;
        Ok(())
    }

    /// Tell writers the backup is done and return the final backup document.
    pub async fn complete_backup(&mut self) -> Result<BackupDocument, CoordinatorError> {
        self.expect_phase(BackupPhase::FilesSaved, "CompleteBackup")?;
        info!("Completing backup");

        let operation = self.service.backup_complete()?;
        complete(operation, &self.settings.wait, &self.cancel, "BackupComplete").await?;
        self.check_writers("BackupComplete").await?;

        let document = self.service.backup_document()?;
        self.release_snapshots()?;

        self.phase = BackupPhase::BackupCompleted;
        Ok(document)
    }

    fn release_snapshots(&mut self) -> Result<(), CoordinatorError> {
        let Some(set_id) = self.snapshot_set.take() else {
            return Ok(());
        };
        if self.settings.keep_snapshots {
            info!("Keeping snapshot set {}", set_id);
            return Ok(());
        }
        let deleted = self.service.delete_snapshots(set_id)?;
        info!("Deleted {} snapshots of set {}", deleted, set_id);
        Ok(())
    }

    /// Abandon the backup, releasing the snapshot set.
    pub fn abort(&mut self, reason: &str) {
        if self.phase.is_terminal() {
            return;
        }
        error!("Aborting backup in phase {}: {}", self.phase, reason);
        if let Err(e) = self.release_snapshots() {
            warn!("Failed to delete snapshots: {}", e);
        }
        self.phase = BackupPhase::Aborted;
        self.report.aborted = Some(reason.to_string());
    }

    /// Run every phase; any error aborts the backup and is reported.
    pub async fn run(&mut self, selection: Option<&SelectionModel>, previous: Option<&BackupDocument>) -> BackupRun {
        let document = match self.run_phases(selection, previous).await {
            Ok(document) => document,
            Err(e) => {
                self.abort(&e.to_string());
                None
            }
        };
        self.finish(document)
    }

    async fn run_phases(
        &mut self,
        selection: Option<&SelectionModel>,
        previous: Option<&BackupDocument>,
    ) -> Result<Option<BackupDocument>, CoordinatorError> {
        self.gather_metadata().await?;
        if !self.select_components(selection, previous)? {
            return Ok(None);
        }
        self.start_snapshot_set().await?;
        self.prepare_for_backup().await?;
        let snapshots = self.create_snapshot().await?;
        self.save_files(&snapshots).await?;
        Ok(Some(self.complete_backup().await?))
    }

    /// Snapshot a single volume without selecting components or saving files.
    pub async fn snapshot_volume(&mut self, volume: Volume) -> BackupRun {
        let document = match self.snapshot_phases(volume).await {
            Ok(document) => Some(document),
            Err(e) => {
                self.abort(&e.to_string());
                None
            }
        };
        self.finish(document)
    }

    async fn snapshot_phases(&mut self, volume: Volume) -> Result<BackupDocument, CoordinatorError> {
        self.gather_metadata().await?;
        self.service.initialize_for_backup(None)?;
        self.service.set_backup_state(BackupContext {
            backup_type: self.settings.backup_type,
            select_components: false,
            bootable_system_state: self.settings.bootable_system_state,
            partial_file_support: false,
        })?;
        self.pending_volumes = vec![volume];
        self.phase = BackupPhase::ContextSet;

        self.start_snapshot_set().await?;
        self.prepare_for_backup().await?;
        self.create_snapshot().await?;
        self.phase = BackupPhase::FilesSaved;
        self.complete_backup().await
    }

    fn finish(&mut self, document: Option<BackupDocument>) -> BackupRun {
        self.report.elapsed = self.timer.elapsed();
        let totals = self.report.totals();
        info!(
            "Backup finished: {} files, {} at {}",
            totals.total_files(),
            format_bytes(totals.bytes),
            format_speed(self.timer.average_speed(totals.bytes))
        );
        BackupRun {
            report: self.report.clone(),
            document,
        }
    }
}

/// Resolve what one component saves: partial files into the partial area,
/// time-differenced sets into the differenced area, and every descriptor
/// required for `backup_type` into the main tree.
fn backup_job(
    resolver: &PathResolver,
    save_dir: &Path,
    backup_type: BackupType,
    writer: &WriterMetadata,
    component: &ComponentInfo,
    record: Option<&ComponentRecord>,
    devices: &SnapshotMap,
) -> Result<TransferJob, CoordinatorError> {
    let mut base_exclude = ExcludeSet::new();
    for descriptor in &writer.exclude_files {
        base_exclude.add_pattern(descriptor.clone());
    }

    let (partial_files, differenced_files) = match record {
        Some(record) => (record.partial_files.as_slice(), record.differenced_files.as_slice()),
        None => (&[][..], &[][..]),
    };

    let mut job = TransferJob::default();
    for partial in partial_files {
        let descriptor = FileDescriptor::new(&partial.path, &partial.filename, false);
        let source = resolver.resolve_source(&descriptor, true, devices)?;
        let declared = join(&source.original, &[partial.filename.as_str()]);
        base_exclude.insert_file(&declared);

        job.files.push(FileCopy {
            source: to_native(&join(&source.directory, &[partial.filename.as_str()])),
            destination: mirror(save_dir, SaveArea::Partial, &source.volume, &declared)?,
            ranges: ranges::parse(&partial.ranges)?,
        });
    }

    let mut main_exclude = base_exclude.clone();
    for differenced in differenced_files {
        let descriptor = FileDescriptor::new(&differenced.path, &differenced.filespec, differenced.recursive);
        main_exclude.add_pattern(descriptor.clone());
        if differenced.lsn.is_some() {
            debug!("Differenced set {} selects by LSN, not copied", differenced.path);
            continue;
        }

        let source = resolver.resolve_source(&descriptor, true, devices)?;
        let mut options = WalkOptions::new(&differenced.filespec, differenced.recursive);
        options.modified_since = differenced.last_modify_time.map(SystemTime::from);
        job.trees.push(TreeCopy {
            source_dir: to_native(&source.directory),
            destination_dir: mirror(save_dir, SaveArea::Differenced, &source.volume, &source.original)?,
            origin_dir: source.original,
            options,
            exclude: base_exclude.clone(),
        });
    }

    for (_, descriptor) in component.descriptors() {
        let mask = descriptor.backup_mask;
        if !mask.backup_required(backup_type) {
            continue;
        }
        let source = resolver.resolve_source(descriptor, mask.snapshot_required(backup_type), devices)?;
        job.trees.push(TreeCopy {
            source_dir: to_native(&source.directory),
            destination_dir: mirror(save_dir, SaveArea::Main, &source.volume, &source.original)?,
            origin_dir: source.original,
            options: WalkOptions::new(&descriptor.filespec, descriptor.recursive),
            exclude: main_exclude.clone(),
        });
    }

    Ok(job)
}
