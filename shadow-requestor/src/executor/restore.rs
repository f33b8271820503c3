//! Restore coordination.

use std::fmt;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::hooks::RestoreHooks;
use super::policy::run_with_fallback;
use super::report::{ComponentOutcome, ComponentStatus, Operation, RestoreReport};
use super::rules::{self, Purpose};
use super::{blocking, complete, find_component, gather_statuses, CoordinatorError, CoordinatorSettings};
use crate::catalog::{
    BackupDocument, ComponentInfo, ComponentKey, ComponentRecord, FileDescriptor, FileRestoreStatus, InstanceId,
    RestoreMethod, RestoreTarget, WriterMetadata, WriterRestorePolicy,
};
use crate::fs::walker::WalkOptions;
use crate::paths::{
    expand_env, join, mirror_path, to_native, DestinationOrigin, DestinationRule, PathResolver, SaveArea,
};
use crate::selection::SelectionModel;
use crate::service::SnapshotService;
use crate::transfer::stats::{format_bytes, TransferTimer};
use crate::transfer::{ranges, ExcludeSet, MaterializeMode, RebootJournal, TransferError, TransferPlan, TransferStats};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestorePhase {
    Init,
    MetadataGathered,
    SelectedForRestore,
    PreRestoreDispatched,
    FilesRestored,
    PostRestoreDispatched,
    Done,
    Aborted,
}

impl RestorePhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Aborted)
    }
}

impl fmt::Display for RestorePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// What a restore run produced.
#[derive(Debug, Clone)]
pub struct RestoreRun {
    pub report: RestoreReport,
    /// The backup document with restore annotations, when the run got that far.
    pub document: Option<BackupDocument>,
}

/// One component to materialise.
#[derive(Debug, Clone)]
struct RestoreItem {
    instance_id: InstanceId,
    /// Component whose record is annotated in the backup document.
    record_key: ComponentKey,
    /// Component whose declared files are restored; a subcomponent of
    /// `record_key` for subcomponent restores.
    source_key: ComponentKey,
    skip: Option<String>,
}

pub struct RestoreCoordinator<S: SnapshotService> {
    service: S,
    settings: CoordinatorSettings,
    resolver: PathResolver,
    hooks: RestoreHooks,
    cancel: CancellationToken,
    phase: RestorePhase,
    live: Vec<WriterMetadata>,
    catalogs: Vec<WriterMetadata>,
    items: Vec<RestoreItem>,
    report: RestoreReport,
    timer: TransferTimer,
}

impl<S: SnapshotService> RestoreCoordinator<S> {
    pub fn new(service: S, settings: CoordinatorSettings, hooks: RestoreHooks, cancel: CancellationToken) -> Self {
        Self {
            service,
            resolver: PathResolver::new(settings.volumes.clone()),
            settings,
            hooks,
            cancel,
            phase: RestorePhase::Init,
            live: Vec::new(),
            catalogs: Vec::new(),
            items: Vec::new(),
            report: RestoreReport::new(Operation::Restore),
            timer: TransferTimer::start(),
        }
    }

    pub fn phase(&self) -> RestorePhase {
        self.phase
    }

    pub fn service(&self) -> &S {
        &self.service
    }

    pub fn report(&self) -> &RestoreReport {
        &self.report
    }

    /// Keys of the components chosen for materialisation, per writer instance.
    pub fn selected(&self) -> Vec<(InstanceId, ComponentKey)> {
        self.items
            .iter()
            .map(|i| (i.instance_id, i.source_key.clone()))
            .collect()
    }

    fn expect_phase(&self, expected: RestorePhase, operation: &'static str) -> Result<(), CoordinatorError> {
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

    /// Load the backup document into the service and collect live writer metadata.
    pub async fn gather_metadata(&mut self, document: BackupDocument) -> Result<(), CoordinatorError> {
        self.expect_phase(RestorePhase::Init, "GatherMetadata")?;
        info!(
            "Restoring backup {} taken on {} at {}",
            document.backup_id, document.originating_machine, document.created_at
        );
        self.service.initialize_for_restore(document)?;

        let operation = self.service.gather_writer_metadata()?;
        complete(operation, &self.settings.wait, &self.cancel, "GatherWriterMetadata").await?;
        self.live = self.service.writer_metadata()?;
        debug!("{} writers reported metadata", self.live.len());
        self.check_writers("GatherWriterMetadata").await?;

        self.phase = RestorePhase::MetadataGathered;
        Ok(())
    }

    /// Choose the components to restore from those present in the backup document.
    ///
    /// `saved` holds the metadata documents persisted at backup time; they
    /// take precedence over live metadata. Returns `false`, aborting the
    /// restore, when nothing is selected.
    pub fn select_for_restore(
        &mut self,
        selection: Option<&SelectionModel>,
        saved: &[WriterMetadata],
    ) -> Result<bool, CoordinatorError> {
        self.expect_phase(RestorePhase::MetadataGathered, "SelectForRestore")?;
        let document = self.service.backup_document()?;

        let mut catalogs = Vec::with_capacity(document.writers.len());
        for record in &document.writers {
            let catalog = saved
                .iter()
                .chain(self.live.iter())
                .find(|w| w.instance_id == record.instance_id)
                .or_else(|| saved.iter().chain(self.live.iter()).find(|w| w.writer_id == record.writer_id));

            let Some(catalog) = catalog else {
                warn!(
                    "No metadata for writer {} ({}), its components are not restored",
                    record.writer_name, record.instance_id
                );
                let writer = self
                    .report
                    .writer_mut(record.instance_id, record.writer_id, &record.writer_name);
                for component in &record.components {
                    writer.components.push(ComponentOutcome::new(
                        &component.key(),
                        ComponentStatus::Failed("writer metadata not found".to_string()),
                        TransferStats::default(),
                        &[],
                    ));
                }
                continue;
            };

            let mut catalog = catalog.clone();
            catalog.instance_id = record.instance_id;
            catalog.components.retain(|c| record.component(&c.key()).is_some());
            catalogs.push(catalog);
        }

        let mut items: Vec<RestoreItem> = Vec::new();
        for inclusion in rules::select_components(&catalogs, selection, Purpose::Restore) {
            let Some((writer, _)) = find_component(&catalogs, &inclusion) else {
                continue;
            };
            self.mark_selected(writer, &inclusion.key, selection)?;
            items.push(RestoreItem {
                instance_id: writer.instance_id,
                record_key: inclusion.key.clone(),
                source_key: inclusion.key,
                skip: None,
            });
        }

        if let Some(selection) = selection {
            for writer in &catalogs {
                let Some(writer_selection) = selection.writer(writer.writer_id) else {
                    continue;
                };
                let Some(record) = document.writer(writer.instance_id) else {
                    continue;
                };

                for sub in writer_selection.subcomponent_keys() {
                    let Some(ancestor) = record
                        .components
                        .iter()
                        .map(ComponentRecord::key)
                        .filter(|k| k.same_as(&sub) || k.is_ancestor_of(&sub))
                        .max_by_key(ComponentKey::depth)
                    else {
                        warn!("Subcomponent {} of {} has no backed-up ancestor", sub, writer.writer_name);
                        continue;
                    };

                    let source_key = if writer.component(&sub).is_some() { sub.clone() } else { ancestor.clone() };
                    if items
                        .iter()
                        .any(|i| i.instance_id == writer.instance_id && i.source_key.same_as(&source_key))
                    {
                        continue;
                    }

                    if !items
                        .iter()
                        .any(|i| i.instance_id == writer.instance_id && i.record_key.same_as(&ancestor))
                    {
                        self.mark_selected(writer, &ancestor, Some(selection))?;
                    }
                    if !ancestor.same_as(&sub) {
                        self.service.add_restore_subcomponent(writer.instance_id, &ancestor, &sub)?;
                    }
                    debug!("Restoring subcomponent {} through {}", sub, ancestor);
                    items.push(RestoreItem {
                        instance_id: writer.instance_id,
                        record_key: ancestor,
                        source_key,
                        skip: None,
                    });
                }
            }
        }

        if items.is_empty() {
            warn!("Nothing selected for restore");
            self.phase = RestorePhase::Aborted;
            self.report.aborted = Some("no component selected for restore".to_string());
            return Ok(false);
        }

        info!("Selected {} components for restore", items.len());
        self.catalogs = catalogs;
        self.items = items;
        self.phase = RestorePhase::SelectedForRestore;
        Ok(true)
    }

    fn mark_selected(
        &mut self,
        writer: &WriterMetadata,
        key: &ComponentKey,
        selection: Option<&SelectionModel>,
    ) -> Result<(), CoordinatorError> {
        let instance_id = writer.instance_id;
        if writer.restore_method.writer_restore == WriterRestorePolicy::Never {
            debug!("{} of {} does not take part in restore notifications", key, writer.writer_name);
        } else {
            self.service.set_selected_for_restore(instance_id, key, true)?;
        }
        if self.settings.additional_restores {
            self.service.set_additional_restores(instance_id, key, true)?;
        }
        if let Some(options) = &self.settings.restore_options {
            self.service.set_restore_options(instance_id, key, options)?;
        }

        let targets = selection
            .map(|s| s.new_targets_for(writer.writer_id, key))
            .unwrap_or_default();
        for target in &targets {
            self.service.add_new_target(instance_id, key, target)?;
        }
        if !targets.is_empty() {
            self.service.set_restore_target(instance_id, key, RestoreTarget::Alternate)?;
        }
        Ok(())
    }

    /// Notify writers; components a writer vetoes are skipped.
    pub async fn pre_restore(&mut self) -> Result<(), CoordinatorError> {
        self.expect_phase(RestorePhase::SelectedForRestore, "PreRestore")?;
        info!("Dispatching pre-restore");

        let operation = self.service.pre_restore()?;
        complete(operation, &self.settings.wait, &self.cancel, "PreRestore").await?;
        self.check_writers("PreRestore").await?;

        let document = self.service.backup_document()?;
        for item in &mut self.items {
            if let Some(writer) = self.report.writer(item.instance_id).filter(|w| w.is_failed()) {
                let state = writer.state.map(|s| s.to_string()).unwrap_or_default();
                item.skip = Some(format!("writer {state}"));
                continue;
            }
            if let Some(failure) = document
                .component(item.instance_id, &item.record_key)
                .and_then(|c| c.pre_restore_failure.clone())
            {
                warn!("Writer rejected restore of {}: {}", item.record_key, failure);
                item.skip = Some(format!("pre-restore failure: {failure}"));
            }
        }

        self.phase = RestorePhase::PreRestoreDispatched;
        Ok(())
    }

    /// Materialise every selected component under its restore method.
    pub async fn restore_files(&mut self) -> Result<(), CoordinatorError> {
        self.expect_phase(RestorePhase::PreRestoreDispatched, "RestoreFiles")?;
        let document = self.service.backup_document()?;
        let journal = self.settings.reboot_journal.clone().map(RebootJournal::new);

        for catalog in self.catalogs.clone() {
            let items: Vec<RestoreItem> = self
                .items
                .iter()
                .filter(|i| i.instance_id == catalog.instance_id)
                .cloned()
                .collect();
            if items.is_empty() {
                continue;
            }

            let method = catalog.restore_method.method;
            let hooked = method == RestoreMethod::Custom || method.stops_service();
            let mut hook_ran = false;
            let mut hook_failure = None;
            if hooked {
                match self.hooks.get(catalog.writer_id) {
                    Some(hook) => match hook.before_restore(&catalog) {
                        Ok(()) => hook_ran = true,
                        Err(e) => hook_failure = Some(format!("before-restore step failed: {e}")),
                    },
                    None if method == RestoreMethod::Custom => {
                        hook_failure = Some("custom restore method needs a restore hook".to_string())
                    }
                    None => warn!(
                        "Writer {} restores with {:?} but no restore hook is registered",
                        catalog.writer_name, method
                    ),
                }
            }

            let mut stopped = None;
            for item in items {
                let outcome = match self
                    .restore_component(&catalog, &item, &document, journal.as_ref(), hook_failure.as_deref())
                    .await
                {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        stopped = Some(e);
                        break;
                    }
                };
                let failure = match &outcome.status {
                    ComponentStatus::Failed(message) if self.settings.stop_on_first_failure => Some(
                        CoordinatorError::ComponentFailed {
                            component: outcome.component.clone(),
                            message: message.clone(),
                        },
                    ),
                    _ => None,
                };
                self.report
                    .writer_mut(catalog.instance_id, catalog.writer_id, &catalog.writer_name)
                    .components
                    .push(outcome);
                if failure.is_some() {
                    stopped = failure;
                    break;
                }
            }

            // A writer whose hook ran is brought back even when restore stops here.
            if hook_ran {
                if let Some(hook) = self.hooks.get(catalog.writer_id) {
                    if let Err(e) = hook.after_restore(&catalog) {
                        warn!("After-restore step for {} failed: {}", catalog.writer_name, e);
                    }
                }
            }
            if let Some(e) = stopped {
                return Err(e);
            }
        }

        self.phase = RestorePhase::FilesRestored;
        Ok(())
    }

    async fn restore_component(
        &mut self,
        catalog: &WriterMetadata,
        item: &RestoreItem,
        document: &BackupDocument,
        journal: Option<&RebootJournal>,
        hook_failure: Option<&str>,
    ) -> Result<ComponentOutcome, CoordinatorError> {
        let key = &item.source_key;
        let skip = item.skip.clone().or_else(|| {
            catalog
                .component(key)
                .is_none()
                .then(|| "component not in writer metadata".to_string())
        });
        if let Some(reason) = skip {
            info!("Skipping restore of {}: {}", key, reason);
            return Ok(ComponentOutcome::new(
                key,
                ComponentStatus::Skipped(reason),
                TransferStats::default(),
                &[],
            ));
        }
        if let Some(failure) = hook_failure {
            self.service
                .set_file_restore_status(item.instance_id, &item.record_key, FileRestoreStatus::Failed)?;
            return Ok(ComponentOutcome::new(
                key,
                ComponentStatus::Failed(failure.to_string()),
                TransferStats::default(),
                &[],
            ));
        }

        let component = catalog.component(key).cloned().ok_or_else(|| CoordinatorError::ComponentFailed {
            component: key.to_string(),
            message: "component not in writer metadata".to_string(),
        })?;
        let record = document
            .component(item.instance_id, &item.record_key)
            .cloned()
            .unwrap_or_else(|| ComponentRecord::new(component.component_type, &item.record_key));

        let method = catalog.restore_method.method;
        let target = record.restore_target;
        let has_alternate = !catalog.alternate_location_mappings.is_empty();
        let job = RestoreJob {
            resolver: self.resolver.clone(),
            save_dir: self.settings.save_dir.clone(),
            alternate_mappings: catalog.alternate_location_mappings.clone(),
            component,
            record,
            journal: journal.cloned(),
        };

        let outcome = blocking(move || {
            run_with_fallback(method, target, has_alternate, |mode| job.materialize(mode))
        })
        .await?;
        let attempts = outcome.attempts.clone();
        let (status, stats, file_status) = match outcome.result {
            Ok(stats) => {
                info!(
                    "Restored {} as {:?}: {} files, {}",
                    key,
                    attempts.last().copied().unwrap_or(MaterializeMode::Overwrite),
                    stats.total_files(),
                    format_bytes(stats.bytes)
                );
                let file_status = if stats.total_files() == 0 {
                    FileRestoreStatus::None
                } else {
                    FileRestoreStatus::All
                };
                (ComponentStatus::Succeeded, stats, file_status)
            }
            Err(e) => {
                warn!("Restore of {} failed: {}", key, e);
                (ComponentStatus::Failed(e.to_string()), TransferStats::default(), FileRestoreStatus::Failed)
            }
        };

        self.service
            .set_file_restore_status(item.instance_id, &item.record_key, file_status)?;
        Ok(ComponentOutcome::new(key, status, stats, &attempts))
    }

    pub async fn post_restore(&mut self) -> Result<(), CoordinatorError> {
        self.expect_phase(RestorePhase::FilesRestored, "PostRestore")?;
        info!("Dispatching post-restore");

        let operation = self.service.post_restore()?;
        complete(operation, &self.settings.wait, &self.cancel, "PostRestore").await?;
        self.phase = RestorePhase::PostRestoreDispatched;
        self.check_writers("PostRestore").await?;

        self.phase = RestorePhase::Done;
        Ok(())
    }

    pub fn abort(&mut self, reason: &str) {
        if self.phase.is_terminal() {
            return;
        }
        error!("Aborting restore in phase {}: {}", self.phase, reason);
        self.phase = RestorePhase::Aborted;
        self.report.aborted = Some(reason.to_string());
    }

    /// Run every phase; any error aborts the restore and is reported.
    pub async fn run(
        &mut self,
        document: BackupDocument,
        selection: Option<&SelectionModel>,
        saved: &[WriterMetadata],
    ) -> RestoreRun {
        let finished = match self.run_phases(document, selection, saved).await {
            Ok(finished) => finished,
            Err(e) => {
                self.abort(&e.to_string());
                false
            }
        };

        self.report.elapsed = self.timer.elapsed();
        let totals = self.report.totals();
        info!(
            "Restore finished: {} files, {} ({} staged for reboot)",
            totals.total_files(),
            format_bytes(totals.bytes),
            totals.staged_files
        );

        if !finished {
            debug!("Restore stopped in phase {}", self.phase);
        }
        let document = if self.phase == RestorePhase::Init {
            None
        } else {
            self.service.backup_document().ok()
        };
        RestoreRun {
            report: self.report.clone(),
            document,
        }
    }

    async fn run_phases(
        &mut self,
        document: BackupDocument,
        selection: Option<&SelectionModel>,
        saved: &[WriterMetadata],
    ) -> Result<bool, CoordinatorError> {
        self.gather_metadata(document).await?;
        if !self.select_for_restore(selection, saved)? {
            return Ok(false);
        }
        self.pre_restore().await?;
        self.restore_files().await?;
        self.post_restore().await?;
        Ok(true)
    }
}

/// Owned inputs for materialising one component on the blocking pool.
struct RestoreJob {
    resolver: PathResolver,
    save_dir: PathBuf,
    alternate_mappings: Vec<FileDescriptor>,
    component: ComponentInfo,
    record: ComponentRecord,
    journal: Option<RebootJournal>,
}

impl RestoreJob {
    fn materialize(&self, mode: MaterializeMode) -> Result<TransferStats, TransferError> {
        let rule = if mode == MaterializeMode::AlternateLocation {
            DestinationRule::AlternateLocation
        } else {
            DestinationRule::InPlace
        };
        let new_targets = &self.record.new_targets;
        let no_exclude = ExcludeSet::new();
        let mut plan = TransferPlan::new();
        // Entries no alternate mapping moves away from their original location.
        let mut unmapped = Vec::new();

        for (_, descriptor) in self.component.descriptors() {
            let original = expand_env(&descriptor.path);
            let source_dir = self.saved_path(SaveArea::Main, &original)?;
            let destination = self
                .resolver
                .resolve_destination(descriptor, new_targets, &self.alternate_mappings, rule);
            let first = plan.len();
            plan.add_tree(
                &source_dir,
                &to_native(&destination.directory),
                &original,
                &WalkOptions::new(&descriptor.filespec, descriptor.recursive),
                &no_exclude,
            )?;
            if destination.origin == DestinationOrigin::Original {
                unmapped.extend(first..plan.len());
            }
        }

        for partial in &self.record.partial_files {
            let declared = join(&expand_env(&partial.path), &[partial.filename.as_str()]);
            let source = self.saved_path(SaveArea::Partial, &declared)?;
            let descriptor = FileDescriptor::new(&partial.path, &partial.filename, false);
            let destination = self
                .resolver
                .resolve_destination(&descriptor, new_targets, &self.alternate_mappings, rule);
            if destination.origin == DestinationOrigin::Original {
                unmapped.push(plan.len());
            }
            plan.add_file(
                source,
                to_native(&join(&destination.directory, &[partial.filename.as_str()])),
                ranges::parse(&partial.ranges)?,
            );
        }

        for differenced in &self.record.differenced_files {
            if differenced.lsn.is_some() {
                debug!("Differenced set {} selects by LSN, not restored", differenced.path);
                continue;
            }
            let original = expand_env(&differenced.path);
            let source_dir = self.saved_path(SaveArea::Differenced, &original)?;
            let descriptor = FileDescriptor::new(&differenced.path, &differenced.filespec, differenced.recursive);
            let destination = self
                .resolver
                .resolve_destination(&descriptor, new_targets, &self.alternate_mappings, rule);
            let first = plan.len();
            plan.add_tree(
                &source_dir,
                &to_native(&destination.directory),
                &original,
                &WalkOptions::new(&differenced.filespec, differenced.recursive),
                &no_exclude,
            )?;
            if destination.origin == DestinationOrigin::Original {
                unmapped.extend(first..plan.len());
            }
        }

        // An alternate-location attempt never replaces a file in its original place.
        if mode == MaterializeMode::AlternateLocation {
            if let Some(entry) = unmapped
                .into_iter()
                .map(|i| &plan.entries()[i])
                .find(|e| e.destination.exists())
            {
                return Err(TransferError::Conflict {
                    path: entry.destination.clone(),
                });
            }
        }

        debug!("Restore plan has {} files ({:?})", plan.len(), mode);
        plan.execute(mode, self.journal.as_ref())
    }

    fn saved_path(&self, area: SaveArea, declared: &str) -> Result<PathBuf, TransferError> {
        let volume = self
            .resolver
            .volume_of(declared)
            .map_err(|e| TransferError::Unresolved(e.to_string()))?;
        mirror_path(&self.save_dir, area, &volume, declared)
            .ok_or_else(|| TransferError::Unresolved(declared.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ComponentFlags, ComponentType};
    use crate::executor::backup::BackupCoordinator;
    use crate::executor::hooks::RestoreHook;
    use crate::service::{ComponentAnnotation, PassthroughService, WaitPolicy, WriterDefinition};
    use std::fs;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;
    use uuid::Uuid;

    fn writer(dir: &Path, method: RestoreMethod) -> WriterMetadata {
        let mut metadata = WriterMetadata {
            writer_id: Uuid::new_v4(),
            instance_id: Uuid::new_v4(),
            writer_name: "AppWriter".into(),
            instance_name: String::new(),
            usage_type: Default::default(),
            restore_method: Default::default(),
            alternate_location_mappings: vec![],
            include_files: vec![],
            exclude_files: vec![],
            components: vec![ComponentInfo {
                component_type: ComponentType::FileGroup,
                logical_path: None,
                name: "data".into(),
                caption: String::new(),
                selectable: true,
                selectable_for_restore: true,
                flags: ComponentFlags::default(),
                dependencies: vec![],
                files: vec![FileDescriptor::new(&dir.to_string_lossy(), "*", false)],
                database_files: vec![],
                log_files: vec![],
            }],
        };
        metadata.restore_method.method = method;
        metadata
    }

    fn settings(save_dir: &Path) -> CoordinatorSettings {
        CoordinatorSettings {
            save_dir: save_dir.to_path_buf(),
            wait: WaitPolicy {
                poll_interval: Duration::from_millis(5),
                timeout: Some(Duration::from_secs(5)),
            },
            ..Default::default()
        }
    }

    struct Fixture {
        _temp_dir: TempDir,
        data: PathBuf,
        save: PathBuf,
        document: BackupDocument,
        definition: WriterDefinition,
    }

    async fn backed_up(method: RestoreMethod) -> Fixture {
        let temp_dir = TempDir::new().unwrap();
        let data = temp_dir.path().join("data");
        fs::create_dir_all(&data).unwrap();
        fs::write(data.join("main.db"), b"backed up").unwrap();
        let save = temp_dir.path().join("save");

        let definition = WriterDefinition::new(writer(&data, method));
        let service = PassthroughService::with_writers(vec![definition.clone()]);
        let mut backup = BackupCoordinator::new(service, settings(&save), CancellationToken::new());
        let run = backup.run(None, None).await;
        assert!(run.report.succeeded(), "{}", run.report);

        Fixture {
            _temp_dir: temp_dir,
            data,
            save,
            document: run.document.unwrap(),
            definition,
        }
    }

    fn restore_coordinator(
        fixture: &Fixture,
        definition: WriterDefinition,
        hooks: RestoreHooks,
    ) -> RestoreCoordinator<PassthroughService> {
        let service = PassthroughService::with_writers(vec![definition]);
        RestoreCoordinator::new(service, settings(&fixture.save), hooks, CancellationToken::new())
    }

    #[tokio::test]
    async fn test_restore_overwrites_in_place() {
        let fixture = backed_up(RestoreMethod::RestoreIfCanReplace).await;
        fs::write(fixture.data.join("main.db"), b"damaged").unwrap();

        let mut coordinator = restore_coordinator(&fixture, fixture.definition.clone(), RestoreHooks::new());
        let run = coordinator.run(fixture.document.clone(), None, &[]).await;

        assert!(run.report.succeeded(), "{}", run.report);
        assert_eq!(coordinator.phase(), RestorePhase::Done);
        assert_eq!(fs::read(fixture.data.join("main.db")).unwrap(), b"backed up");

        let instance = fixture.definition.metadata.instance_id;
        let record = run
            .document
            .unwrap()
            .component(instance, &ComponentKey::new(None, "data"))
            .unwrap()
            .clone();
        assert!(record.selected_for_restore);
        assert_eq!(record.file_restore_status, FileRestoreStatus::All);
    }

    #[tokio::test]
    async fn test_create_only_conflict_falls_back_to_alternate_location() {
        let fixture = backed_up(RestoreMethod::RestoreIfNotThere).await;
        let alternate = fixture.save.parent().unwrap().join("alternate");

        let mut definition = fixture.definition.clone();
        let mut mapping = FileDescriptor::new(&fixture.data.to_string_lossy(), "*", true);
        mapping.alternate_location = Some(alternate.to_string_lossy().to_string());
        definition.metadata.alternate_location_mappings.push(mapping);

        let mut coordinator = restore_coordinator(&fixture, definition, RestoreHooks::new());
        let run = coordinator.run(fixture.document.clone(), None, &[]).await;

        assert!(run.report.succeeded(), "{}", run.report);
        let outcome = &run.report.writers[0].components[0];
        assert_eq!(outcome.attempts, vec!["CreateOnly", "AlternateLocation"]);
        assert_eq!(fs::read(alternate.join("main.db")).unwrap(), b"backed up");
    }

    #[tokio::test]
    async fn test_create_only_conflict_without_mapping_fails() {
        let fixture = backed_up(RestoreMethod::RestoreIfNotThere).await;

        let mut coordinator = restore_coordinator(&fixture, fixture.definition.clone(), RestoreHooks::new());
        let run = coordinator.run(fixture.document.clone(), None, &[]).await;

        assert!(!run.report.succeeded());
        assert!(run.report.aborted.is_none());
        let outcome = &run.report.writers[0].components[0];
        assert_eq!(outcome.attempts, vec!["CreateOnly"]);
        let record = run
            .document
            .unwrap()
            .component(fixture.definition.metadata.instance_id, &ComponentKey::new(None, "data"))
            .unwrap()
            .clone();
        assert_eq!(record.file_restore_status, FileRestoreStatus::Failed);
    }

    #[tokio::test]
    async fn test_writer_mapping_elsewhere_keeps_original_untouched() {
        let fixture = backed_up(RestoreMethod::RestoreIfNotThere).await;
        fs::write(fixture.data.join("main.db"), b"live").unwrap();
        let alternate = fixture.save.parent().unwrap().join("alternate");

        let mut definition = fixture.definition.clone();
        let elsewhere = fixture.save.parent().unwrap().join("elsewhere");
        let mut mapping = FileDescriptor::new(&elsewhere.to_string_lossy(), "*", true);
        mapping.alternate_location = Some(alternate.to_string_lossy().to_string());
        definition.metadata.alternate_location_mappings.push(mapping);

        let mut coordinator = restore_coordinator(&fixture, definition, RestoreHooks::new());
        let run = coordinator.run(fixture.document.clone(), None, &[]).await;

        assert!(!run.report.succeeded());
        let outcome = &run.report.writers[0].components[0];
        assert_eq!(outcome.attempts, vec!["CreateOnly", "AlternateLocation"]);
        assert!(matches!(outcome.status, ComponentStatus::Failed(_)));
        assert_eq!(fs::read(fixture.data.join("main.db")).unwrap(), b"live");
        assert!(!alternate.exists());
    }

    #[tokio::test]
    async fn test_pre_restore_failure_skips_component() {
        let fixture = backed_up(RestoreMethod::RestoreIfCanReplace).await;
        fs::write(fixture.data.join("main.db"), b"live").unwrap();

        let mut definition = fixture.definition.clone();
        definition.annotations.push(ComponentAnnotation {
            name: "data".into(),
            pre_restore_failure: Some("database online".into()),
            ..Default::default()
        });

        let mut coordinator = restore_coordinator(&fixture, definition, RestoreHooks::new());
        let run = coordinator.run(fixture.document.clone(), None, &[]).await;

        assert!(matches!(
            run.report.writers[0].components[0].status,
            ComponentStatus::Skipped(_)
        ));
        assert_eq!(fs::read(fixture.data.join("main.db")).unwrap(), b"live");
    }

    struct CountingHook {
        calls: Arc<AtomicUsize>,
    }

    impl RestoreHook for CountingHook {
        fn before_restore(&self, _writer: &WriterMetadata) -> Result<(), String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn after_restore(&self, _writer: &WriterMetadata) -> Result<(), String> {
            self.calls.fetch_add(10, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_stop_restore_start_runs_hook() {
        let fixture = backed_up(RestoreMethod::StopRestoreStart).await;
        let calls = Arc::new(AtomicUsize::new(0));
        let mut hooks = RestoreHooks::new();
        hooks.register(
            fixture.definition.metadata.writer_id,
            Box::new(CountingHook { calls: calls.clone() }),
        );

        let mut coordinator = restore_coordinator(&fixture, fixture.definition.clone(), hooks);
        let run = coordinator.run(fixture.document.clone(), None, &[]).await;

        assert!(run.report.succeeded(), "{}", run.report);
        assert_eq!(calls.load(Ordering::SeqCst), 11);
    }

    #[tokio::test]
    async fn test_stop_on_first_failure_still_runs_after_restore() {
        let fixture = backed_up(RestoreMethod::StopRestoreStart).await;
        let live = fixture.data.join("main.db");
        let mut permissions = fs::metadata(&live).unwrap().permissions();
        permissions.set_readonly(true);
        fs::set_permissions(&live, permissions).unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let mut hooks = RestoreHooks::new();
        hooks.register(
            fixture.definition.metadata.writer_id,
            Box::new(CountingHook { calls: calls.clone() }),
        );
        let mut settings = settings(&fixture.save);
        settings.stop_on_first_failure = true;
        let service = PassthroughService::with_writers(vec![fixture.definition.clone()]);
        let mut coordinator = RestoreCoordinator::new(service, settings, hooks, CancellationToken::new());

        let run = coordinator.run(fixture.document.clone(), None, &[]).await;

        assert!(run.report.aborted.is_some());
        assert_eq!(coordinator.phase(), RestorePhase::Aborted);
        assert_eq!(calls.load(Ordering::SeqCst), 11);
        assert!(matches!(
            run.report.writers[0].components[0].status,
            ComponentStatus::Failed(_)
        ));
        assert_eq!(fs::read(&live).unwrap(), b"backed up");
    }

    #[tokio::test]
    async fn test_custom_method_requires_hook() {
        let fixture = backed_up(RestoreMethod::Custom).await;

        let mut coordinator = restore_coordinator(&fixture, fixture.definition.clone(), RestoreHooks::new());
        let run = coordinator.run(fixture.document.clone(), None, &[]).await;

        assert!(matches!(
            &run.report.writers[0].components[0].status,
            ComponentStatus::Failed(reason) if reason.contains("restore hook")
        ));
    }

    #[tokio::test]
    async fn test_new_target_redirects_restore() {
        let fixture = backed_up(RestoreMethod::RestoreIfNotThere).await;
        let redirected = fixture.save.parent().unwrap().join("redirected");
        let writer_id = fixture.definition.metadata.writer_id;

        let text = format!(
            "\"{}\": \"data\" {{ \"{}{}*\" # \"{}\" }};",
            writer_id,
            fixture.data.display(),
            std::path::MAIN_SEPARATOR,
            redirected.display()
        );
        let selection = SelectionModel::parse(&text).unwrap();

        let mut coordinator = restore_coordinator(&fixture, fixture.definition.clone(), RestoreHooks::new());
        let run = coordinator.run(fixture.document.clone(), Some(&selection), &[]).await;

        assert!(run.report.succeeded(), "{}", run.report);
        assert_eq!(fs::read(redirected.join("main.db")).unwrap(), b"backed up");
        let record = run
            .document
            .unwrap()
            .component(fixture.definition.metadata.instance_id, &ComponentKey::new(None, "data"))
            .unwrap()
            .clone();
        assert_eq!(record.restore_target, RestoreTarget::Alternate);
        assert_eq!(record.new_targets.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_writer_metadata_is_reported() {
        let fixture = backed_up(RestoreMethod::RestoreIfCanReplace).await;
        let stranger = WriterDefinition::new(writer(&fixture.data, RestoreMethod::RestoreIfCanReplace));

        let mut coordinator = restore_coordinator(&fixture, stranger, RestoreHooks::new());
        let run = coordinator.run(fixture.document.clone(), None, &[]).await;

        assert!(!run.report.succeeded());
        assert_eq!(run.report.aborted.as_deref(), Some("no component selected for restore"));
        assert_eq!(run.report.failed_components(), 1);
    }

    #[tokio::test]
    async fn test_saved_metadata_used_when_writer_absent() {
        let fixture = backed_up(RestoreMethod::RestoreIfCanReplace).await;
        let saved = WriterMetadata::load_all_from_dir(&fixture.save).unwrap();
        assert_eq!(saved.len(), 1);

        let mut coordinator = restore_coordinator(
            &fixture,
            WriterDefinition::new(writer(&fixture.data, RestoreMethod::Undefined)),
            RestoreHooks::new(),
        );
        let run = coordinator.run(fixture.document.clone(), None, &saved).await;
        assert!(run.report.succeeded(), "{}", run.report);
        assert_eq!(coordinator.selected().len(), 1);
    }
}
