//! End-of-run reports.

use serde::Serialize;
use std::fmt;
use std::time::Duration;

use crate::catalog::{ComponentKey, InstanceId, WriterId};
use crate::service::{WriterState, WriterStatusReport};
use crate::transfer::stats::{format_bytes, format_duration};
use crate::transfer::{MaterializeMode, TransferStats};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Backup,
    Restore,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Backup => f.write_str("Backup"),
            Self::Restore => f.write_str("Restore"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum ComponentStatus {
    Succeeded,
    Failed(String),
    Skipped(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComponentOutcome {
    pub component: String,
    pub status: ComponentStatus,
    pub stats: TransferStats,
    /// Restore modes attempted, in order.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attempts: Vec<String>,
}

impl ComponentOutcome {
    pub fn new(key: &ComponentKey, status: ComponentStatus, stats: TransferStats, attempts: &[MaterializeMode]) -> Self {
        Self {
            component: key.to_string(),
            status,
            stats,
            attempts: attempts.iter().map(|m| format!("{m:?}")).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WriterOutcome {
    pub instance_id: InstanceId,
    pub writer_id: WriterId,
    pub writer_name: String,
    pub state: Option<WriterState>,
    pub failure: Option<String>,
    pub components: Vec<ComponentOutcome>,
}

impl WriterOutcome {
    pub fn is_failed(&self) -> bool {
        self.state.is_some_and(|s| s.is_failed())
    }
}

/// Per-writer results of one backup or restore run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub operation: Operation,
    pub writers: Vec<WriterOutcome>,
    /// Why the run stopped early, if it did.
    pub aborted: Option<String>,
    #[serde(with = "seconds")]
    pub elapsed: Duration,
}

pub type BackupReport = RunReport;
pub type RestoreReport = RunReport;

impl RunReport {
    pub fn new(operation: Operation) -> Self {
        Self {
            operation,
            writers: Vec::new(),
            aborted: None,
            elapsed: Duration::ZERO,
        }
    }

    pub fn writer_mut(&mut self, instance_id: InstanceId, writer_id: WriterId, writer_name: &str) -> &mut WriterOutcome {
        let index = match self.writers.iter().position(|w| w.instance_id == instance_id) {
            Some(index) => index,
            None => {
                self.writers.push(WriterOutcome {
                    instance_id,
                    writer_id,
                    writer_name: writer_name.to_string(),
                    state: None,
                    failure: None,
                    components: Vec::new(),
                });
                self.writers.len() - 1
            }
        };
        &mut self.writers[index]
    }

    pub fn writer(&self, instance_id: InstanceId) -> Option<&WriterOutcome> {
        self.writers.iter().find(|w| w.instance_id == instance_id)
    }

    /// Record the latest reported state of a writer.
    pub fn record_status(&mut self, status: &WriterStatusReport) {
        let writer = self.writer_mut(status.instance_id, status.writer_id, &status.writer_name);
        // A failure sticks even if a later gather reports the writer stable.
        if writer.is_failed() && !status.state.is_failed() {
            return;
        }
        writer.state = Some(status.state);
        writer.failure = status.failure.clone();
    }

    pub fn totals(&self) -> TransferStats {
        let mut totals = TransferStats::default();
        for component in self.writers.iter().flat_map(|w| &w.components) {
            totals.merge(&component.stats);
        }
        totals
    }

    pub fn failed_components(&self) -> usize {
        self.writers
            .iter()
            .flat_map(|w| &w.components)
            .filter(|c| matches!(c.status, ComponentStatus::Failed(_)))
            .count()
    }

    /// Whether every required component was processed and nothing aborted the run.
    pub fn succeeded(&self) -> bool {
        self.aborted.is_none() && self.failed_components() == 0 && !self.writers.iter().any(|w| w.is_failed())
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let result = if self.succeeded() { "succeeded" } else { "FAILED" };
        writeln!(f, "{} {} in {}", self.operation, result, format_duration(self.elapsed.as_secs()))?;
        if let Some(reason) = &self.aborted {
            writeln!(f, "  aborted: {}", reason)?;
        }

        for writer in &self.writers {
            let state = writer.state.map(|s| s.to_string()).unwrap_or_else(|| "unknown".to_string());
            write!(f, "  writer {} ({}): {}", writer.writer_name, writer.instance_id, state)?;
            if let Some(failure) = &writer.failure {
                write!(f, " [{}]", failure)?;
            }
            writeln!(f)?;

            for component in &writer.components {
                let status = match &component.status {
                    ComponentStatus::Succeeded => "ok".to_string(),
                    ComponentStatus::Failed(reason) => format!("failed: {reason}"),
                    ComponentStatus::Skipped(reason) => format!("skipped: {reason}"),
                };
                writeln!(
                    f,
                    "    {} {} ({} files, {})",
                    component.component,
                    status,
                    component.stats.total_files(),
                    format_bytes(component.stats.bytes)
                )?;
            }
        }

        let totals = self.totals();
        write!(f, "  total: {} files, {}", totals.total_files(), format_bytes(totals.bytes))
    }
}

mod seconds {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(duration.as_secs_f64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn status(instance_id: InstanceId, state: WriterState) -> WriterStatusReport {
        WriterStatusReport {
            instance_id,
            writer_id: Uuid::nil(),
            writer_name: "DbWriter".into(),
            state,
            failure: state.is_failed().then(|| "E_WRITER_FAILED".to_string()),
        }
    }

    #[test]
    fn test_failure_is_sticky() {
        let instance = Uuid::new_v4();
        let mut report = RunReport::new(Operation::Backup);
        report.record_status(&status(instance, WriterState::FailedAtFreeze));
        report.record_status(&status(instance, WriterState::Stable));

        let writer = report.writer(instance).unwrap();
        assert_eq!(writer.state, Some(WriterState::FailedAtFreeze));
        assert_eq!(writer.failure.as_deref(), Some("E_WRITER_FAILED"));
        assert!(!report.succeeded());
    }

    #[test]
    fn test_totals_and_rendering() {
        let instance = Uuid::new_v4();
        let mut report = RunReport::new(Operation::Restore);
        report.record_status(&status(instance, WriterState::Stable));

        let mut stats = TransferStats::default();
        stats.record_file(2048);
        report.writer_mut(instance, Uuid::nil(), "DbWriter").components.push(ComponentOutcome::new(
            &ComponentKey::new(Some("db"), "main"),
            ComponentStatus::Succeeded,
            stats,
            &[MaterializeMode::Overwrite],
        ));

        assert!(report.succeeded());
        assert_eq!(report.totals().bytes, 2048);
        let text = report.to_string();
        assert!(text.starts_with("Restore succeeded"));
        assert!(text.contains("\\db\\main ok (1 files, 2.00 KB)"));
    }

    #[test]
    fn test_failed_component_fails_run() {
        let mut report = RunReport::new(Operation::Backup);
        report.writer_mut(Uuid::new_v4(), Uuid::nil(), "W").components.push(ComponentOutcome::new(
            &ComponentKey::new(None, "data"),
            ComponentStatus::Failed("disk full".into()),
            TransferStats::default(),
            &[],
        ));
        assert_eq!(report.failed_components(), 1);
        assert!(!report.succeeded());
    }
}
