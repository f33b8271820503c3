//! Configuration management for the requestor.
//!
//! Built-in defaults, then an optional TOML file, then environment overrides
//! (`SHADOW_REQUESTOR_<SECTION>__<KEY>`, e.g. `SHADOW_REQUESTOR_WAIT__TIMEOUT_SECS`).

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::catalog::BackupType;
use crate::executor::{CommandHook, CoordinatorSettings};
use crate::paths::VolumeResolver;
use crate::service::WaitPolicy;
use crate::utils::errors::{RequestorError, Result};

pub const ENV_PREFIX: &str = "SHADOW_REQUESTOR";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub operation: OperationConfig,
    #[serde(default)]
    pub wait: WaitConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub log: LogConfig,
    /// Commands run around materialisation for writers that stop a service.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hooks: Vec<CommandHook>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationConfig {
    #[serde(default = "default_backup_type")]
    pub backup_type: BackupType,

    /// Abort the whole run on the first writer or component failure
    #[serde(default)]
    pub stop_on_first_failure: bool,

    #[serde(default)]
    pub additional_restores: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_options: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore_options: Option<String>,

    /// Keep the snapshot set after the backup completes
    #[serde(default)]
    pub keep_snapshots: bool,

    #[serde(default = "default_true")]
    pub partial_file_support: bool,

    #[serde(default)]
    pub bootable_system_state: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitConfig {
    /// Status poll interval for asynchronous service operations
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Deadline per operation; absent blocks until it finishes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,

    /// Extra attempts at starting a snapshot set while another is in progress
    #[serde(default = "default_start_retries")]
    pub start_retries: u32,

    #[serde(default = "default_start_retry_delay_secs")]
    pub start_retry_delay_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Where backed-up files and writer metadata are saved
    #[serde(default = "default_save_dir")]
    pub save_dir: PathBuf,

    /// Writer definition documents for the passthrough snapshot service
    #[serde(default = "default_writers_dir")]
    pub writers_dir: PathBuf,

    /// Local mount roots; paths resolve to the longest matching root
    #[serde(default = "default_volume_roots")]
    pub volume_roots: Vec<String>,

    /// Journal of files staged for replacement at the next boot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reboot_journal: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values
fn default_backup_type() -> BackupType {
    BackupType::Full
}

fn default_true() -> bool {
    true
}

fn default_poll_interval_ms() -> u64 {
    200
}

fn default_start_retries() -> u32 {
    3
}

fn default_start_retry_delay_secs() -> u64 {
    5
}

fn default_save_dir() -> PathBuf {
    PathBuf::from("saved-files")
}

fn default_writers_dir() -> PathBuf {
    PathBuf::from("writers")
}

fn default_volume_roots() -> Vec<String> {
    vec![if cfg!(windows) { "C:\\".to_string() } else { "/".to_string() }]
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for OperationConfig {
    fn default() -> Self {
        Self {
            backup_type: default_backup_type(),
            stop_on_first_failure: false,
            additional_restores: false,
            backup_options: None,
            restore_options: None,
            keep_snapshots: false,
            partial_file_support: default_true(),
            bootable_system_state: false,
        }
    }
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            timeout_secs: None,
            start_retries: default_start_retries(),
            start_retry_delay_secs: default_start_retry_delay_secs(),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            save_dir: default_save_dir(),
            writers_dir: default_writers_dir(),
            volume_roots: default_volume_roots(),
            reboot_journal: None,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration: defaults, then `path` if given, then the environment.
    ///
    /// A missing file is an error only when a path was given explicitly.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder().add_source(config::Config::try_from(&Self::default())?);
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).format(config::FileFormat::Toml));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: Config = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file only.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| RequestorError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config: Config = toml::from_str(&content).map_err(|e| RequestorError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Write the default configuration as TOML.
    pub fn write_default(path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(&Self::default()).map_err(|e| RequestorError::Config(e.to_string()))?;
        std::fs::write(path, content).map_err(|e| RequestorError::Io {
            path: path.to_path_buf(),
            source: e,
        })
    }

    fn validate(&self) -> Result<()> {
        if self.wait.poll_interval_ms == 0 {
            return Err(RequestorError::Config("wait.poll_interval_ms must be positive".to_string()));
        }
        if self.paths.volume_roots.is_empty() {
            return Err(RequestorError::Config("paths.volume_roots must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn wait_policy(&self) -> WaitPolicy {
        WaitPolicy {
            poll_interval: Duration::from_millis(self.wait.poll_interval_ms),
            timeout: self.wait.timeout_secs.map(Duration::from_secs),
        }
    }

    pub fn coordinator_settings(&self) -> CoordinatorSettings {
        let operation = &self.operation;
        CoordinatorSettings {
            backup_type: operation.backup_type,
            stop_on_first_failure: operation.stop_on_first_failure,
            additional_restores: operation.additional_restores,
            backup_options: operation.backup_options.clone(),
            restore_options: operation.restore_options.clone(),
            keep_snapshots: operation.keep_snapshots,
            partial_file_support: operation.partial_file_support,
            bootable_system_state: operation.bootable_system_state,
            wait: self.wait_policy(),
            start_retries: self.wait.start_retries,
            start_retry_delay: Duration::from_secs(self.wait.start_retry_delay_secs),
            save_dir: self.paths.save_dir.clone(),
            reboot_journal: self.paths.reboot_journal.clone(),
            volumes: VolumeResolver::new(self.paths.volume_roots.iter().cloned()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_roundtrips_through_toml() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("requestor.toml");
        Config::write_default(&path).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded, Config::default());
    }

    #[test]
    fn test_file_overrides_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("requestor.toml");
        std::fs::write(
            &path,
            r#"
[operation]
backup_type = "incremental"
stop_on_first_failure = true

[wait]
timeout_secs = 30

[paths]
save_dir = "/var/backups/saved"
"#,
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.operation.backup_type, BackupType::Incremental);
        assert!(config.operation.stop_on_first_failure);
        assert!(config.operation.partial_file_support);
        assert_eq!(config.wait.poll_interval_ms, 200);

        let settings = config.coordinator_settings();
        assert_eq!(settings.wait.timeout, Some(Duration::from_secs(30)));
        assert_eq!(settings.save_dir, PathBuf::from("/var/backups/saved"));
        assert_eq!(settings.start_retries, 3);
    }

    #[test]
    fn test_missing_explicit_file_fails() {
        let temp_dir = TempDir::new().unwrap();
        assert!(Config::load(Some(&temp_dir.path().join("absent.toml"))).is_err());
    }

    #[test]
    fn test_zero_poll_interval_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("requestor.toml");
        std::fs::write(&path, "[wait]\npoll_interval_ms = 0\n").unwrap();
        assert!(Config::from_file(&path).is_err());
    }
}
