//! Writer-specific steps run around file materialisation.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::process::Command;
use tracing::info;

use crate::catalog::{WriterId, WriterMetadata};

/// Stops and restarts whatever a writer needs quiet while its files are replaced.
pub trait RestoreHook: Send + Sync {
    fn before_restore(&self, writer: &WriterMetadata) -> Result<(), String>;
    fn after_restore(&self, writer: &WriterMetadata) -> Result<(), String>;
}

/// Hook that runs external commands.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandHook {
    pub writer_id: WriterId,
    /// Program and arguments run before materialisation.
    #[serde(default)]
    pub before: Vec<String>,
    /// Program and arguments run after materialisation.
    #[serde(default)]
    pub after: Vec<String>,
}

impl CommandHook {
    fn run(&self, step: &str, argv: &[String], writer: &WriterMetadata) -> Result<(), String> {
        let Some((program, args)) = argv.split_first() else {
            return Ok(());
        };
        info!("Running {} step for writer {}: {}", step, writer.writer_name, argv.join(" "));

        let status = Command::new(program)
            .args(args)
            .env("SHADOW_REQUESTOR_WRITER_ID", writer.writer_id.to_string())
            .env(
                "SHADOW_REQUESTOR_SERVICE",
                writer.restore_method.service.as_deref().unwrap_or_default(),
            )
            .status()
            .map_err(|e| format!("{step} step {program}: {e}"))?;

        if status.success() {
            Ok(())
        } else {
            Err(format!("{step} step {program} exited with {status}"))
        }
    }
}

impl RestoreHook for CommandHook {
    fn before_restore(&self, writer: &WriterMetadata) -> Result<(), String> {
        self.run("before", &self.before, writer)
    }

    fn after_restore(&self, writer: &WriterMetadata) -> Result<(), String> {
        self.run("after", &self.after, writer)
    }
}

/// Registered hooks, keyed by writer class.
#[derive(Default)]
pub struct RestoreHooks {
    hooks: HashMap<WriterId, Box<dyn RestoreHook>>,
}

impl RestoreHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_commands(commands: &[CommandHook]) -> Self {
        let mut hooks = Self::new();
        for command in commands {
            hooks.register(command.writer_id, Box::new(command.clone()));
        }
        hooks
    }

    pub fn register(&mut self, writer_id: WriterId, hook: Box<dyn RestoreHook>) {
        self.hooks.insert(writer_id, hook);
    }

    pub fn get(&self, writer_id: WriterId) -> Option<&dyn RestoreHook> {
        self.hooks.get(&writer_id).map(|h| h.as_ref())
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }
}
