//! Selection text: which writers, components and subcomponents take part in
//! an operation, and where restored files should be redirected.
//!
//! ```text
//! "writer-guid": "db\main" {"C:\data\*.mdf" # "D:\restore"}, "config";
//! "writer-guid": "db\main\logs";
//! ```
//!
//! The first `;`-terminated block for a writer lists components; later blocks
//! for the same writer list subcomponents. A component token is a bare name,
//! `logical-path\name`, or a logical path with a trailing separator.

mod lexer;
mod parser;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

use crate::catalog::{ComponentKey, WriterId};
use crate::paths;

/// Largest selection file accepted.
pub const MAX_SELECTION_BYTES: u64 = 1024 * 1024;

/// A selection-declared redirection of a source file spec to a new directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTarget {
    pub source_directory: String,
    pub source_filespec: String,
    #[serde(default)]
    pub recursive: bool,
    pub destination_directory: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ComponentToken {
    text: String,
    path_only: bool,
    /// Most recently declared first.
    targets: Vec<NewTarget>,
}

impl ComponentToken {
    fn new(raw: &str, mut declared_targets: Vec<NewTarget>) -> Self {
        let trimmed = raw.trim();
        let path_only = trimmed.len() > 1 && trimmed.ends_with(['\\', '/']);
        declared_targets.reverse();
        Self {
            text: trimmed.trim_matches(['\\', '/']).to_string(),
            path_only,
            targets: declared_targets,
        }
    }

    /// A token names a component by bare name, by full path, or by the
    /// logical path its leaf sits under. A trailing separator restricts the
    /// token to the last form.
    fn matches(&self, key: &ComponentKey) -> bool {
        let under_path = key
            .logical_path
            .as_deref()
            .is_some_and(|path| !paths::segments(path).is_empty() && paths::same_path(&self.text, path));
        if self.path_only {
            return under_path;
        }
        if paths::segments(&self.text).len() == 1 && self.text.eq_ignore_ascii_case(&key.name) {
            return true;
        }
        under_path || paths::same_path(&self.text, &key.full_path())
    }
}

/// The selected components and subcomponents of one writer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ComponentSelection {
    components: Vec<ComponentToken>,
    subcomponents: Vec<ComponentToken>,
}

impl ComponentSelection {
    pub fn is_component_selected(&self, key: &ComponentKey) -> bool {
        self.components.iter().any(|t| t.matches(key))
    }

    pub fn is_subcomponent_selected(&self, key: &ComponentKey) -> bool {
        self.subcomponents.iter().any(|t| t.matches(key))
    }

    pub fn has_subcomponents(&self) -> bool {
        !self.subcomponents.is_empty()
    }

    /// Subcomponent tokens as declared, for locating their backed-up ancestors.
    pub fn subcomponent_keys(&self) -> Vec<ComponentKey> {
        self.subcomponents
            .iter()
            .map(|t| match paths::split_last(&t.text) {
                Some((path, name)) => ComponentKey::new(Some(path), name),
                None => ComponentKey::new(None, &t.text),
            })
            .collect()
    }

    /// Redirections for a component, most recently declared first.
    pub fn new_targets_for(&self, key: &ComponentKey) -> Vec<NewTarget> {
        let mut targets = Vec::new();
        for token in self.components.iter().chain(self.subcomponents.iter()).rev() {
            if token.matches(key) {
                targets.extend(token.targets.iter().cloned());
            }
        }
        targets
    }
}

/// Parsed selection text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectionModel {
    writers: HashMap<WriterId, ComponentSelection>,
}

impl SelectionModel {
    /// Parse selection text. Empty text is valid and selects nothing.
    pub fn parse(text: &str) -> Result<Self, SelectionError> {
        let tokens = lexer::tokenize(text)?;
        let blocks = parser::parse(&tokens)?;

        let mut writers: HashMap<WriterId, ComponentSelection> = HashMap::new();
        for block in blocks {
            let first_block = !writers.contains_key(&block.writer_id);
            let selection = writers.entry(block.writer_id).or_default();
            let tokens = block
                .components
                .into_iter()
                .map(|c| ComponentToken::new(&c.token, c.targets));
            if first_block {
                selection.components.extend(tokens);
            } else {
                selection.subcomponents.extend(tokens);
            }
        }

        debug!("Parsed selection for {} writer(s)", writers.len());
        Ok(Self { writers })
    }

    /// Read and parse a selection file.
    ///
    /// Files larger than [`MAX_SELECTION_BYTES`] are rejected; text that is
    /// not valid UTF-8 is decoded as Latin-1.
    pub fn load_file(path: &Path) -> Result<Self, SelectionError> {
        let io_error = |source| SelectionError::Io {
            path: path.to_path_buf(),
            source,
        };
        let size = fs::metadata(path).map_err(io_error)?.len();
        if size > MAX_SELECTION_BYTES {
            return Err(SelectionError::TooLarge {
                path: path.to_path_buf(),
                size,
            });
        }

        let bytes = fs::read(path).map_err(io_error)?;
        let text = match String::from_utf8(bytes) {
            Ok(text) => text,
            Err(err) => err.into_bytes().iter().map(|&b| b as char).collect(),
        };
        Self::parse(&text)
    }

    pub fn is_writer_selected(&self, writer_id: WriterId) -> bool {
        self.writers.contains_key(&writer_id)
    }

    pub fn is_component_selected(&self, writer_id: WriterId, key: &ComponentKey) -> bool {
        self.writers
            .get(&writer_id)
            .is_some_and(|s| s.is_component_selected(key))
    }

    pub fn is_subcomponent_selected(&self, writer_id: WriterId, key: &ComponentKey) -> bool {
        self.writers
            .get(&writer_id)
            .is_some_and(|s| s.is_subcomponent_selected(key))
    }

    pub fn new_targets_for(&self, writer_id: WriterId, key: &ComponentKey) -> Vec<NewTarget> {
        self.writers
            .get(&writer_id)
            .map(|s| s.new_targets_for(key))
            .unwrap_or_default()
    }

    pub fn writer(&self, writer_id: WriterId) -> Option<&ComponentSelection> {
        self.writers.get(&writer_id)
    }

    pub fn writer_ids(&self) -> impl Iterator<Item = &WriterId> {
        self.writers.keys()
    }

    pub fn is_empty(&self) -> bool {
        self.writers.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum SelectionError {
    #[error("Selection syntax error at line {line}, column {column}: {message}")]
    Syntax {
        line: usize,
        column: usize,
        message: String,
    },

    #[error("Unterminated string starting at line {line}, column {column}")]
    UnterminatedString { line: usize, column: usize },

    #[error("Newline inside string starting at line {line}, column {column}")]
    NewlineInString { line: usize, column: usize },

    #[error("Invalid writer id \"{value}\" at line {line}, column {column}")]
    InvalidWriterId {
        line: usize,
        column: usize,
        value: String,
    },

    #[error("Unterminated redirection block")]
    UnterminatedRedirection,

    #[error("Unexpected end of selection text, expected ';'")]
    UnexpectedEnd,

    #[error("Selection file {path} is {size} bytes, larger than the {MAX_SELECTION_BYTES} byte limit")]
    TooLarge { path: PathBuf, size: u64 },

    #[error("Failed to read selection file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use uuid::Uuid;

    const WRITER: &str = "a65faa63-5ea8-4ebc-9dbd-a0c4db26912a";
    const OTHER: &str = "0f6e2c5a-1b1e-4d4b-9a59-3a9d7e3f2b10";

    fn writer() -> WriterId {
        Uuid::parse_str(WRITER).unwrap()
    }

    fn key(path: Option<&str>, name: &str) -> ComponentKey {
        ComponentKey::new(path, name)
    }

    #[test]
    fn test_empty_selection_selects_nothing() {
        let model = SelectionModel::parse("").unwrap();
        assert!(model.is_empty());
        assert!(!model.is_writer_selected(writer()));
        assert!(!model.is_component_selected(writer(), &key(None, "db")));
    }

    #[test]
    fn test_token_forms() {
        let model = SelectionModel::parse(&format!(
            "\"{WRITER}\": \"config\", \"\\db\\main\", \"archive\\\";"
        ))
        .unwrap();
        let w = writer();

        // Bare name at any depth.
        assert!(model.is_component_selected(w, &key(None, "config")));
        assert!(model.is_component_selected(w, &key(Some("apps\\web"), "CONFIG")));

        // Full path, leading separator ignored. The same text also names
        // the leaves under that logical path.
        assert!(model.is_component_selected(w, &key(Some("db"), "main")));
        assert!(model.is_component_selected(w, &key(Some("db\\main"), "logs")));
        assert!(!model.is_component_selected(w, &key(Some("db\\main\\logs"), "archive")));
        assert!(!model.is_component_selected(w, &key(Some("other"), "main")));

        // Path only.
        assert!(model.is_component_selected(w, &key(Some("archive"), "2023")));
        assert!(!model.is_component_selected(w, &key(None, "archive")));
    }

    #[test]
    fn test_logical_path_alone_selects_its_leaves() {
        let model = SelectionModel::parse(&format!("\"{WRITER}\": \"db\\main\";")).unwrap();
        let w = writer();

        assert!(model.is_component_selected(w, &key(Some("db"), "main")));
        assert!(model.is_component_selected(w, &key(Some("DB\\Main"), "logs")));
        assert!(model.is_component_selected(w, &key(Some("\\db\\main\\"), "data")));
        assert!(!model.is_component_selected(w, &key(None, "main")));
        assert!(!model.is_component_selected(w, &key(Some("db"), "logs")));
    }

    #[test]
    fn test_unknown_writer_not_selected() {
        let model = SelectionModel::parse(&format!("\"{WRITER}\": \"db\";")).unwrap();
        let other = Uuid::parse_str(OTHER).unwrap();
        assert!(model.is_writer_selected(writer()));
        assert!(!model.is_writer_selected(other));
        assert!(!model.is_component_selected(other, &key(None, "db")));
    }

    #[test]
    fn test_second_block_lists_subcomponents() {
        let model = SelectionModel::parse(&format!(
            "\"{WRITER}\": \"config\";\n\"{WRITER}\": \"db\\main\\logs\";"
        ))
        .unwrap();
        let logs = key(Some("db\\main"), "logs");
        assert!(model.is_subcomponent_selected(writer(), &logs));
        assert!(!model.is_component_selected(writer(), &logs));
        assert_eq!(model.writer(writer()).unwrap().subcomponent_keys(), vec![logs]);
    }

    #[test]
    fn test_new_targets_most_recent_first() {
        let model = SelectionModel::parse(&format!(
            "\"{WRITER}\": \"db\" {{\"/srv/db/*.db\" # \"/first\", \"/srv/db/*.db\" # \"/second\"}};"
        ))
        .unwrap();
        let targets = model.new_targets_for(writer(), &key(None, "db"));
        let destinations: Vec<&str> = targets.iter().map(|t| t.destination_directory.as_str()).collect();
        assert_eq!(destinations, vec!["/second", "/first"]);
        assert!(model.new_targets_for(writer(), &key(None, "other")).is_empty());
    }

    #[test]
    fn test_parsing_is_deterministic() {
        let text = format!("\"{WRITER}\": \"db\" {{\"/a/*\" # \"/b\"}}, \"x\\y\";\"{WRITER}\": \"z\";");
        let first = SelectionModel::parse(&text).unwrap();
        let second = SelectionModel::parse(&text).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_parse_error_is_total() {
        let text = format!("\"{WRITER}\": \"db\"; \"{OTHER}\": \"x\" #;");
        assert!(SelectionModel::parse(&text).is_err());
    }

    #[test]
    fn test_load_file_latin1() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("selection.txt");
        let mut bytes = format!("\"{WRITER}\": \"caf").into_bytes();
        bytes.push(0xE9);
        bytes.extend_from_slice(b"\";");
        std::fs::write(&path, bytes).unwrap();

        let model = SelectionModel::load_file(&path).unwrap();
        assert!(model.is_component_selected(writer(), &key(None, "café")));
    }

    #[test]
    fn test_load_file_size_bound() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("huge.txt");
        std::fs::write(&path, vec![b' '; (MAX_SELECTION_BYTES + 1) as usize]).unwrap();
        assert!(matches!(
            SelectionModel::load_file(&path),
            Err(SelectionError::TooLarge { .. })
        ));
    }
}
