//! Tagged-state parser over the token stream.
//!
//! Any structurally invalid sequence fails the whole parse with one error;
//! there is no recovery.

use uuid::Uuid;

use super::lexer::{Position, Token, TokenKind};
use super::{NewTarget, SelectionError};
use crate::paths;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Expecting a writer id string.
    BeforeWriter,
    /// Writer id read, expecting `:` (or `;` for a writer-only block).
    AfterWriter,
    /// Expecting a component string.
    BeforeComponent,
    /// Component read, expecting `{`, `,` or `;`.
    AfterComponent,
    /// Inside `{`, expecting a source string.
    TargetSource,
    /// Source read, expecting `#`.
    TargetHash,
    /// `#` read, expecting a destination string.
    TargetDestination,
    /// Destination read, expecting `,` or `}`.
    AfterTarget,
    /// `}` read, expecting `,` or `;`.
    AfterTargets,
}

/// One component or subcomponent token with its redirections in declared order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedComponent {
    pub token: String,
    pub targets: Vec<NewTarget>,
}

/// One `;`-terminated writer block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedBlock {
    pub writer_id: Uuid,
    pub components: Vec<ParsedComponent>,
}

pub fn parse(tokens: &[Token]) -> Result<Vec<ParsedBlock>, SelectionError> {
    let mut state = State::BeforeWriter;
    let mut blocks: Vec<ParsedBlock> = Vec::new();
    let mut pending_source: Option<(String, Position)> = None;

    for token in tokens {
        let position = token.position;
        state = match (state, &token.kind) {
            (State::BeforeWriter, TokenKind::Str(text)) => {
                blocks.push(ParsedBlock {
                    writer_id: parse_writer_id(text, position)?,
                    components: Vec::new(),
                });
                State::AfterWriter
            }
            (State::AfterWriter, TokenKind::Colon) => State::BeforeComponent,
            (State::AfterWriter, TokenKind::Semicolon) => State::BeforeWriter,
            (State::BeforeComponent, TokenKind::Str(text)) => {
                current_block(&mut blocks)?.components.push(ParsedComponent {
                    token: text.clone(),
                    targets: Vec::new(),
                });
                State::AfterComponent
            }
            (State::AfterComponent, TokenKind::OpenBrace) => State::TargetSource,
            (State::AfterComponent | State::AfterTargets, TokenKind::Comma) => State::BeforeComponent,
            (State::AfterComponent | State::AfterTargets, TokenKind::Semicolon) => State::BeforeWriter,
            (State::TargetSource, TokenKind::Str(text)) => {
                pending_source = Some((text.clone(), position));
                State::TargetHash
            }
            (State::TargetHash, TokenKind::Hash) => State::TargetDestination,
            (State::TargetDestination, TokenKind::Str(destination)) => {
                let (source, source_position) = pending_source.take().ok_or_else(|| {
                    syntax(position, "redirection destination without a source".to_string())
                })?;
                let target = parse_target(&source, destination, source_position)?;
                let component = current_block(&mut blocks)?
                    .components
                    .last_mut()
                    .ok_or_else(|| syntax(position, "redirection without a component".to_string()))?;
                component.targets.push(target);
                State::AfterTarget
            }
            (State::AfterTarget, TokenKind::Comma) => State::TargetSource,
            (State::AfterTarget, TokenKind::CloseBrace) => State::AfterTargets,
            (State::BeforeComponent | State::AfterComponent | State::AfterTargets, TokenKind::Colon) => {
                return Err(syntax(position, "':' after the writer id was already read".to_string()))
            }
            (State::BeforeWriter | State::BeforeComponent | State::AfterComponent | State::AfterWriter, TokenKind::Hash) => {
                return Err(syntax(position, "'#' outside a redirection block".to_string()))
            }
            (state, kind) => {
                return Err(syntax(
                    position,
                    format!("unexpected {} {}", kind.describe(), expectation(state)),
                ))
            }
        };
    }

    match state {
        State::BeforeWriter => Ok(blocks),
        State::TargetSource | State::TargetHash | State::TargetDestination | State::AfterTarget => {
            Err(SelectionError::UnterminatedRedirection)
        }
        _ => Err(SelectionError::UnexpectedEnd),
    }
}

fn current_block(blocks: &mut [ParsedBlock]) -> Result<&mut ParsedBlock, SelectionError> {
    blocks.last_mut().ok_or(SelectionError::UnexpectedEnd)
}

fn expectation(state: State) -> &'static str {
    match state {
        State::BeforeWriter => "where a writer id was expected",
        State::AfterWriter => "after the writer id, expected ':' or ';'",
        State::BeforeComponent => "where a component was expected",
        State::AfterComponent => "after a component, expected '{', ',' or ';'",
        State::TargetSource => "where a redirection source was expected",
        State::TargetHash => "after a redirection source, expected '#'",
        State::TargetDestination => "where a redirection destination was expected",
        State::AfterTarget => "after a redirection, expected ',' or '}'",
        State::AfterTargets => "after a redirection block, expected ',' or ';'",
    }
}

fn syntax(position: Position, message: String) -> SelectionError {
    SelectionError::Syntax {
        line: position.line,
        column: position.column,
        message,
    }
}

/// Writer ids are accepted with or without surrounding braces.
fn parse_writer_id(text: &str, position: Position) -> Result<Uuid, SelectionError> {
    let trimmed = text.trim();
    let bare = trimmed
        .strip_prefix('{')
        .and_then(|t| t.strip_suffix('}'))
        .unwrap_or(trimmed);
    Uuid::parse_str(bare).map_err(|_| SelectionError::InvalidWriterId {
        line: position.line,
        column: position.column,
        value: text.to_string(),
    })
}

/// Split `dir\filespec[...]` into a redirection.
fn parse_target(source: &str, destination: &str, position: Position) -> Result<NewTarget, SelectionError> {
    let (directory, filespec) = paths::split_last(source).ok_or_else(|| {
        syntax(
            position,
            format!("redirection source \"{source}\" has no directory part"),
        )
    })?;

    let (filespec, recursive) = match filespec.strip_suffix("...") {
        Some(stripped) => (stripped, true),
        None => (filespec, false),
    };

    if filespec.is_empty() {
        return Err(syntax(
            position,
            format!("redirection source \"{source}\" has no filespec"),
        ));
    }

    Ok(NewTarget {
        source_directory: if directory.is_empty() {
            source[..1].to_string()
        } else {
            directory.to_string()
        },
        source_filespec: filespec.to_string(),
        recursive,
        destination_directory: destination.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::super::lexer::tokenize;
    use super::*;

    const WRITER: &str = "a65faa63-5ea8-4ebc-9dbd-a0c4db26912a";

    fn parse_text(text: &str) -> Result<Vec<ParsedBlock>, SelectionError> {
        parse(&tokenize(text)?)
    }

    #[test]
    fn test_writer_with_components() {
        let blocks = parse_text(&format!("\"{WRITER}\": \"db\\main\", \"config\";")).unwrap();
        assert_eq!(blocks.len(), 1);
        let tokens: Vec<&str> = blocks[0].components.iter().map(|c| c.token.as_str()).collect();
        assert_eq!(tokens, vec!["db\\main", "config"]);
    }

    #[test]
    fn test_braced_writer_id() {
        let blocks = parse_text(&format!("\"{{{WRITER}}}\";")).unwrap();
        assert_eq!(blocks[0].writer_id.to_string(), WRITER);
        assert!(blocks[0].components.is_empty());
    }

    #[test]
    fn test_redirections() {
        let text = format!(
            "\"{WRITER}\": \"db\" {{\"C:\\data\\*.mdf\" # \"D:\\restore\", \"C:\\logs\\*.ldf...\" # \"E:\\logs\"}};"
        );
        let blocks = parse_text(&text).unwrap();
        let targets = &blocks[0].components[0].targets;
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].source_directory, "C:\\data");
        assert_eq!(targets[0].source_filespec, "*.mdf");
        assert!(!targets[0].recursive);
        assert_eq!(targets[1].source_filespec, "*.ldf");
        assert!(targets[1].recursive);
        assert_eq!(targets[1].destination_directory, "E:\\logs");
    }

    #[test]
    fn test_root_directory_source() {
        let text = format!("\"{WRITER}\": \"db\" {{\"/*.db\" # \"/restore\"}};");
        let blocks = parse_text(&text).unwrap();
        assert_eq!(blocks[0].components[0].targets[0].source_directory, "/");
    }

    #[test]
    fn test_hash_outside_block_fails() {
        let result = parse_text(&format!("\"{WRITER}\": \"db\" # \"x\";"));
        assert!(matches!(result, Err(SelectionError::Syntax { .. })));
    }

    #[test]
    fn test_second_colon_fails() {
        let result = parse_text(&format!("\"{WRITER}\": \"db\" : \"x\";"));
        assert!(matches!(result, Err(SelectionError::Syntax { line: 1, .. })));
    }

    #[test]
    fn test_unterminated_redirection() {
        let result = parse_text(&format!("\"{WRITER}\": \"db\" {{\"/a/*\" # \"/b\""));
        assert!(matches!(result, Err(SelectionError::UnterminatedRedirection)));
    }

    #[test]
    fn test_missing_semicolon_fails() {
        let result = parse_text(&format!("\"{WRITER}\": \"db\""));
        assert!(matches!(result, Err(SelectionError::UnexpectedEnd)));
    }

    #[test]
    fn test_invalid_writer_id() {
        let result = parse_text("\"not-a-guid\": \"db\";");
        assert!(matches!(result, Err(SelectionError::InvalidWriterId { .. })));
    }

    #[test]
    fn test_empty_input() {
        assert!(parse_text("  \n ").unwrap().is_empty());
    }
}
