//! Tokenizer for selection text.
//!
//! Splits the input on double quotes first: everything between a pair of
//! quotes is one string token, everything outside is punctuation or
//! whitespace.

use super::SelectionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Position {
    pub line: usize,
    pub column: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenKind {
    Str(String),
    OpenBrace,
    CloseBrace,
    Hash,
    Colon,
    Semicolon,
    Comma,
}

impl TokenKind {
    pub fn describe(&self) -> String {
        match self {
            Self::Str(s) => format!("string \"{s}\""),
            Self::OpenBrace => "'{'".to_string(),
            Self::CloseBrace => "'}'".to_string(),
            Self::Hash => "'#'".to_string(),
            Self::Colon => "':'".to_string(),
            Self::Semicolon => "';'".to_string(),
            Self::Comma => "','".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub position: Position,
}

pub fn tokenize(text: &str) -> Result<Vec<Token>, SelectionError> {
    let mut tokens = Vec::new();
    let mut line = 1;
    let mut column = 0;
    let mut chars = text.chars();

    while let Some(c) = chars.next() {
        column += 1;
        let position = Position { line, column };

        let kind = match c {
            '"' => {
                let mut value = String::new();
                loop {
                    match chars.next() {
                        Some('"') => {
                            column += 1;
                            break;
                        }
                        Some('\n') | Some('\r') => {
                            return Err(SelectionError::NewlineInString {
                                line: position.line,
                                column: position.column,
                            })
                        }
                        Some(inner) => {
                            column += 1;
                            value.push(inner);
                        }
                        None => {
                            return Err(SelectionError::UnterminatedString {
                                line: position.line,
                                column: position.column,
                            })
                        }
                    }
                }
                TokenKind::Str(value)
            }
            '{' => TokenKind::OpenBrace,
            '}' => TokenKind::CloseBrace,
            '#' => TokenKind::Hash,
            ':' => TokenKind::Colon,
            ';' => TokenKind::Semicolon,
            ',' => TokenKind::Comma,
            '\n' => {
                line += 1;
                column = 0;
                continue;
            }
            c if c.is_whitespace() || c == '\u{feff}' => continue,
            other => {
                return Err(SelectionError::Syntax {
                    line,
                    column,
                    message: format!("unexpected character '{other}' outside a string"),
                })
            }
        };

        tokens.push(Token { kind, position });
    }

    Ok(tokens)
}
