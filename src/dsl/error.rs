use std::fmt;

use super::ast::Span;
use crate::error::{ErrorKind as RuntimeKind, KnitError};

/// Stage that rejected the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Lexer,
    Parser,
}

/// A lexing or parsing diagnostic with its source location and, for parse
/// errors, the tokens that would have been accepted.
#[derive(Debug, Clone)]
pub struct CompileError {
    pub message: String,
    pub span: Span,
    pub kind: ErrorKind,
    pub expected: Vec<String>,
}

impl CompileError {
    pub fn lexer(message: impl Into<String>, span: Span) -> Self {
        Self {
            message: message.into(),
            span,
            kind: ErrorKind::Lexer,
            expected: Vec::new(),
        }
    }

    pub fn parser(message: impl Into<String>, span: Span) -> Self {
        Self {
            message: message.into(),
            span,
            kind: ErrorKind::Parser,
            expected: Vec::new(),
        }
    }

    pub fn expecting(mut self, expected: &[&str]) -> Self {
        self.expected = expected.iter().map(|e| (*e).to_string()).collect();
        self
    }

    /// `[parser] line L:C: message`, followed by the offending source line
    /// and the expected tokens when known.
    pub fn format_with_source(&self, source: &str) -> String {
        let (line, col) = offset_to_line_col(source, self.span.start);
        let stage = match self.kind {
            ErrorKind::Lexer => "lexer",
            ErrorKind::Parser => "parser",
        };
        let mut out = format!("[{stage}] line {line}:{col}: {}", self.message);
        if let Some(text) = source.lines().nth(line.saturating_sub(1)) {
            out.push_str(&format!("\n    {text}\n    {}^", " ".repeat(col.saturating_sub(1))));
        }
        if !self.expected.is_empty() {
            out.push_str(&format!("\n    expected one of: {}", self.expected.join(", ")));
        }
        out
    }

    /// Runtime form, used when a parse failure aborts an interpreter run.
    pub fn into_knit_error(self, source: &str) -> KnitError {
        let (line, _) = offset_to_line_col(source, self.span.start);
        let message = self.format_with_source(source);
        KnitError::new(RuntimeKind::Parsing, message).at(self.span, line)
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CompileError {}

/// 1-based line and column of a byte offset.
pub fn offset_to_line_col(source: &str, offset: usize) -> (usize, usize) {
    let mut line = 1;
    let mut col = 1;
    for (i, ch) in source.char_indices() {
        if i >= offset {
            break;
        }
        if ch == '\n' {
            line += 1;
            col = 1;
        } else {
            col += 1;
        }
    }
    (line, col)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn line_and_column() {
        let src = "a = 1;\nb = ;";
        assert_eq!(offset_to_line_col(src, 0), (1, 1));
        assert_eq!(offset_to_line_col(src, 11), (2, 5));
    }

    #[test]
    fn format_shows_window_and_expected() {
        let src = "a = 1;\nb = ;";
        let err = CompileError::parser("unexpected ';'", Span::new(11, 12)).expecting(&["expression"]);
        let text = err.format_with_source(src);
        assert!(text.starts_with("[parser] line 2:5: unexpected ';'"));
        assert!(text.contains("b = ;"));
        assert!(text.ends_with("expected one of: expression"));
    }

    #[test]
    fn converts_to_parsing_error() {
        let err = CompileError::lexer("bad", Span::new(0, 1)).into_knit_error("$");
        assert_eq!(err.kind, RuntimeKind::Parsing);
        assert_eq!(err.line, Some(1));
    }
}
