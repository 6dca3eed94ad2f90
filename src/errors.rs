// File: src/errors.rs
//
// Error handling and reporting for the Panda scripting language.
// Provides structured error types with source location information,
// runtime stack traces, and pretty-printed error messages.

use colored::Colorize;
use std::fmt;

/// Categories of errors produced by the pipeline.
///
/// Lex, Parse, and Compile errors are fatal for the current compilation and
/// are never visible to script-level `try`. Runtime errors (including values
/// thrown by `throw`) unwind through script handlers first and only escape
/// the VM when uncaught.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Lex,
    Parse,
    Compile,
    Runtime,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ErrorKind::Lex => write!(f, "Lex Error"),
            ErrorKind::Parse => write!(f, "Parse Error"),
            ErrorKind::Compile => write!(f, "Compile Error"),
            ErrorKind::Runtime => write!(f, "Runtime Error"),
        }
    }
}

/// One frame of a runtime stack trace, innermost first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceFrame {
    pub function: String,
    pub file: String,
    pub line: u32,
}

impl fmt::Display for TraceFrame {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "at {} ({}:{})", self.function, self.file, self.line)
    }
}

/// A structured error with location information.
///
/// `line`/`column` are 1-based; zero means "unknown". The trace is only
/// populated for runtime errors that escaped the VM.
#[derive(Debug, Clone)]
pub struct PandaError {
    pub kind: ErrorKind,
    pub message: String,
    pub file: Option<String>,
    pub line: u32,
    pub column: u32,
    pub trace: Vec<TraceFrame>,
}

impl PandaError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            file: None,
            line: 0,
            column: 0,
            trace: Vec::new(),
        }
    }

    /// Create a lexer error at a source position.
    pub fn lex(message: impl Into<String>, line: u32, column: u32) -> Self {
        let mut err = Self::new(ErrorKind::Lex, message);
        err.line = line;
        err.column = column;
        err
    }

    /// Create a parse error at a source position.
    pub fn parse(message: impl Into<String>, line: u32, column: u32) -> Self {
        let mut err = Self::new(ErrorKind::Parse, message);
        err.line = line;
        err.column = column;
        err
    }

    /// Create a compile error at a source line.
    pub fn compile(message: impl Into<String>, line: u32) -> Self {
        let mut err = Self::new(ErrorKind::Compile, message);
        err.line = line;
        err
    }

    /// Create a runtime error with no position attached yet.
    pub fn runtime(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Runtime, message)
    }

    pub fn with_file(mut self, file: impl Into<String>) -> Self {
        self.file = Some(file.into());
        self
    }

    pub fn with_line(mut self, line: u32) -> Self {
        self.line = line;
        self
    }

    pub fn with_trace(mut self, trace: Vec<TraceFrame>) -> Self {
        self.trace = trace;
        self
    }

    /// The `file:line:column` suffix used for single-line rendering.
    pub fn location(&self) -> Option<String> {
        if self.line == 0 {
            return self.file.clone();
        }
        let file = self.file.as_deref().unwrap_or("<unknown>");
        if self.column > 0 {
            Some(format!("{}:{}:{}", file, self.line, self.column))
        } else {
            Some(format!("{}:{}", file, self.line))
        }
    }
}

impl fmt::Display for PandaError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let kind_str = format!("{}", self.kind);
        write!(f, "{}: {}", kind_str.red().bold(), self.message.bold())?;

        if let Some(location) = self.location() {
            write!(f, "\n{}", format!("  --> {}", location).bright_blue())?;
        }

        for frame in &self.trace {
            write!(f, "\n   {}", format!("{}", frame).bright_black())?;
        }

        Ok(())
    }
}

impl std::error::Error for PandaError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn location_includes_column_when_known() {
        let err = PandaError::parse("unexpected token", 3, 7).with_file("main.panda");
        assert_eq!(err.location().unwrap(), "main.panda:3:7");
    }

    #[test]
    fn location_omits_column_for_compile_errors() {
        let err = PandaError::compile("too many locals", 12).with_file("big.panda");
        assert_eq!(err.location().unwrap(), "big.panda:12");
    }

    #[test]
    fn unknown_position_has_no_location() {
        let err = PandaError::runtime("boom");
        assert!(err.location().is_none());
    }
}
