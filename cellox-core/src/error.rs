//! Error types for every fallible operation the core exposes.
//!
//! One `thiserror` enum per §7 error kind. Lex errors never escape the
//! lexer directly — they are carried on an `Error` token and surface as
//! a [`CompileError`] once the parser consumes that token.

use std::fmt;

/// A single compiler diagnostic, tagged with the source line and lexeme
/// that triggered it.
#[derive(Debug, Clone)]
pub struct CompileError {
    pub line: u32,
    /// The offending lexeme, empty for diagnostics not anchored to a token
    /// (e.g. an unterminated string that ran off the end of the source).
    pub lexeme: String,
    pub message: String,
}

impl CompileError {
    #[must_use]
    pub fn new(line: u32, lexeme: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            line,
            lexeme: lexeme.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.lexeme.is_empty() {
            write!(f, "[line {}] Error: {}", self.line, self.message)
        } else {
            write!(f, "[line {}] Error at '{}': {}", self.line, self.lexeme, self.message)
        }
    }
}

impl std::error::Error for CompileError {}

/// One stack frame captured at the moment a [`RuntimeError`] was raised,
/// innermost first.
#[derive(Debug, Clone)]
pub struct TraceFrame {
    pub line: u32,
    /// `None` denotes the top-level script frame (printed as `script`).
    pub function_name: Option<String>,
}

impl fmt::Display for TraceFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.function_name {
            Some(name) => write!(f, "[line {}] in {name}", self.line),
            None => write!(f, "[line {}] in script", self.line),
        }
    }
}

/// A runtime error: a message plus the call-stack trace captured at the
/// point of the fault, innermost frame first.
#[derive(Debug, Clone)]
pub struct RuntimeError {
    pub message: String,
    pub trace: Vec<TraceFrame>,
}

impl std::error::Error for RuntimeError {}

impl RuntimeError {
    #[must_use]
    pub fn new(message: impl Into<String>, trace: Vec<TraceFrame>) -> Self {
        Self {
            message: message.into(),
            trace,
        }
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.message)?;
        for (i, frame) in self.trace.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{frame}")?;
        }
        Ok(())
    }
}

/// Chunk-file (`.cxcf`) codec failures: malformed segments, unknown
/// segment tags, truncated input, or unsupported flag bits.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("unknown chunk-file segment tag {0:#04x}")]
    UnknownSegment(u8),
    #[error("truncated chunk file: expected {expected} more byte(s)")]
    Truncated { expected: usize },
    #[error("unsupported chunk-file flag bits {0:#010b}")]
    UnsupportedFlags(u8),
    #[error("chunk file has unsupported version {major}.{minor}")]
    UnsupportedVersion { major: u8, minor: u8 },
    #[error("string constant contains an embedded NUL byte, which the zstring encoding cannot represent")]
    EmbeddedNul,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
