//! SQL layer error types

use std::fmt;
use thiserror::Error;

/// Primary result codes reported by an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Error,
    Internal,
    Perm,
    Abort,
    Busy,
    Locked,
    NoMem,
    ReadOnly,
    Interrupt,
    IoErr,
    Corrupt,
    NotFound,
    Full,
    CantOpen,
    Protocol,
    Empty,
    Schema,
    TooBig,
    Constraint,
    Mismatch,
    Misuse,
    NoLfs,
    Auth,
    Format,
    Range,
    NotADb,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Error => "error",
            ErrorCode::Internal => "internal",
            ErrorCode::Perm => "perm",
            ErrorCode::Abort => "abort",
            ErrorCode::Busy => "busy",
            ErrorCode::Locked => "locked",
            ErrorCode::NoMem => "nomem",
            ErrorCode::ReadOnly => "readonly",
            ErrorCode::Interrupt => "interrupt",
            ErrorCode::IoErr => "ioerr",
            ErrorCode::Corrupt => "corrupt",
            ErrorCode::NotFound => "notfound",
            ErrorCode::Full => "full",
            ErrorCode::CantOpen => "cantopen",
            ErrorCode::Protocol => "protocol",
            ErrorCode::Empty => "empty",
            ErrorCode::Schema => "schema",
            ErrorCode::TooBig => "toobig",
            ErrorCode::Constraint => "constraint",
            ErrorCode::Mismatch => "mismatch",
            ErrorCode::Misuse => "misuse",
            ErrorCode::NoLfs => "nolfs",
            ErrorCode::Auth => "auth",
            ErrorCode::Format => "format",
            ErrorCode::Range => "range",
            ErrorCode::NotADb => "notadb",
        }
    }

    /// The file is locked by another connection; retrying later may succeed.
    pub fn is_busy(&self) -> bool {
        matches!(self, ErrorCode::Busy | ErrorCode::Locked)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{code}: {message}")]
pub struct EngineError {
    pub code: ErrorCode,
    pub message: String,
}

impl EngineError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn misuse(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Misuse, message)
    }

    pub fn range() -> Self {
        Self::new(ErrorCode::Range, "bind or column index out of range")
    }
}

#[derive(Error, Debug)]
pub enum SqlError {
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Column index out of range: {0}")]
    OutOfRange(usize),

    #[error("Unknown column: {0}")]
    UnknownColumn(String),

    #[error("Result set exceeded its size limit of {limit} bytes")]
    TooBig { limit: u64 },

    #[error("Operation not supported by this result set")]
    NotSupported,

    #[error("No current row")]
    NoRow,
}
