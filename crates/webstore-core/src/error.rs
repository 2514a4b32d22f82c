//! Storage error types

use thiserror::Error;
use webstore_index::IndexError;
use webstore_policy::PolicyError;
use webstore_sql::{EngineError, ErrorCode, SqlError};

use crate::quota::LowResourceKind;

/// Outcome of a failed statement or storage operation.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Quota exceeded")]
    QuotaExceeded,

    #[error("Storage is corrupted")]
    Corrupted,

    #[error("No access: {0}")]
    NoAccess(String),

    #[error("Out of memory")]
    NoMemory,

    #[error("Out of memory (soft limit)")]
    SoftNoMemory,

    #[error("Out of disk space")]
    NoDisk,

    #[error("Statement timed out")]
    TimedOut,

    #[error("Version mismatch: expected {expected:?}, found {actual:?}")]
    VersionMismatch {
        expected: String,
        actual: Option<String>,
    },

    #[error("Cancelled")]
    Cancelled,

    #[error("Result set too big")]
    ResultSetTooBig,

    #[error("Bad query: {0}")]
    BadQuery(String),

    #[error("Bad bind parameters: {0}")]
    BadBindParameters(String),

    #[error("Constraint failed: {0}")]
    ConstraintFailed(String),

    #[error("Storage is read-only")]
    ReadOnly,

    #[error("Not authorized: {0}")]
    Authorization(String),

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Too many storage objects for this origin")]
    MaxObjectsPerOrigin,

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Index error: {0}")]
    Index(#[source] IndexError),

    #[error("Policy error: {0}")]
    Policy(#[from] PolicyError),

    #[error("SQL error: {0}")]
    Sql(#[from] SqlError),
}

impl StorageError {
    /// Maps an engine result code onto the statement taxonomy. Busy and
    /// locked codes are handled by the scheduler before they get here; when
    /// the backoff runs out they surface as a timeout.
    pub fn from_engine(error: &EngineError) -> Self {
        let message = error.message.clone();
        match error.code {
            ErrorCode::Error | ErrorCode::Empty | ErrorCode::Mismatch => {
                StorageError::BadQuery(message)
            }
            ErrorCode::Perm | ErrorCode::IoErr | ErrorCode::CantOpen => {
                StorageError::NoAccess(message)
            }
            ErrorCode::Abort | ErrorCode::Interrupt | ErrorCode::Busy | ErrorCode::Locked => {
                StorageError::TimedOut
            }
            ErrorCode::NoMem => StorageError::NoMemory,
            ErrorCode::ReadOnly => StorageError::ReadOnly,
            ErrorCode::Corrupt | ErrorCode::NotADb => StorageError::Corrupted,
            ErrorCode::Full => StorageError::QuotaExceeded,
            ErrorCode::Schema => StorageError::VersionMismatch {
                expected: String::new(),
                actual: None,
            },
            ErrorCode::TooBig | ErrorCode::Range => StorageError::BadBindParameters(message),
            ErrorCode::Constraint => StorageError::ConstraintFailed(message),
            ErrorCode::NoLfs => StorageError::NotSupported(message),
            ErrorCode::Auth => StorageError::Authorization(message),
            ErrorCode::Internal
            | ErrorCode::NotFound
            | ErrorCode::Protocol
            | ErrorCode::Misuse
            | ErrorCode::Format => StorageError::Internal(message),
        }
    }

    /// False for conditions a retry cannot fix. These never trigger replay.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            StorageError::NoMemory
                | StorageError::SoftNoMemory
                | StorageError::NoAccess(_)
                | StorageError::VersionMismatch { .. }
        )
    }

    pub fn is_low_resource(&self) -> bool {
        self.low_resource_kind().is_some()
    }

    pub fn low_resource_kind(&self) -> Option<LowResourceKind> {
        match self {
            StorageError::NoMemory => Some(LowResourceKind::NoMemory),
            StorageError::SoftNoMemory => Some(LowResourceKind::SoftNoMemory),
            StorageError::NoDisk => Some(LowResourceKind::NoDisk),
            _ => None,
        }
    }
}

impl From<EngineError> for StorageError {
    fn from(error: EngineError) -> Self {
        StorageError::from_engine(&error)
    }
}

impl From<IndexError> for StorageError {
    fn from(error: IndexError) -> Self {
        match error {
            IndexError::NoAccess(message) => StorageError::NoAccess(message),
            IndexError::MaxObjectsPerOrigin { .. } => StorageError::MaxObjectsPerOrigin,
            other => StorageError::Index(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_code_mapping() {
        let map = |code| StorageError::from_engine(&EngineError::new(code, "x"));
        assert!(matches!(map(ErrorCode::Full), StorageError::QuotaExceeded));
        assert!(matches!(map(ErrorCode::NotADb), StorageError::Corrupted));
        assert!(matches!(map(ErrorCode::Corrupt), StorageError::Corrupted));
        assert!(matches!(map(ErrorCode::CantOpen), StorageError::NoAccess(_)));
        assert!(matches!(map(ErrorCode::Interrupt), StorageError::TimedOut));
        assert!(matches!(map(ErrorCode::NoMem), StorageError::NoMemory));
        assert!(matches!(map(ErrorCode::Range), StorageError::BadBindParameters(_)));
        assert!(matches!(map(ErrorCode::Auth), StorageError::Authorization(_)));
        assert!(matches!(map(ErrorCode::Constraint), StorageError::ConstraintFailed(_)));
    }

    #[test]
    fn test_recoverability() {
        assert!(StorageError::TimedOut.is_recoverable());
        assert!(StorageError::QuotaExceeded.is_recoverable());
        assert!(!StorageError::NoMemory.is_recoverable());
        assert!(!StorageError::NoAccess("gone".into()).is_recoverable());
        assert!(!StorageError::VersionMismatch {
            expected: "1".into(),
            actual: None
        }
        .is_recoverable());

        assert!(StorageError::NoDisk.is_low_resource());
        assert!(!StorageError::QuotaExceeded.is_low_resource());
    }

    #[test]
    fn test_index_errors_keep_their_meaning() {
        let err: StorageError = IndexError::NoAccess("denied".into()).into();
        assert!(matches!(err, StorageError::NoAccess(_)));
        let err: StorageError = IndexError::MaxObjectsPerOrigin {
            origin: "https://a.com".into(),
            max: 1,
        }
        .into();
        assert!(matches!(err, StorageError::MaxObjectsPerOrigin));
    }
}
