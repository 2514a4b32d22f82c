//! Webstore SQL layer
//!
//! Typed scalar values, tabular result sets, and the engine boundary the
//! transaction engine drives one step at a time. Two engines ship with the
//! crate: a rusqlite-backed one for real profiles and a deterministic
//! in-process one used by tests and tooling.

mod engine;
mod error;
pub mod memory;
mod result_set;
mod sqlite;
mod value;

pub use engine::{
    list_files, AuthAction, Authorization, Authorizer, Connection, Engine, OpenTarget,
    ProgressHandler, SharedConnection, StepResult, StmtHandle, TransactionOp, MAX_PAGE_COUNT,
};
pub use error::{EngineError, ErrorCode, SqlError};
pub use memory::MemoryEngine;
pub use result_set::{CloseHook, Cursor, CursorClosed, Fetch, ResultSet, STEP_BLOCK_SIZE};
pub use sqlite::SqliteEngine;
pub use value::SqlValue;

pub type Result<T> = std::result::Result<T, SqlError>;

/// Engine-level result, carrying the raw engine error code.
pub type EngineResult<T> = std::result::Result<T, EngineError>;
