//! Engine boundary
//!
//! Everything the transaction engine needs from an embedded SQL engine.
//! Any engine exposing this shape can back a profile.

use parking_lot::Mutex;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::{EngineResult, SqlValue};

/// Largest page count an engine accepts as a size ceiling.
pub const MAX_PAGE_COUNT: u64 = 1_073_741_823;

/// Opaque handle to a prepared statement, valid for the connection that
/// produced it until finalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StmtHandle(u64);

impl StmtHandle {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepResult {
    Row,
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenTarget {
    File(PathBuf),
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionOp {
    Begin,
    Commit,
    Rollback,
}

/// Action reported to the authorizer while a statement is compiled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthAction {
    Select,
    Read,
    Insert,
    Update,
    Delete,
    /// Table, index, view or trigger creation, removal or alteration.
    Schema,
    Transaction(TransactionOp),
    Pragma(String),
    Attach,
    Detach,
    Function,
    Other,
}

impl AuthAction {
    /// True for actions naming the statement itself rather than one of its
    /// sub-operations.
    pub fn is_statement(&self) -> bool {
        !matches!(self, AuthAction::Read | AuthAction::Function | AuthAction::Other)
    }

    pub fn is_write(&self) -> bool {
        matches!(
            self,
            AuthAction::Insert | AuthAction::Update | AuthAction::Delete | AuthAction::Schema
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Authorization {
    Allow,
    Deny,
    Ignore,
}

pub type Authorizer = Box<dyn FnMut(&AuthAction) -> Authorization + Send>;

/// Called every N engine operations. Returning `true` interrupts the step.
pub type ProgressHandler = Box<dyn FnMut() -> bool + Send>;

pub trait Connection: Send {
    fn prepare(&mut self, sql: &str) -> EngineResult<StmtHandle>;

    fn parameter_count(&self, stmt: StmtHandle) -> EngineResult<usize>;

    /// Binds a 1-based parameter.
    fn bind(&mut self, stmt: StmtHandle, index: usize, value: &SqlValue) -> EngineResult<()>;

    fn step(&mut self, stmt: StmtHandle) -> EngineResult<StepResult>;

    fn column_names(&self, stmt: StmtHandle) -> EngineResult<Vec<String>>;

    /// Values of the row produced by the last `Row` step.
    fn row(&self, stmt: StmtHandle) -> EngineResult<Vec<SqlValue>>;

    fn finalize(&mut self, stmt: StmtHandle) -> EngineResult<()>;

    fn changes(&self) -> u64;

    fn last_insert_rowid(&self) -> i64;

    fn set_authorizer(&mut self, authorizer: Option<Authorizer>);

    fn set_progress_handler(&mut self, period: u32, handler: Option<ProgressHandler>);

    fn is_autocommit(&self) -> bool;

    /// Whether a step interrupted by the progress handler can be resumed
    /// without losing work. Engines that restart the statement only get
    /// interrupted on timeout.
    fn resumable_interrupts(&self) -> bool;

    fn page_size(&mut self) -> EngineResult<u64>;

    fn page_count(&mut self) -> EngineResult<u64>;

    /// Sets the size ceiling in pages and returns the ceiling in effect.
    fn set_max_page_count(&mut self, pages: u64) -> EngineResult<u64>;

    fn max_page_count_limit(&self) -> u64 {
        MAX_PAGE_COUNT
    }

    fn close(self: Box<Self>) -> EngineResult<()>;
}

/// Connection shared between the transaction that owns it and any result
/// set cursor handed out to a caller.
pub type SharedConnection = Arc<Mutex<Box<dyn Connection>>>;

pub trait Engine: Send + Sync {
    fn open(&self, target: &OpenTarget, read_only: bool) -> EngineResult<Box<dyn Connection>>;

    /// Size of a data file that is not currently open, `None` if missing.
    fn data_file_size(&self, path: &Path) -> io::Result<Option<u64>>;

    /// Removes a data file and any companion files the engine keeps.
    fn remove_data_file(&self, path: &Path) -> io::Result<()>;

    fn data_file_exists(&self, path: &Path) -> io::Result<bool> {
        Ok(self.data_file_size(path)?.is_some())
    }

    /// Data files below `dir`, companion files included.
    fn list_data_files(&self, dir: &Path) -> io::Result<Vec<PathBuf>> {
        list_files(dir)
    }
}

/// Every file below `dir`, recursively. A missing `dir` holds nothing.
pub fn list_files(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let items = match std::fs::read_dir(&dir) {
            Ok(items) => items,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };
        for item in items {
            let path = item?.path();
            if path.is_dir() {
                pending.push(path);
            } else {
                files.push(path);
            }
        }
    }
    files.sort();
    Ok(files)
}
