//! SQLite engine backed by rusqlite

use rusqlite::hooks::{
    AuthAction as SqliteAction, AuthContext, Authorization as SqliteAuthorization,
    TransactionOperation,
};
use rusqlite::types::{ToSqlOutput, Value, ValueRef};
use rusqlite::{OpenFlags, ToSql};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::os::raw::c_int;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::{
    AuthAction, Authorization, Authorizer, Connection, Engine, EngineError, EngineResult,
    ErrorCode, OpenTarget, ProgressHandler, SqlValue, StepResult, StmtHandle, TransactionOp,
};

/// Engine storing each object in its own SQLite file.
#[derive(Debug, Clone, Default)]
pub struct SqliteEngine;

impl SqliteEngine {
    pub fn new() -> Self {
        Self
    }
}

fn journal_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push("-journal");
    PathBuf::from(name)
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

impl Engine for SqliteEngine {
    fn open(&self, target: &OpenTarget, read_only: bool) -> EngineResult<Box<dyn Connection>> {
        let conn = match target {
            OpenTarget::Memory => rusqlite::Connection::open_in_memory(),
            OpenTarget::File(path) => {
                let flags = if read_only {
                    OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX
                } else {
                    OpenFlags::SQLITE_OPEN_READ_WRITE
                        | OpenFlags::SQLITE_OPEN_CREATE
                        | OpenFlags::SQLITE_OPEN_NO_MUTEX
                };
                rusqlite::Connection::open_with_flags(path, flags)
            }
        }
        .map_err(map_error)?;

        tracing::debug!(target = ?target, read_only, "Opened sqlite connection");
        Ok(Box::new(SqliteConnection::new(conn)))
    }

    fn data_file_size(&self, path: &Path) -> io::Result<Option<u64>> {
        match std::fs::metadata(path) {
            Ok(meta) => Ok(Some(meta.len())),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn remove_data_file(&self, path: &Path) -> io::Result<()> {
        remove_if_exists(&journal_path(path))?;
        remove_if_exists(path)
    }
}

/// Hook state shared with the callbacks registered on the rusqlite
/// connection. std mutexes keep the closures unwind safe.
struct HookSlots {
    enabled: AtomicBool,
    authorizer: std::sync::Mutex<Option<Authorizer>>,
    progress: std::sync::Mutex<Option<ProgressHandler>>,
}

impl HookSlots {
    fn authorize(&self, action: &AuthAction) -> Authorization {
        if !self.enabled.load(Ordering::Acquire) {
            return Authorization::Allow;
        }
        let mut slot = match self.authorizer.lock() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        slot.as_mut().map_or(Authorization::Allow, |auth| auth(action))
    }

    fn progress(&self) -> bool {
        if !self.enabled.load(Ordering::Acquire) {
            return false;
        }
        let mut slot = match self.progress.lock() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        slot.as_mut().is_some_and(|handler| handler())
    }
}

/// Statements are compiled on `prepare` so syntax and authorization errors
/// surface early, then executed in full on the first step. rusqlite ties
/// statements to a connection borrow, so rows are buffered per handle.
struct Prepared {
    sql: String,
    param_count: usize,
    columns: Vec<String>,
    params: Vec<SqlValue>,
    rows: Option<VecDeque<Vec<SqlValue>>>,
    current: Option<Vec<SqlValue>>,
}

struct SqliteConnection {
    conn: rusqlite::Connection,
    statements: HashMap<u64, Prepared>,
    next_handle: u64,
    hooks: Arc<HookSlots>,
}

impl SqliteConnection {
    fn new(conn: rusqlite::Connection) -> Self {
        let hooks = Arc::new(HookSlots {
            enabled: AtomicBool::new(true),
            authorizer: std::sync::Mutex::new(None),
            progress: std::sync::Mutex::new(None),
        });
        let auth_hooks = Arc::clone(&hooks);
        conn.authorizer(Some(move |ctx: AuthContext<'_>| {
            match auth_hooks.authorize(&translate_action(&ctx.action)) {
                Authorization::Allow => SqliteAuthorization::Allow,
                Authorization::Deny => SqliteAuthorization::Deny,
                Authorization::Ignore => SqliteAuthorization::Ignore,
            }
        }));
        Self {
            conn,
            statements: HashMap::new(),
            next_handle: 1,
            hooks,
        }
    }

    fn prepared(&self, stmt: StmtHandle) -> EngineResult<&Prepared> {
        self.statements
            .get(&stmt.raw())
            .ok_or_else(|| EngineError::misuse("unknown statement handle"))
    }

    fn pragma(&self, sql: &str) -> EngineResult<u64> {
        self.hooks.enabled.store(false, Ordering::Release);
        let result = self.conn.query_row(sql, [], |row| row.get::<_, i64>(0));
        self.hooks.enabled.store(true, Ordering::Release);
        result.map(|value| value.max(0) as u64).map_err(map_error)
    }
}

fn run_statement(
    conn: &rusqlite::Connection,
    prepared: &Prepared,
) -> EngineResult<VecDeque<Vec<SqlValue>>> {
    let mut stmt = conn.prepare(&prepared.sql).map_err(map_error)?;
    for (index, value) in prepared.params.iter().enumerate() {
        stmt.raw_bind_parameter(index + 1, value)
            .map_err(map_error)?;
    }
    let column_count = stmt.column_count();
    let mut rows = VecDeque::new();
    let mut cursor = stmt.raw_query();
    while let Some(row) = cursor.next().map_err(map_error)? {
        let mut values = Vec::with_capacity(column_count);
        for index in 0..column_count {
            values.push(from_value_ref(row.get_ref(index).map_err(map_error)?));
        }
        rows.push_back(values);
    }
    Ok(rows)
}

impl Connection for SqliteConnection {
    fn prepare(&mut self, sql: &str) -> EngineResult<StmtHandle> {
        let stmt = self.conn.prepare(sql).map_err(map_error)?;
        let param_count = stmt.parameter_count();
        let columns = stmt
            .column_names()
            .into_iter()
            .map(String::from)
            .collect();
        drop(stmt);

        let handle = self.next_handle;
        self.next_handle += 1;
        self.statements.insert(
            handle,
            Prepared {
                sql: sql.to_string(),
                param_count,
                columns,
                params: vec![SqlValue::Null; param_count],
                rows: None,
                current: None,
            },
        );
        Ok(StmtHandle::new(handle))
    }

    fn parameter_count(&self, stmt: StmtHandle) -> EngineResult<usize> {
        Ok(self.prepared(stmt)?.param_count)
    }

    fn bind(&mut self, stmt: StmtHandle, index: usize, value: &SqlValue) -> EngineResult<()> {
        let prepared = self
            .statements
            .get_mut(&stmt.raw())
            .ok_or_else(|| EngineError::misuse("unknown statement handle"))?;
        if index == 0 || index > prepared.param_count {
            return Err(EngineError::range());
        }
        prepared.params[index - 1] = value.clone();
        Ok(())
    }

    fn step(&mut self, stmt: StmtHandle) -> EngineResult<StepResult> {
        let Self {
            conn, statements, ..
        } = self;
        let prepared = statements
            .get_mut(&stmt.raw())
            .ok_or_else(|| EngineError::misuse("unknown statement handle"))?;
        if prepared.rows.is_none() {
            prepared.rows = Some(run_statement(conn, prepared)?);
        }
        let next = prepared.rows.as_mut().and_then(VecDeque::pop_front);
        let result = if next.is_some() {
            StepResult::Row
        } else {
            StepResult::Done
        };
        prepared.current = next;
        Ok(result)
    }

    fn column_names(&self, stmt: StmtHandle) -> EngineResult<Vec<String>> {
        Ok(self.prepared(stmt)?.columns.clone())
    }

    fn row(&self, stmt: StmtHandle) -> EngineResult<Vec<SqlValue>> {
        self.prepared(stmt)?
            .current
            .clone()
            .ok_or_else(|| EngineError::misuse("no current row"))
    }

    fn finalize(&mut self, stmt: StmtHandle) -> EngineResult<()> {
        self.statements.remove(&stmt.raw());
        Ok(())
    }

    fn changes(&self) -> u64 {
        self.conn.changes() as u64
    }

    fn last_insert_rowid(&self) -> i64 {
        self.conn.last_insert_rowid()
    }

    fn set_authorizer(&mut self, authorizer: Option<Authorizer>) {
        let mut slot = match self.hooks.authorizer.lock() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = authorizer;
    }

    fn set_progress_handler(&mut self, period: u32, handler: Option<ProgressHandler>) {
        let installed = handler.is_some();
        {
            let mut slot = match self.hooks.progress.lock() {
                Ok(slot) => slot,
                Err(poisoned) => poisoned.into_inner(),
            };
            *slot = handler;
        }
        if installed {
            let hooks = Arc::clone(&self.hooks);
            let period = c_int::try_from(period).unwrap_or(c_int::MAX);
            self.conn
                .progress_handler(period, Some(move || hooks.progress()));
        } else {
            self.conn.progress_handler(0, None::<fn() -> bool>);
        }
    }

    fn is_autocommit(&self) -> bool {
        self.conn.is_autocommit()
    }

    fn resumable_interrupts(&self) -> bool {
        false
    }

    fn page_size(&mut self) -> EngineResult<u64> {
        self.pragma("PRAGMA page_size")
    }

    fn page_count(&mut self) -> EngineResult<u64> {
        self.pragma("PRAGMA page_count")
    }

    fn set_max_page_count(&mut self, pages: u64) -> EngineResult<u64> {
        self.pragma(&format!("PRAGMA max_page_count = {pages}"))
    }

    fn close(self: Box<Self>) -> EngineResult<()> {
        let this = *self;
        this.conn.close().map_err(|(_, err)| map_error(err))
    }
}

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            SqlValue::Null => ToSqlOutput::Owned(Value::Null),
            SqlValue::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            SqlValue::Integer(i) => ToSqlOutput::Owned(Value::Integer(*i)),
            SqlValue::Double(d) => ToSqlOutput::Owned(Value::Real(*d)),
            SqlValue::Blob(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b)),
            SqlValue::Bool(true) => ToSqlOutput::Borrowed(ValueRef::Text(b"true")),
            SqlValue::Bool(false) => ToSqlOutput::Borrowed(ValueRef::Text(b"false")),
        })
    }
}

fn from_value_ref(value: ValueRef<'_>) -> SqlValue {
    match value {
        ValueRef::Null => SqlValue::Null,
        ValueRef::Integer(i) => SqlValue::Integer(i),
        ValueRef::Real(d) => SqlValue::Double(d),
        ValueRef::Text(t) => SqlValue::Text(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => SqlValue::Blob(b.to_vec()),
    }
}

fn translate_action(action: &SqliteAction<'_>) -> AuthAction {
    match action {
        SqliteAction::Select => AuthAction::Select,
        SqliteAction::Read { .. } => AuthAction::Read,
        SqliteAction::Insert { .. } => AuthAction::Insert,
        SqliteAction::Update { .. } => AuthAction::Update,
        SqliteAction::Delete { .. } => AuthAction::Delete,
        SqliteAction::Transaction { operation } => AuthAction::Transaction(match operation {
            TransactionOperation::Begin => TransactionOp::Begin,
            TransactionOperation::Rollback => TransactionOp::Rollback,
            _ => TransactionOp::Commit,
        }),
        SqliteAction::Pragma { pragma_name, .. } => AuthAction::Pragma(pragma_name.to_string()),
        SqliteAction::Attach { .. } => AuthAction::Attach,
        SqliteAction::Detach { .. } => AuthAction::Detach,
        SqliteAction::Function { .. } => AuthAction::Function,
        SqliteAction::CreateIndex { .. }
        | SqliteAction::CreateTable { .. }
        | SqliteAction::CreateTrigger { .. }
        | SqliteAction::CreateView { .. }
        | SqliteAction::DropIndex { .. }
        | SqliteAction::DropTable { .. }
        | SqliteAction::DropTrigger { .. }
        | SqliteAction::DropView { .. }
        | SqliteAction::AlterTable { .. } => AuthAction::Schema,
        _ => AuthAction::Other,
    }
}

fn map_error(err: rusqlite::Error) -> EngineError {
    match err {
        rusqlite::Error::SqliteFailure(failure, message) => {
            let code = match failure.code {
                rusqlite::ErrorCode::InternalMalfunction => ErrorCode::Internal,
                rusqlite::ErrorCode::PermissionDenied => ErrorCode::Perm,
                rusqlite::ErrorCode::OperationAborted => ErrorCode::Abort,
                rusqlite::ErrorCode::DatabaseBusy => ErrorCode::Busy,
                rusqlite::ErrorCode::DatabaseLocked => ErrorCode::Locked,
                rusqlite::ErrorCode::OutOfMemory => ErrorCode::NoMem,
                rusqlite::ErrorCode::ReadOnly => ErrorCode::ReadOnly,
                rusqlite::ErrorCode::OperationInterrupted => ErrorCode::Interrupt,
                rusqlite::ErrorCode::SystemIoFailure => ErrorCode::IoErr,
                rusqlite::ErrorCode::DatabaseCorrupt => ErrorCode::Corrupt,
                rusqlite::ErrorCode::NotFound => ErrorCode::NotFound,
                rusqlite::ErrorCode::DiskFull => ErrorCode::Full,
                rusqlite::ErrorCode::CannotOpen => ErrorCode::CantOpen,
                rusqlite::ErrorCode::FileLockingProtocolFailed => ErrorCode::Protocol,
                rusqlite::ErrorCode::SchemaChanged => ErrorCode::Schema,
                rusqlite::ErrorCode::TooBig => ErrorCode::TooBig,
                rusqlite::ErrorCode::ConstraintViolation => ErrorCode::Constraint,
                rusqlite::ErrorCode::TypeMismatch => ErrorCode::Mismatch,
                rusqlite::ErrorCode::ApiMisuse => ErrorCode::Misuse,
                rusqlite::ErrorCode::NoLargeFileSupport => ErrorCode::NoLfs,
                rusqlite::ErrorCode::AuthorizationForStatementDenied => ErrorCode::Auth,
                rusqlite::ErrorCode::ParameterOutOfRange => ErrorCode::Range,
                rusqlite::ErrorCode::NotADatabase => ErrorCode::NotADb,
                _ => ErrorCode::Error,
            };
            let message = message.unwrap_or_else(|| failure.to_string());
            EngineError::new(code, message)
        }
        rusqlite::Error::InvalidParameterCount(_, _) | rusqlite::Error::InvalidColumnIndex(_) => {
            EngineError::range()
        }
        other => EngineError::new(ErrorCode::Error, other.to_string()),
    }
}
