//! Deterministic in-process engine
//!
//! Data files are virtual: each path maps to a table of `key -> payload
//! bytes` rows, stored with one-byte pages so sizes and quotas are exact.
//! Statements use a small command language:
//!
//! ```text
//! BEGIN | COMMIT | ROLLBACK
//! PUT <key> <bytes>        insert or replace a row holding <bytes> bytes
//! DEL <key>                remove a row
//! SELECT [<key>]           rows as (key, bytes)
//! COUNT                    number of rows
//! SLOW <ticks>             runs <ticks> progress periods before finishing
//! CREATE <name>            schema change
//! ```
//!
//! Any argument may be a `?` placeholder. Interrupts are resumable, and the
//! engine can be told to abort an open transaction, corrupt a file, or
//! fail the next open.

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::{
    AuthAction, Authorization, Authorizer, Connection, Engine, EngineError, EngineResult,
    ErrorCode, OpenTarget, ProgressHandler, SqlValue, StepResult, StmtHandle, TransactionOp,
    MAX_PAGE_COUNT,
};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum FileKey {
    Path(PathBuf),
    Private(u64),
}

#[derive(Debug, Clone, Default)]
struct Tables {
    rows: BTreeMap<String, u64>,
    schema: Vec<String>,
}

impl Tables {
    fn size(&self) -> u64 {
        self.rows.values().sum()
    }
}

#[derive(Debug, Default)]
struct FileState {
    tables: Tables,
    /// Connection holding the write lock inside an explicit transaction.
    writer: Option<u64>,
    abort_pending: bool,
}

#[derive(Debug, Default)]
struct EngineState {
    files: HashMap<FileKey, FileState>,
    corrupt: HashSet<PathBuf>,
    open_failures: VecDeque<ErrorCode>,
    next_connection: u64,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryEngine {
    state: Arc<Mutex<EngineState>>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the connection holding an open transaction on `path` lose it
    /// at its next step, as an engine would under memory pressure.
    pub fn force_abort(&self, path: &Path) {
        let mut state = self.state.lock();
        if let Some(file) = state.files.get_mut(&FileKey::Path(path.to_path_buf())) {
            file.abort_pending = true;
        }
    }

    /// Every statement prepared against `path` fails as not-a-database
    /// until the file is removed.
    pub fn corrupt(&self, path: &Path) {
        self.state.lock().corrupt.insert(path.to_path_buf());
    }

    pub fn fail_next_open(&self, code: ErrorCode) {
        self.state.lock().open_failures.push_back(code);
    }

    /// Committed and uncommitted payload bytes stored in `path`.
    pub fn data_size(&self, path: &Path) -> Option<u64> {
        let state = self.state.lock();
        state
            .files
            .get(&FileKey::Path(path.to_path_buf()))
            .map(|file| file.tables.size())
    }

    pub fn keys(&self, path: &Path) -> Vec<String> {
        let state = self.state.lock();
        state
            .files
            .get(&FileKey::Path(path.to_path_buf()))
            .map(|file| file.tables.rows.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn file_count(&self) -> usize {
        let state = self.state.lock();
        state
            .files
            .keys()
            .filter(|key| matches!(key, FileKey::Path(_)))
            .count()
    }
}

impl Engine for MemoryEngine {
    fn open(&self, target: &OpenTarget, read_only: bool) -> EngineResult<Box<dyn Connection>> {
        let mut state = self.state.lock();
        if let Some(code) = state.open_failures.pop_front() {
            return Err(EngineError::new(code, "unable to open database file"));
        }
        state.next_connection += 1;
        let id = state.next_connection;
        let key = match target {
            OpenTarget::Memory => FileKey::Private(id),
            OpenTarget::File(path) => FileKey::Path(path.clone()),
        };
        if !state.files.contains_key(&key) {
            if read_only && matches!(key, FileKey::Path(_)) {
                return Err(EngineError::new(
                    ErrorCode::CantOpen,
                    "unable to open database file",
                ));
            }
            state.files.insert(key.clone(), FileState::default());
        }
        Ok(Box::new(MemoryConnection {
            id,
            key,
            read_only,
            engine: Arc::clone(&self.state),
            snapshot: None,
            max_pages: MAX_PAGE_COUNT,
            statements: HashMap::new(),
            next_handle: 1,
            authorizer: None,
            progress: None,
            changes: 0,
            last_rowid: 0,
            next_rowid: 1,
        }))
    }

    fn data_file_size(&self, path: &Path) -> io::Result<Option<u64>> {
        Ok(self.data_size(path))
    }

    fn remove_data_file(&self, path: &Path) -> io::Result<()> {
        let mut state = self.state.lock();
        state.files.remove(&FileKey::Path(path.to_path_buf()));
        state.corrupt.remove(path);
        Ok(())
    }

    fn list_data_files(&self, dir: &Path) -> io::Result<Vec<PathBuf>> {
        let state = self.state.lock();
        let mut files: Vec<PathBuf> = state
            .files
            .keys()
            .filter_map(|key| match key {
                FileKey::Path(path) if path.starts_with(dir) => Some(path.clone()),
                _ => None,
            })
            .collect();
        files.sort();
        Ok(files)
    }
}

#[derive(Debug, Clone)]
enum Arg {
    Literal(String),
    Param(usize),
}

#[derive(Debug, Clone)]
enum Command {
    Transaction(TransactionOp),
    Put { key: Arg, bytes: Arg },
    Del { key: Arg },
    Select { key: Option<Arg> },
    Count,
    Slow { ticks: u32 },
    Create { name: String },
}

impl Command {
    fn actions(&self) -> Vec<AuthAction> {
        match self {
            Command::Transaction(op) => vec![AuthAction::Transaction(*op)],
            Command::Put { .. } => vec![AuthAction::Insert],
            Command::Del { .. } => vec![AuthAction::Delete],
            Command::Select { .. } | Command::Count => vec![AuthAction::Select, AuthAction::Read],
            Command::Slow { .. } => vec![AuthAction::Select, AuthAction::Function],
            Command::Create { .. } => vec![AuthAction::Schema],
        }
    }

    fn columns(&self) -> Vec<String> {
        match self {
            Command::Select { .. } => vec!["key".to_string(), "bytes".to_string()],
            Command::Count => vec!["count".to_string()],
            _ => Vec::new(),
        }
    }

    fn writes(&self) -> bool {
        matches!(
            self,
            Command::Put { .. } | Command::Del { .. } | Command::Create { .. }
        )
    }
}

fn syntax_error(token: &str) -> EngineError {
    EngineError::new(ErrorCode::Error, format!("near \"{token}\": syntax error"))
}

fn parse(sql: &str) -> EngineResult<(Command, usize)> {
    let mut params = 0;
    let mut arg = |token: &str| {
        if token == "?" {
            params += 1;
            Arg::Param(params)
        } else {
            Arg::Literal(token.to_string())
        }
    };
    let tokens: Vec<&str> = sql
        .trim()
        .trim_end_matches(';')
        .split_whitespace()
        .collect();
    let Some((head, rest)) = tokens.split_first() else {
        return Err(EngineError::new(ErrorCode::Error, "syntax error: no query"));
    };
    let command = match (head.to_ascii_uppercase().as_str(), rest) {
        ("BEGIN", []) => Command::Transaction(TransactionOp::Begin),
        ("COMMIT" | "END", []) => Command::Transaction(TransactionOp::Commit),
        ("ROLLBACK", []) => Command::Transaction(TransactionOp::Rollback),
        ("PUT", [key, bytes]) => Command::Put {
            key: arg(*key),
            bytes: arg(*bytes),
        },
        ("DEL", [key]) => Command::Del { key: arg(*key) },
        ("SELECT", []) => Command::Select { key: None },
        ("SELECT", [key]) => Command::Select {
            key: Some(arg(*key)),
        },
        ("COUNT", []) => Command::Count,
        ("SLOW", [ticks]) => Command::Slow {
            ticks: ticks.parse().map_err(|_| syntax_error(ticks))?,
        },
        ("CREATE", [name]) => Command::Create {
            name: name.to_string(),
        },
        (_, [last, ..]) => return Err(syntax_error(last)),
        (_, []) => return Err(syntax_error(head)),
    };
    Ok((command, params))
}

struct MemStatement {
    command: Command,
    params: Vec<SqlValue>,
    ticks_left: u32,
    output: Option<VecDeque<Vec<SqlValue>>>,
    current: Option<Vec<SqlValue>>,
}

struct MemoryConnection {
    id: u64,
    key: FileKey,
    read_only: bool,
    engine: Arc<Mutex<EngineState>>,
    /// Rows as of BEGIN, present while an explicit transaction is open.
    snapshot: Option<Tables>,
    max_pages: u64,
    statements: HashMap<u64, MemStatement>,
    next_handle: u64,
    authorizer: Option<Authorizer>,
    progress: Option<ProgressHandler>,
    changes: u64,
    last_rowid: i64,
    next_rowid: i64,
}

impl MemoryConnection {
    fn statement(&self, stmt: StmtHandle) -> EngineResult<&MemStatement> {
        self.statements
            .get(&stmt.raw())
            .ok_or_else(|| EngineError::misuse("unknown statement handle"))
    }

    fn resolve(args: &[SqlValue], arg: &Arg) -> EngineResult<String> {
        match arg {
            Arg::Literal(value) => Ok(value.clone()),
            Arg::Param(index) => match args.get(index - 1) {
                Some(SqlValue::Null) | None => Err(EngineError::new(
                    ErrorCode::Constraint,
                    "NOT NULL constraint failed",
                )),
                Some(value) => Ok(value.to_string()),
            },
        }
    }

    fn release_write_lock(&self, file: &mut FileState) {
        if file.writer == Some(self.id) {
            file.writer = None;
        }
    }

    fn execute(
        &mut self,
        command: &Command,
        params: &[SqlValue],
    ) -> EngineResult<VecDeque<Vec<SqlValue>>> {
        let engine = Arc::clone(&self.engine);
        let mut state = engine.lock();
        let file = state
            .files
            .get_mut(&self.key)
            .ok_or_else(|| EngineError::new(ErrorCode::IoErr, "disk I/O error"))?;

        if file.abort_pending && self.snapshot.is_some() {
            file.abort_pending = false;
            if let Some(snapshot) = self.snapshot.take() {
                file.tables = snapshot;
            }
            self.release_write_lock(file);
            return Err(EngineError::new(ErrorCode::Abort, "abort due to ROLLBACK"));
        }

        if command.writes() {
            if self.read_only {
                return Err(EngineError::new(
                    ErrorCode::ReadOnly,
                    "attempt to write a readonly database",
                ));
            }
            if matches!(file.writer, Some(writer) if writer != self.id) {
                return Err(EngineError::new(ErrorCode::Busy, "database is locked"));
            }
        }

        let mut rows = VecDeque::new();
        match command {
            Command::Transaction(TransactionOp::Begin) => {
                if self.snapshot.is_some() {
                    return Err(EngineError::new(
                        ErrorCode::Error,
                        "cannot start a transaction within a transaction",
                    ));
                }
                self.snapshot = Some(file.tables.clone());
            }
            Command::Transaction(TransactionOp::Commit) => {
                if self.snapshot.take().is_none() {
                    return Err(EngineError::new(
                        ErrorCode::Error,
                        "cannot commit - no transaction is active",
                    ));
                }
                self.release_write_lock(file);
            }
            Command::Transaction(TransactionOp::Rollback) => {
                let Some(snapshot) = self.snapshot.take() else {
                    return Err(EngineError::new(
                        ErrorCode::Error,
                        "cannot rollback - no transaction is active",
                    ));
                };
                file.tables = snapshot;
                self.release_write_lock(file);
            }
            Command::Put { key, bytes } => {
                let key = Self::resolve(params, key)?;
                let bytes: u64 = Self::resolve(params, bytes)?
                    .parse()
                    .map_err(|_| EngineError::new(ErrorCode::Mismatch, "datatype mismatch"))?;
                let previous = file.tables.rows.get(&key).copied().unwrap_or(0);
                let new_size = file.tables.size() - previous + bytes;
                if new_size > self.max_pages {
                    return Err(EngineError::new(
                        ErrorCode::Full,
                        "database or disk is full",
                    ));
                }
                if self.snapshot.is_some() {
                    file.writer = Some(self.id);
                }
                file.tables.rows.insert(key, bytes);
                self.changes = 1;
                self.last_rowid = self.next_rowid;
                self.next_rowid += 1;
            }
            Command::Del { key } => {
                let key = Self::resolve(params, key)?;
                if self.snapshot.is_some() {
                    file.writer = Some(self.id);
                }
                self.changes = u64::from(file.tables.rows.remove(&key).is_some());
            }
            Command::Create { name } => {
                if self.snapshot.is_some() {
                    file.writer = Some(self.id);
                }
                if file.tables.schema.contains(name) {
                    return Err(EngineError::new(
                        ErrorCode::Error,
                        format!("table {name} already exists"),
                    ));
                }
                file.tables.schema.push(name.clone());
                self.changes = 0;
            }
            Command::Select { key } => {
                let filter = key
                    .as_ref()
                    .map(|key| Self::resolve(params, key))
                    .transpose()?;
                for (row_key, bytes) in &file.tables.rows {
                    if filter.as_ref().is_some_and(|wanted| wanted != row_key) {
                        continue;
                    }
                    rows.push_back(vec![
                        SqlValue::Text(row_key.clone()),
                        SqlValue::Integer(*bytes as i64),
                    ]);
                }
            }
            Command::Count => {
                rows.push_back(vec![SqlValue::Integer(file.tables.rows.len() as i64)]);
            }
            Command::Slow { .. } => {}
        }
        Ok(rows)
    }
}

impl Connection for MemoryConnection {
    fn prepare(&mut self, sql: &str) -> EngineResult<StmtHandle> {
        if let FileKey::Path(path) = &self.key {
            if self.engine.lock().corrupt.contains(path) {
                return Err(EngineError::new(
                    ErrorCode::NotADb,
                    "file is not a database",
                ));
            }
        }
        let (command, param_count) = parse(sql)?;
        if let Some(authorizer) = self.authorizer.as_mut() {
            for action in command.actions() {
                if authorizer(&action) == Authorization::Deny {
                    return Err(EngineError::new(ErrorCode::Auth, "not authorized"));
                }
            }
        }
        let ticks_left = match command {
            Command::Slow { ticks } => ticks,
            _ => 0,
        };
        let handle = self.next_handle;
        self.next_handle += 1;
        self.statements.insert(
            handle,
            MemStatement {
                command,
                params: vec![SqlValue::Null; param_count],
                ticks_left,
                output: None,
                current: None,
            },
        );
        Ok(StmtHandle::new(handle))
    }

    fn parameter_count(&self, stmt: StmtHandle) -> EngineResult<usize> {
        Ok(self.statement(stmt)?.params.len())
    }

    fn bind(&mut self, stmt: StmtHandle, index: usize, value: &SqlValue) -> EngineResult<()> {
        let statement = self
            .statements
            .get_mut(&stmt.raw())
            .ok_or_else(|| EngineError::misuse("unknown statement handle"))?;
        if index == 0 || index > statement.params.len() {
            return Err(EngineError::range());
        }
        statement.params[index - 1] = value.clone();
        Ok(())
    }

    fn step(&mut self, stmt: StmtHandle) -> EngineResult<StepResult> {
        let mut statement = self
            .statements
            .remove(&stmt.raw())
            .ok_or_else(|| EngineError::misuse("unknown statement handle"))?;
        let result = self.step_statement(&mut statement);
        self.statements.insert(stmt.raw(), statement);
        result
    }

    fn column_names(&self, stmt: StmtHandle) -> EngineResult<Vec<String>> {
        Ok(self.statement(stmt)?.command.columns())
    }

    fn row(&self, stmt: StmtHandle) -> EngineResult<Vec<SqlValue>> {
        self.statement(stmt)?
            .current
            .clone()
            .ok_or_else(|| EngineError::misuse("no current row"))
    }

    fn finalize(&mut self, stmt: StmtHandle) -> EngineResult<()> {
        self.statements.remove(&stmt.raw());
        Ok(())
    }

    fn changes(&self) -> u64 {
        self.changes
    }

    fn last_insert_rowid(&self) -> i64 {
        self.last_rowid
    }

    fn set_authorizer(&mut self, authorizer: Option<Authorizer>) {
        self.authorizer = authorizer;
    }

    fn set_progress_handler(&mut self, period: u32, handler: Option<ProgressHandler>) {
        self.progress = if period == 0 { None } else { handler };
    }

    fn is_autocommit(&self) -> bool {
        self.snapshot.is_none()
    }

    fn resumable_interrupts(&self) -> bool {
        true
    }

    fn page_size(&mut self) -> EngineResult<u64> {
        Ok(1)
    }

    fn page_count(&mut self) -> EngineResult<u64> {
        let state = self.engine.lock();
        Ok(state.files.get(&self.key).map_or(0, |file| file.tables.size()))
    }

    fn set_max_page_count(&mut self, pages: u64) -> EngineResult<u64> {
        let current = self.page_count()?;
        self.max_pages = pages.clamp(current.max(1), MAX_PAGE_COUNT);
        Ok(self.max_pages)
    }

    fn close(self: Box<Self>) -> EngineResult<()> {
        Ok(())
    }
}

impl MemoryConnection {
    fn step_statement(&mut self, statement: &mut MemStatement) -> EngineResult<StepResult> {
        if statement.output.is_none() {
            while statement.ticks_left > 0 {
                statement.ticks_left -= 1;
                if let Some(progress) = self.progress.as_mut() {
                    if progress() {
                        return Err(EngineError::new(ErrorCode::Interrupt, "interrupted"));
                    }
                }
            }
            let rows = self.execute(&statement.command, &statement.params)?;
            statement.output = Some(rows);
        }
        statement.current = statement.output.as_mut().and_then(VecDeque::pop_front);
        Ok(if statement.current.is_some() {
            StepResult::Row
        } else {
            StepResult::Done
        })
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        let mut state = self.engine.lock();
        let private = matches!(self.key, FileKey::Private(_));
        if let Some(file) = state.files.get_mut(&self.key) {
            if let Some(snapshot) = self.snapshot.take() {
                file.tables = snapshot;
            }
            if file.writer == Some(self.id) {
                file.writer = None;
            }
        }
        if private {
            state.files.remove(&self.key);
        }
    }
}
