//! Tabular result sets
//!
//! A result set is either the outcome of a data-modifying statement
//! (rows affected, last insert id) or an iterable cursor over rows. An
//! iterable result set may cache rows as it goes, bounded by a byte
//! budget, which also allows random access to already fetched rows.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::{
    Connection, EngineResult, SharedConnection, SqlError, SqlValue, StepResult, StmtHandle,
};

/// Rows fetched at once when a caching result set needs more data.
pub const STEP_BLOCK_SIZE: usize = 8;

/// Reported to the close hook once the engine statement is finalized.
#[derive(Debug)]
pub struct CursorClosed {
    pub finalize: EngineResult<()>,
    /// Auto-commit state of the connection right after finalizing.
    pub autocommit: bool,
}

pub type CloseHook = Box<dyn FnOnce(CursorClosed) + Send>;

/// Live engine statement backing an iterable result set.
pub struct Cursor {
    conn: SharedConnection,
    stmt: StmtHandle,
    on_close: Option<CloseHook>,
}

impl Cursor {
    pub fn new(conn: SharedConnection, stmt: StmtHandle) -> Self {
        Self {
            conn,
            stmt,
            on_close: None,
        }
    }

    pub fn with_close_hook(mut self, hook: CloseHook) -> Self {
        self.on_close = Some(hook);
        self
    }

    pub fn stmt(&self) -> StmtHandle {
        self.stmt
    }

    /// Finalizes through the shared connection and fires the close hook.
    fn finalize(mut self) {
        let (finalize, autocommit) = {
            let mut conn = self.conn.lock();
            let result = conn.finalize(self.stmt);
            (result, conn.is_autocommit())
        };
        if let Some(hook) = self.on_close.take() {
            hook(CursorClosed {
                finalize,
                autocommit,
            });
        }
    }

    /// Finalizes on a connection the caller already holds. The close hook
    /// is dropped: the caller handles the outcome itself.
    fn finalize_on(self, conn: &mut dyn Connection) -> EngineResult<()> {
        conn.finalize(self.stmt)
    }
}

/// Outcome of an eager fetch batch.
#[derive(Debug)]
pub enum Fetch {
    More,
    /// The cursor was exhausted and finalized.
    Closed(EngineResult<()>),
}

struct RowCache {
    rows: Vec<Vec<SqlValue>>,
    size_bytes: u64,
    max_bytes: Option<u64>,
}

impl RowCache {
    fn push(&mut self, row: Vec<SqlValue>) -> Result<(), SqlError> {
        self.size_bytes += row.iter().map(SqlValue::size_of).sum::<u64>();
        self.rows.push(row);
        match self.max_bytes {
            Some(limit) if self.size_bytes > limit => Err(SqlError::TooBig { limit }),
            _ => Ok(()),
        }
    }
}

struct Rows {
    columns: Vec<String>,
    cursor: Option<Cursor>,
    /// Row produced by the executor's first step, not yet returned.
    pending_first: Option<Vec<SqlValue>>,
    current: Option<Vec<SqlValue>>,
    cache: Option<RowCache>,
    position: Option<usize>,
    row_count: usize,
    closed: Arc<AtomicBool>,
}

impl Rows {
    fn mark_closed(&mut self) {
        self.closed.store(true, Ordering::Release);
    }

    fn close_external(&mut self) {
        if let Some(cursor) = self.cursor.take() {
            cursor.finalize();
        }
        self.pending_first = None;
        self.mark_closed();
    }

    fn fetch_with(
        &mut self,
        conn: &mut dyn Connection,
        max_rows: usize,
    ) -> Result<Fetch, SqlError> {
        for _ in 0..max_rows {
            let Some(cursor) = self.cursor.as_ref() else {
                return Ok(Fetch::Closed(Ok(())));
            };
            let stmt = cursor.stmt();
            match conn.step(stmt)? {
                StepResult::Row => {
                    let row = conn.row(stmt)?;
                    match self.cache.as_mut() {
                        Some(cache) => cache.push(row)?,
                        None => self.pending_first = Some(row),
                    }
                }
                StepResult::Done => {
                    let result = match self.cursor.take() {
                        Some(cursor) => cursor.finalize_on(conn),
                        None => Ok(()),
                    };
                    self.mark_closed();
                    return Ok(Fetch::Closed(result));
                }
            }
        }
        Ok(Fetch::More)
    }

    /// Fetches through the shared connection, firing the close hook if the
    /// cursor is exhausted.
    fn fetch_shared(&mut self, max_rows: usize) -> Result<(), SqlError> {
        let Some(conn) = self.cursor.as_ref().map(|c| Arc::clone(&c.conn)) else {
            return Ok(());
        };
        let hook = self.cursor.as_mut().and_then(|c| c.on_close.take());
        let (fetched, autocommit) = {
            let mut guard = conn.lock();
            let fetched = self.fetch_with(guard.as_mut(), max_rows);
            (fetched, guard.is_autocommit())
        };
        match fetched {
            Ok(Fetch::Closed(finalize)) => {
                if let Some(hook) = hook {
                    hook(CursorClosed {
                        finalize,
                        autocommit,
                    });
                }
                Ok(())
            }
            Ok(Fetch::More) => {
                if let (Some(cursor), Some(hook)) = (self.cursor.as_mut(), hook) {
                    cursor.on_close = Some(hook);
                }
                Ok(())
            }
            Err(err) => {
                if let (Some(cursor), Some(hook)) = (self.cursor.as_mut(), hook) {
                    cursor.on_close = Some(hook);
                }
                Err(err)
            }
        }
    }

    fn prefetch_until(&mut self, row: usize) -> Result<(), SqlError> {
        while self.cursor.is_some() {
            let cached = self.cache.as_ref().map_or(0, |c| c.rows.len());
            if cached > row {
                break;
            }
            let missing = row + 1 - cached;
            let block = missing.div_ceil(STEP_BLOCK_SIZE).saturating_mul(STEP_BLOCK_SIZE);
            self.fetch_shared(block)?;
        }
        Ok(())
    }
}

enum Inner {
    Dml { rows_affected: u64, last_insert_id: i64 },
    Rows(Rows),
}

pub struct ResultSet {
    inner: Inner,
}

impl ResultSet {
    pub fn dml(rows_affected: u64, last_insert_id: i64) -> Self {
        Self {
            inner: Inner::Dml {
                rows_affected,
                last_insert_id,
            },
        }
    }

    /// Builds an iterable result set. `first_row` is the row the executor
    /// already stepped onto; the first `step()` returns it.
    pub fn rows(
        columns: Vec<String>,
        cursor: Option<Cursor>,
        first_row: Option<Vec<SqlValue>>,
    ) -> Self {
        let closed = Arc::new(AtomicBool::new(cursor.is_none()));
        Self {
            inner: Inner::Rows(Rows {
                columns,
                cursor,
                pending_first: first_row,
                current: None,
                cache: None,
                position: None,
                row_count: 0,
                closed,
            }),
        }
    }

    pub fn is_iterable(&self) -> bool {
        matches!(self.inner, Inner::Rows(_))
    }

    pub fn rows_affected(&self) -> Option<u64> {
        match self.inner {
            Inner::Dml { rows_affected, .. } => Some(rows_affected),
            Inner::Rows(_) => None,
        }
    }

    pub fn last_insert_id(&self) -> Option<i64> {
        match self.inner {
            Inner::Dml { last_insert_id, .. } => Some(last_insert_id),
            Inner::Rows(_) => None,
        }
    }

    pub fn is_caching(&self) -> bool {
        matches!(&self.inner, Inner::Rows(rows) if rows.cache.is_some())
    }

    pub fn is_closed(&self) -> bool {
        match &self.inner {
            Inner::Dml { .. } => true,
            Inner::Rows(rows) => rows.cursor.is_none(),
        }
    }

    /// Flag that flips when the cursor closes, present only while an open,
    /// uncached cursor holds up its statement.
    pub fn completion_flag(&self) -> Option<Arc<AtomicBool>> {
        match &self.inner {
            Inner::Rows(rows) if rows.cache.is_none() && rows.cursor.is_some() => {
                Some(Arc::clone(&rows.closed))
            }
            _ => None,
        }
    }

    /// Switches to caching mode. Every row fetched from now on is kept and
    /// charged against `max_bytes`.
    pub fn enable_caching(&mut self, max_bytes: Option<u64>) -> Result<(), SqlError> {
        let Inner::Rows(rows) = &mut self.inner else {
            return Err(SqlError::NotSupported);
        };
        if rows.cache.is_some() {
            return Ok(());
        }
        let mut cache = RowCache {
            rows: Vec::new(),
            size_bytes: 0,
            max_bytes,
        };
        if let Some(first) = rows.pending_first.take() {
            cache.push(first)?;
        }
        rows.cache = Some(cache);
        Ok(())
    }

    /// Steps the cursor up to `max_rows` times on a connection the caller
    /// already holds.
    pub fn fetch(&mut self, conn: &mut dyn Connection, max_rows: usize) -> Result<Fetch, SqlError> {
        match &mut self.inner {
            Inner::Rows(rows) => rows.fetch_with(conn, max_rows),
            Inner::Dml { .. } => Err(SqlError::NotSupported),
        }
    }

    /// Finalizes the cursor on a connection the caller already holds,
    /// without firing the close hook.
    pub fn close_on(&mut self, conn: &mut dyn Connection) -> Option<EngineResult<()>> {
        let Inner::Rows(rows) = &mut self.inner else {
            return None;
        };
        let result = rows.cursor.take().map(|cursor| cursor.finalize_on(conn));
        rows.pending_first = None;
        rows.mark_closed();
        result
    }

    /// Advances to the next row. Returns `false` once the rows are
    /// exhausted, at which point the cursor is closed.
    pub fn step(&mut self) -> Result<bool, SqlError> {
        let Inner::Rows(rows) = &mut self.inner else {
            return Err(SqlError::NotSupported);
        };

        if rows.cache.is_some() {
            let next = rows.position.map_or(0, |p| p + 1);
            rows.prefetch_until(next)?;
            let cached = rows.cache.as_ref().map_or(0, |c| c.rows.len());
            rows.position = Some(next.min(cached));
            if next < cached {
                rows.row_count = next + 1;
                return Ok(true);
            }
            return Ok(false);
        }

        if let Some(first) = rows.pending_first.take() {
            rows.current = Some(first);
            rows.row_count += 1;
            return Ok(true);
        }
        if rows.cursor.is_none() {
            rows.current = None;
            return Ok(false);
        }
        rows.fetch_shared(1)?;
        match rows.pending_first.take() {
            Some(row) => {
                rows.current = Some(row);
                rows.row_count += 1;
                Ok(true)
            }
            None => {
                rows.current = None;
                Ok(false)
            }
        }
    }

    pub fn column_names(&self) -> &[String] {
        match &self.inner {
            Inner::Rows(rows) => &rows.columns,
            Inner::Dml { .. } => &[],
        }
    }

    pub fn column_count(&self) -> usize {
        self.column_names().len()
    }

    /// Case-insensitive column lookup.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.column_names()
            .iter()
            .position(|column| column.eq_ignore_ascii_case(name))
    }

    /// Rows returned by `step()` so far.
    pub fn row_count(&self) -> usize {
        match &self.inner {
            Inner::Rows(rows) => rows.row_count,
            Inner::Dml { .. } => 0,
        }
    }

    fn current_row(&self) -> Result<&[SqlValue], SqlError> {
        let Inner::Rows(rows) = &self.inner else {
            return Err(SqlError::NotSupported);
        };
        let row = match (&rows.cache, rows.position) {
            (Some(cache), Some(position)) => cache.rows.get(position),
            (Some(_), None) => None,
            (None, _) => rows.current.as_ref(),
        };
        row.map(Vec::as_slice).ok_or(SqlError::NoRow)
    }

    pub fn value(&self, column: usize) -> Result<&SqlValue, SqlError> {
        self.current_row()?
            .get(column)
            .ok_or(SqlError::OutOfRange(column))
    }

    pub fn value_by_name(&self, name: &str) -> Result<&SqlValue, SqlError> {
        let index = self
            .column_index(name)
            .ok_or_else(|| SqlError::UnknownColumn(name.to_string()))?;
        self.value(index)
    }

    /// Random access into cached rows, fetching ahead as needed.
    pub fn cached_value(&mut self, row: usize, column: usize) -> Result<&SqlValue, SqlError> {
        let Inner::Rows(rows) = &mut self.inner else {
            return Err(SqlError::NotSupported);
        };
        if rows.cache.is_none() {
            return Err(SqlError::NotSupported);
        }
        rows.prefetch_until(row)?;
        let cache = rows.cache.as_ref().ok_or(SqlError::NotSupported)?;
        let values = cache.rows.get(row).ok_or(SqlError::OutOfRange(row))?;
        values.get(column).ok_or(SqlError::OutOfRange(column))
    }

    /// Total number of rows, fetching the remainder into the cache.
    pub fn cached_len(&mut self) -> Result<usize, SqlError> {
        let Inner::Rows(rows) = &mut self.inner else {
            return Err(SqlError::NotSupported);
        };
        if rows.cache.is_none() {
            return Err(SqlError::NotSupported);
        }
        rows.prefetch_until(usize::MAX - 1)?;
        Ok(rows.cache.as_ref().map_or(0, |c| c.rows.len()))
    }

    /// Bytes held by cached rows.
    pub fn size_of(&self) -> u64 {
        match &self.inner {
            Inner::Rows(rows) => rows.cache.as_ref().map_or(0, |c| c.size_bytes),
            Inner::Dml { .. } => 0,
        }
    }

    pub fn close(&mut self) {
        if let Inner::Rows(rows) = &mut self.inner {
            rows.close_external();
        }
    }
}

impl Drop for ResultSet {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for ResultSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.inner {
            Inner::Dml {
                rows_affected,
                last_insert_id,
            } => f
                .debug_struct("ResultSet::Dml")
                .field("rows_affected", rows_affected)
                .field("last_insert_id", last_insert_id)
                .finish(),
            Inner::Rows(rows) => f
                .debug_struct("ResultSet::Rows")
                .field("columns", &rows.columns)
                .field("row_count", &rows.row_count)
                .field("caching", &rows.cache.is_some())
                .field("closed", &rows.cursor.is_none())
                .finish(),
        }
    }
}
