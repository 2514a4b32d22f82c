//! Engine connections as seen by transactions
//!
//! Every connection carries an authorizer that classifies and validates the
//! statement being prepared, and a progress handler that interrupts long
//! steps for time slicing and timeouts.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use webstore_index::DataFileHandle;
use webstore_sql::{AuthAction, Authorization, Engine, OpenTarget, SharedConnection, TransactionOp};

use crate::scheduler::Scheduler;
use crate::statement::StatementKind;
use crate::{Result, StorageError};

/// Pragmas a statement may use. All of them only read the schema.
pub(crate) const PRAGMA_WHITELIST: [&str; 3] = ["table_info", "index_list", "index_info"];

/// Why the validator refuses `action`, if it does. Synchronous
/// transactions never hold a rollback segment, so they may not open one.
pub(crate) fn validate(action: &AuthAction, read_only: bool, synchronous: bool) -> Option<String> {
    match action {
        AuthAction::Attach | AuthAction::Detach => {
            Some("attaching databases is not allowed".to_string())
        }
        AuthAction::Pragma(name)
            if !PRAGMA_WHITELIST.contains(&name.to_ascii_lowercase().as_str()) =>
        {
            Some(format!("pragma {name} is not allowed"))
        }
        AuthAction::Transaction(_) if read_only => {
            Some("transaction control in a read-only transaction".to_string())
        }
        AuthAction::Transaction(_) if synchronous => {
            Some("transaction control in a synchronous transaction".to_string())
        }
        action if read_only && action.is_write() => {
            Some("write in a read-only transaction".to_string())
        }
        _ => None,
    }
}

#[derive(Default)]
struct AuthState {
    validate: bool,
    read_only: bool,
    synchronous: bool,
    kind: StatementKind,
    seen_statement: bool,
    denied: Option<String>,
}

impl AuthState {
    fn record(&mut self, action: &AuthAction) -> Authorization {
        if action.is_statement() && !self.seen_statement {
            self.seen_statement = true;
            self.kind.is_select = matches!(action, AuthAction::Select);
        }
        if action.is_write() {
            self.kind.writes = true;
        }
        if let AuthAction::Transaction(op) = action {
            self.kind.transaction = Some(*op);
        }
        if self.validate {
            if let Some(reason) = validate(action, self.read_only, self.synchronous) {
                self.denied.get_or_insert(reason);
                return Authorization::Deny;
            }
        }
        Authorization::Allow
    }
}

/// Shared with the progress handler installed on the connection.
struct ProgressState {
    clock: Arc<dyn Scheduler>,
    resumable: bool,
    /// Only the transaction engine's own steps may be interrupted; a caller
    /// stepping a cursor never is.
    active: AtomicBool,
    deadline: Mutex<Option<Duration>>,
    timed_out: AtomicBool,
}

impl ProgressState {
    fn on_progress(&self) -> bool {
        if !self.active.load(Ordering::Acquire) {
            return false;
        }
        if let Some(deadline) = *self.deadline.lock() {
            if self.clock.now() > deadline {
                self.timed_out.store(true, Ordering::Release);
                return true;
            }
        }
        self.resumable
    }
}

/// A connection plus the hooks wired into it.
pub(crate) struct EngineLink {
    conn: SharedConnection,
    auth: Arc<Mutex<AuthState>>,
    progress: Arc<ProgressState>,
    page_size: u64,
    /// Keeps the data file alive while the connection is open.
    file: DataFileHandle,
}

impl EngineLink {
    pub(crate) fn open(
        engine: &dyn Engine,
        file: DataFileHandle,
        clock: Arc<dyn Scheduler>,
        progress_period: u32,
    ) -> Result<Self> {
        let target = match file.absolute_path() {
            Some(path) => OpenTarget::File(path.to_path_buf()),
            None => OpenTarget::Memory,
        };
        let mut conn = engine.open(&target, false)?;

        let auth = Arc::new(Mutex::new(AuthState::default()));
        let hook_auth = Arc::clone(&auth);
        conn.set_authorizer(Some(Box::new(move |action| hook_auth.lock().record(action))));

        let progress = Arc::new(ProgressState {
            clock,
            resumable: conn.resumable_interrupts(),
            active: AtomicBool::new(false),
            deadline: Mutex::new(None),
            timed_out: AtomicBool::new(false),
        });
        let hook_progress = Arc::clone(&progress);
        conn.set_progress_handler(
            progress_period,
            Some(Box::new(move || hook_progress.on_progress())),
        );

        let page_size = conn.page_size()?.max(1);
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            auth,
            progress,
            page_size,
            file,
        })
    }

    pub(crate) fn conn(&self) -> &SharedConnection {
        &self.conn
    }

    /// Arms the authorizer for the next prepare.
    pub(crate) fn begin_prepare(&self, validate: bool, read_only: bool, synchronous: bool) {
        *self.auth.lock() = AuthState {
            validate,
            read_only,
            synchronous,
            ..AuthState::default()
        };
    }

    /// Classification of the statement just prepared, and the validator's
    /// refusal if there was one.
    pub(crate) fn finish_prepare(&self) -> (StatementKind, Option<String>) {
        let mut auth = self.auth.lock();
        (std::mem::take(&mut auth.kind), auth.denied.take())
    }

    /// Marks the start of an engine call made on behalf of a statement with
    /// the given absolute deadline.
    pub(crate) fn enter(&self, deadline: Option<Duration>) {
        *self.progress.deadline.lock() = deadline;
        self.progress.timed_out.store(false, Ordering::Release);
        self.progress.active.store(true, Ordering::Release);
    }

    /// Ends an engine call. Returns whether the call ran out of time.
    pub(crate) fn leave(&self) -> bool {
        self.progress.active.store(false, Ordering::Release);
        self.progress.timed_out.load(Ordering::Acquire)
    }

    /// Whether an interrupted step picks up where it stopped.
    pub(crate) fn resumable(&self) -> bool {
        self.progress.resumable
    }

    pub(crate) fn is_autocommit(&self) -> bool {
        self.conn.lock().is_autocommit()
    }

    /// Bytes the data file uses right now.
    pub(crate) fn data_size(&self) -> Result<u64> {
        let pages = self.conn.lock().page_count()?;
        Ok(pages.saturating_mul(self.page_size))
    }

    /// Caps the data file at `bytes`, or at the engine's own ceiling.
    pub(crate) fn set_size_limit(&self, bytes: Option<u64>) -> Result<()> {
        let mut conn = self.conn.lock();
        let pages = match bytes {
            Some(bytes) => bytes / self.page_size,
            None => conn.max_page_count_limit(),
        };
        conn.set_max_page_count(pages)?;
        Ok(())
    }

    /// Runs a statement outside the queue, e.g. a rollback on close.
    pub(crate) fn run_direct(&self, sql: &str) -> Result<()> {
        self.begin_prepare(false, false, false);
        let mut conn = self.conn.lock();
        let stmt = conn.prepare(sql)?;
        let stepped = conn.step(stmt);
        conn.finalize(stmt)?;
        stepped.map(|_| ()).map_err(StorageError::from)
    }

    /// Closes the connection if nothing else holds it.
    pub(crate) fn close(self) {
        let Self { conn, file, .. } = self;
        match Arc::try_unwrap(conn) {
            Ok(conn) => {
                if let Err(e) = conn.into_inner().close() {
                    tracing::warn!(error = %e, "Closing connection failed");
                }
            }
            Err(_) => tracing::debug!("Connection still referenced by a result set"),
        }
        drop(file);
    }
}

/// SQL text for a transaction control statement.
pub(crate) fn op_sql(op: TransactionOp) -> &'static str {
    match op {
        TransactionOp::Begin => "BEGIN",
        TransactionOp::Commit => "COMMIT",
        TransactionOp::Rollback => "ROLLBACK",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ManualScheduler;
    use std::path::PathBuf;
    use webstore_index::{DataFiles, DiskFiles};
    use webstore_sql::MemoryEngine;

    fn link(engine: &MemoryEngine, clock: Arc<ManualScheduler>) -> EngineLink {
        let files: Arc<dyn DataFiles> = Arc::new(DiskFiles);
        let file = DataFileHandle::on_disk(
            &PathBuf::from("/virtual"),
            PathBuf::from("pstorage/01/00/00000000"),
            files,
        );
        EngineLink::open(engine, file, clock, 1).unwrap()
    }

    #[test]
    fn test_validator_rules() {
        assert!(validate(&AuthAction::Attach, false, false).is_some());
        assert!(validate(&AuthAction::Detach, false, false).is_some());
        assert!(validate(&AuthAction::Pragma("journal_mode".into()), false, false).is_some());
        assert!(validate(&AuthAction::Pragma("TABLE_INFO".into()), false, false).is_none());
        assert!(validate(&AuthAction::Insert, false, false).is_none());
        assert!(validate(&AuthAction::Insert, true, false).is_some());
        assert!(validate(&AuthAction::Schema, true, false).is_some());
        assert!(validate(&AuthAction::Transaction(TransactionOp::Begin), true, false).is_some());
        assert!(validate(&AuthAction::Select, true, false).is_none());
        assert!(validate(&AuthAction::Insert, false, true).is_none());
        assert!(validate(&AuthAction::Transaction(TransactionOp::Begin), false, true).is_some());
        assert!(validate(&AuthAction::Transaction(TransactionOp::Commit), false, true).is_some());
    }

    #[test]
    fn test_prepare_classifies_statements() {
        let engine = MemoryEngine::new();
        let link = link(&engine, Arc::new(ManualScheduler::new()));
        let classify = |sql: &str| {
            link.begin_prepare(true, false, false);
            let stmt = link.conn().lock().prepare(sql).unwrap();
            link.conn().lock().finalize(stmt).unwrap();
            link.finish_prepare().0
        };
        assert!(classify("SELECT").is_select);
        assert!(classify("PUT a 1").writes);
        assert_eq!(classify("BEGIN").transaction, Some(TransactionOp::Begin));
        assert!(classify("COMMIT").ends_segment());
    }

    #[test]
    fn test_read_only_prepare_is_denied() {
        let engine = MemoryEngine::new();
        let link = link(&engine, Arc::new(ManualScheduler::new()));
        link.begin_prepare(true, true, false);
        assert!(link.conn().lock().prepare("PUT a 1").is_err());
        let (_, denied) = link.finish_prepare();
        assert!(denied.unwrap().contains("read-only"));

        // Internal statements skip validation.
        link.begin_prepare(false, true, false);
        assert!(link.conn().lock().prepare("PUT a 1").is_ok());
    }

    #[test]
    fn test_progress_interrupts_only_engine_steps() {
        let engine = MemoryEngine::new();
        let clock = Arc::new(ManualScheduler::new());
        let link = link(&engine, Arc::clone(&clock));
        let stmt = link.conn().lock().prepare("SLOW 2").unwrap();

        // Outside enter/leave a caller's step is never interrupted.
        assert!(link.conn().lock().step(stmt).is_ok());

        let stmt = link.conn().lock().prepare("SLOW 2").unwrap();
        link.enter(Some(Duration::from_millis(50)));
        assert!(link.conn().lock().step(stmt).is_err());
        assert!(!link.leave());

        clock.advance(Duration::from_millis(100));
        link.enter(Some(Duration::from_millis(50)));
        assert!(link.conn().lock().step(stmt).is_err());
        assert!(link.leave());
    }

    #[test]
    fn test_size_limit_and_direct_statements() {
        let engine = MemoryEngine::new();
        let link = link(&engine, Arc::new(ManualScheduler::new()));
        link.run_direct("PUT a 10").unwrap();
        assert_eq!(link.data_size().unwrap(), 10);
        link.set_size_limit(Some(12)).unwrap();
        assert!(link.run_direct("PUT b 5").is_err());
        link.set_size_limit(None).unwrap();
        link.run_direct("PUT b 5").unwrap();
        assert!(link.is_autocommit());
    }
}
