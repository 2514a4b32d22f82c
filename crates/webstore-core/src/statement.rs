//! Statements and their state machine

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use webstore_sql::{ResultSet, SqlValue, StmtHandle, TransactionOp};

use crate::object::ObjectShared;
use crate::quota::PromptTarget;
use crate::{StorageError, TransactionId};

/// Delivered exactly once per statement, unless the statement is cancelled
/// first.
pub type StatementCallback = Box<dyn FnOnce(StatementResult) + Send>;

pub type StatementResult = std::result::Result<Option<ResultSet>, StorageError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatementState {
    BeforeExecution,
    DuringExecution,
    DuringStepping,
    AfterExecution,
    Cancelled,
}

impl StatementState {
    fn rank(self) -> u8 {
        match self {
            StatementState::BeforeExecution => 0,
            StatementState::DuringExecution => 1,
            StatementState::DuringStepping => 2,
            StatementState::AfterExecution => 3,
            StatementState::Cancelled => 4,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, StatementState::AfterExecution | StatementState::Cancelled)
    }

    /// States only move forward. Going back to `BeforeExecution` is a reset,
    /// not a transition.
    pub fn can_transition_to(self, next: StatementState) -> bool {
        match next {
            StatementState::Cancelled => !self.is_terminal(),
            _ => !self.is_terminal() && next.rank() > self.rank(),
        }
    }
}

impl fmt::Display for StatementState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StatementState::BeforeExecution => "before-execution",
            StatementState::DuringExecution => "during-execution",
            StatementState::DuringStepping => "during-stepping",
            StatementState::AfterExecution => "after-execution",
            StatementState::Cancelled => "cancelled",
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatementOptions {
    /// Shown in the quota prompt instead of the object name.
    pub display_name: Option<String>,
    /// Bytes the caller expects the write to need.
    pub preferred_size: Option<u64>,
    pub prompt_target: Option<PromptTarget>,
    /// Fetch every row before the callback fires.
    pub cache_rows: bool,
}

impl StatementOptions {
    pub fn cached() -> Self {
        Self {
            cache_rows: true,
            ..Self::default()
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn with_preferred_size(mut self, bytes: u64) -> Self {
        self.preferred_size = Some(bytes);
        self
    }

    pub fn with_prompt_target(mut self, target: PromptTarget) -> Self {
        self.prompt_target = Some(target);
        self
    }
}

/// What the authorizer learned while a statement was prepared.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct StatementKind {
    pub is_select: bool,
    pub writes: bool,
    pub transaction: Option<TransactionOp>,
}

impl StatementKind {
    pub(crate) fn ends_segment(&self) -> bool {
        matches!(
            self.transaction,
            Some(TransactionOp::Commit | TransactionOp::Rollback)
        )
    }

    pub(crate) fn may_change_size(&self) -> bool {
        self.writes || self.transaction.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Source {
    User,
    /// begin/commit/rollback queued by the transaction API; skips validation.
    Internal,
    /// Only attaches the data file and measures it.
    Probe,
}

pub(crate) enum CallbackSlot {
    Real(StatementCallback),
    /// Replayed copy: successes are swallowed, errors go to the next real
    /// statement.
    Replay,
    Discarded,
}

/// Copy of an executed statement kept while its rollback segment is open.
#[derive(Clone)]
pub(crate) struct SavedStatement {
    pub id: u64,
    pub sql: String,
    pub params: Vec<SqlValue>,
    pub options: StatementOptions,
    pub source: Source,
}

/// Cursor state shared with the close hook of a result set handed to the
/// caller.
#[derive(Default)]
pub(crate) struct CursorWatch {
    closed: AtomicBool,
    autocommit: AtomicBool,
}

impl CursorWatch {
    pub(crate) fn record(&self, autocommit: bool) {
        self.autocommit.store(autocommit, Ordering::Release);
        self.closed.store(true, Ordering::Release);
    }

    /// `Some(autocommit)` once the caller closed the cursor.
    pub(crate) fn outcome(&self) -> Option<bool> {
        self.closed
            .load(Ordering::Acquire)
            .then(|| self.autocommit.load(Ordering::Acquire))
    }
}

pub(crate) struct Statement {
    pub id: u64,
    pub sql: String,
    pub params: Vec<SqlValue>,
    pub options: StatementOptions,
    pub source: Source,
    pub callback: CallbackSlot,
    pub state: StatementState,
    pub kind: StatementKind,
    pub stmt: Option<StmtHandle>,
    /// Result being cached in `DuringStepping`.
    pub result: Option<ResultSet>,
    /// Set while an uncached cursor is out with the caller.
    pub cursor: Option<Arc<CursorWatch>>,
    pub started_at: Duration,
    pub budget: Option<Duration>,
    pub busy_retries: u32,
    pub recoveries: u32,
}

impl Statement {
    pub(crate) fn new(
        id: u64,
        sql: String,
        params: Vec<SqlValue>,
        options: StatementOptions,
        source: Source,
        callback: CallbackSlot,
    ) -> Self {
        Self {
            id,
            sql,
            params,
            options,
            source,
            callback,
            state: StatementState::BeforeExecution,
            kind: StatementKind::default(),
            stmt: None,
            result: None,
            cursor: None,
            started_at: Duration::ZERO,
            budget: None,
            busy_retries: 0,
            recoveries: 0,
        }
    }

    pub(crate) fn replay(saved: SavedStatement) -> Self {
        Self::new(
            saved.id,
            saved.sql,
            saved.params,
            saved.options,
            saved.source,
            CallbackSlot::Replay,
        )
    }

    pub(crate) fn saved(&self) -> SavedStatement {
        SavedStatement {
            id: self.id,
            sql: self.sql.clone(),
            params: self.params.clone(),
            options: self.options.clone(),
            source: self.source,
        }
    }

    pub(crate) fn is_replay(&self) -> bool {
        matches!(self.callback, CallbackSlot::Replay)
    }

    pub(crate) fn has_real_callback(&self) -> bool {
        matches!(self.callback, CallbackSlot::Real(_))
    }

    pub(crate) fn set_state(&mut self, next: StatementState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "{} -> {next}",
            self.state
        );
        tracing::debug!(statement = self.id, from = %self.state, to = %next, "Statement state");
        self.state = next;
    }

    /// Back to `BeforeExecution` so the statement runs again from scratch.
    /// The caller finalizes any engine handle first.
    pub(crate) fn reset(&mut self) {
        self.state = StatementState::BeforeExecution;
        self.stmt = None;
        self.result = None;
        self.kind = StatementKind::default();
        self.busy_retries = 0;
    }

    pub(crate) fn take_callback(&mut self) -> CallbackSlot {
        std::mem::replace(&mut self.callback, CallbackSlot::Discarded)
    }
}

/// Handle returned for every queued statement.
#[derive(Clone)]
pub struct StatementHandle {
    pub(crate) object: Weak<ObjectShared>,
    pub(crate) transaction: TransactionId,
    pub(crate) id: u64,
}

impl StatementHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn transaction(&self) -> TransactionId {
        self.transaction
    }

    /// Discards the callback if it has not fired yet. Neither the success
    /// nor the error path runs afterwards. Returns whether anything was
    /// discarded.
    pub fn cancel(&self) -> bool {
        match self.object.upgrade() {
            Some(object) => object.cancel_statement(self.transaction, self.id),
            None => false,
        }
    }
}

impl fmt::Debug for StatementHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatementHandle")
            .field("transaction", &self.transaction)
            .field("id", &self.id)
            .finish()
    }
}
