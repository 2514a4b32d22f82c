//! Transactions: ordered statement queues on a storage object

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use webstore_sql::{SqlValue, TransactionOp};

use crate::link::{op_sql, EngineLink};
use crate::object::{DriveStep, ObjectShared};
use crate::statement::{
    CallbackSlot, SavedStatement, Source, Statement, StatementCallback, StatementHandle,
    StatementOptions,
};
use crate::{Result, StorageError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransactionId(pub(crate) u64);

impl TransactionId {
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx#{}", self.0)
    }
}

#[derive(Debug, Clone, Default)]
pub struct TransactionOptions {
    pub read_only: bool,
    /// Never scheduled; the caller runs it with `flush`.
    pub synchronous: bool,
    /// Every statement fails unless the object has this version.
    pub expected_version: Option<String>,
}

impl TransactionOptions {
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn synchronous(mut self) -> Self {
        self.synchronous = true;
        self
    }

    pub fn expecting_version(mut self, version: impl Into<String>) -> Self {
        self.expected_version = Some(version.into());
        self
    }
}

pub(crate) struct QuotaWait {
    pub request_id: u64,
}

/// Engine-side state of a transaction, owned by its storage object.
pub(crate) struct TxState {
    pub id: TransactionId,
    pub options: TransactionOptions,
    pub pending: VecDeque<Statement>,
    /// Statements executed since the rollback segment opened, in order.
    pub saved: Vec<SavedStatement>,
    pub link: Option<Arc<EngineLink>>,
    pub has_rollback_segment: bool,
    /// Closes once the queue drains.
    pub released: bool,
    pub quota_wait: Option<QuotaWait>,
}

impl TxState {
    pub(crate) fn new(id: TransactionId, options: TransactionOptions) -> Self {
        Self {
            id,
            options,
            pending: VecDeque::new(),
            saved: Vec::new(),
            link: None,
            has_rollback_segment: false,
            released: false,
            quota_wait: None,
        }
    }

    /// Queues every saved statement to run again ahead of the statements
    /// that have not run yet.
    pub(crate) fn start_replay(&mut self) {
        self.has_rollback_segment = false;
        let saved = std::mem::take(&mut self.saved);
        if saved.is_empty() {
            return;
        }
        tracing::warn!(
            transaction = %self.id,
            statements = saved.len(),
            "Rollback segment lost, replaying"
        );
        let at = match self.pending.front() {
            Some(head) if head.state.is_terminal() => 1,
            _ => 0,
        };
        for statement in saved.into_iter().rev() {
            self.pending.insert(at, Statement::replay(statement));
        }
    }

    pub(crate) fn drop_segment(&mut self) {
        self.has_rollback_segment = false;
        self.saved.clear();
    }
}

/// Caller handle for a transaction. Cloning shares the same queue.
#[derive(Clone)]
pub struct Transaction {
    pub(crate) object: Arc<ObjectShared>,
    pub(crate) id: TransactionId,
    pub(crate) options: TransactionOptions,
}

impl Transaction {
    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn is_read_only(&self) -> bool {
        self.options.read_only
    }

    pub fn is_synchronous(&self) -> bool {
        self.options.synchronous
    }

    /// Queues a statement. The callback fires once with the result, unless
    /// the statement is cancelled first.
    pub fn execute_sql(
        &self,
        sql: impl Into<String>,
        params: Vec<SqlValue>,
        options: StatementOptions,
        callback: StatementCallback,
    ) -> Result<StatementHandle> {
        self.object.enqueue(
            self.id,
            sql.into(),
            params,
            options,
            Source::User,
            CallbackSlot::Real(callback),
        )
    }

    pub fn begin(&self, callback: Option<StatementCallback>) -> Result<StatementHandle> {
        if self.options.synchronous || self.options.read_only {
            return Err(StorageError::NotSupported(
                "explicit transactions need an asynchronous read-write transaction".into(),
            ));
        }
        self.control(TransactionOp::Begin, callback)
    }

    pub fn commit(&self, callback: Option<StatementCallback>) -> Result<StatementHandle> {
        self.control(TransactionOp::Commit, callback)
    }

    pub fn rollback(&self, callback: Option<StatementCallback>) -> Result<StatementHandle> {
        self.control(TransactionOp::Rollback, callback)
    }

    fn control(
        &self,
        op: TransactionOp,
        callback: Option<StatementCallback>,
    ) -> Result<StatementHandle> {
        let slot = match callback {
            Some(callback) => CallbackSlot::Real(callback),
            None => CallbackSlot::Discarded,
        };
        self.object.enqueue(
            self.id,
            op_sql(op).to_string(),
            Vec::new(),
            StatementOptions::default(),
            Source::Internal,
            slot,
        )
    }

    /// Runs a synchronous transaction until it has nothing left to do or
    /// has to wait.
    pub fn flush(&self) -> Result<DriveStep> {
        if !self.options.synchronous {
            return Err(StorageError::NotSupported(
                "only synchronous transactions are flushed".into(),
            ));
        }
        Ok(self.object.flush_transaction(self.id))
    }

    /// Discards the callbacks of every queued statement.
    pub fn cancel_all(&self) -> usize {
        self.object.cancel_transaction(self.id)
    }

    /// The transaction closes once its queue drains. Further statements are
    /// refused.
    pub fn release(&self) {
        self.object.release_transaction(self.id);
    }

    pub fn has_rollback_segment(&self) -> bool {
        self.object
            .with_transaction(self.id, |tx| tx.has_rollback_segment)
            .unwrap_or(false)
    }

    /// Statements queued and not yet cleaned up.
    pub fn pending_count(&self) -> usize {
        self.object
            .with_transaction(self.id, |tx| tx.pending.len())
            .unwrap_or(0)
    }

    pub fn is_closed(&self) -> bool {
        self.object.with_transaction(self.id, |_| ()).is_none()
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("entry", &self.object.entry)
            .field("options", &self.options)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn saved(id: u64, sql: &str) -> SavedStatement {
        SavedStatement {
            id,
            sql: sql.into(),
            params: Vec::new(),
            options: StatementOptions::default(),
            source: Source::User,
        }
    }

    fn queued(id: u64) -> Statement {
        Statement::new(
            id,
            "PUT x 1".into(),
            Vec::new(),
            StatementOptions::default(),
            Source::User,
            CallbackSlot::Discarded,
        )
    }

    #[test]
    fn test_replay_goes_before_unexecuted_statements() {
        let mut tx = TxState::new(TransactionId(1), TransactionOptions::default());
        tx.has_rollback_segment = true;
        tx.saved = vec![saved(1, "BEGIN"), saved(2, "PUT a 1")];
        tx.pending.push_back(queued(3));

        tx.start_replay();
        let order: Vec<u64> = tx.pending.iter().map(|s| s.id).collect();
        assert_eq!(order, vec![1, 2, 3]);
        assert!(tx.pending[0].is_replay());
        assert!(!tx.has_rollback_segment);
        assert!(tx.saved.is_empty());
    }

    #[test]
    fn test_replay_goes_after_a_finished_head() {
        let mut tx = TxState::new(TransactionId(1), TransactionOptions::default());
        let mut head = queued(5);
        head.set_state(crate::StatementState::AfterExecution);
        tx.pending.push_back(head);
        tx.saved = vec![saved(1, "BEGIN")];

        tx.start_replay();
        let order: Vec<u64> = tx.pending.iter().map(|s| s.id).collect();
        assert_eq!(order, vec![5, 1]);
    }

    #[test]
    fn test_options_builders() {
        let options = TransactionOptions::default()
            .read_only()
            .expecting_version("1.0");
        assert!(options.read_only);
        assert!(!options.synchronous);
        assert_eq!(options.expected_version.as_deref(), Some("1.0"));
        assert_eq!(TransactionId(4).to_string(), "tx#4");
    }
}
