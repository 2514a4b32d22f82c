//! Storage objects
//!
//! A storage object owns the transactions opened on one index entry and
//! drives them: one statement step per drive, round-robin across the
//! asynchronous transactions, then it posts itself back to the scheduler.
//! Callbacks, prompts and events collected while the object is locked are
//! delivered after it is unlocked, so callers may re-enter from any of
//! them.

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use webstore_index::{EntryId, Identity, QuotaStatus};
use webstore_policy::{Attribute, AttributeValue, ExceededHandling, PolicyScope, Quota};
use webstore_sql::SqlValue;

use crate::env::EnvInner;
use crate::events::{EventFeed, ObjectEvent};
use crate::link::EngineLink;
use crate::quota::{LowResourceKind, QuotaPrompt, QuotaReply, QuotaRequest, QuotaResponder};
use crate::scheduler::TaskId;
use crate::statement::{
    CallbackSlot, Source, Statement, StatementCallback, StatementHandle, StatementOptions,
    StatementResult, StatementState,
};
use crate::transaction::{Transaction, TransactionId, TransactionOptions, TxState};
use crate::{Result, StorageError};

/// What a drive accomplished, and when the object wants to run again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveStep {
    /// More work is ready now.
    Continue,
    /// A statement is backing off; run again after the delay.
    Yield(Duration),
    /// Everything left waits on the caller or the user.
    Suspended,
    /// No queued work.
    Done,
}

/// Result of stepping one transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TxStep {
    Progress,
    Yield(Duration),
    Blocked,
    Idle,
}

/// Side effects collected under the object lock and run after it is
/// released.
#[derive(Default)]
pub(crate) struct Deferred {
    pub callbacks: Vec<(StatementCallback, StatementResult)>,
    pub garbage: Vec<Statement>,
    pub results: Vec<StatementResult>,
    pub discarded: Vec<StatementCallback>,
    pub prompts: Vec<(TransactionId, Arc<dyn QuotaPrompt>, QuotaRequest, QuotaResponder)>,
    pub prompt_cancels: Vec<u64>,
    pub low_resource: Vec<LowResourceKind>,
    pub events: Vec<ObjectEvent>,
    pub links: Vec<Arc<EngineLink>>,
}

pub(crate) struct ObjectInner {
    pub transactions: Vec<TxState>,
    pub last_run: Option<TransactionId>,
    /// Memory-only objects keep their data in one connection shared by
    /// every transaction.
    pub memory_link: Option<Arc<EngineLink>>,
    /// Set once corruption recovery gave up.
    pub inaccessible: bool,
    pub closed: bool,
}

impl ObjectInner {
    pub(crate) fn segment_held_by_other(&self, tx_id: TransactionId) -> bool {
        self.transactions
            .iter()
            .any(|tx| tx.id != tx_id && tx.has_rollback_segment)
    }
}

#[derive(Default)]
struct PostState {
    task: Option<TaskId>,
    due: Duration,
}

pub(crate) struct ObjectShared {
    pub(crate) env: Arc<EnvInner>,
    pub(crate) entry: EntryId,
    pub(crate) identity: Identity,
    pub(crate) inner: Mutex<ObjectInner>,
    post: Mutex<PostState>,
    pub(crate) events: EventFeed,
    users: AtomicU32,
    pub(crate) weak_self: Weak<ObjectShared>,
}

impl ObjectShared {
    pub(crate) fn new(
        env: Arc<EnvInner>,
        entry: EntryId,
        identity: Identity,
        weak_self: Weak<ObjectShared>,
    ) -> Self {
        Self {
            env,
            entry,
            identity,
            inner: Mutex::new(ObjectInner {
                transactions: Vec::new(),
                last_run: None,
                memory_link: None,
                inaccessible: false,
                closed: false,
            }),
            post: Mutex::new(PostState::default()),
            events: EventFeed::default(),
            users: AtomicU32::new(1),
            weak_self,
        }
    }

    pub(crate) fn add_user(&self) {
        self.users.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub(crate) fn origin_scope(&self) -> PolicyScope {
        PolicyScope::origin(
            self.identity.context,
            self.identity.class,
            self.identity.origin.clone(),
        )
    }

    // === Queue management ===

    pub(crate) fn enqueue(
        &self,
        tx_id: TransactionId,
        sql: String,
        params: Vec<SqlValue>,
        options: StatementOptions,
        source: Source,
        callback: CallbackSlot,
    ) -> Result<StatementHandle> {
        let id = self.env.next_id();
        let synchronous = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(StorageError::NoAccess("storage object is closed".into()));
            }
            let tx = inner
                .transactions
                .iter_mut()
                .find(|tx| tx.id == tx_id)
                .ok_or_else(|| StorageError::NotSupported(format!("{tx_id} is closed")))?;
            if tx.released {
                return Err(StorageError::NotSupported(format!("{tx_id} was released")));
            }
            tx.pending
                .push_back(Statement::new(id, sql, params, options, source, callback));
            tx.options.synchronous
        };
        if !synchronous {
            self.schedule(Duration::ZERO);
        }
        Ok(StatementHandle {
            object: self.weak_self.clone(),
            transaction: tx_id,
            id,
        })
    }

    pub(crate) fn with_transaction<T>(
        &self,
        tx_id: TransactionId,
        f: impl FnOnce(&TxState) -> T,
    ) -> Option<T> {
        let inner = self.inner.lock();
        inner.transactions.iter().find(|tx| tx.id == tx_id).map(f)
    }

    /// Discards the callback of one statement and any replay copy of it.
    pub(crate) fn cancel_statement(&self, tx_id: TransactionId, statement_id: u64) -> bool {
        let mut deferred = Deferred::default();
        let (discarded, synchronous) = {
            let mut inner = self.inner.lock();
            let Some(tx) = inner.transactions.iter_mut().find(|tx| tx.id == tx_id) else {
                return false;
            };
            tx.saved.retain(|saved| saved.id != statement_id);
            let mut discarded = false;
            let waiting_head = tx.quota_wait.is_some();
            for (position, statement) in tx.pending.iter_mut().enumerate() {
                if statement.id != statement_id || statement.state.is_terminal() {
                    continue;
                }
                if position == 0 && waiting_head {
                    if let Some(wait) = tx.quota_wait.take() {
                        deferred.prompt_cancels.push(wait.request_id);
                    }
                }
                if let CallbackSlot::Real(callback) = statement.take_callback() {
                    deferred.discarded.push(callback);
                    discarded = true;
                }
                statement.set_state(StatementState::Cancelled);
            }
            (discarded, tx.options.synchronous)
        };
        self.run_deferred(deferred);
        if discarded {
            tracing::debug!(transaction = %tx_id, statement = statement_id, "Statement cancelled");
            if !synchronous {
                self.schedule(Duration::ZERO);
            }
        }
        discarded
    }

    pub(crate) fn cancel_transaction(&self, tx_id: TransactionId) -> usize {
        let mut deferred = Deferred::default();
        let cancelled = {
            let mut inner = self.inner.lock();
            match inner.transactions.iter_mut().find(|tx| tx.id == tx_id) {
                Some(tx) => cancel_queue(tx, &mut deferred),
                None => 0,
            }
        };
        self.run_deferred(deferred);
        if cancelled > 0 {
            self.schedule(Duration::ZERO);
        }
        cancelled
    }

    pub(crate) fn cancel_all(&self) -> usize {
        let mut deferred = Deferred::default();
        let cancelled = {
            let mut inner = self.inner.lock();
            inner
                .transactions
                .iter_mut()
                .map(|tx| cancel_queue(tx, &mut deferred))
                .sum()
        };
        self.run_deferred(deferred);
        if cancelled > 0 {
            self.schedule(Duration::ZERO);
        }
        cancelled
    }

    pub(crate) fn release_transaction(&self, tx_id: TransactionId) {
        let mut deferred = Deferred::default();
        let reschedule = {
            let mut inner = self.inner.lock();
            let Some(index) = inner.transactions.iter().position(|tx| tx.id == tx_id) else {
                return;
            };
            let tx = &mut inner.transactions[index];
            tx.released = true;
            if tx.pending.is_empty() {
                self.close_transaction(&mut inner, index, &mut deferred);
                false
            } else {
                !tx.options.synchronous
            }
        };
        self.run_deferred(deferred);
        if reschedule {
            self.schedule(Duration::ZERO);
        }
    }

    /// Steps a synchronous transaction until it finishes, yields or blocks.
    /// Its statements stay queued while another transaction holds the
    /// rollback segment. Size probes are exempt.
    pub(crate) fn flush_transaction(&self, tx_id: TransactionId) -> DriveStep {
        loop {
            let mut deferred = Deferred::default();
            let step = {
                let mut inner = self.inner.lock();
                match inner.transactions.iter().position(|tx| tx.id == tx_id) {
                    Some(index)
                        if inner.transactions[index]
                            .pending
                            .front()
                            .is_some_and(|head| head.source != Source::Probe)
                            && inner.segment_held_by_other(tx_id) =>
                    {
                        tracing::debug!(transaction = %tx_id, "Waiting for the rollback segment");
                        TxStep::Blocked
                    }
                    Some(index) => self.step_transaction(&mut inner, index, &mut deferred),
                    None => TxStep::Idle,
                }
            };
            let prompted = !deferred.prompts.is_empty();
            self.run_deferred(deferred);
            match step {
                TxStep::Progress => continue,
                TxStep::Yield(delay) => return DriveStep::Yield(delay),
                TxStep::Idle => return DriveStep::Done,
                TxStep::Blocked => {
                    if prompted && !self.waiting_on_quota(&[tx_id]) {
                        continue;
                    }
                    return DriveStep::Suspended;
                }
            }
        }
    }

    fn waiting_on_quota(&self, ids: &[TransactionId]) -> bool {
        self.inner
            .lock()
            .transactions
            .iter()
            .any(|tx| ids.contains(&tx.id) && tx.quota_wait.is_some())
    }

    // === Driving ===

    pub(crate) fn drive(&self) -> DriveStep {
        let mut deferred = Deferred::default();
        let step = {
            let mut inner = self.inner.lock();
            self.drive_locked(&mut inner, &mut deferred)
        };
        let prompted: Vec<TransactionId> =
            deferred.prompts.iter().map(|(tx_id, ..)| *tx_id).collect();
        self.run_deferred(deferred);
        // A prompt may answer before returning.
        if step == DriveStep::Suspended && !prompted.is_empty() && !self.waiting_on_quota(&prompted)
        {
            return DriveStep::Continue;
        }
        step
    }

    /// Posts a drive after `delay`, unless one is already due no later.
    pub(crate) fn schedule(&self, delay: Duration) {
        let scheduler = &self.env.scheduler;
        let delay = delay.min(self.env.config.max_schedule_delay());
        let due = scheduler.now() + delay;
        let mut post = self.post.lock();
        if let Some(task) = post.task {
            if post.due <= due {
                return;
            }
            scheduler.cancel_posted(task);
        }
        let object = self.weak_self.clone();
        let task = scheduler.post(
            Box::new(move || {
                if let Some(object) = object.upgrade() {
                    object.run_posted();
                }
            }),
            delay,
        );
        post.task = Some(task);
        post.due = due;
    }

    fn run_posted(&self) {
        self.post.lock().task = None;
        match self.drive() {
            DriveStep::Continue => self.schedule(Duration::ZERO),
            DriveStep::Yield(delay) => self.schedule(delay),
            DriveStep::Suspended | DriveStep::Done => {}
        }
    }

    fn cancel_post(&self) {
        if let Some(task) = self.post.lock().task.take() {
            self.env.scheduler.cancel_posted(task);
        }
    }

    pub(crate) fn run_deferred(&self, deferred: Deferred) {
        let Deferred {
            callbacks,
            garbage,
            results,
            discarded,
            prompts,
            prompt_cancels,
            low_resource,
            events,
            links,
        } = deferred;

        // Result sets may still hold cursors; they finalize on drop.
        drop(garbage);
        drop(results);
        drop(discarded);
        for link in links {
            if let Ok(link) = Arc::try_unwrap(link) {
                link.close();
            }
        }
        for event in events {
            self.events.emit(event);
        }
        for (callback, result) in callbacks {
            callback(result);
        }
        if !prompt_cancels.is_empty() {
            if let Some(prompt) = self.env.prompt() {
                for request_id in prompt_cancels {
                    prompt.cancel(request_id);
                }
            }
        }
        for (_, prompt, request, responder) in prompts {
            prompt.request_quota_increase(request, responder);
        }
        if !low_resource.is_empty() {
            let handler = self.env.low_resource();
            for kind in low_resource {
                handler.raise(kind);
            }
        }
    }

    // === Quota prompt replies ===

    pub(crate) fn on_quota_reply(
        &self,
        tx_id: TransactionId,
        request_id: u64,
        reply: Option<QuotaReply>,
    ) {
        let mut deferred = Deferred::default();
        {
            let mut inner = self.inner.lock();
            let Some(index) = inner.transactions.iter().position(|tx| {
                tx.id == tx_id
                    && tx
                        .quota_wait
                        .as_ref()
                        .is_some_and(|wait| wait.request_id == request_id)
            }) else {
                tracing::debug!(request = request_id, "Ignoring stale quota reply");
                return;
            };
            inner.transactions[index].quota_wait = None;

            let applied = match reply {
                Some(reply) => self.apply_quota_reply(reply),
                None => {
                    self.fail_head(&mut inner, index, StorageError::QuotaExceeded, &mut deferred);
                    Ok(())
                }
            };
            if let Err(e) = applied {
                tracing::warn!(error = %e, "Failed to store quota reply");
            }
            if let Err(e) = self
                .env
                .index
                .set_quota_status(self.entry, QuotaStatus::UserReplied)
            {
                tracing::debug!(error = %e, "Entry gone before quota reply");
            }
            tracing::info!(
                origin = %self.identity.origin,
                reply = ?reply,
                "Quota prompt answered"
            );
        }
        self.run_deferred(deferred);
        self.schedule(self.env.config.quota_reply_delay());
    }

    fn apply_quota_reply(&self, reply: QuotaReply) -> Result<()> {
        let policy = &self.env.policy;
        let scope = self.origin_scope();
        match reply {
            QuotaReply::AllowUnbounded => policy.set_attribute(
                Attribute::ExceededHandling,
                &scope,
                AttributeValue::Handling(ExceededHandling::Allow),
            )?,
            QuotaReply::AllowUpTo(bytes) => {
                let quota = Quota::Bytes(bytes);
                policy.set_attribute(Attribute::OriginQuota, &scope, AttributeValue::Quota(quota))?;
                let class_scope = PolicyScope::class(self.identity.context, self.identity.class);
                let global = policy.global_quota(&class_scope);
                if global.bytes().is_some_and(|limit| limit < bytes) {
                    policy.set_attribute(
                        Attribute::GlobalQuota,
                        &class_scope,
                        AttributeValue::Quota(quota),
                    )?;
                }
            }
            QuotaReply::Deny { new_quota } => {
                policy.set_attribute(
                    Attribute::ExceededHandling,
                    &scope,
                    AttributeValue::Handling(ExceededHandling::Deny),
                )?;
                if let Some(bytes) = new_quota {
                    policy.set_attribute(
                        Attribute::OriginQuota,
                        &scope,
                        AttributeValue::Quota(Quota::Bytes(bytes)),
                    )?;
                }
            }
        }
        Ok(())
    }

    // === Shutdown ===

    /// Closes a transaction, rolling back its open segment. The caller
    /// holds the object lock.
    pub(crate) fn close_transaction(
        &self,
        inner: &mut ObjectInner,
        index: usize,
        deferred: &mut Deferred,
    ) {
        let mut tx = inner.transactions.remove(index);
        cancel_queue(&mut tx, deferred);
        if let Some(link) = tx.link.take() {
            {
                let mut conn = link.conn().lock();
                for statement in tx.pending.iter_mut() {
                    release_engine_state(conn.as_mut(), statement);
                }
            }
            if tx.has_rollback_segment {
                if let Err(e) = link.run_direct("ROLLBACK") {
                    tracing::warn!(transaction = %tx.id, error = %e, "Rollback on close failed");
                }
            }
            deferred.links.push(link);
        }
        deferred.garbage.extend(tx.pending.drain(..));
        deferred.events.push(ObjectEvent::TransactionClosed(tx.id));
        tracing::debug!(transaction = %tx.id, "Transaction closed");
    }

    /// Cancels all work, closes every transaction and hands the entry back
    /// to the index.
    pub(crate) fn shutdown(&self) {
        let mut deferred = Deferred::default();
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return;
            }
            inner.closed = true;
            self.events.emit(ObjectEvent::Closing(self.entry));
            while !inner.transactions.is_empty() {
                self.close_transaction(&mut inner, 0, &mut deferred);
            }
            if let Some(link) = inner.memory_link.take() {
                deferred.links.push(link);
            }
        }
        self.cancel_post();
        self.run_deferred(deferred);

        let index = &self.env.index;
        for _ in 0..self.users.swap(0, Ordering::AcqRel) {
            if let Err(e) = index.release(self.entry) {
                tracing::debug!(entry = %self.entry, error = %e, "Entry already gone");
            }
        }
        match index.object_shutdown(self.entry, false) {
            Ok(removed) => tracing::debug!(entry = %self.entry, removed, "Storage object closed"),
            Err(e) => tracing::debug!(entry = %self.entry, error = %e, "Entry already gone"),
        }
        self.env.forget_object(self.entry, &self.weak_self);
        self.events.emit(ObjectEvent::Closed(self.entry));
        self.events.close();
    }

    /// Drops one user. The last one closes the object.
    pub(crate) fn release_user(&self) {
        let previous = self
            .users
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |users| {
                users.checked_sub(1)
            });
        let Ok(previous) = previous else {
            return;
        };
        if let Err(e) = self.env.index.release(self.entry) {
            tracing::debug!(entry = %self.entry, error = %e, "Entry already gone");
        }
        if previous == 1 {
            self.shutdown();
        }
    }
}

impl Drop for ObjectShared {
    fn drop(&mut self) {
        if !self.inner.get_mut().closed {
            self.shutdown();
        }
    }
}

/// Discards every callback still queued on `tx` and marks the statements
/// cancelled. Returns how many callbacks were discarded.
pub(crate) fn cancel_queue(tx: &mut TxState, deferred: &mut Deferred) -> usize {
    if let Some(wait) = tx.quota_wait.take() {
        deferred.prompt_cancels.push(wait.request_id);
    }
    tx.saved.clear();
    let mut cancelled = 0;
    for statement in tx.pending.iter_mut() {
        if statement.state.is_terminal() {
            continue;
        }
        if let CallbackSlot::Real(callback) = statement.take_callback() {
            deferred.discarded.push(callback);
            cancelled += 1;
        }
        statement.set_state(StatementState::Cancelled);
    }
    cancelled
}

/// Finalizes whatever engine state a statement holds on `conn`.
pub(crate) fn release_engine_state(
    conn: &mut dyn webstore_sql::Connection,
    statement: &mut Statement,
) {
    if let Some(stmt) = statement.stmt.take() {
        if let Err(e) = conn.finalize(stmt) {
            tracing::debug!(statement = statement.id, error = %e, "Finalize failed");
        }
    }
    if let Some(mut result) = statement.result.take() {
        result.close_on(conn);
    }
}

/// Caller handle for a storage object.
#[derive(Clone)]
pub struct StorageObject {
    pub(crate) shared: Arc<ObjectShared>,
}

impl StorageObject {
    pub fn entry_id(&self) -> EntryId {
        self.shared.entry
    }

    pub fn identity(&self) -> &Identity {
        &self.shared.identity
    }

    pub fn is_persistent(&self) -> bool {
        self.shared.identity.persistent
    }

    pub fn transaction(&self, options: TransactionOptions) -> Result<Transaction> {
        let id = TransactionId(self.shared.env.next_id());
        {
            let mut inner = self.shared.inner.lock();
            if inner.closed {
                return Err(StorageError::NoAccess("storage object is closed".into()));
            }
            inner.transactions.push(TxState::new(id, options.clone()));
        }
        self.shared.events.emit(ObjectEvent::TransactionCreated(id));
        tracing::debug!(entry = %self.shared.entry, transaction = %id, "Transaction created");
        Ok(Transaction {
            object: Arc::clone(&self.shared),
            id,
            options,
        })
    }

    /// Runs one scheduling round right now.
    pub fn drive(&self) -> DriveStep {
        self.shared.drive()
    }

    /// Asks the scheduler to drive the object after `delay`.
    pub fn schedule(&self, delay: Duration) {
        self.shared.schedule(delay);
    }

    pub fn transaction_count(&self) -> usize {
        self.shared.inner.lock().transactions.len()
    }

    /// Discards the callbacks of every queued statement in every
    /// transaction.
    pub fn cancel_all_statements(&self) -> usize {
        self.shared.cancel_all()
    }

    pub fn version(&self) -> Option<String> {
        self.shared
            .env
            .index
            .entry(self.shared.entry)
            .and_then(|entry| entry.version().map(str::to_string))
    }

    pub fn set_version(&self, version: Option<String>) -> Result<()> {
        self.shared
            .env
            .index
            .set_version(self.shared.entry, version)
            .map_err(StorageError::from)
    }

    /// Bytes the object's data file uses, as last measured.
    pub fn data_size(&self) -> Result<u64> {
        self.shared
            .env
            .index
            .data_file_size(self.shared.entry)
            .map_err(StorageError::from)
    }

    pub fn subscribe(&self) -> crossbeam::channel::Receiver<ObjectEvent> {
        self.shared.events.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Gives up this user's hold. The last user closes the object.
    pub fn release(self) {
        self.shared.release_user();
    }

    /// Closes the object now, whoever else still uses it. Queued callbacks
    /// are discarded.
    pub fn close(&self) {
        self.shared.shutdown();
    }
}

impl fmt::Debug for StorageObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageObject")
            .field("entry", &self.shared.entry)
            .field("identity", &self.shared.identity)
            .finish()
    }
}
