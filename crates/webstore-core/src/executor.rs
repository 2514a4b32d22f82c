//! Statement execution
//!
//! Each call advances the head statement of one transaction by one state.
//! Engine errors are sorted here: busy conditions back off, interrupts
//! resume, a full disk goes through the quota rules, corruption deletes
//! and recreates the data file, and an engine abort inside an explicit
//! transaction replays everything the transaction ran since BEGIN.

use std::sync::Arc;
use std::time::Duration;
use webstore_index::QuotaStatus;
use webstore_policy::ExceededHandling;
use webstore_sql::{
    Connection, Cursor, CursorClosed, EngineError, ErrorCode, Fetch, ResultSet, SqlError, SqlValue,
    StepResult, StmtHandle,
};

use crate::config::PromptFallback;
use crate::link::EngineLink;
use crate::object::{release_engine_state, Deferred, DriveStep, ObjectInner, ObjectShared, TxStep};
use crate::quota::{QuotaRequest, QuotaResponder};
use crate::statement::{CallbackSlot, CursorWatch, Source, StatementState};
use crate::transaction::QuotaWait;
use crate::{Result, StorageError};

impl ObjectShared {
    /// One scheduling round. A transaction holding the rollback segment runs
    /// alone; otherwise transactions take turns starting after the one that
    /// ran last.
    pub(crate) fn drive_locked(
        &self,
        inner: &mut ObjectInner,
        deferred: &mut Deferred,
    ) -> DriveStep {
        if inner.closed {
            return DriveStep::Done;
        }
        let asynchronous: Vec<usize> = (0..inner.transactions.len())
            .filter(|&i| !inner.transactions[i].options.synchronous)
            .collect();
        let order = match asynchronous
            .iter()
            .copied()
            .find(|&i| inner.transactions[i].has_rollback_segment)
        {
            Some(holder) => vec![holder],
            None => {
                let start = inner
                    .last_run
                    .and_then(|last| {
                        asynchronous
                            .iter()
                            .position(|&i| inner.transactions[i].id == last)
                    })
                    .map_or(0, |p| p + 1);
                let len = asynchronous.len();
                let mut order = asynchronous.clone();
                order.rotate_left(start.min(len));
                order
            }
        };

        let mut blocked = false;
        for index in order {
            let id = inner.transactions[index].id;
            match self.step_transaction(inner, index, deferred) {
                TxStep::Idle => {}
                TxStep::Blocked => blocked = true,
                TxStep::Progress => {
                    inner.last_run = Some(id);
                    return DriveStep::Continue;
                }
                TxStep::Yield(delay) => {
                    inner.last_run = Some(id);
                    return DriveStep::Yield(delay);
                }
            }
        }
        if blocked {
            DriveStep::Suspended
        } else {
            DriveStep::Done
        }
    }

    pub(crate) fn step_transaction(
        &self,
        inner: &mut ObjectInner,
        index: usize,
        deferred: &mut Deferred,
    ) -> TxStep {
        let tx = &mut inner.transactions[index];
        if tx.quota_wait.is_some() {
            return TxStep::Blocked;
        }
        let Some(head) = tx.pending.front() else {
            if tx.released {
                self.close_transaction(inner, index, deferred);
                return TxStep::Progress;
            }
            return TxStep::Idle;
        };
        let state = head.state;
        match state {
            StatementState::Cancelled => {
                if let Some(mut head) = tx.pending.pop_front() {
                    if let Some(link) = tx.link.clone() {
                        release_engine_state(link.conn().lock().as_mut(), &mut head);
                    }
                    deferred.garbage.push(head);
                }
                TxStep::Progress
            }
            StatementState::BeforeExecution => self.before_execution(inner, index, deferred),
            StatementState::DuringExecution => self.during_execution(inner, index, deferred),
            StatementState::DuringStepping => self.during_stepping(inner, index, deferred),
            StatementState::AfterExecution => self.after_execution(inner, index, deferred),
        }
    }

    // === BeforeExecution ===

    fn before_execution(&self, inner: &mut ObjectInner, index: usize, deferred: &mut Deferred) -> TxStep {
        if inner.inaccessible {
            return self.fail_head(
                inner,
                index,
                StorageError::NoAccess("storage object is no longer accessible".into()),
                deferred,
            );
        }
        let tx = &inner.transactions[index];
        let Some(head) = tx.pending.front() else {
            return TxStep::Idle;
        };
        let probe = head.source == Source::Probe;
        if !probe && head.sql.trim().is_empty() {
            return self.fail_head(inner, index, StorageError::BadQuery("empty statement".into()), deferred);
        }
        if let Some(expected) = tx.options.expected_version.clone() {
            let actual = self
                .env
                .index
                .entry(self.entry)
                .and_then(|entry| entry.version().map(str::to_string));
            if actual.as_deref().unwrap_or("") != expected {
                return self.fail_head(
                    inner,
                    index,
                    StorageError::VersionMismatch { expected, actual },
                    deferred,
                );
            }
        }

        let link = match self.attach(inner, index) {
            Ok(link) => link,
            Err(StorageError::Corrupted) => return self.recover_corruption(inner, index, deferred),
            Err(e) => return self.fail_head(inner, index, e, deferred),
        };
        let limit = self.available_quota().and_then(|limit| link.set_size_limit(limit));
        if let Err(e) = limit {
            return self.fail_head(inner, index, e, deferred);
        }

        if probe {
            self.record_size(&link);
            return self.complete_head(inner, index, Ok(None), deferred);
        }

        let now = self.env.scheduler.now();
        let budget = self.env.policy.query_timeout(&self.origin_scope());
        let read_only = inner.transactions[index].options.read_only;
        let synchronous = inner.transactions[index].options.synchronous;
        let Some(head) = inner.transactions[index].pending.front_mut() else {
            return TxStep::Idle;
        };
        head.started_at = now;
        head.budget = budget;

        link.begin_prepare(head.source == Source::User, read_only, synchronous);
        let prepared = link.conn().lock().prepare(&head.sql);
        let (kind, denied) = link.finish_prepare();
        let stmt = match prepared {
            Ok(stmt) => stmt,
            Err(e) => {
                if let Some(reason) = denied {
                    tracing::debug!(statement = head.id, reason = %reason, "Statement refused");
                    return self.fail_head(inner, index, StorageError::Authorization(reason), deferred);
                }
                return self.on_engine_error(inner, index, &link, e, false, deferred);
            }
        };
        head.kind = kind;
        head.stmt = Some(stmt);

        let bound = {
            let mut conn = link.conn().lock();
            bind_all(conn.as_mut(), stmt, &head.params)
        };
        if let Err(e) = bound {
            return self.fail_head(inner, index, e, deferred);
        }
        head.set_state(StatementState::DuringExecution);
        TxStep::Progress
    }

    /// Connection for a transaction, opening one on first use.
    fn attach(&self, inner: &mut ObjectInner, index: usize) -> Result<Arc<EngineLink>> {
        if let Some(link) = &inner.transactions[index].link {
            return Ok(Arc::clone(link));
        }
        let link = if self.identity.persistent {
            Arc::new(self.open_link()?)
        } else {
            match &inner.memory_link {
                Some(link) => Arc::clone(link),
                None => {
                    let link = Arc::new(self.open_link()?);
                    inner.memory_link = Some(Arc::clone(&link));
                    link
                }
            }
        };
        self.record_size(&link);
        tracing::debug!(
            entry = %self.entry,
            transaction = %inner.transactions[index].id,
            "Attached connection"
        );
        inner.transactions[index].link = Some(Arc::clone(&link));
        Ok(link)
    }

    fn open_link(&self) -> Result<EngineLink> {
        let file = self.env.index.ensure_data_file(self.entry)?;
        EngineLink::open(
            self.env.engine.as_ref(),
            file,
            Arc::clone(&self.env.scheduler),
            self.env.config.progress_period,
        )
    }

    /// Bytes the object may still grow to, `None` when nothing is enforced.
    fn available_quota(&self) -> Result<Option<u64>> {
        let policy = &self.env.policy;
        let index = &self.env.index;
        let identity = &self.identity;
        let scope = self.origin_scope();
        if policy.exceeded_handling(&scope) == ExceededHandling::Allow {
            return Ok(None);
        }
        let own = index.data_file_size(self.entry)?;
        let origin_quota = policy.origin_quota(&scope).bytes();
        if !identity.persistent {
            return Ok(origin_quota);
        }
        let origin_used = index.global_data_size(identity.context, identity.class, Some(&identity.origin))?;
        let global_used = index.global_data_size(identity.context, identity.class, None)?;
        let by_origin = origin_quota.map(|quota| quota.saturating_sub(origin_used.saturating_sub(own)));
        let by_global = policy
            .global_quota(&scope)
            .bytes()
            .map(|quota| quota.saturating_sub(global_used.saturating_sub(own)));
        Ok(match (by_origin, by_global) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        })
    }

    fn record_size(&self, link: &EngineLink) {
        match link.data_size() {
            Ok(size) => {
                if let Err(e) = self.env.index.set_data_file_size(self.entry, size) {
                    tracing::debug!(entry = %self.entry, error = %e, "Could not record size");
                }
            }
            Err(e) => tracing::debug!(entry = %self.entry, error = %e, "Could not measure data file"),
        }
    }

    // === DuringExecution ===

    fn during_execution(&self, inner: &mut ObjectInner, index: usize, deferred: &mut Deferred) -> TxStep {
        let tx = &mut inner.transactions[index];
        let Some(link) = tx.link.clone() else {
            return self.restart_head(inner, index);
        };
        let Some(head) = tx.pending.front_mut() else {
            return TxStep::Idle;
        };
        let Some(stmt) = head.stmt else {
            return self.restart_head(inner, index);
        };
        let deadline = head.budget.map(|budget| head.started_at + budget);
        if deadline.is_some_and(|deadline| self.env.scheduler.now() > deadline) {
            return self.fail_head(inner, index, StorageError::TimedOut, deferred);
        }

        link.enter(deadline);
        let stepped = link.conn().lock().step(stmt);
        let timed_out = link.leave();
        match stepped {
            Ok(StepResult::Row) => self.on_row(inner, index, &link, stmt, deferred),
            Ok(StepResult::Done) => self.on_done(inner, index, &link, stmt, deferred),
            Err(e) if e.code == ErrorCode::Interrupt => {
                if timed_out || !link.resumable() {
                    self.fail_head(inner, index, StorageError::TimedOut, deferred)
                } else {
                    TxStep::Progress
                }
            }
            Err(e) => self.on_engine_error(inner, index, &link, e, false, deferred),
        }
    }

    fn on_row(
        &self,
        inner: &mut ObjectInner,
        index: usize,
        link: &Arc<EngineLink>,
        stmt: StmtHandle,
        deferred: &mut Deferred,
    ) -> TxStep {
        let replay = inner.transactions[index]
            .pending
            .front()
            .is_some_and(|head| head.is_replay());
        if replay {
            // Rows of a replayed read are never looked at.
            return self.on_done(inner, index, link, stmt, deferred);
        }

        let fetched = {
            let conn = link.conn().lock();
            conn.column_names(stmt).and_then(|columns| Ok((columns, conn.row(stmt)?)))
        };
        let (columns, first) = match fetched {
            Ok(fetched) => fetched,
            Err(e) => return self.on_engine_error(inner, index, link, e, false, deferred),
        };

        let max_result = self.env.policy.max_result_set_size(&self.origin_scope()).bytes();
        let Some(head) = inner.transactions[index].pending.front_mut() else {
            return TxStep::Idle;
        };
        head.stmt = None;
        let cursor = Cursor::new(Arc::clone(link.conn()), stmt);

        if head.options.cache_rows {
            let mut result = ResultSet::rows(columns, Some(cursor), Some(first));
            if result.enable_caching(max_result).is_err() {
                head.result = Some(result);
                return self.fail_head(inner, index, StorageError::ResultSetTooBig, deferred);
            }
            head.result = Some(result);
            head.set_state(StatementState::DuringStepping);
            return TxStep::Progress;
        }

        let watch = Arc::new(CursorWatch::default());
        let hook_watch = Arc::clone(&watch);
        let object = self.weak_self.clone();
        let statement_id = head.id;
        let cursor = cursor.with_close_hook(Box::new(move |closed: CursorClosed| {
            if let Err(e) = &closed.finalize {
                tracing::debug!(statement = statement_id, error = %e, "Cursor finalize failed");
            }
            hook_watch.record(closed.autocommit);
            if let Some(object) = object.upgrade() {
                object.schedule(Duration::ZERO);
            }
        }));
        head.cursor = Some(watch);
        let result = ResultSet::rows(columns, Some(cursor), Some(first));
        self.complete_head(inner, index, Ok(Some(result)), deferred)
    }

    fn on_done(
        &self,
        inner: &mut ObjectInner,
        index: usize,
        link: &Arc<EngineLink>,
        stmt: StmtHandle,
        deferred: &mut Deferred,
    ) -> TxStep {
        let (columns, changes, rowid, finalized, autocommit) = {
            let mut conn = link.conn().lock();
            let columns = conn.column_names(stmt).unwrap_or_default();
            let changes = conn.changes();
            let rowid = conn.last_insert_rowid();
            let finalized = conn.finalize(stmt);
            (columns, changes, rowid, finalized, conn.is_autocommit())
        };
        let Some(head) = inner.transactions[index].pending.front_mut() else {
            return TxStep::Idle;
        };
        head.stmt = None;
        if let Err(e) = finalized {
            return self.fail_head(inner, index, StorageError::from_engine(&e), deferred);
        }
        let result = if head.kind.is_select || !columns.is_empty() {
            ResultSet::rows(columns, None, None)
        } else {
            ResultSet::dml(changes, rowid)
        };
        let step = self.complete_head(inner, index, Ok(Some(result)), deferred);
        self.after_finalize(inner, index, autocommit);
        step
    }

    // === DuringStepping ===

    fn during_stepping(&self, inner: &mut ObjectInner, index: usize, deferred: &mut Deferred) -> TxStep {
        let batch = self.env.config.stepping_batch.max(1);
        let tx = &mut inner.transactions[index];
        let Some(link) = tx.link.clone() else {
            return self.restart_head(inner, index);
        };
        let Some(head) = tx.pending.front_mut() else {
            return TxStep::Idle;
        };
        let deadline = head.budget.map(|budget| head.started_at + budget);
        if deadline.is_some_and(|deadline| self.env.scheduler.now() > deadline) {
            return self.fail_head(inner, index, StorageError::TimedOut, deferred);
        }
        let Some(result) = head.result.as_mut() else {
            return self.restart_head(inner, index);
        };

        link.enter(deadline);
        let fetched = result.fetch(link.conn().lock().as_mut(), batch);
        let timed_out = link.leave();
        match fetched {
            Ok(Fetch::More) => TxStep::Progress,
            Ok(Fetch::Closed(Ok(()))) => {
                let result = head.result.take();
                let autocommit = link.is_autocommit();
                let step = self.complete_head(inner, index, Ok(result), deferred);
                self.after_finalize(inner, index, autocommit);
                step
            }
            Ok(Fetch::Closed(Err(e))) => {
                self.fail_head(inner, index, StorageError::from_engine(&e), deferred)
            }
            Err(SqlError::TooBig { limit }) => {
                tracing::warn!(statement = head.id, limit, "Cached result set too big");
                self.fail_head(inner, index, StorageError::ResultSetTooBig, deferred)
            }
            Err(SqlError::Engine(e)) if e.code == ErrorCode::Interrupt => {
                if timed_out || !link.resumable() {
                    self.fail_head(inner, index, StorageError::TimedOut, deferred)
                } else {
                    TxStep::Progress
                }
            }
            Err(SqlError::Engine(e)) => self.on_engine_error(inner, index, &link, e, true, deferred),
            Err(e) => self.fail_head(inner, index, StorageError::Sql(e), deferred),
        }
    }

    // === AfterExecution ===

    fn after_execution(&self, inner: &mut ObjectInner, index: usize, deferred: &mut Deferred) -> TxStep {
        let tx = &mut inner.transactions[index];
        let Some(head) = tx.pending.front_mut() else {
            return TxStep::Idle;
        };
        if let Some(watch) = head.cursor.clone() {
            let Some(autocommit) = watch.outcome() else {
                return TxStep::Blocked;
            };
            head.cursor = None;
            self.after_finalize(inner, index, autocommit);
        }
        if let Some(done) = inner.transactions[index].pending.pop_front() {
            deferred.garbage.push(done);
        }
        TxStep::Progress
    }

    // === Outcomes ===

    /// Segment bookkeeping once the head statement's engine statement is
    /// finalized.
    fn after_finalize(&self, inner: &mut ObjectInner, index: usize, autocommit: bool) {
        let tx = &mut inner.transactions[index];
        let Some(head) = tx.pending.front() else {
            return;
        };
        let kind = head.kind.clone();
        if !autocommit {
            if !tx.has_rollback_segment {
                tracing::debug!(transaction = %tx.id, "Rollback segment opened");
            }
            tx.has_rollback_segment = true;
            // Reads leave nothing behind to replay.
            if !kind.is_select || kind.writes {
                let saved = head.saved();
                tx.saved.push(saved);
            }
        } else if tx.has_rollback_segment {
            if kind.ends_segment() {
                tracing::debug!(transaction = %tx.id, "Rollback segment closed");
                tx.drop_segment();
            } else {
                tx.start_replay();
            }
        }
        if kind.may_change_size() {
            if let Some(link) = tx.link.clone() {
                self.record_size(&link);
            }
        }
    }

    /// Moves the head to `AfterExecution` and queues its callback.
    pub(crate) fn complete_head(
        &self,
        inner: &mut ObjectInner,
        index: usize,
        outcome: crate::StatementResult,
        deferred: &mut Deferred,
    ) -> TxStep {
        let tx = &mut inner.transactions[index];
        let Some(head) = tx.pending.front_mut() else {
            return TxStep::Idle;
        };
        head.set_state(StatementState::AfterExecution);
        if let Err(e) = &outcome {
            if let Some(kind) = e.low_resource_kind() {
                deferred.low_resource.push(kind);
            }
        }
        match head.take_callback() {
            CallbackSlot::Real(callback) => deferred.callbacks.push((callback, outcome)),
            CallbackSlot::Replay => match outcome {
                Ok(result) => deferred.results.push(Ok(result)),
                Err(error) => {
                    tracing::warn!(statement = head.id, error = %error, "Replayed statement failed");
                    // The rest of the replay is useless; the next statement
                    // the caller queued hears about it instead.
                    let mut target = None;
                    for statement in tx.pending.iter_mut().skip(1) {
                        if statement.is_replay() {
                            statement.set_state(StatementState::Cancelled);
                            continue;
                        }
                        if statement.has_real_callback()
                            && statement.state == StatementState::BeforeExecution
                        {
                            target = Some(statement);
                            break;
                        }
                    }
                    match target {
                        Some(statement) => {
                            if let CallbackSlot::Real(callback) = statement.take_callback() {
                                deferred.callbacks.push((callback, Err(error)));
                            }
                            statement.set_state(StatementState::Cancelled);
                        }
                        None => deferred.results.push(Err(error)),
                    }
                    tx.drop_segment();
                    // The replayed BEGIN may still be open in the engine.
                    if let Some(link) = tx.link.clone() {
                        if !link.is_autocommit() {
                            if let Err(e) = link.run_direct("ROLLBACK") {
                                tracing::warn!(
                                    transaction = %tx.id,
                                    error = %e,
                                    "Rollback after failed replay failed"
                                );
                            }
                        }
                    }
                }
            },
            CallbackSlot::Discarded => deferred.results.push(outcome),
        }
        TxStep::Progress
    }

    /// Fails the head statement, releasing its engine state first.
    pub(crate) fn fail_head(
        &self,
        inner: &mut ObjectInner,
        index: usize,
        error: StorageError,
        deferred: &mut Deferred,
    ) -> TxStep {
        let tx = &mut inner.transactions[index];
        let mut autocommit = true;
        let mut ends_segment = false;
        if let Some(head) = tx.pending.front_mut() {
            ends_segment = head.kind.ends_segment();
            if let Some(link) = tx.link.clone() {
                let mut conn = link.conn().lock();
                release_engine_state(conn.as_mut(), head);
                autocommit = conn.is_autocommit();
            }
        }
        let recoverable = error.is_recoverable();
        let step = self.complete_head(inner, index, Err(error), deferred);

        let tx = &mut inner.transactions[index];
        if tx.has_rollback_segment && autocommit {
            if ends_segment || !recoverable {
                tx.drop_segment();
            } else {
                tx.start_replay();
            }
        }
        step
    }

    /// Puts the head back to `BeforeExecution` after its connection went
    /// away underneath it.
    fn restart_head(&self, inner: &mut ObjectInner, index: usize) -> TxStep {
        if let Some(head) = inner.transactions[index].pending.front_mut() {
            head.reset();
        }
        TxStep::Progress
    }

    fn on_engine_error(
        &self,
        inner: &mut ObjectInner,
        index: usize,
        link: &Arc<EngineLink>,
        error: EngineError,
        stepping: bool,
        deferred: &mut Deferred,
    ) -> TxStep {
        tracing::debug!(
            entry = %self.entry,
            code = %error.code.as_str(),
            message = %error.message,
            "Engine error"
        );
        if error.code.is_busy() {
            let limit = self.env.config.busy_retry_limit;
            let Some(head) = inner.transactions[index].pending.front_mut() else {
                return TxStep::Idle;
            };
            head.busy_retries += 1;
            if head.busy_retries > limit {
                tracing::warn!(statement = head.id, retries = limit, "Giving up on busy database");
                return self.fail_head(inner, index, StorageError::TimedOut, deferred);
            }
            return TxStep::Yield(self.env.config.yield_backoff(head.busy_retries - 1));
        }

        let tx = &mut inner.transactions[index];
        if error.code == ErrorCode::Abort && tx.has_rollback_segment && link.is_autocommit() {
            // The engine dropped the whole segment: run it again, then this
            // statement.
            if let Some(head) = tx.pending.front_mut() {
                release_engine_state(link.conn().lock().as_mut(), head);
                head.reset();
            }
            tx.start_replay();
            return TxStep::Progress;
        }

        match error.code {
            ErrorCode::Full => self.quota_exceeded(inner, index, link, deferred),
            ErrorCode::Corrupt | ErrorCode::NotADb => self.recover_corruption(inner, index, deferred),
            ErrorCode::NoMem if stepping => {
                self.fail_head(inner, index, StorageError::ResultSetTooBig, deferred)
            }
            _ => self.fail_head(inner, index, StorageError::from_engine(&error), deferred),
        }
    }

    // === Quota ===

    fn quota_exceeded(
        &self,
        inner: &mut ObjectInner,
        index: usize,
        link: &Arc<EngineLink>,
        deferred: &mut Deferred,
    ) -> TxStep {
        let scope = self.origin_scope();
        match self.env.policy.exceeded_handling(&scope) {
            ExceededHandling::Allow => {
                return self.fail_head(inner, index, StorageError::NoDisk, deferred);
            }
            ExceededHandling::Deny => {
                return self.fail_head(inner, index, StorageError::QuotaExceeded, deferred);
            }
            ExceededHandling::Ask => {}
        }

        let Some(head) = inner.transactions[index].pending.front() else {
            return TxStep::Idle;
        };
        let target = head.options.prompt_target;
        let domain = self
            .env
            .index
            .entry(self.entry)
            .and_then(|entry| entry.domain().map(str::to_string));
        let prompt = self.env.prompt();
        let (Some(prompt), Some(domain)) = (prompt, domain) else {
            tracing::warn!(origin = %self.identity.origin, "Quota exceeded and nobody to ask");
            return self.fail_head(inner, index, StorageError::QuotaExceeded, deferred);
        };
        if target.is_none() && self.env.config.ask_without_prompt_target == PromptFallback::Deny {
            tracing::warn!(origin = %self.identity.origin, "Quota exceeded outside any window");
            return self.fail_head(inner, index, StorageError::QuotaExceeded, deferred);
        }

        let current_quota = self.env.policy.origin_quota(&scope);
        let current_size = if self.identity.persistent {
            self.env
                .index
                .global_data_size(self.identity.context, self.identity.class, Some(&self.identity.origin))
                .unwrap_or(0)
        } else {
            self.env.index.data_file_size(self.entry).unwrap_or(0)
        };
        let request_id = self.env.next_id();
        let tx = &mut inner.transactions[index];
        let tx_id = tx.id;
        let Some(head) = tx.pending.front_mut() else {
            return TxStep::Idle;
        };
        let wanted = head
            .options
            .preferred_size
            .unwrap_or_else(|| current_quota.bytes().unwrap_or(current_size).max(1));
        let request = QuotaRequest {
            id: request_id,
            display_name: head
                .options
                .display_name
                .clone()
                .or_else(|| self.identity.name.clone())
                .unwrap_or_else(|| self.identity.origin.clone()),
            domain,
            origin: self.identity.origin.clone(),
            class: self.identity.class,
            current_quota,
            current_size,
            desired_size: current_size.saturating_add(wanted),
            target,
        };

        let autocommit = {
            let mut conn = link.conn().lock();
            release_engine_state(conn.as_mut(), head);
            conn.is_autocommit()
        };
        head.reset();
        let statement_id = head.id;
        if tx.has_rollback_segment && autocommit {
            tx.start_replay();
        }
        tx.quota_wait = Some(QuotaWait { request_id });
        if let Err(e) = self.env.index.set_quota_status(self.entry, QuotaStatus::WaitingForUser) {
            tracing::debug!(entry = %self.entry, error = %e, "Could not mark quota status");
        }

        let object = self.weak_self.clone();
        let responder = QuotaResponder::new(
            request_id,
            Box::new(move |reply| {
                if let Some(object) = object.upgrade() {
                    object.on_quota_reply(tx_id, request_id, reply);
                }
            }),
        );
        tracing::info!(
            origin = %self.identity.origin,
            statement = statement_id,
            desired = request.desired_size,
            "Asking for more quota"
        );
        deferred.prompts.push((tx_id, prompt, request, responder));
        TxStep::Blocked
    }

    // === Corruption ===

    fn recover_corruption(&self, inner: &mut ObjectInner, index: usize, deferred: &mut Deferred) -> TxStep {
        let attempts = self.env.config.corruption_recovery_attempts;
        let Some(head) = inner.transactions[index].pending.front_mut() else {
            return TxStep::Idle;
        };
        head.recoveries += 1;
        let recoveries = head.recoveries;

        if let Err(e) = self.env.index.delete_data_file(self.entry) {
            tracing::warn!(entry = %self.entry, error = %e, "Could not delete corrupted data file");
        }
        for tx in inner.transactions.iter_mut() {
            if let Some(link) = tx.link.take() {
                {
                    let mut conn = link.conn().lock();
                    for statement in tx.pending.iter_mut() {
                        release_engine_state(conn.as_mut(), statement);
                        if matches!(
                            statement.state,
                            StatementState::DuringExecution | StatementState::DuringStepping
                        ) {
                            statement.reset();
                        }
                    }
                }
                deferred.links.push(link);
            }
            tx.drop_segment();
        }
        if let Some(link) = inner.memory_link.take() {
            deferred.links.push(link);
        }

        if recoveries > attempts {
            tracing::error!(entry = %self.entry, attempts, "Data file stays corrupted, giving up");
            inner.inaccessible = true;
            return self.fail_head(inner, index, StorageError::Corrupted, deferred);
        }
        tracing::warn!(entry = %self.entry, attempt = recoveries, "Data file corrupted, recreating it");
        if let Some(head) = inner.transactions[index].pending.front_mut() {
            head.reset();
        }
        TxStep::Progress
    }
}

fn bind_all(conn: &mut dyn Connection, stmt: StmtHandle, params: &[SqlValue]) -> Result<()> {
    let expected = conn.parameter_count(stmt)?;
    if expected != params.len() {
        return Err(StorageError::BadBindParameters(format!(
            "expected {expected} parameters, got {}",
            params.len()
        )));
    }
    for (position, value) in params.iter().enumerate() {
        conn.bind(stmt, position + 1, value)?;
    }
    Ok(())
}
