use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use webstore_core::{
    Attribute, AttributeValue, ClassDefaults, Config, DriveStep, ExceededHandling, Identity,
    LowResourceHandler, LowResourceKind, ManualScheduler, MemoryEngine, ObjectEvent, PolicyScope,
    PromptTarget, Quota, QuotaPrompt, QuotaReply, QuotaRequest, QuotaResponder, QuotaStatus,
    ResultSet, SqlValue, StatementCallback, StatementOptions, StorageClass, StorageEnv,
    StorageError, StorageObject, TokioScheduler, TransactionOptions, DEFAULT_CONTEXT,
};
use webstore_sql::ErrorCode;

struct Harness {
    _dir: tempfile::TempDir,
    engine: Arc<MemoryEngine>,
    clock: Arc<ManualScheduler>,
    env: StorageEnv,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(|config| config)
    }

    fn with_config(configure: impl FnOnce(Config) -> Config) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(MemoryEngine::new());
        let clock = Arc::new(ManualScheduler::new());
        let config = configure(Config::new(dir.path()));
        let env = StorageEnv::new(config, engine.clone(), clock.clone()).unwrap();
        Self {
            _dir: dir,
            engine,
            clock,
            env,
        }
    }

    fn open(&self, origin: &str) -> StorageObject {
        self.env.open(identity(origin)).unwrap()
    }

    fn run(&self) {
        self.clock.run_all(10_000);
    }

    fn data_path(&self, object: &StorageObject) -> PathBuf {
        self.env
            .index()
            .entry(object.entry_id())
            .and_then(|entry| entry.data_file().cloned())
            .and_then(|file| file.absolute_path().map(PathBuf::from))
            .unwrap()
    }
}

fn identity(origin: &str) -> Identity {
    Identity::new(
        DEFAULT_CONTEXT,
        StorageClass::WebDatabase,
        origin,
        Some("db".into()),
    )
}

fn scope(origin: &str) -> PolicyScope {
    PolicyScope::origin(DEFAULT_CONTEXT, StorageClass::WebDatabase, origin)
}

/// Records `label=ok` or `label=<error>` per callback, in firing order.
#[derive(Clone, Default)]
struct Log(Arc<Mutex<Vec<String>>>);

impl Log {
    fn callback(&self, label: &str) -> StatementCallback {
        let log = self.clone();
        let label = label.to_string();
        Box::new(move |result| {
            let entry = match result {
                Ok(_) => format!("{label}=ok"),
                Err(e) => format!("{label}={e:?}"),
            };
            log.0.lock().push(entry);
        })
    }

    fn entries(&self) -> Vec<String> {
        self.0.lock().clone()
    }
}

fn run_sql(tx: &webstore_core::Transaction, sql: &str, log: &Log, label: &str) {
    tx.execute_sql(sql, Vec::new(), StatementOptions::default(), log.callback(label))
        .unwrap();
}

fn quota_config(config: Config, bytes: u64, handling: ExceededHandling) -> Config {
    let mut defaults = ClassDefaults::new(StorageClass::WebDatabase);
    defaults.origin_quota = Some(Quota::Bytes(bytes));
    defaults.exceeded_handling = Some(handling);
    config.with_class_defaults(defaults)
}

#[derive(Default)]
struct RecordingPrompt {
    requests: Mutex<Vec<(QuotaRequest, QuotaResponder)>>,
    cancelled: Mutex<Vec<u64>>,
}

impl QuotaPrompt for RecordingPrompt {
    fn request_quota_increase(&self, request: QuotaRequest, responder: QuotaResponder) {
        self.requests.lock().push((request, responder));
    }

    fn cancel(&self, request_id: u64) {
        self.cancelled.lock().push(request_id);
    }
}

#[test]
fn test_statements_complete_in_queue_order() {
    let h = Harness::new();
    let object = h.open("https://order.example");
    let tx = object.transaction(TransactionOptions::default()).unwrap();
    let log = Log::default();

    run_sql(&tx, "PUT a 1", &log, "a");
    run_sql(&tx, "PUT b 2", &log, "b");
    let rows = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&rows);
    tx.execute_sql(
        "SELECT",
        Vec::new(),
        StatementOptions::cached(),
        Box::new(move |result| {
            let mut result: ResultSet = result.unwrap().unwrap();
            *slot.lock() = Some(result.cached_len().unwrap());
        }),
    )
    .unwrap();
    run_sql(&tx, "DEL a", &log, "del");
    h.run();

    assert_eq!(log.entries(), vec!["a=ok", "b=ok", "del=ok"]);
    assert_eq!(*rows.lock(), Some(2));
    assert_eq!(h.engine.keys(&h.data_path(&object)), vec!["b"]);
    assert_eq!(object.data_size().unwrap(), 2);
    assert_eq!(tx.pending_count(), 0);
}

#[test]
fn test_callbacks_may_queue_more_work() {
    let h = Harness::new();
    let object = h.open("https://reentrant.example");
    let tx = object.transaction(TransactionOptions::default()).unwrap();
    let log = Log::default();

    let follow_up = tx.clone();
    let inner_log = log.clone();
    tx.execute_sql(
        "PUT a 1",
        Vec::new(),
        StatementOptions::default(),
        Box::new(move |result| {
            result.unwrap();
            run_sql(&follow_up, "PUT b 1", &inner_log, "b");
        }),
    )
    .unwrap();
    h.run();

    assert_eq!(log.entries(), vec!["b=ok"]);
}

#[test]
fn test_read_only_transaction_runs_alongside_writer() {
    let h = Harness::new();
    let object = h.open("https://readers.example");
    let writer = object.transaction(TransactionOptions::default()).unwrap();
    let reader = object
        .transaction(TransactionOptions::default().read_only())
        .unwrap();
    let writes = Log::default();
    let reads = Log::default();

    run_sql(&writer, "PUT a 1", &writes, "w1");
    run_sql(&reader, "COUNT", &reads, "r1");
    run_sql(&writer, "PUT b 1", &writes, "w2");
    run_sql(&reader, "PUT x 1", &reads, "r2");
    run_sql(&reader, "SELECT", &reads, "r3");
    run_sql(&writer, "DEL a", &writes, "w3");
    h.run();

    assert_eq!(writes.entries(), vec!["w1=ok", "w2=ok", "w3=ok"]);
    let reads = reads.entries();
    assert_eq!(reads.len(), 3);
    assert_eq!(reads[0], "r1=ok");
    assert!(reads[1].starts_with("r2=Authorization"), "{reads:?}");
    assert_eq!(reads[2], "r3=ok");
    assert!(!h.engine.keys(&h.data_path(&object)).contains(&"x".to_string()));
}

#[test]
fn test_open_cursor_holds_up_its_transaction() {
    let h = Harness::new();
    let object = h.open("https://cursor.example");
    let tx = object.transaction(TransactionOptions::default()).unwrap();
    let log = Log::default();

    run_sql(&tx, "PUT a 1", &log, "a");
    let cursor = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&cursor);
    tx.execute_sql(
        "SELECT",
        Vec::new(),
        StatementOptions::default(),
        Box::new(move |result| *slot.lock() = result.unwrap()),
    )
    .unwrap();
    run_sql(&tx, "PUT b 1", &log, "b");
    h.run();

    assert_eq!(log.entries(), vec!["a=ok"]);
    assert_eq!(tx.pending_count(), 2);
    assert_eq!(object.drive(), DriveStep::Suspended);

    let mut result = cursor.lock().take().unwrap();
    assert!(result.step().unwrap());
    assert_eq!(result.value(0).unwrap(), &SqlValue::Text("a".into()));
    drop(result);
    h.run();

    assert_eq!(log.entries(), vec!["a=ok", "b=ok"]);
}

#[test]
fn test_cancel_discards_callback_exactly_once() {
    let h = Harness::new();
    let object = h.open("https://cancel.example");
    let tx = object.transaction(TransactionOptions::default()).unwrap();
    let log = Log::default();

    run_sql(&tx, "PUT a 1", &log, "a");
    let handle = tx
        .execute_sql("PUT b 1", Vec::new(), StatementOptions::default(), log.callback("b"))
        .unwrap();
    run_sql(&tx, "PUT c 1", &log, "c");

    assert!(handle.cancel());
    assert!(!handle.cancel());
    h.run();

    assert_eq!(log.entries(), vec!["a=ok", "c=ok"]);
    assert_eq!(h.engine.keys(&h.data_path(&object)), vec!["a", "c"]);
    assert!(!handle.cancel());
}

#[test]
fn test_bind_parameters_are_counted() {
    let h = Harness::new();
    let object = h.open("https://bind.example");
    let tx = object.transaction(TransactionOptions::default()).unwrap();
    let log = Log::default();

    let params = vec![SqlValue::Text("k".into()), SqlValue::Text("7".into())];
    tx.execute_sql("PUT ? ?", params, StatementOptions::default(), log.callback("two"))
        .unwrap();
    tx.execute_sql(
        "PUT ? ?",
        vec![SqlValue::Text("k".into())],
        StatementOptions::default(),
        log.callback("one"),
    )
    .unwrap();
    run_sql(&tx, "   ", &log, "empty");
    h.run();

    let entries = log.entries();
    assert_eq!(entries[0], "two=ok");
    assert!(entries[1].starts_with("one=BadBindParameters"), "{entries:?}");
    assert!(entries[2].starts_with("empty=BadQuery"), "{entries:?}");
}

#[test]
fn test_engine_abort_replays_without_duplicate_callbacks() {
    let h = Harness::new();
    let object = h.open("https://replay.example");
    let tx = object.transaction(TransactionOptions::default()).unwrap();
    let log = Log::default();

    tx.begin(Some(log.callback("begin"))).unwrap();
    run_sql(&tx, "PUT a 1", &log, "a");
    run_sql(&tx, "PUT b 2", &log, "b");
    h.run();
    assert!(tx.has_rollback_segment());

    let path = h.data_path(&object);
    h.engine.force_abort(&path);
    run_sql(&tx, "PUT c 3", &log, "c");
    tx.commit(Some(log.callback("commit"))).unwrap();
    h.run();

    assert_eq!(
        log.entries(),
        vec!["begin=ok", "a=ok", "b=ok", "c=ok", "commit=ok"]
    );
    assert_eq!(h.engine.keys(&path), vec!["a", "b", "c"]);
    assert!(!tx.has_rollback_segment());
}

#[test]
fn test_failed_replay_reports_to_next_statement() {
    let h = Harness::with_config(|config| quota_config(config, 1000, ExceededHandling::Deny));
    let object = h.open("https://replay-fail.example");
    let tx = object.transaction(TransactionOptions::default()).unwrap();
    let log = Log::default();

    tx.begin(Some(log.callback("begin"))).unwrap();
    run_sql(&tx, "PUT a 500", &log, "a");
    h.run();

    // The replayed write no longer fits.
    h.env
        .set_policy(
            Attribute::OriginQuota,
            &scope("https://replay-fail.example"),
            AttributeValue::Quota(Quota::Bytes(100)),
        )
        .unwrap();
    let path = h.data_path(&object);
    h.engine.force_abort(&path);
    run_sql(&tx, "PUT c 1", &log, "c");
    h.run();

    assert_eq!(log.entries(), vec!["begin=ok", "a=ok", "c=QuotaExceeded"]);
    assert!(!tx.has_rollback_segment());
    assert!(h.engine.keys(&path).is_empty());

    // The replayed BEGIN was rolled back too, so other writers are not
    // swallowed by a segment nobody tracks.
    let other = object.transaction(TransactionOptions::default()).unwrap();
    run_sql(&other, "PUT z 1", &log, "z");
    h.run();
    tx.rollback(Some(log.callback("rollback"))).unwrap();
    h.run();

    let entries = log.entries();
    assert_eq!(entries[3], "z=ok");
    assert!(entries[4].starts_with("rollback=BadQuery"), "{entries:?}");
    assert_eq!(h.engine.keys(&path), vec!["z"]);
}

#[test]
fn test_quota_deny_fails_only_oversized_writes() {
    let h = Harness::with_config(|config| quota_config(config, 1024, ExceededHandling::Deny));
    let object = h.open("https://deny.example");
    let tx = object.transaction(TransactionOptions::default()).unwrap();
    let log = Log::default();

    run_sql(&tx, "PUT a 1000", &log, "a");
    run_sql(&tx, "PUT b 100", &log, "b");
    run_sql(&tx, "PUT c 20", &log, "c");
    h.run();

    assert_eq!(log.entries(), vec!["a=ok", "b=QuotaExceeded", "c=ok"]);
    assert_eq!(object.data_size().unwrap(), 1020);
}

#[test]
fn test_quota_allow_skips_enforcement() {
    let h = Harness::with_config(|config| quota_config(config, 10, ExceededHandling::Allow));
    let object = h.open("https://allow.example");
    let tx = object.transaction(TransactionOptions::default()).unwrap();
    let log = Log::default();

    run_sql(&tx, "PUT a 50", &log, "a");
    h.run();
    assert_eq!(log.entries(), vec!["a=ok"]);
}

#[test]
fn test_quota_prompt_suspends_and_resumes_once() {
    let h = Harness::with_config(|config| quota_config(config, 100, ExceededHandling::Ask));
    let prompt = Arc::new(RecordingPrompt::default());
    h.env.set_prompt(Some(prompt.clone() as Arc<dyn QuotaPrompt>));
    let object = h.open("https://ask.example");
    let tx = object.transaction(TransactionOptions::default()).unwrap();
    let log = Log::default();

    let options = StatementOptions::default()
        .with_preferred_size(500)
        .with_prompt_target(PromptTarget(9))
        .with_display_name("Notes");
    tx.execute_sql("PUT a 500", Vec::new(), options, log.callback("a"))
        .unwrap();
    run_sql(&tx, "PUT b 1", &log, "b");
    h.run();

    assert!(log.entries().is_empty());
    assert_eq!(object.drive(), DriveStep::Suspended);
    let entry = h.env.index().entry(object.entry_id()).unwrap();
    assert_eq!(entry.quota_status(), QuotaStatus::WaitingForUser);

    let (request, responder) = prompt.requests.lock().pop().unwrap();
    assert_eq!(request.domain, "ask.example");
    assert_eq!(request.display_name, "Notes");
    assert_eq!(request.current_quota, Quota::Bytes(100));
    assert_eq!(request.desired_size, 500);
    assert_eq!(request.target, Some(PromptTarget(9)));

    responder.reply(QuotaReply::AllowUpTo(1000));
    h.run();

    assert_eq!(log.entries(), vec!["a=ok", "b=ok"]);
    assert!(prompt.requests.lock().is_empty());
    assert_eq!(
        h.env.policy().origin_quota(&scope("https://ask.example")),
        Quota::Bytes(1000)
    );
    let entry = h.env.index().entry(object.entry_id()).unwrap();
    assert_eq!(entry.quota_status(), QuotaStatus::UserReplied);
}

#[test]
fn test_dropped_prompt_fails_the_write() {
    let h = Harness::with_config(|config| quota_config(config, 100, ExceededHandling::Ask));
    let prompt = Arc::new(RecordingPrompt::default());
    h.env.set_prompt(Some(prompt.clone() as Arc<dyn QuotaPrompt>));
    let object = h.open("https://dismiss.example");
    let tx = object.transaction(TransactionOptions::default()).unwrap();
    let log = Log::default();

    let options = StatementOptions::default().with_prompt_target(PromptTarget(1));
    tx.execute_sql("PUT a 500", Vec::new(), options, log.callback("a"))
        .unwrap();
    h.run();

    let (_, responder) = prompt.requests.lock().pop().unwrap();
    drop(responder);
    h.run();
    assert_eq!(log.entries(), vec!["a=QuotaExceeded"]);
}

#[test]
fn test_ask_without_window_denies_by_default() {
    let h = Harness::with_config(|config| quota_config(config, 100, ExceededHandling::Ask));
    let prompt = Arc::new(RecordingPrompt::default());
    h.env.set_prompt(Some(prompt.clone() as Arc<dyn QuotaPrompt>));
    let object = h.open("https://nowindow.example");
    let tx = object.transaction(TransactionOptions::default()).unwrap();
    let log = Log::default();

    run_sql(&tx, "PUT a 500", &log, "a");
    h.run();
    assert_eq!(log.entries(), vec!["a=QuotaExceeded"]);
    assert!(prompt.requests.lock().is_empty());
}

#[test]
fn test_cancelling_a_waiting_statement_cancels_the_prompt() {
    let h = Harness::with_config(|config| quota_config(config, 100, ExceededHandling::Ask));
    let prompt = Arc::new(RecordingPrompt::default());
    h.env.set_prompt(Some(prompt.clone() as Arc<dyn QuotaPrompt>));
    let object = h.open("https://withdraw.example");
    let tx = object.transaction(TransactionOptions::default()).unwrap();
    let log = Log::default();

    let options = StatementOptions::default().with_prompt_target(PromptTarget(1));
    let handle = tx
        .execute_sql("PUT a 500", Vec::new(), options, log.callback("a"))
        .unwrap();
    run_sql(&tx, "PUT b 1", &log, "b");
    h.run();

    let request_id = prompt.requests.lock()[0].0.id;
    assert!(handle.cancel());
    h.run();
    assert_eq!(*prompt.cancelled.lock(), vec![request_id]);
    assert_eq!(log.entries(), vec!["b=ok"]);

    // A late answer is ignored.
    let (_, responder) = prompt.requests.lock().pop().unwrap();
    responder.reply(QuotaReply::AllowUnbounded);
    h.run();
    assert_eq!(log.entries(), vec!["b=ok"]);
}

#[test]
fn test_corrupted_file_is_recreated() {
    let h = Harness::new();
    let object = h.open("https://corrupt.example");
    let tx = object.transaction(TransactionOptions::default()).unwrap();
    let log = Log::default();

    run_sql(&tx, "PUT a 1", &log, "a");
    h.run();
    let old_path = h.data_path(&object);
    h.engine.corrupt(&old_path);

    run_sql(&tx, "PUT b 2", &log, "b");
    h.run();

    assert_eq!(log.entries(), vec!["a=ok", "b=ok"]);
    let new_path = h.data_path(&object);
    assert_ne!(old_path, new_path);
    assert_eq!(h.engine.data_size(&old_path), None);
    assert_eq!(h.engine.keys(&new_path), vec!["b"]);
}

#[test]
fn test_corruption_recovery_gives_up() {
    let h = Harness::with_config(|config| config.with_corruption_recovery_attempts(0));
    let object = h.open("https://broken.example");
    let tx = object.transaction(TransactionOptions::default()).unwrap();
    let log = Log::default();

    run_sql(&tx, "PUT a 1", &log, "a");
    h.run();
    h.engine.corrupt(&h.data_path(&object));
    run_sql(&tx, "PUT b 1", &log, "b");
    run_sql(&tx, "PUT c 1", &log, "c");
    h.run();

    let entries = log.entries();
    assert_eq!(entries[1], "b=Corrupted");
    assert!(entries[2].starts_with("c=NoAccess"), "{entries:?}");
}

#[test]
fn test_busy_writer_backs_off_then_succeeds() {
    let h = Harness::new();
    let object = h.open("https://busy.example");
    let holder = object.transaction(TransactionOptions::default()).unwrap();
    let waiter = object
        .transaction(TransactionOptions::default().synchronous())
        .unwrap();
    let log = Log::default();

    holder.begin(None).unwrap();
    run_sql(&holder, "PUT a 1", &log, "a");
    h.run();
    assert!(holder.has_rollback_segment());

    run_sql(&waiter, "PUT b 1", &log, "b");
    assert_eq!(waiter.flush().unwrap(), DriveStep::Yield(Duration::from_millis(10)));
    assert_eq!(waiter.flush().unwrap(), DriveStep::Yield(Duration::from_millis(20)));

    holder.commit(None).unwrap();
    h.run();
    assert_eq!(waiter.flush().unwrap(), DriveStep::Done);
    assert_eq!(log.entries(), vec!["a=ok", "b=ok"]);
}

#[test]
fn test_busy_writer_times_out() {
    let h = Harness::with_config(|config| config.with_busy_retry_limit(2));
    let object = h.open("https://locked.example");
    let holder = object.transaction(TransactionOptions::default()).unwrap();
    let waiter = object
        .transaction(TransactionOptions::default().synchronous())
        .unwrap();
    let log = Log::default();

    holder.begin(None).unwrap();
    run_sql(&holder, "PUT a 1", &log, "a");
    h.run();

    run_sql(&waiter, "PUT b 1", &log, "b");
    assert!(matches!(waiter.flush().unwrap(), DriveStep::Yield(_)));
    assert!(matches!(waiter.flush().unwrap(), DriveStep::Yield(_)));
    assert_eq!(waiter.flush().unwrap(), DriveStep::Done);
    assert_eq!(log.entries(), vec!["a=ok", "b=TimedOut"]);
}

#[test]
fn test_slow_statement_times_out() {
    let h = Harness::with_config(|config| config.with_progress_period(1));
    let object = h.open("https://slow.example");
    h.env
        .set_policy(
            Attribute::QueryTimeout,
            &scope("https://slow.example"),
            AttributeValue::Millis(50),
        )
        .unwrap();
    let tx = object.transaction(TransactionOptions::default()).unwrap();
    let log = Log::default();

    run_sql(&tx, "SLOW 1000", &log, "slow");
    run_sql(&tx, "PUT a 1", &log, "a");
    h.clock.run_all(4);
    assert!(log.entries().is_empty());

    h.clock.skip(Duration::from_millis(100));
    h.run();
    assert_eq!(log.entries(), vec!["slow=TimedOut", "a=ok"]);
}

#[test]
fn test_slow_statement_is_time_sliced() {
    let h = Harness::with_config(|config| config.with_progress_period(1));
    let object = h.open("https://sliced.example");
    let slow = object.transaction(TransactionOptions::default()).unwrap();
    let fast = object.transaction(TransactionOptions::default()).unwrap();
    let log = Log::default();

    run_sql(&slow, "SLOW 20", &log, "slow");
    run_sql(&fast, "PUT a 1", &log, "fast");
    h.run();

    // The quick write finishes while the slow statement is interrupted.
    assert_eq!(log.entries(), vec!["fast=ok", "slow=ok"]);
}

#[test]
fn test_version_is_checked_before_each_statement() {
    let h = Harness::new();
    let object = h.open("https://version.example");
    object.set_version(Some("1.0".into())).unwrap();
    let log = Log::default();

    let current = object
        .transaction(TransactionOptions::default().expecting_version("1.0"))
        .unwrap();
    let stale = object
        .transaction(TransactionOptions::default().expecting_version("0.9"))
        .unwrap();
    run_sql(&current, "PUT a 1", &log, "current");
    run_sql(&stale, "PUT b 1", &log, "stale");
    h.run();

    let entries = log.entries();
    assert!(entries.contains(&"current=ok".to_string()));
    assert!(
        entries.iter().any(|e| e.starts_with("stale=VersionMismatch")),
        "{entries:?}"
    );
    assert_eq!(object.version().as_deref(), Some("1.0"));
}

#[test]
fn test_memory_only_transactions_share_data() {
    let h = Harness::new();
    let object = h
        .env
        .open(identity("https://memory.example").memory_only())
        .unwrap();
    assert!(!object.is_persistent());
    let first = object.transaction(TransactionOptions::default()).unwrap();
    let second = object.transaction(TransactionOptions::default()).unwrap();
    let log = Log::default();

    run_sql(&first, "PUT a 5", &log, "put");
    h.run();
    let count = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&count);
    second
        .execute_sql(
            "COUNT",
            Vec::new(),
            StatementOptions::cached(),
            Box::new(move |result| {
                let mut result = result.unwrap().unwrap();
                assert!(result.step().unwrap());
                *slot.lock() = Some(result.value(0).unwrap().clone());
            }),
        )
        .unwrap();
    h.run();

    assert_eq!(log.entries(), vec!["put=ok"]);
    assert_eq!(*count.lock(), Some(SqlValue::Integer(1)));
    assert_eq!(h.engine.file_count(), 0);
}

#[test]
fn test_synchronous_flush_waits_for_rollback_segment() {
    let h = Harness::new();
    let object = h
        .env
        .open(identity("https://segment.example").memory_only())
        .unwrap();
    let writer = object.transaction(TransactionOptions::default()).unwrap();
    let sync = object
        .transaction(TransactionOptions::default().synchronous())
        .unwrap();
    let log = Log::default();

    writer.begin(Some(log.callback("begin"))).unwrap();
    run_sql(&writer, "PUT a 1", &log, "a");
    h.run();
    assert!(writer.has_rollback_segment());

    run_sql(&sync, "PUT b 1", &log, "b");
    assert_eq!(sync.flush().unwrap(), DriveStep::Suspended);
    assert_eq!(sync.pending_count(), 1);
    assert_eq!(log.entries(), vec!["begin=ok", "a=ok"]);

    writer.rollback(Some(log.callback("rollback"))).unwrap();
    h.run();
    assert_eq!(sync.flush().unwrap(), DriveStep::Done);

    let count = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&count);
    sync.execute_sql(
        "COUNT",
        Vec::new(),
        StatementOptions::cached(),
        Box::new(move |result| {
            let mut result = result.unwrap().unwrap();
            assert!(result.step().unwrap());
            *slot.lock() = Some(result.value(0).unwrap().clone());
        }),
    )
    .unwrap();
    assert_eq!(sync.flush().unwrap(), DriveStep::Done);

    assert_eq!(log.entries(), vec!["begin=ok", "a=ok", "rollback=ok", "b=ok"]);
    assert_eq!(*count.lock(), Some(SqlValue::Integer(1)));
}

#[test]
fn test_synchronous_transaction_cannot_open_segment() {
    let h = Harness::new();
    let object = h.open("https://sync-begin.example");
    let sync = object
        .transaction(TransactionOptions::default().synchronous())
        .unwrap();
    let log = Log::default();

    assert!(sync.begin(None).is_err());
    run_sql(&sync, "BEGIN", &log, "begin");
    assert_eq!(sync.flush().unwrap(), DriveStep::Done);

    let entries = log.entries();
    assert!(entries[0].starts_with("begin=Authorization"), "{entries:?}");
    assert!(!sync.has_rollback_segment());
}

#[derive(Default)]
struct CollectLowResource(Mutex<Vec<LowResourceKind>>);

impl LowResourceHandler for CollectLowResource {
    fn raise(&self, kind: LowResourceKind) {
        self.0.lock().push(kind);
    }
}

#[test]
fn test_out_of_memory_raises_low_resource() {
    let h = Harness::new();
    let handler = Arc::new(CollectLowResource::default());
    h.env.set_low_resource_handler(handler.clone());
    let object = h.open("https://oom.example");
    let tx = object.transaction(TransactionOptions::default()).unwrap();
    let log = Log::default();

    h.engine.fail_next_open(ErrorCode::NoMem);
    run_sql(&tx, "PUT a 1", &log, "a");
    run_sql(&tx, "PUT b 1", &log, "b");
    h.run();

    assert_eq!(log.entries(), vec!["a=NoMemory", "b=ok"]);
    assert_eq!(*handler.0.lock(), vec![LowResourceKind::NoMemory]);
}

#[test]
fn test_lifecycle_events_and_close() {
    let h = Harness::new();
    let object = h.open("https://events.example");
    let events = object.subscribe();
    let log = Log::default();

    let tx = object.transaction(TransactionOptions::default()).unwrap();
    let kept = object.transaction(TransactionOptions::default()).unwrap();
    run_sql(&kept, "PUT a 1", &log, "a");
    tx.release();
    assert!(tx.is_closed());
    assert!(tx
        .execute_sql("PUT b 1", Vec::new(), StatementOptions::default(), log.callback("b"))
        .is_err());

    object.close();
    h.run();
    assert!(object.is_closed());
    assert!(kept.is_closed());
    assert!(log.entries().is_empty());
    assert!(matches!(
        object.transaction(TransactionOptions::default()),
        Err(StorageError::NoAccess(_))
    ));

    let seen: Vec<ObjectEvent> = events.try_iter().collect();
    let entry = object.entry_id();
    assert_eq!(
        seen,
        vec![
            ObjectEvent::TransactionCreated(tx.id()),
            ObjectEvent::TransactionCreated(kept.id()),
            ObjectEvent::TransactionClosed(tx.id()),
            ObjectEvent::Closing(entry),
            ObjectEvent::TransactionClosed(kept.id()),
            ObjectEvent::Closed(entry),
        ]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_tokio_scheduler_drives_statements() {
    let dir = tempfile::tempdir().unwrap();
    let env = StorageEnv::new(
        Config::new(dir.path()),
        Arc::new(MemoryEngine::new()),
        Arc::new(TokioScheduler::current()),
    )
    .unwrap();
    let object = env.open(identity("https://tokio.example")).unwrap();
    let tx = object.transaction(TransactionOptions::default()).unwrap();

    let (send, recv) = tokio::sync::oneshot::channel();
    tx.execute_sql(
        "PUT a 3",
        Vec::new(),
        StatementOptions::default(),
        Box::new(move |result| {
            let _ = send.send(result.map(|rs| rs.and_then(|rs| rs.rows_affected())));
        }),
    )
    .unwrap();

    let affected = tokio::time::timeout(Duration::from_secs(5), recv)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(affected, Some(1));
    object.release();
}
