//! Scheduler boundary
//!
//! Storage objects never block on I/O; they post "drive me again" tasks to
//! a scheduler and return. Two schedulers ship:
//! - `ManualScheduler`: a virtual clock advanced by the caller (tests, tools)
//! - `TokioScheduler`: spawned sleeps on a Tokio runtime

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub type Task = Box<dyn FnOnce() + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

pub trait Scheduler: Send + Sync {
    /// Runs `task` once, no earlier than `delay` from now.
    fn post(&self, task: Task, delay: Duration) -> TaskId;

    /// Drops a task that has not run yet. Returns false if it already ran.
    fn cancel_posted(&self, id: TaskId) -> bool;

    /// Monotonic time since the scheduler was created.
    fn now(&self) -> Duration;
}

#[derive(Default)]
struct ManualState {
    now: Duration,
    next_id: u64,
    queue: BTreeMap<(Duration, u64), Task>,
}

/// Deterministic scheduler driven by its caller. Time only moves through
/// `advance`, so timeouts and backoff are reproducible.
#[derive(Default)]
pub struct ManualScheduler {
    state: Mutex<ManualState>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Delay until the earliest queued task, if any.
    pub fn next_due(&self) -> Option<Duration> {
        let state = self.state.lock();
        state
            .queue
            .keys()
            .next()
            .map(|(due, _)| due.saturating_sub(state.now))
    }

    fn pop_due(&self, until: Duration) -> Option<Task> {
        let mut state = self.state.lock();
        let key = *state.queue.keys().next()?;
        if key.0 > until {
            return None;
        }
        state.now = state.now.max(key.0);
        state.queue.remove(&key)
    }

    /// Runs every task that is due at the current time, including tasks
    /// those tasks post with no delay. Returns how many ran.
    pub fn run_until_idle(&self) -> usize {
        let now = self.now();
        let mut ran = 0;
        while let Some(task) = self.pop_due(now) {
            task();
            ran += 1;
        }
        ran
    }

    /// Moves the clock forward by `by`, running tasks in due order.
    pub fn advance(&self, by: Duration) -> usize {
        let target = self.now() + by;
        let mut ran = 0;
        while let Some(task) = self.pop_due(target) {
            task();
            ran += 1;
        }
        let mut state = self.state.lock();
        state.now = state.now.max(target);
        ran
    }

    /// Moves the clock forward without running anything. Tasks that became
    /// due run on the next `run_until_idle`.
    pub fn skip(&self, by: Duration) {
        self.state.lock().now += by;
    }

    /// Keeps jumping to the next due task until the queue is empty or
    /// `max_tasks` have run.
    pub fn run_all(&self, max_tasks: usize) -> usize {
        let mut ran = 0;
        while ran < max_tasks {
            let Some(task) = self.pop_due(Duration::MAX) else {
                break;
            };
            task();
            ran += 1;
        }
        ran
    }
}

impl Scheduler for ManualScheduler {
    fn post(&self, task: Task, delay: Duration) -> TaskId {
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = state.next_id;
        let due = state.now + delay;
        state.queue.insert((due, id), task);
        TaskId(id)
    }

    fn cancel_posted(&self, id: TaskId) -> bool {
        let mut state = self.state.lock();
        let key = state.queue.keys().find(|(_, seq)| *seq == id.0).copied();
        key.and_then(|key| state.queue.remove(&key)).is_some()
    }

    fn now(&self) -> Duration {
        self.state.lock().now
    }
}

/// Posts tasks onto a Tokio runtime. Each task is a spawned sleep that can
/// be aborted until it fires.
pub struct TokioScheduler {
    handle: tokio::runtime::Handle,
    started: tokio::time::Instant,
    next_id: AtomicU64,
    tasks: Arc<Mutex<HashMap<TaskId, tokio::task::AbortHandle>>>,
}

impl TokioScheduler {
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self {
            handle,
            started: tokio::time::Instant::now(),
            next_id: AtomicU64::new(1),
            tasks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Uses the runtime the caller is running on.
    pub fn current() -> Self {
        Self::new(tokio::runtime::Handle::current())
    }

    pub fn pending(&self) -> usize {
        self.tasks.lock().len()
    }
}

impl Scheduler for TokioScheduler {
    fn post(&self, task: Task, delay: Duration) -> TaskId {
        let id = TaskId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let tasks = Arc::clone(&self.tasks);
        // Hold the map lock across the spawn so a zero-delay task cannot
        // remove itself before it is registered.
        let mut map = self.tasks.lock();
        let join = self.handle.spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if tasks.lock().remove(&id).is_some() {
                task();
            }
        });
        map.insert(id, join.abort_handle());
        id
    }

    fn cancel_posted(&self, id: TaskId) -> bool {
        match self.tasks.lock().remove(&id) {
            Some(abort) => {
                abort.abort();
                true
            }
            None => false,
        }
    }

    fn now(&self) -> Duration {
        self.started.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder() -> (Arc<Mutex<Vec<&'static str>>>, impl Fn(&'static str) -> Task) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let make = {
            let log = Arc::clone(&log);
            move |name: &'static str| -> Task {
                let log = Arc::clone(&log);
                Box::new(move || log.lock().push(name))
            }
        };
        (log, make)
    }

    #[test]
    fn test_manual_runs_in_due_order() {
        let scheduler = ManualScheduler::new();
        let (log, task) = recorder();
        scheduler.post(task("late"), Duration::from_millis(20));
        scheduler.post(task("now"), Duration::ZERO);
        scheduler.post(task("soon"), Duration::from_millis(5));

        assert_eq!(scheduler.run_until_idle(), 1);
        assert_eq!(scheduler.advance(Duration::from_millis(10)), 1);
        assert_eq!(scheduler.now(), Duration::from_millis(10));
        assert_eq!(scheduler.next_due(), Some(Duration::from_millis(10)));
        assert_eq!(scheduler.run_all(10), 1);
        assert_eq!(*log.lock(), vec!["now", "soon", "late"]);
        assert_eq!(scheduler.now(), Duration::from_millis(20));
    }

    #[test]
    fn test_manual_cancel() {
        let scheduler = ManualScheduler::new();
        let (log, task) = recorder();
        let id = scheduler.post(task("dropped"), Duration::ZERO);
        assert!(scheduler.cancel_posted(id));
        assert!(!scheduler.cancel_posted(id));
        assert_eq!(scheduler.run_until_idle(), 0);
        assert!(log.lock().is_empty());
    }

    #[test]
    fn test_tasks_may_post_more_work() {
        let scheduler = Arc::new(ManualScheduler::new());
        let count = Arc::new(AtomicU64::new(0));
        fn chain(scheduler: Arc<ManualScheduler>, count: Arc<AtomicU64>) {
            if count.fetch_add(1, Ordering::SeqCst) < 4 {
                let next = Arc::clone(&scheduler);
                scheduler.post(Box::new(move || chain(next, count)), Duration::ZERO);
            }
        }
        let first = Arc::clone(&scheduler);
        let c = Arc::clone(&count);
        scheduler.post(Box::new(move || chain(first, c)), Duration::ZERO);
        assert_eq!(scheduler.run_until_idle(), 5);
        assert_eq!(count.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_tokio_scheduler_fires_and_cancels() {
        let scheduler = TokioScheduler::current();
        let (tx, rx) = tokio::sync::oneshot::channel();
        scheduler.post(
            Box::new(move || {
                let _ = tx.send(());
            }),
            Duration::from_millis(1),
        );
        let cancelled = scheduler.post(Box::new(|| panic!("must not run")), Duration::from_secs(60));
        assert!(scheduler.cancel_posted(cancelled));
        rx.await.unwrap();
        assert_eq!(scheduler.pending(), 0);
    }
}
