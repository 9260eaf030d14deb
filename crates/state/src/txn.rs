//! Optimistic transaction runner.
//!
//! Every state mutation is a batch of [`Op`]s built from a fresh read and
//! committed atomically. When a batch aborts because a concurrent writer
//! invalidated one of its assertions, the runner calls the builder again so
//! it can re-read and decide afresh. A builder may return `Ok(None)` when
//! the fresh state shows there is nothing to do, or an error when the fresh
//! state makes the operation impossible. After `max_attempts` aborts the
//! runner reports [`StateError::Contention`].
//!
//! # Test hooks
//!
//! [`TxnHooks`] lets tests interleave a conflicting write between the build
//! and the commit of a batch. Hooks are consumed one per commit attempt, in
//! order. Transactions started from inside a hook do not consume hooks.

use std::{
    collections::VecDeque,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Instant,
};

use keel_store::{Database, Op, StorageBackend};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::{
    error::{Result, StateError},
    metrics,
};

/// A closure run around one commit attempt.
pub type HookFn = Box<dyn FnOnce() + Send>;

/// Callbacks for one commit attempt.
#[derive(Default)]
pub struct TestHook {
    /// Runs after the batch is built and before it is committed.
    pub before: Option<HookFn>,
    /// Runs after the commit attempt, whatever its outcome.
    pub after: Option<HookFn>,
}

impl TestHook {
    /// A hook that only runs before the commit.
    pub fn before(f: impl FnOnce() + Send + 'static) -> Self {
        Self { before: Some(Box::new(f)), after: None }
    }

    /// A hook that only runs after the commit.
    pub fn after(f: impl FnOnce() + Send + 'static) -> Self {
        Self { before: None, after: Some(Box::new(f)) }
    }

    /// A hook with both halves.
    pub fn around(
        before: impl FnOnce() + Send + 'static,
        after: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self { before: Some(Box::new(before)), after: Some(Box::new(after)) }
    }
}

impl fmt::Debug for TestHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestHook")
            .field("before", &self.before.is_some())
            .field("after", &self.after.is_some())
            .finish()
    }
}

#[derive(Default)]
struct HookQueue {
    pending: VecDeque<TestHook>,
    running: bool,
}

/// Queue of [`TestHook`]s consumed by successive commit attempts.
#[derive(Default)]
pub struct TxnHooks {
    queue: Mutex<HookQueue>,
}

impl fmt::Debug for TxnHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let queue = self.queue.lock();
        f.debug_struct("TxnHooks")
            .field("pending", &queue.pending.len())
            .field("running", &queue.running)
            .finish()
    }
}

impl TxnHooks {
    /// Appends hooks to the queue.
    pub(crate) fn push(self: &Arc<Self>, hooks: Vec<TestHook>) -> HookCheck {
        let mut queue = self.queue.lock();
        queue.pending.extend(hooks);
        HookCheck { hooks: Arc::clone(self) }
    }

    /// Takes the next hook unless one is already running.
    fn take(&self) -> Option<TestHook> {
        let mut queue = self.queue.lock();
        if queue.running {
            return None;
        }
        let hook = queue.pending.pop_front()?;
        queue.running = true;
        Some(hook)
    }

    fn finish(&self) {
        self.queue.lock().running = false;
    }

    fn remaining(&self) -> usize {
        self.queue.lock().pending.len()
    }
}

/// Handle returned when hooks are installed.
#[derive(Debug)]
pub struct HookCheck {
    hooks: Arc<TxnHooks>,
}

impl HookCheck {
    /// Number of installed hooks no commit attempt has consumed yet.
    pub fn remaining(&self) -> usize {
        self.hooks.remaining()
    }

    /// Whether every installed hook has run.
    pub fn consumed(&self) -> bool {
        self.remaining() == 0
    }

    /// Panics if any installed hook has not run.
    ///
    /// For tests that expect a precise number of commit attempts.
    #[track_caller]
    pub fn assert_consumed(&self) {
        let remaining = self.remaining();
        assert!(remaining == 0, "{remaining} transaction hook(s) never ran");
    }
}

/// Clears the running flag even if a hook panics.
struct RunningGuard<'a>(&'a TxnHooks);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.finish();
    }
}

/// Runs optimistic transactions against a [`Database`].
pub struct TxnRunner<B: StorageBackend> {
    db: Arc<Database<B>>,
    max_attempts: u32,
    hooks: Arc<TxnHooks>,
    attempts: AtomicU64,
}

impl<B: StorageBackend> fmt::Debug for TxnRunner<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxnRunner")
            .field("max_attempts", &self.max_attempts)
            .field("attempts", &self.attempts.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl<B: StorageBackend> TxnRunner<B> {
    /// Creates a runner that gives up after `max_attempts` aborted commits.
    pub fn new(db: Arc<Database<B>>, max_attempts: u32) -> Self {
        Self {
            db,
            max_attempts: max_attempts.max(1),
            hooks: Arc::new(TxnHooks::default()),
            attempts: AtomicU64::new(0),
        }
    }

    /// Retry bound.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Total commit attempts made through this runner.
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    /// Installs hooks consumed by upcoming commit attempts.
    pub fn set_hooks(&self, hooks: Vec<TestHook>) -> HookCheck {
        self.hooks.push(hooks)
    }

    /// Builds and commits a batch, rebuilding after every abort.
    ///
    /// `build` receives the zero-based attempt number.
    ///
    /// # Errors
    ///
    /// - Whatever `build` returns.
    /// - [`StateError::Contention`] (with an empty context) when every
    ///   attempt aborted.
    /// - Store failures other than aborts, unchanged.
    pub fn run<F>(&self, mut build: F) -> Result<()>
    where
        F: FnMut(u32) -> Result<Option<Vec<Op>>>,
    {
        for attempt in 0..self.max_attempts {
            let Some(ops) = build(attempt)? else {
                return Ok(());
            };
            match self.run_once(ops) {
                Ok(_) => return Ok(()),
                Err(e) if e.is_aborted() => {
                    debug!(attempt, error = %e, "Transaction aborted, retrying");
                },
                Err(e) => return Err(e.into()),
            }
        }
        warn!(attempts = self.max_attempts, "Transaction retry budget exhausted");
        metrics::record_txn_contention();
        Err(StateError::Contention { context: String::new() })
    }

    /// Commits one batch, running the next test hook around it.
    ///
    /// # Errors
    ///
    /// Returns the store error unchanged, including `Aborted`.
    pub fn run_once(&self, ops: Vec<Op>) -> keel_store::Result<u64> {
        let hook = self.hooks.take();
        let _guard = hook.as_ref().map(|_| RunningGuard(&self.hooks));
        let (before, after) = match hook {
            Some(TestHook { before, after }) => (before, after),
            None => (None, None),
        };
        if let Some(before) = before {
            before();
        }

        self.attempts.fetch_add(1, Ordering::Relaxed);
        let start = Instant::now();
        let result = self.db.commit(ops);
        let committed = match &result {
            Ok(_) => true,
            Err(e) => !e.is_aborted(),
        };
        metrics::record_txn_attempt(committed, start.elapsed().as_secs_f64());

        if let Some(after) = after {
            after();
        }
        result
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use keel_store::{Collection, CollectionId};
    use serde::{Deserialize, Serialize};

    use super::*;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Counter {
        value: u64,
    }

    struct Counters;

    impl Collection for Counters {
        const ID: CollectionId = CollectionId::Sequences;
        type Doc = Counter;
    }

    fn runner(max_attempts: u32) -> (Arc<Database>, TxnRunner<keel_store::InMemoryBackend>) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        db.commit(vec![Op::on::<Counters>("c").missing().insert(Counter { value: 0 })]).unwrap();
        let runner = TxnRunner::new(Arc::clone(&db), max_attempts);
        (db, runner)
    }

    fn increment_op(db: &Database) -> Vec<Op> {
        let current = db.get::<Counters>("c").unwrap().unwrap();
        vec![Op::on::<Counters>("c").revno(current.revno).update(|c| c.value += 1)]
    }

    #[test]
    fn test_run_commits_first_attempt() {
        let (db, runner) = runner(3);
        runner.run(|_| Ok(Some(increment_op(&db)))).unwrap();
        assert_eq!(db.get::<Counters>("c").unwrap().unwrap().doc.value, 1);
        assert_eq!(runner.attempts(), 1);
    }

    #[test]
    fn test_run_retries_after_interference() {
        let (db, runner) = runner(3);
        let interferer = Arc::clone(&db);
        let check = runner.set_hooks(vec![TestHook::before(move || {
            interferer
                .commit(vec![Op::on::<Counters>("c").update(|c| c.value += 10)])
                .unwrap();
        })]);

        let builds = AtomicUsize::new(0);
        runner
            .run(|_| {
                builds.fetch_add(1, Ordering::SeqCst);
                Ok(Some(increment_op(&db)))
            })
            .unwrap();

        check.assert_consumed();
        assert_eq!(builds.load(Ordering::SeqCst), 2);
        assert_eq!(db.get::<Counters>("c").unwrap().unwrap().doc.value, 11);
    }

    #[test]
    fn test_run_reports_contention_after_bound() {
        let (db, runner) = runner(3);
        let hooks = (0..3)
            .map(|_| {
                let interferer = Arc::clone(&db);
                TestHook::before(move || {
                    interferer
                        .commit(vec![Op::on::<Counters>("c").update(|c| c.value += 1)])
                        .unwrap();
                })
            })
            .collect();
        let check = runner.set_hooks(hooks);

        let err = runner.run(|_| Ok(Some(increment_op(&db)))).unwrap_err();
        assert!(matches!(err, StateError::Contention { .. }));
        assert!(check.consumed());
        assert_eq!(runner.attempts(), 3);
    }

    #[test]
    fn test_nothing_to_do_skips_commit() {
        let (_db, runner) = runner(3);
        runner.run(|_| Ok(None)).unwrap();
        assert_eq!(runner.attempts(), 0);
    }

    #[test]
    fn test_nested_transactions_do_not_consume_hooks() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        db.commit(vec![Op::on::<Counters>("c").missing().insert(Counter { value: 0 })]).unwrap();
        let runner = Arc::new(TxnRunner::new(Arc::clone(&db), 3));

        let nested = Arc::clone(&runner);
        let check = runner.set_hooks(vec![
            TestHook::before(move || {
                nested
                    .run_once(vec![Op::on::<Counters>("c").update(|c| c.value += 100)])
                    .unwrap();
            }),
            TestHook::default(),
        ]);

        runner.run_once(vec![Op::on::<Counters>("c").update(|c| c.value += 1)]).unwrap();
        assert_eq!(check.remaining(), 1);
        assert_eq!(db.get::<Counters>("c").unwrap().unwrap().doc.value, 101);
    }
}
