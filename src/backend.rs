//! Deferred execution backends.
//!
//! A [`Backend`] runs a unit of work once after a delay. The harness needs
//! nothing else from it: step chaining and the watchdog timer are both
//! expressed as `schedule_once` calls.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{panic_message, BackendError};

/// A unit of deferred work.
pub type Work = Box<dyn FnOnce() + Send + 'static>;

/// Handle to a unit of work handed to [`Backend::schedule_once`].
///
/// Dropping the handle leaves the work scheduled.
pub struct Scheduled {
    cancel: Option<Box<dyn FnOnce() + Send + 'static>>,
}

impl Scheduled {
    /// Handle whose [`cancel`](Self::cancel) runs `cancel`.
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Handle for work that cannot be withdrawn.
    pub fn detached() -> Self {
        Self { cancel: None }
    }

    /// Withdraw the work if it has not started yet.
    pub fn cancel(self) {
        if let Some(cancel) = self.cancel {
            cancel();
        }
    }
}

impl std::fmt::Debug for Scheduled {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduled")
            .field("cancellable", &self.cancel.is_some())
            .finish()
    }
}

/// Scheduler used by a [`TestContext`](crate::TestContext).
///
/// Implementations must be thread-safe (`Send + Sync`).
pub trait Backend: Send + Sync + 'static {
    /// Run `work` once after `delay`. Never blocks the caller.
    ///
    /// A delay too large to represent means the work never becomes due.
    fn schedule_once(&self, delay: Duration, work: Work) -> Scheduled;

    /// Block until outstanding work has run.
    ///
    /// Cancelled work and work that never becomes due are not waited for.
    /// Returns the first panic raised by any unit of work since the last
    /// `join`.
    fn join(&self) -> Result<(), BackendError>;
}

impl<B: Backend + ?Sized> Backend for Arc<B> {
    fn schedule_once(&self, delay: Duration, work: Work) -> Scheduled {
        (**self).schedule_once(delay, work)
    }

    fn join(&self) -> Result<(), BackendError> {
        (**self).join()
    }
}

/// Run `work`, recording its panic message instead of unwinding.
fn run_guarded(work: Work, panics: &Mutex<Vec<String>>) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(work)) {
        let message = panic_message(&*payload);

        #[cfg(feature = "tracing")]
        tracing::error!(panic = %message, "work.panicked");

        panics.lock().push(message);
    }
}

fn take_first_panic(panics: &Mutex<Vec<String>>) -> Result<(), BackendError> {
    let mut panics = panics.lock();
    let first = panics.drain(..).next();
    match first {
        Some(message) => Err(BackendError::WorkPanicked(message)),
        None => Ok(()),
    }
}

// ============================================================================
// Timer Queue
// ============================================================================

struct Entry {
    /// `None` when the delay overflows `Instant`; such work never runs.
    due: Option<Instant>,
    seq: u64,
    work: Work,
}

/// Earliest first, never-due last.
fn cmp_due(a: Option<Instant>, b: Option<Instant>) -> CmpOrdering {
    match (a, b) {
        (Some(a), Some(b)) => a.cmp(&b),
        (Some(_), None) => CmpOrdering::Less,
        (None, Some(_)) => CmpOrdering::Greater,
        (None, None) => CmpOrdering::Equal,
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // Reversed so the max-heap pops the earliest (due, seq) first.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        cmp_due(other.due, self.due).then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct Queue {
    entries: BinaryHeap<Entry>,
    next_seq: u64,
    running: bool,
    shutdown: bool,
}

impl Queue {
    fn has_due_work(&self) -> bool {
        self.running || self.entries.iter().any(|e| e.due.is_some())
    }
}

#[derive(Default)]
struct QueueShared {
    queue: Mutex<Queue>,
    wake: Condvar,
    idle: Condvar,
    panics: Mutex<Vec<String>>,
}

impl QueueShared {
    fn withdraw(&self, seq: u64) {
        let mut queue = self.queue.lock();
        let (gone, keep): (Vec<Entry>, Vec<Entry>) = std::mem::take(&mut queue.entries)
            .into_vec()
            .into_iter()
            .partition(|e| e.seq == seq);
        queue.entries = keep.into();
        if !queue.has_due_work() {
            self.idle.notify_all();
        }
        drop(queue);

        // Work may own the last handle to its backend; drop it unlocked.
        drop(gone);
    }
}

type Runner = Box<dyn Fn(Work, &Mutex<Vec<String>>) + Send + 'static>;

/// Heap of pending work drained in `(due, seq)` order by one dispatcher
/// thread, one unit at a time.
struct TimerQueue {
    shared: Arc<QueueShared>,
    _dispatcher: Option<JoinHandle<()>>,
}

impl TimerQueue {
    fn start(name: &str, run: Runner) -> Self {
        let shared = Arc::new(QueueShared::default());
        let dispatcher_shared = Arc::clone(&shared);
        let dispatcher = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || dispatch(&dispatcher_shared, &run));

        let dispatcher = match dispatcher {
            Ok(handle) => Some(handle),
            Err(_e) => {
                #[cfg(feature = "tracing")]
                tracing::error!(error = %_e, "failed to spawn dispatcher thread");

                shared.queue.lock().shutdown = true;
                None
            }
        };

        Self {
            shared,
            _dispatcher: dispatcher,
        }
    }

    fn push(&self, delay: Duration, work: Work) -> Scheduled {
        let mut queue = self.shared.queue.lock();
        let seq = queue.next_seq;
        queue.next_seq += 1;
        queue.entries.push(Entry {
            due: Instant::now().checked_add(delay),
            seq,
            work,
        });
        drop(queue);
        self.shared.wake.notify_one();

        let shared: Weak<QueueShared> = Arc::downgrade(&self.shared);
        Scheduled::new(move || {
            if let Some(shared) = shared.upgrade() {
                shared.withdraw(seq);
            }
        })
    }

    fn pending(&self) -> usize {
        self.shared.queue.lock().entries.len()
    }

    fn join(&self) -> Result<(), BackendError> {
        {
            let mut queue = self.shared.queue.lock();
            while queue.has_due_work() && !queue.shutdown {
                self.shared.idle.wait(&mut queue);
            }
        }
        take_first_panic(&self.shared.panics)
    }
}

impl Drop for TimerQueue {
    fn drop(&mut self) {
        // The dispatcher is not joined: the last handle may be dropped by
        // work it is running.
        self.shared.queue.lock().shutdown = true;
        self.shared.wake.notify_all();
        self.shared.idle.notify_all();
    }
}

fn dispatch(shared: &QueueShared, run: &Runner) {
    let mut queue = shared.queue.lock();
    loop {
        if queue.shutdown {
            return;
        }
        let next_due = queue.entries.peek().and_then(|e| e.due);
        match next_due {
            Some(due) if due <= Instant::now() => {
                let Some(entry) = queue.entries.pop() else {
                    continue;
                };
                queue.running = true;
                drop(queue);
                run(entry.work, &shared.panics);
                queue = shared.queue.lock();
                queue.running = false;
                if !queue.has_due_work() {
                    shared.idle.notify_all();
                }
            }
            Some(due) => {
                shared.wake.wait_until(&mut queue, due);
            }
            None => {
                shared.idle.notify_all();
                shared.wake.wait(&mut queue);
            }
        }
    }
}

// ============================================================================
// Thread Backend
// ============================================================================

/// Runs each unit of work on a fresh OS thread.
///
/// A dispatcher thread releases units in order of due time, with submission
/// order breaking ties, and waits for each unit's thread to finish before
/// starting the next. Work from one chain is therefore FIFO.
pub struct ThreadBackend {
    queue: TimerQueue,
    spawned: Arc<AtomicU64>,
}

impl ThreadBackend {
    /// Start the dispatcher thread.
    pub fn new() -> Self {
        let spawned = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&spawned);
        let queue = TimerQueue::start(
            "baton-dispatch",
            Box::new(move |work: Work, panics: &Mutex<Vec<String>>| {
                let n = counter.fetch_add(1, Ordering::Relaxed);
                run_on_fresh_thread(n, work, panics);
            }),
        );
        Self { queue, spawned }
    }

    /// Number of units started so far.
    pub fn spawned(&self) -> u64 {
        self.spawned.load(Ordering::Relaxed)
    }

    /// Number of units waiting to run.
    pub fn pending(&self) -> usize {
        self.queue.pending()
    }
}

impl Default for ThreadBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn run_on_fresh_thread(n: u64, work: Work, panics: &Mutex<Vec<String>>) {
    std::thread::scope(|scope| {
        let spawned = std::thread::Builder::new()
            .name(format!("baton-worker-{n}"))
            .spawn_scoped(scope, move || run_guarded(work, panics));

        if let Err(_e) = spawned {
            #[cfg(feature = "tracing")]
            tracing::error!(error = %_e, "failed to spawn worker thread");

            panics
                .lock()
                .push("failed to spawn worker thread".to_string());
        }
    });
}

impl Backend for ThreadBackend {
    fn schedule_once(&self, delay: Duration, work: Work) -> Scheduled {
        self.queue.push(delay, work)
    }

    fn join(&self) -> Result<(), BackendError> {
        self.queue.join()
    }
}

// ============================================================================
// Serial Backend
// ============================================================================

/// Executes work one unit at a time on a single worker thread.
///
/// Work runs strictly in order of due time, with submission order breaking
/// ties, so two units scheduled with the same delay always run in the order
/// they were scheduled. The crate's own tests run on this backend.
pub struct SerialBackend {
    queue: TimerQueue,
}

impl SerialBackend {
    /// Start the worker thread.
    pub fn new() -> Self {
        Self {
            queue: TimerQueue::start("baton-serial", Box::new(run_guarded)),
        }
    }

    /// Number of units waiting to run.
    pub fn pending(&self) -> usize {
        self.queue.pending()
    }
}

impl Default for SerialBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for SerialBackend {
    fn schedule_once(&self, delay: Duration, work: Work) -> Scheduled {
        self.queue.push(delay, work)
    }

    fn join(&self) -> Result<(), BackendError> {
        self.queue.join()
    }
}

// ============================================================================
// Tokio Backend
// ============================================================================

/// Runs work as tasks on a `tokio` runtime.
///
/// Work runs inside a task, so it should not block for long. `join` uses
/// [`Handle::block_on`](tokio::runtime::Handle::block_on) and must be called
/// from outside the runtime.
pub struct TokioBackend {
    handle: tokio::runtime::Handle,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    panics: Arc<Mutex<Vec<String>>>,
}

impl TokioBackend {
    /// Schedule onto the runtime behind `handle`.
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self {
            handle,
            tasks: Mutex::new(Vec::new()),
            panics: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Schedule onto the runtime the caller is running in.
    ///
    /// Returns `None` outside a runtime context.
    pub fn current() -> Option<Self> {
        tokio::runtime::Handle::try_current().ok().map(Self::new)
    }

    /// Number of tasks not yet finished.
    pub fn pending(&self) -> usize {
        let mut tasks = self.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.len()
    }
}

impl Backend for TokioBackend {
    fn schedule_once(&self, delay: Duration, work: Work) -> Scheduled {
        let panics = Arc::clone(&self.panics);
        let task = self.handle.spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            run_guarded(work, &panics);
        });
        let abort = task.abort_handle();

        let mut tasks = self.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);

        Scheduled::new(move || abort.abort())
    }

    fn join(&self) -> Result<(), BackendError> {
        loop {
            let tasks = std::mem::take(&mut *self.tasks.lock());
            if tasks.is_empty() {
                break;
            }
            self.handle.block_on(async {
                for task in tasks {
                    // Aborted tasks end with a cancellation error.
                    let _ = task.await;
                }
            });
        }
        take_first_panic(&self.panics)
    }
}
