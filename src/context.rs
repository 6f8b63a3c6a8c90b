//! Per-run completion state, watchdog and assertion helpers.
//!
//! A [`TestContext`] owns the terminal state of one test run. Steps and
//! deferred work mutate it from backend threads; the test thread blocks in
//! [`TestContext::delay_test_finish`] until the run resolves.
//!
//! ```text
//!          arm            finish
//! Idle ──────────► Awaiting ─────────► Succeeded
//!   │                 │   fail
//!   │ finish / fail   ├─────────────► Failed(cause)
//!   └─────────────────┤   watchdog
//!                     └─────────────► TimedOut
//! ```
//!
//! Resolved states are final. A failure reported after resolution is dropped
//! from the outcome, logged, and kept in [`TestContext::dropped_failures`].

use std::fmt::Debug;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::backend::{Backend, Scheduled, SerialBackend, ThreadBackend};
use crate::config::HarnessConfig;
use crate::error::{BoxError, Failure, HarnessError};

/// How long a waiter keeps waiting for resolution listeners past its
/// watchdog deadline.
const LISTENER_GRACE: Duration = Duration::from_secs(1);

/// Unique identifier of a test run, used to correlate log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub Uuid);

impl RunId {
    /// Create a new random run ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Run State
// ============================================================================

/// Completion state of a run.
#[derive(Debug, Clone)]
pub enum RunState {
    /// Nothing armed the watchdog and nothing resolved the run yet.
    Idle,
    /// The watchdog is armed and the run is waiting for `finish_test`.
    Awaiting {
        /// Duration of the armed watchdog.
        timeout: Duration,
    },
    /// `finish_test` was called.
    Succeeded,
    /// The run failed; holds the first recorded cause.
    Failed(Failure),
    /// The watchdog fired before the run finished.
    TimedOut {
        /// Duration of the watchdog that fired.
        after: Duration,
    },
}

impl RunState {
    /// Returns `true` once the run reached a final state.
    pub fn is_resolved(&self) -> bool {
        self.resolution().is_some()
    }

    /// The final outcome, if resolved.
    pub fn resolution(&self) -> Option<Resolution> {
        match self {
            Self::Idle | Self::Awaiting { .. } => None,
            Self::Succeeded => Some(Resolution::Succeeded),
            Self::Failed(f) => Some(Resolution::Failed(f.clone())),
            Self::TimedOut { after } => Some(Resolution::TimedOut { after: *after }),
        }
    }
}

/// Final outcome of a run.
#[derive(Debug, Clone)]
pub enum Resolution {
    /// The run finished.
    Succeeded,
    /// The run failed with this cause.
    Failed(Failure),
    /// The watchdog fired first.
    TimedOut {
        /// Duration of the watchdog that fired.
        after: Duration,
    },
}

impl Resolution {
    /// Convert into the result the blocking wait returns.
    pub fn into_result(self) -> Result<(), HarnessError> {
        match self {
            Self::Succeeded => Ok(()),
            Self::Failed(f) => Err(HarnessError::Failed(f)),
            Self::TimedOut { after } => Err(HarnessError::TimedOut { after }),
        }
    }
}

enum Event {
    Arm(Duration),
    Finish,
    Fail(Failure),
    Timeout(u64),
}

#[derive(Debug)]
enum Transition {
    Unchanged,
    Armed(u64),
    Resolved(Resolution),
    Dropped(Failure),
}

type Listener = Box<dyn FnOnce(&Resolution) + Send + 'static>;

struct Shared {
    state: RunState,
    /// Generation of the armed watchdog; stale timers compare unequal.
    watchdog: u64,
    /// Backend timer of the armed watchdog, released on resolution.
    timer: Option<Scheduled>,
    dropped: Vec<Failure>,
    listeners: Vec<Listener>,
    /// False while resolution listeners are running.
    settled: bool,
}

impl Shared {
    fn new() -> Self {
        Self {
            state: RunState::Idle,
            watchdog: 0,
            timer: None,
            dropped: Vec::new(),
            listeners: Vec::new(),
            settled: true,
        }
    }

    fn apply(&mut self, event: Event) -> Transition {
        let open = !self.state.is_resolved();
        match event {
            Event::Arm(timeout) if open => {
                self.watchdog += 1;
                self.state = RunState::Awaiting { timeout };
                Transition::Armed(self.watchdog)
            }
            Event::Arm(_) => Transition::Unchanged,
            Event::Finish if open => self.resolve(RunState::Succeeded),
            Event::Finish => Transition::Unchanged,
            Event::Fail(failure) if open => self.resolve(RunState::Failed(failure)),
            Event::Fail(failure) => {
                self.dropped.push(failure.clone());
                Transition::Dropped(failure)
            }
            Event::Timeout(generation) => match self.state {
                RunState::Awaiting { timeout } if generation == self.watchdog => {
                    self.resolve(RunState::TimedOut { after: timeout })
                }
                _ => Transition::Unchanged,
            },
        }
    }

    fn resolve(&mut self, state: RunState) -> Transition {
        self.state = state;
        match self.state.resolution() {
            Some(resolution) => Transition::Resolved(resolution),
            None => Transition::Unchanged,
        }
    }
}

// ============================================================================
// Test Context
// ============================================================================

struct Inner {
    id: RunId,
    backend: Arc<dyn Backend>,
    config: HarnessConfig,
    narrate: AtomicBool,
    shared: Mutex<Shared>,
    changed: Condvar,
}

/// Completion state and scheduling surface of one test run.
///
/// Cloning is cheap; all clones share the same run.
#[derive(Clone)]
pub struct TestContext {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for TestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestContext")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish()
    }
}

impl TestContext {
    /// Create a context scheduling onto `backend`.
    pub fn new(backend: impl Backend, config: HarnessConfig) -> Self {
        Self::with_backend(Arc::new(backend), config)
    }

    /// Create a context sharing an existing backend.
    pub fn with_backend(backend: Arc<dyn Backend>, config: HarnessConfig) -> Self {
        let narrate = AtomicBool::new(config.narrate);
        Self {
            inner: Arc::new(Inner {
                id: RunId::new(),
                backend,
                config,
                narrate,
                shared: Mutex::new(Shared::new()),
                changed: Condvar::new(),
            }),
        }
    }

    /// Context on a fresh [`ThreadBackend`] with default settings.
    pub fn threaded() -> Self {
        Self::new(ThreadBackend::new(), HarnessConfig::default())
    }

    /// Context on a fresh [`SerialBackend`] with default settings.
    pub fn serial() -> Self {
        Self::new(SerialBackend::new(), HarnessConfig::default())
    }

    /// Identifier of this run.
    pub fn id(&self) -> RunId {
        self.inner.id
    }

    /// Settings this context was created with.
    pub fn config(&self) -> &HarnessConfig {
        &self.inner.config
    }

    /// The backend work is scheduled on.
    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.inner.backend
    }

    // ------------------------------------------------------------------------
    // Scheduling
    // ------------------------------------------------------------------------

    /// Run `work` asynchronously after the configured step delay.
    ///
    /// A panic inside `work` fails the run.
    pub fn run_later(&self, work: impl FnOnce() + Send + 'static) {
        self.run_after(self.inner.config.step_delay(), work);
    }

    /// Run `work` asynchronously after `delay`.
    pub fn run_after(&self, delay: Duration, work: impl FnOnce() + Send + 'static) {
        let ctx = self.clone();
        self.inner.backend.schedule_once(
            delay,
            Box::new(move || {
                if let Err(payload) = catch_unwind(AssertUnwindSafe(work)) {
                    ctx.fail_test_with(Failure::from_panic(payload));
                }
            }),
        );
    }

    // ------------------------------------------------------------------------
    // Watchdog
    // ------------------------------------------------------------------------

    /// Arm the watchdog and block until the run resolves.
    ///
    /// Returns `Ok(())` once `finish_test` is called, the first recorded
    /// failure if the run fails, or [`HarnessError::TimedOut`] if neither
    /// happens within `timeout`. A run that resolved before this call returns
    /// its outcome immediately.
    pub fn delay_test_finish(&self, timeout: Duration) -> Result<(), HarnessError> {
        // `None` when the timeout does not fit in an `Instant`: wait forever.
        let deadline = Instant::now().checked_add(timeout);

        if let Transition::Armed(generation) = self.apply(Event::Arm(timeout)) {
            #[cfg(feature = "tracing")]
            tracing::debug!(run = %self.inner.id, ?timeout, "run.armed");

            let run: Weak<Inner> = Arc::downgrade(&self.inner);
            let timer = self.inner.backend.schedule_once(
                timeout,
                Box::new(move || {
                    if let Some(inner) = run.upgrade() {
                        TestContext { inner }.apply(Event::Timeout(generation));
                    }
                }),
            );
            self.keep_timer(generation, timer);
        }

        let mut shared = self.inner.shared.lock();
        loop {
            if shared.settled {
                if let Some(resolution) = shared.state.resolution() {
                    return resolution.into_result();
                }
            }

            let now = Instant::now();
            if shared.state.is_resolved() {
                // Listeners are still running; give them a grace period past
                // the deadline.
                match deadline.and_then(|d| d.checked_add(LISTENER_GRACE)) {
                    Some(limit) if now >= limit => {
                        #[cfg(feature = "tracing")]
                        tracing::warn!(run = %self.inner.id, "resolution listeners still running");

                        if let Some(resolution) = shared.state.resolution() {
                            return resolution.into_result();
                        }
                    }
                    Some(limit) => {
                        self.inner.changed.wait_until(&mut shared, limit);
                    }
                    None => self.inner.changed.wait(&mut shared),
                }
            } else {
                match deadline {
                    Some(deadline) if now >= deadline => {
                        // The backend did not deliver the timer; fire it here.
                        let generation = shared.watchdog;
                        drop(shared);
                        self.apply(Event::Timeout(generation));
                        shared = self.inner.shared.lock();
                    }
                    Some(deadline) => {
                        self.inner.changed.wait_until(&mut shared, deadline);
                    }
                    None => self.inner.changed.wait(&mut shared),
                }
            }
        }
    }

    /// Store the timer of watchdog `generation`, or cancel it if the run
    /// already moved on.
    fn keep_timer(&self, generation: u64, timer: Scheduled) {
        let mut shared = self.inner.shared.lock();
        let stale = if shared.watchdog == generation && !shared.state.is_resolved() {
            shared.timer.replace(timer)
        } else {
            Some(timer)
        };
        drop(shared);

        if let Some(stale) = stale {
            stale.cancel();
        }
    }

    /// [`delay_test_finish`](Self::delay_test_finish) with the configured
    /// default duration.
    pub fn delay_test_finish_default(&self) -> Result<(), HarnessError> {
        self.delay_test_finish(self.inner.config.timeout())
    }

    /// Mark the run as finished. No effect once resolved.
    pub fn finish_test(&self) {
        self.apply(Event::Finish);
    }

    /// Fail the run with `cause` unless it already resolved.
    pub fn fail_test(&self, cause: impl Into<BoxError>) {
        self.fail_test_with(Failure::step(cause));
    }

    /// Fail the run with an already classified failure.
    pub fn fail_test_with(&self, failure: Failure) {
        self.apply(Event::Fail(failure));
    }

    /// Register a one-shot listener for the run's resolution.
    ///
    /// Runs immediately on the calling thread if the run already resolved.
    pub fn on_resolved(&self, listener: impl FnOnce(&Resolution) + Send + 'static) {
        let mut shared = self.inner.shared.lock();
        match shared.state.resolution() {
            Some(resolution) => {
                drop(shared);
                listener(&resolution);
            }
            None => shared.listeners.push(Box::new(listener)),
        }
    }

    fn apply(&self, event: Event) -> Transition {
        let mut shared = self.inner.shared.lock();
        let transition = shared.apply(event);

        match &transition {
            Transition::Resolved(resolution) => {
                let listeners = std::mem::take(&mut shared.listeners);
                let timer = shared.timer.take();
                shared.settled = false;
                drop(shared);

                if let Some(timer) = timer {
                    timer.cancel();
                }

                #[cfg(feature = "tracing")]
                match resolution {
                    Resolution::Succeeded => {
                        tracing::info!(run = %self.inner.id, outcome = "succeeded", "run.resolved")
                    }
                    Resolution::Failed(f) => {
                        tracing::error!(run = %self.inner.id, outcome = "failed", cause = %f, "run.resolved")
                    }
                    Resolution::TimedOut { after } => {
                        tracing::error!(run = %self.inner.id, outcome = "timed_out", ?after, "run.resolved")
                    }
                }

                for listener in listeners {
                    if catch_unwind(AssertUnwindSafe(|| listener(resolution))).is_err() {
                        #[cfg(feature = "tracing")]
                        tracing::error!(run = %self.inner.id, "resolution listener panicked");
                    }
                }

                self.inner.shared.lock().settled = true;
                self.inner.changed.notify_all();
            }
            Transition::Dropped(_failure) => {
                drop(shared);

                #[cfg(feature = "tracing")]
                tracing::warn!(run = %self.inner.id, cause = %_failure, "failure.dropped");
            }
            Transition::Unchanged | Transition::Armed(_) => {}
        }

        transition
    }

    // ------------------------------------------------------------------------
    // State inspection
    // ------------------------------------------------------------------------

    /// Snapshot of the run state.
    pub fn state(&self) -> RunState {
        self.inner.shared.lock().state.clone()
    }

    /// Returns `true` once the run succeeded, failed or timed out.
    pub fn is_resolved(&self) -> bool {
        self.inner.shared.lock().state.is_resolved()
    }

    /// Returns `true` while the watchdog is armed and the run unresolved.
    pub fn is_awaiting_completion(&self) -> bool {
        matches!(self.inner.shared.lock().state, RunState::Awaiting { .. })
    }

    /// Returns `true` if the run failed.
    pub fn has_failed(&self) -> bool {
        matches!(self.inner.shared.lock().state, RunState::Failed(_))
    }

    /// Returns `true` if the watchdog fired.
    pub fn has_timed_out(&self) -> bool {
        matches!(self.inner.shared.lock().state, RunState::TimedOut { .. })
    }

    /// The recorded failure cause, if any.
    pub fn failure_cause(&self) -> Option<Failure> {
        match &self.inner.shared.lock().state {
            RunState::Failed(f) => Some(f.clone()),
            _ => None,
        }
    }

    /// Failures reported after the run had already resolved.
    pub fn dropped_failures(&self) -> Vec<Failure> {
        self.inner.shared.lock().dropped.clone()
    }

    // ------------------------------------------------------------------------
    // Assertions
    // ------------------------------------------------------------------------

    /// Fail the run with `message` (or a default) unless `condition` holds.
    ///
    /// Never panics, so it is safe to call from deferred work. Returns
    /// `condition`.
    pub fn assert_that(&self, condition: bool, message: Option<&str>) -> bool {
        if !condition {
            let rendered = message.unwrap_or("Expected <true> but got <false>.");
            self.fail_test_with(Failure::Assertion(rendered.to_string()));
        }
        condition
    }

    /// Fail the run unless `condition` is true.
    pub fn assert_true(&self, condition: bool) -> bool {
        self.assert_that(condition, None)
    }

    /// Fail the run unless `condition` is false.
    pub fn assert_false(&self, condition: bool) -> bool {
        self.assert_that(!condition, Some("Expected <false> but got <true>."))
    }

    /// Fail the run unless `expected == actual`.
    pub fn assert_equals<E, A>(&self, expected: E, actual: A) -> bool
    where
        E: PartialEq<A> + Debug,
        A: Debug,
    {
        self.assert_equals_msg(expected, actual, None)
    }

    /// Like [`assert_equals`](Self::assert_equals), prefixing the failure
    /// with `message`.
    pub fn assert_equals_msg<E, A>(&self, expected: E, actual: A, message: Option<&str>) -> bool
    where
        E: PartialEq<A> + Debug,
        A: Debug,
    {
        if expected == actual {
            return true;
        }
        let rendered = format!("Expected [{expected:?}] but got [{actual:?}]");
        let rendered = match message {
            Some(message) => format!("{message} {rendered}"),
            None => rendered,
        };
        self.fail_test_with(Failure::Assertion(rendered));
        false
    }

    // ------------------------------------------------------------------------
    // Narration
    // ------------------------------------------------------------------------

    /// Turn `will`/`has` narration on or off.
    pub fn narrate(&self, enabled: bool) {
        self.inner.narrate.store(enabled, Ordering::Relaxed);
    }

    /// Returns `true` if narration is on.
    pub fn is_narrating(&self) -> bool {
        self.inner.narrate.load(Ordering::Relaxed)
    }

    /// Narrate something the test is about to do.
    pub fn will(&self, _what: &str) {
        if self.is_narrating() {
            #[cfg(feature = "tracing")]
            tracing::info!(run = %self.inner.id, "will '{}'", _what);
        }
    }

    /// Narrate something the test has done.
    pub fn has(&self, _what: &str) {
        if self.is_narrating() {
            #[cfg(feature = "tracing")]
            tracing::info!(run = %self.inner.id, "has '{}'", _what);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BackendError;

    fn quick() -> TestContext {
        TestContext::new(
            SerialBackend::new(),
            HarnessConfig::default().with_step_delay(Duration::ZERO),
        )
    }

    /// Swallows everything, including the watchdog timer.
    struct BlackHole;

    impl Backend for BlackHole {
        fn schedule_once(&self, _delay: Duration, _work: crate::Work) -> Scheduled {
            Scheduled::detached()
        }

        fn join(&self) -> Result<(), BackendError> {
            Ok(())
        }
    }

    #[test]
    fn transitions_are_final_once_resolved() {
        let mut shared = Shared::new();
        assert!(matches!(
            shared.apply(Event::Arm(Duration::from_secs(1))),
            Transition::Armed(1)
        ));
        assert!(matches!(
            shared.apply(Event::Finish),
            Transition::Resolved(Resolution::Succeeded)
        ));

        assert!(matches!(shared.apply(Event::Finish), Transition::Unchanged));
        assert!(matches!(shared.apply(Event::Timeout(1)), Transition::Unchanged));
        assert!(matches!(
            shared.apply(Event::Arm(Duration::from_secs(1))),
            Transition::Unchanged
        ));
        assert!(matches!(
            shared.apply(Event::Fail(Failure::step("late"))),
            Transition::Dropped(_)
        ));
        assert!(matches!(shared.state, RunState::Succeeded));
        assert_eq!(shared.dropped.len(), 1);
    }

    #[test]
    fn stale_watchdog_is_ignored() {
        let mut shared = Shared::new();
        shared.apply(Event::Arm(Duration::from_secs(1)));
        shared.apply(Event::Arm(Duration::from_secs(2)));

        assert!(matches!(shared.apply(Event::Timeout(1)), Transition::Unchanged));
        assert!(matches!(
            shared.apply(Event::Timeout(2)),
            Transition::Resolved(Resolution::TimedOut { after }) if after == Duration::from_secs(2)
        ));
    }

    #[test]
    fn finish_from_deferred_work_returns_ok() {
        let ctx = quick();
        let finisher = ctx.clone();
        ctx.run_later(move || finisher.finish_test());

        ctx.delay_test_finish(Duration::from_secs(5))
            .expect("run should succeed");
        assert!(!ctx.is_awaiting_completion());
        assert!(!ctx.has_failed());
        assert!(!ctx.has_timed_out());
    }

    #[test]
    fn resolved_before_arming_returns_immediately() {
        let ctx = quick();
        ctx.finish_test();
        let started = Instant::now();
        assert!(ctx.delay_test_finish(Duration::from_secs(5)).is_ok());
        assert!(started.elapsed() < Duration::from_secs(1));

        let ctx = quick();
        ctx.fail_test("early");
        let err = ctx
            .delay_test_finish(Duration::from_secs(5))
            .expect_err("run should fail");
        assert_eq!(err.to_string(), "test failed: early");
    }

    #[test]
    fn finish_wins_over_later_watchdog() {
        let ctx = quick();
        let finisher = ctx.clone();
        ctx.run_later(move || finisher.finish_test());

        assert!(ctx.delay_test_finish(Duration::from_millis(50)).is_ok());
        std::thread::sleep(Duration::from_millis(120));

        assert!(matches!(ctx.state(), RunState::Succeeded));
        assert!(!ctx.has_timed_out());
    }

    #[test]
    fn first_failure_wins_and_later_ones_are_kept() {
        let ctx = quick();
        let first = ctx.clone();
        let second = ctx.clone();
        ctx.run_later(move || first.fail_test("first"));
        ctx.run_later(move || second.fail_test("second"));

        let err = ctx
            .delay_test_finish(Duration::from_millis(200))
            .expect_err("run should fail");
        assert_eq!(err.failure().map(ToString::to_string).as_deref(), Some("first"));

        // The second failure may still be in flight.
        ctx.backend().join().expect("no work should panic");
        let dropped = ctx.dropped_failures();
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].to_string(), "second");
        assert_eq!(ctx.failure_cause().map(|f| f.to_string()).as_deref(), Some("first"));
    }

    #[test]
    fn panicking_work_fails_the_run() {
        let ctx = quick();
        ctx.run_later(|| panic!("inside work"));

        let err = ctx
            .delay_test_finish(Duration::from_secs(5))
            .expect_err("run should fail");
        assert!(matches!(err.failure(), Some(Failure::Panic(m)) if m == "inside work"));
    }

    #[test]
    fn wait_gives_up_at_deadline_without_backend_timer() {
        let ctx = TestContext::new(BlackHole, HarnessConfig::default());
        let started = Instant::now();

        let err = ctx
            .delay_test_finish(Duration::from_millis(60))
            .expect_err("run should time out");
        assert!(err.is_timeout());
        assert!(started.elapsed() >= Duration::from_millis(60));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn assertions_record_instead_of_panicking() {
        let ctx = quick();
        assert!(ctx.assert_true(true));
        assert!(ctx.assert_equals(4, 2 + 2));
        assert!(!ctx.is_resolved());

        assert!(!ctx.assert_true(false));
        assert!(!ctx.assert_equals("a", "b"));
        assert!(!ctx.assert_false(true));

        match ctx.failure_cause() {
            Some(Failure::Assertion(m)) => assert_eq!(m, "Expected <true> but got <false>."),
            other => panic!("expected assertion failure, got {other:?}"),
        }
        let dropped: Vec<String> = ctx.dropped_failures().iter().map(|f| f.to_string()).collect();
        assert_eq!(
            dropped,
            vec![
                "Expected [\"a\"] but got [\"b\"]".to_string(),
                "Expected <false> but got <true>.".to_string(),
            ]
        );
    }

    #[test]
    fn assert_equals_prefixes_message() {
        let ctx = quick();
        ctx.assert_equals_msg(1, 2, Some("counter mismatch."));
        assert_eq!(
            ctx.failure_cause().map(|f| f.to_string()).as_deref(),
            Some("counter mismatch. Expected [1] but got [2]")
        );
    }

    #[test]
    fn listeners_run_once_before_waiter_returns() {
        let ctx = quick();
        let calls = Arc::new(Mutex::new(Vec::new()));

        let seen = Arc::clone(&calls);
        ctx.on_resolved(move |r| seen.lock().push(format!("{r:?}")));

        let finisher = ctx.clone();
        ctx.run_later(move || {
            finisher.finish_test();
            finisher.finish_test();
        });
        ctx.delay_test_finish(Duration::from_secs(5))
            .expect("run should succeed");
        assert_eq!(*calls.lock(), vec!["Succeeded".to_string()]);

        // Late registration fires immediately.
        let seen = Arc::clone(&calls);
        ctx.on_resolved(move |_| seen.lock().push("late".to_string()));
        assert_eq!(calls.lock().len(), 2);
    }

    #[test]
    fn resolution_releases_the_watchdog_timer() {
        let backend = Arc::new(SerialBackend::new());
        let ctx = TestContext::with_backend(backend.clone(), HarnessConfig::default());
        let finisher = ctx.clone();
        ctx.run_later(move || finisher.finish_test());

        ctx.delay_test_finish(Duration::from_secs(3))
            .expect("run should succeed");
        let started = Instant::now();
        ctx.backend().join().expect("no work should panic");

        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(backend.pending(), 0);
    }

    #[test]
    fn pending_watchdog_does_not_keep_the_run_alive() {
        let backend = Arc::new(SerialBackend::new());
        let ctx = TestContext::with_backend(backend.clone(), HarnessConfig::default());
        let run = Arc::downgrade(&ctx.inner);

        // Arm without resolving: the timer stays queued.
        let err = ctx
            .delay_test_finish(Duration::from_millis(20))
            .expect_err("run should time out");
        assert!(err.is_timeout());
        drop(ctx);

        backend.join().expect("no work should panic");
        assert!(run.upgrade().is_none());
    }

    #[test]
    fn unbounded_timeout_does_not_overflow() {
        let ctx = quick();
        let finisher = ctx.clone();
        ctx.run_later(move || finisher.finish_test());

        ctx.delay_test_finish(Duration::MAX)
            .expect("run should succeed");
        ctx.backend().join().expect("no work should panic");
    }

    #[test]
    fn blocking_listener_cannot_hold_the_waiter_forever() {
        let ctx = quick();
        ctx.on_resolved(|_| std::thread::sleep(Duration::from_secs(4)));
        let finisher = ctx.clone();
        ctx.run_later(move || finisher.finish_test());

        let started = Instant::now();
        ctx.delay_test_finish(Duration::from_millis(50))
            .expect("run should succeed");
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn narration_toggles() {
        let ctx = quick();
        assert!(!ctx.is_narrating());
        ctx.narrate(true);
        assert!(ctx.is_narrating());
        ctx.will("open the door");
        ctx.has("opened the door");
    }
}
