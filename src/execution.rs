//! Step-chain execution.
//!
//! A [`Chain`] runs its steps strictly one after another. Each step is
//! started through [`TestContext::run_later`]; when it signals completion the
//! next one is scheduled the same way, never inline. The first failure, a
//! panic inside `process`, or the watchdog ends the run, and the chain's
//! [`Monitor`] hears about the outcome exactly once.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::context::{RunId, TestContext};
use crate::error::{Failure, HarnessError};
use crate::step::{step_fn, Monitor, Step, StepCallback};

/// Get the current Unix timestamp in milliseconds.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ============================================================================
// Step Timing
// ============================================================================

/// Outcome of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepStatus {
    /// `process` was called and the step has not signalled yet.
    Running,
    /// The step signalled completion.
    Completed,
    /// The step signalled failure.
    Failed,
    /// `process` panicked.
    Panicked,
    /// The step was skipped, or signalled, after the run had already
    /// resolved.
    Abandoned,
}

/// Timing information for a single step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepTiming {
    /// Index of the step.
    pub step_index: usize,
    /// When the step started (Unix timestamp ms).
    pub started_at: u64,
    /// When the step signalled (Unix timestamp ms), if it did.
    pub completed_at: Option<u64>,
    /// Current status of the step.
    pub status: StepStatus,
    /// Whether `process` was called.
    pub processed: bool,
}

impl StepTiming {
    /// Create a timing record for a step that just started.
    pub fn new(step_index: usize) -> Self {
        Self {
            step_index,
            started_at: now_millis(),
            completed_at: None,
            status: StepStatus::Running,
            processed: true,
        }
    }

    /// Mark the step as finished with the given status.
    pub fn complete(&mut self, status: StepStatus) {
        self.completed_at = Some(now_millis());
        self.status = status;
    }

    /// Get the duration in milliseconds, if finished.
    pub fn duration_ms(&self) -> Option<u64> {
        self.completed_at
            .map(|end| end.saturating_sub(self.started_at))
    }
}

// ============================================================================
// Chain State
// ============================================================================

/// Cursor and timing records of a running chain.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChainState {
    /// Index of the most recently started step.
    index: usize,
    /// Whether the last step completed.
    finished: bool,
    /// Timing records, in start order.
    timings: Vec<StepTiming>,
}

impl ChainState {
    /// Create an empty chain state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Index of the most recently started step.
    pub fn current_index(&self) -> usize {
        self.index
    }

    /// Returns `true` once the last step completed.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Record that the step at `index` started.
    pub fn record_step_start(&mut self, index: usize) {
        self.index = index;
        self.timings.push(StepTiming::new(index));
    }

    /// Record the signal of the step at `index`.
    ///
    /// Only the first signal of a running step is kept.
    pub fn record_step_end(&mut self, index: usize, status: StepStatus) {
        if let Some(timing) = self
            .timings
            .iter_mut()
            .rev()
            .find(|t| t.step_index == index)
        {
            if timing.status == StepStatus::Running {
                timing.complete(status);
            }
        }
    }

    /// Record that the step at `index` was skipped because the run resolved.
    pub fn record_abandoned(&mut self, index: usize) {
        let mut timing = StepTiming::new(index);
        timing.complete(StepStatus::Abandoned);
        timing.processed = false;
        self.timings.push(timing);
    }

    /// Get all step timing records.
    pub fn step_timings(&self) -> &[StepTiming] {
        &self.timings
    }

    /// Get the timing for a specific step by index.
    pub fn timing_for_step(&self, index: usize) -> Option<&StepTiming> {
        self.timings.iter().find(|t| t.step_index == index)
    }
}

/// Snapshot of a chain run for diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainReport {
    /// The run the chain belongs to.
    pub run_id: RunId,
    /// Number of steps in the chain.
    pub steps: usize,
    /// Whether the last step completed.
    pub finished: bool,
    /// Timing records, in start order.
    pub timings: Vec<StepTiming>,
}

impl ChainReport {
    /// Indices of the steps whose `process` was called, in order.
    pub fn started(&self) -> Vec<usize> {
        self.timings
            .iter()
            .filter(|t| t.processed)
            .map(|t| t.step_index)
            .collect()
    }

    /// Status of the step at `index`, if it started.
    pub fn status_of(&self, index: usize) -> Option<StepStatus> {
        self.timings
            .iter()
            .find(|t| t.step_index == index)
            .map(|t| t.status)
    }
}

// ============================================================================
// Chain
// ============================================================================

/// Ordered sequence of steps run by one test.
#[derive(Default)]
pub struct Chain {
    steps: Vec<Box<dyn Step>>,
    timeout: Option<Duration>,
}

impl Chain {
    /// Create an empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a step.
    pub fn then(mut self, step: impl Step) -> Self {
        self.push(step);
        self
    }

    /// Append a closure step.
    pub fn then_fn<F>(self, f: F) -> Self
    where
        F: Fn(&TestContext, StepCallback) + Send + Sync + 'static,
    {
        self.then(step_fn(f))
    }

    /// Append a step in place.
    pub fn push(&mut self, step: impl Step) {
        self.steps.push(Box::new(step));
    }

    /// Override the watchdog duration armed by [`run`](Self::run).
    ///
    /// Defaults to the context's configured timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Number of steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns `true` if the chain has no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Run the chain and block until it resolves.
    ///
    /// An empty chain returns `Ok(())` at once without notifying `monitor`
    /// or arming the watchdog.
    pub fn run(self, ctx: &TestContext, monitor: impl Monitor) -> Result<(), HarnessError> {
        match self.launch(ctx, monitor) {
            Some(handle) => handle.wait(),
            None => Ok(()),
        }
    }

    /// Register the chain and schedule its first step without blocking.
    ///
    /// Returns `None` for an empty chain.
    pub fn launch(self, ctx: &TestContext, monitor: impl Monitor) -> Option<ChainHandle> {
        if self.steps.is_empty() {
            return None;
        }

        let timeout = self.timeout.unwrap_or_else(|| ctx.config().timeout());
        let run = Arc::new(ChainRun {
            steps: self.steps,
            ctx: ctx.clone(),
            timeout,
            state: Mutex::new(ChainState::new()),
        });

        ctx.on_resolved(move |resolution| match resolution.clone().into_result() {
            Ok(()) => monitor.on_last_step_completed(),
            Err(error) => monitor.on_failure(&error),
        });

        #[cfg(feature = "tracing")]
        tracing::debug!(run = %ctx.id(), steps = run.steps.len(), "chain.launch");

        run.schedule(0);
        Some(ChainHandle { run })
    }
}

impl From<Vec<Box<dyn Step>>> for Chain {
    fn from(steps: Vec<Box<dyn Step>>) -> Self {
        Self {
            steps,
            timeout: None,
        }
    }
}

impl FromIterator<Box<dyn Step>> for Chain {
    fn from_iter<I: IntoIterator<Item = Box<dyn Step>>>(iter: I) -> Self {
        Self::from(iter.into_iter().collect::<Vec<_>>())
    }
}

impl std::fmt::Debug for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chain")
            .field("steps", &self.steps.len())
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Handle to a launched chain.
pub struct ChainHandle {
    run: Arc<ChainRun>,
}

impl ChainHandle {
    /// The context the chain runs in.
    pub fn context(&self) -> &TestContext {
        &self.run.ctx
    }

    /// Arm the watchdog with the chain's timeout and block until the run
    /// resolves.
    pub fn wait(&self) -> Result<(), HarnessError> {
        self.run.ctx.delay_test_finish(self.run.timeout)
    }

    /// Snapshot of the chain's progress.
    pub fn report(&self) -> ChainReport {
        let state = self.run.state.lock();
        ChainReport {
            run_id: self.run.ctx.id(),
            steps: self.run.steps.len(),
            finished: state.is_finished(),
            timings: state.step_timings().to_vec(),
        }
    }
}

// ============================================================================
// Chain Run (Internal)
// ============================================================================

/// Shared state of a launched chain, referenced by its step callbacks.
pub(crate) struct ChainRun {
    steps: Vec<Box<dyn Step>>,
    ctx: TestContext,
    timeout: Duration,
    state: Mutex<ChainState>,
}

impl ChainRun {
    pub(crate) fn ctx(&self) -> &TestContext {
        &self.ctx
    }

    fn schedule(self: &Arc<Self>, index: usize) {
        let run = Arc::clone(self);
        self.ctx.run_later(move || run.execute(index));
    }

    fn execute(self: Arc<Self>, index: usize) {
        let Some(step) = self.steps.get(index) else {
            return;
        };

        if self.ctx.is_resolved() {
            self.state.lock().record_abandoned(index);

            #[cfg(feature = "tracing")]
            tracing::debug!(run = %self.ctx.id(), step = index, outcome = "abandoned", "step.end");

            return;
        }

        self.state.lock().record_step_start(index);

        #[cfg(feature = "tracing")]
        tracing::info!(run = %self.ctx.id(), step = index, "step.start");

        let callback = StepCallback::new(Arc::clone(&self), index);
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| step.process(&self.ctx, callback))) {
            self.step_failed(index, Failure::from_panic(payload), StepStatus::Panicked);
        }
    }

    pub(crate) fn step_completed(self: &Arc<Self>, index: usize) {
        if self.ctx.is_resolved() {
            self.state.lock().record_step_end(index, StepStatus::Abandoned);

            #[cfg(feature = "tracing")]
            tracing::debug!(run = %self.ctx.id(), step = index, outcome = "late", "step.end");

            return;
        }

        self.state.lock().record_step_end(index, StepStatus::Completed);

        #[cfg(feature = "tracing")]
        tracing::info!(run = %self.ctx.id(), step = index, outcome = "completed", "step.end");

        if index + 1 < self.steps.len() {
            self.schedule(index + 1);
            return;
        }

        self.state.lock().finished = true;

        #[cfg(feature = "tracing")]
        tracing::info!(run = %self.ctx.id(), steps = self.steps.len(), "chain.complete");

        self.ctx.finish_test();
    }

    pub(crate) fn step_failed(&self, index: usize, failure: Failure, status: StepStatus) {
        let status = if self.ctx.is_resolved() {
            StepStatus::Abandoned
        } else {
            status
        };
        self.state.lock().record_step_end(index, status);

        #[cfg(feature = "tracing")]
        tracing::error!(
            run = %self.ctx.id(),
            step = index,
            outcome = ?status,
            cause = %failure,
            "step.end"
        );

        self.ctx.fail_test_with(failure);
    }
}
