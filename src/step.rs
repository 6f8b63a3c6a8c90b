//! Step and monitor traits.
//!
//! A [`Step`] is one unit of asynchronous test logic. It receives the run's
//! [`TestContext`] and a [`StepCallback`], schedules whatever work it needs,
//! and eventually consumes the callback with either
//! [`on_step_completed`](StepCallback::on_step_completed) or
//! [`on_failure`](StepCallback::on_failure).

use std::sync::Arc;

use crate::context::TestContext;
use crate::error::{BoxError, Failure, HarnessError};
use crate::execution::{ChainRun, StepStatus};

/// A unit of test logic in a chain.
///
/// `process` must arrange for exactly one of the callback's methods to be
/// called. Both consume the callback, so signalling twice does not compile.
/// A step that never signals stalls the chain until the watchdog fires.
pub trait Step: Send + Sync + 'static {
    /// Start the step.
    fn process(&self, ctx: &TestContext, callback: StepCallback);
}

impl<S: Step + ?Sized> Step for Box<S> {
    fn process(&self, ctx: &TestContext, callback: StepCallback) {
        (**self).process(ctx, callback)
    }
}

impl<S: Step + ?Sized> Step for Arc<S> {
    fn process(&self, ctx: &TestContext, callback: StepCallback) {
        (**self).process(ctx, callback)
    }
}

/// Step backed by a closure. Built with [`step_fn`].
pub struct FnStep<F>(F);

/// Turn a closure into a [`Step`].
///
/// ```ignore
/// let step = step_fn(|ctx, done| ctx.run_later(move || done.on_step_completed()));
/// ```
pub fn step_fn<F>(f: F) -> FnStep<F>
where
    F: Fn(&TestContext, StepCallback) + Send + Sync + 'static,
{
    FnStep(f)
}

impl<F> Step for FnStep<F>
where
    F: Fn(&TestContext, StepCallback) + Send + Sync + 'static,
{
    fn process(&self, ctx: &TestContext, callback: StepCallback) {
        (self.0)(ctx, callback)
    }
}

// ============================================================================
// Step Callback
// ============================================================================

/// Completion signal handed to a step.
pub struct StepCallback {
    run: Arc<ChainRun>,
    index: usize,
    signalled: bool,
}

impl StepCallback {
    pub(crate) fn new(run: Arc<ChainRun>, index: usize) -> Self {
        Self {
            run,
            index,
            signalled: false,
        }
    }

    /// Position of the step in its chain.
    pub fn index(&self) -> usize {
        self.index
    }

    /// The step finished; the chain moves on.
    pub fn on_step_completed(mut self) {
        self.signalled = true;
        ChainRun::step_completed(&self.run, self.index);
    }

    /// The step failed; the run fails with `cause` and the chain stops.
    pub fn on_failure(self, cause: impl Into<BoxError>) {
        self.fail_with(Failure::step(cause), StepStatus::Failed);
    }

    pub(crate) fn fail_with(mut self, failure: Failure, status: StepStatus) {
        self.signalled = true;
        self.run.step_failed(self.index, failure, status);
    }
}

impl Drop for StepCallback {
    fn drop(&mut self) {
        if !self.signalled {
            #[cfg(feature = "tracing")]
            tracing::warn!(
                run = %self.run.ctx().id(),
                step = self.index,
                "callback.dropped"
            );
        }
    }
}

impl std::fmt::Debug for StepCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepCallback")
            .field("index", &self.index)
            .finish()
    }
}

// ============================================================================
// Async Steps
// ============================================================================

/// A step written as an `async fn`.
///
/// Run it in a chain by wrapping it in [`Spawned`].
#[async_trait::async_trait]
pub trait AsyncStep: Send + Sync + 'static {
    /// Run the step to completion.
    async fn run(&self, ctx: &TestContext) -> Result<(), BoxError>;
}

/// Adapts an [`AsyncStep`] to [`Step`] by spawning it on a `tokio` runtime.
///
/// `Ok` completes the step, `Err` fails it, and a panicking future is
/// reported as a panic.
pub struct Spawned<S> {
    step: Arc<S>,
    handle: tokio::runtime::Handle,
}

impl<S: AsyncStep> Spawned<S> {
    /// Spawn `step` on the runtime behind `handle`.
    pub fn new(step: S, handle: tokio::runtime::Handle) -> Self {
        Self {
            step: Arc::new(step),
            handle,
        }
    }
}

impl<S: AsyncStep> Step for Spawned<S> {
    fn process(&self, ctx: &TestContext, callback: StepCallback) {
        let step = Arc::clone(&self.step);
        let ctx = ctx.clone();
        let handle = self.handle.clone();
        self.handle.spawn(async move {
            let task = handle.spawn(async move { step.run(&ctx).await });
            match settle(task.await) {
                None => callback.on_step_completed(),
                Some((failure, status)) => callback.fail_with(failure, status),
            }
        });
    }
}

/// Failure and step status for a spawned step that did not return `Ok`.
fn settle(
    joined: Result<Result<(), BoxError>, tokio::task::JoinError>,
) -> Option<(Failure, StepStatus)> {
    match joined {
        Ok(Ok(())) => None,
        Ok(Err(cause)) => Some((Failure::step(cause), StepStatus::Failed)),
        Err(e) if e.is_panic() => Some((Failure::from_panic(e.into_panic()), StepStatus::Panicked)),
        Err(_) => Some((Failure::step("step task was cancelled"), StepStatus::Failed)),
    }
}

// ============================================================================
// Monitor
// ============================================================================

/// Observer of a chain's terminal outcome.
///
/// Exactly one of the two methods is called, once. Methods should return
/// quickly: a blocked waiter stops waiting for them one second past its
/// watchdog deadline.
pub trait Monitor: Send + Sync + 'static {
    /// Every step completed.
    fn on_last_step_completed(&self);

    /// The run failed or timed out.
    fn on_failure(&self, error: &HarnessError);
}

impl<M: Monitor + ?Sized> Monitor for Arc<M> {
    fn on_last_step_completed(&self) {
        (**self).on_last_step_completed()
    }

    fn on_failure(&self, error: &HarnessError) {
        (**self).on_failure(error)
    }
}

/// Monitor that ignores both outcomes.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMonitor;

impl Monitor for NoopMonitor {
    fn on_last_step_completed(&self) {}

    fn on_failure(&self, _error: &HarnessError) {}
}
