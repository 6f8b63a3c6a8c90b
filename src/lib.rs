#![deny(missing_docs)]

//! Baton: step chains for asynchronous unit tests.
//!
//! # Design Goals
//!
//! Baton lets a test express "schedule work, wait for a callback, schedule
//! more work, wait again" as a list of steps, while the test thread blocks on
//! a single call that reports how the run ended:
//!
//! - **Strictly sequential**: a step starts only after the previous one
//!   signalled completion, and only one step is in flight at a time
//! - **One outcome**: step failures, panics and assertion failures all
//!   converge on the run's failure recorder; the first one wins
//! - **Never hangs**: a watchdog bounds every blocking wait
//!
//! # Core Concepts
//!
//! - [`Step`]: A unit of test logic that signals through a [`StepCallback`]
//! - [`Chain`]: An ordered list of steps, driven by the executor
//! - [`TestContext`]: Completion state, scheduling, watchdog and assertions
//! - [`Backend`]: Where deferred work actually runs
//! - [`Monitor`]: Receives the chain's terminal outcome exactly once
//!
//! # Example
//!
//! ```ignore
//! use baton::{chain, step_fn, NoopMonitor, TestContext};
//!
//! let ctx = TestContext::threaded();
//! chain![
//!     step_fn(|ctx, done| ctx.run_later(move || done.on_step_completed())),
//!     step_fn(|ctx, done| {
//!         ctx.assert_equals(2, 1 + 1);
//!         done.on_step_completed();
//!     }),
//! ]
//! .run(&ctx, NoopMonitor)?;
//! ```

// Modules
pub mod backend;
pub mod config;
pub mod context;
pub mod error;
pub mod execution;
pub mod factory;
mod macros;
pub mod step;

// Re-exports for convenience
pub use backend::{Backend, Scheduled, SerialBackend, ThreadBackend, TokioBackend, Work};
pub use config::{HarnessConfig, DEFAULT_STEP_DELAY_MS, DEFAULT_TIMEOUT_MS};
pub use context::{Resolution, RunId, RunState, TestContext};
pub use error::{BackendError, BoxError, ConfigError, Failure, HarnessError};
pub use execution::{Chain, ChainHandle, ChainReport, ChainState, StepStatus, StepTiming};
pub use factory::{
    new_test, ContextFactory, SerialContextFactory, SharedBackendFactory, ThreadContextFactory,
};
pub use step::{step_fn, AsyncStep, FnStep, Monitor, NoopMonitor, Spawned, Step, StepCallback};

#[cfg(test)]
mod tests;
