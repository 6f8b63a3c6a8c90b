//! Common types and step implementations for tests.
//!
//! This module contains:
//! - `init_test_logging`: tracing subscriber for test output
//! - `serial_ctx`: Context on the deterministic backend
//! - `Journal`: Ordered log of what steps did
//! - `RecordingMonitor`: Monitor that counts its notifications
//! - Step implementations: `Record`, `FailWith`, `Hang`, `Explode`

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use parking_lot::Mutex;

use crate::{HarnessConfig, HarnessError, Monitor, SerialBackend, Step, StepCallback, TestContext};

static INIT_LOGGING: Once = Once::new();

/// Initialize test logging once per process.
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
            )
            .with_test_writer()
            .with_thread_names(true)
            .with_ansi(false)
            .try_init();
    });
}

/// Context on a fresh serial backend, with no `run_later` delay.
pub fn serial_ctx() -> TestContext {
    init_test_logging();
    TestContext::new(
        SerialBackend::new(),
        HarnessConfig::default().with_step_delay(Duration::ZERO),
    )
}

// ============================================================================
// Journal
// ============================================================================

/// Ordered record of step activity, shared across threads.
#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    pub fn contains(&self, entry: &str) -> bool {
        self.0.lock().iter().any(|e| e == entry)
    }
}

// ============================================================================
// Monitor
// ============================================================================

/// Counts every notification it receives.
#[derive(Default)]
pub struct RecordingMonitor {
    pub completed: AtomicUsize,
    pub failures: Mutex<Vec<HarnessError>>,
}

impl RecordingMonitor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn failures(&self) -> Vec<HarnessError> {
        self.failures.lock().clone()
    }

    /// Total notifications of either kind.
    pub fn total(&self) -> usize {
        self.completed() + self.failures.lock().len()
    }
}

impl Monitor for RecordingMonitor {
    fn on_last_step_completed(&self) {
        self.completed.fetch_add(1, Ordering::SeqCst);
    }

    fn on_failure(&self, error: &HarnessError) {
        self.failures.lock().push(error.clone());
    }
}

// ============================================================================
// Step Implementations
// ============================================================================

/// Writes `label:start`, then `label:done` from deferred work and completes.
pub struct Record {
    pub journal: Journal,
    pub label: &'static str,
}

impl Step for Record {
    fn process(&self, ctx: &TestContext, done: StepCallback) {
        self.journal.push(format!("{}:start", self.label));
        let journal = self.journal.clone();
        let label = self.label;
        ctx.run_later(move || {
            journal.push(format!("{label}:done"));
            done.on_step_completed();
        });
    }
}

/// Writes `label:start`, then fails with `message` from deferred work.
pub struct FailWith {
    pub journal: Journal,
    pub label: &'static str,
    pub message: &'static str,
}

impl Step for FailWith {
    fn process(&self, ctx: &TestContext, done: StepCallback) {
        self.journal.push(format!("{}:start", self.label));
        let message = self.message;
        ctx.run_later(move || done.on_failure(message));
    }
}

/// Writes `label:start` and never signals.
pub struct Hang {
    pub journal: Journal,
    pub label: &'static str,
}

impl Step for Hang {
    fn process(&self, _ctx: &TestContext, _done: StepCallback) {
        self.journal.push(format!("{}:start", self.label));
    }
}

/// Panics inside `process`.
pub struct Explode;

impl Step for Explode {
    fn process(&self, _ctx: &TestContext, _done: StepCallback) {
        panic!("step exploded");
    }
}
