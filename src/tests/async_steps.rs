//! Async step tests.
//!
//! Tests for `AsyncStep` wrapped in `Spawned`, run against the tokio backend.

use std::time::Duration;

use crate::{
    chain, AsyncStep, BoxError, Failure, HarnessConfig, Spawned, StepStatus, TestContext,
    TokioBackend,
};

use super::common::{init_test_logging, Journal, RecordingMonitor};

/// Sleeps, then records its label.
struct Sleepy {
    journal: Journal,
    label: &'static str,
}

#[async_trait::async_trait]
impl AsyncStep for Sleepy {
    async fn run(&self, _ctx: &TestContext) -> Result<(), BoxError> {
        tokio::time::sleep(Duration::from_millis(10)).await;
        self.journal.push(self.label);
        Ok(())
    }
}

/// Fails after an await point.
struct Refuses;

#[async_trait::async_trait]
impl AsyncStep for Refuses {
    async fn run(&self, _ctx: &TestContext) -> Result<(), BoxError> {
        tokio::task::yield_now().await;
        Err("refused".into())
    }
}

/// Panics after an await point.
struct Crashes;

#[async_trait::async_trait]
impl AsyncStep for Crashes {
    async fn run(&self, _ctx: &TestContext) -> Result<(), BoxError> {
        tokio::task::yield_now().await;
        panic!("async step crashed");
    }
}

fn runtime() -> tokio::runtime::Runtime {
    init_test_logging();
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_time()
        .build()
        .expect("runtime should build")
}

fn tokio_ctx(runtime: &tokio::runtime::Runtime) -> TestContext {
    TestContext::new(
        TokioBackend::new(runtime.handle().clone()),
        HarnessConfig::default().with_step_delay(Duration::ZERO),
    )
}

/// Async steps run in order on the tokio backend.
#[test]
fn async_chain_completes() {
    let runtime = runtime();
    let ctx = tokio_ctx(&runtime);
    let journal = Journal::default();
    let monitor = RecordingMonitor::new();
    let handle = runtime.handle().clone();

    chain![
        Spawned::new(
            Sleepy {
                journal: journal.clone(),
                label: "one",
            },
            handle.clone(),
        ),
        Spawned::new(
            Sleepy {
                journal: journal.clone(),
                label: "two",
            },
            handle,
        ),
    ]
    .with_timeout(Duration::from_secs(5))
    .run(&ctx, monitor.clone())
    .expect("chain should complete");

    assert_eq!(journal.entries(), vec!["one", "two"]);
    assert_eq!(monitor.completed(), 1);
}

/// `Err` from an async step fails the run with that cause.
#[test]
fn async_error_fails_the_run() {
    let runtime = runtime();
    let ctx = tokio_ctx(&runtime);

    let err = chain![Spawned::new(Refuses, runtime.handle().clone())]
        .with_timeout(Duration::from_secs(5))
        .run(&ctx, crate::NoopMonitor)
        .expect_err("chain should fail");

    assert!(matches!(err.failure(), Some(Failure::Step(cause)) if cause.to_string() == "refused"));
}

/// A panicking async step is reported as a panic, not a timeout.
#[test]
fn async_panic_is_reported() {
    let runtime = runtime();
    let ctx = tokio_ctx(&runtime);

    let handle = chain![Spawned::new(Crashes, runtime.handle().clone())]
        .with_timeout(Duration::from_secs(5))
        .launch(&ctx, crate::NoopMonitor)
        .expect("non-empty chain should launch");
    let err = handle.wait().expect_err("chain should fail");

    assert!(matches!(err.failure(), Some(Failure::Panic(m)) if m == "async step crashed"));
    assert_eq!(handle.report().status_of(0), Some(StepStatus::Panicked));
}
