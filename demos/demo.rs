//! Chain demo showing a passing, a failing and a stalled test.
//!
//! Run with: cargo run --example demo
//!
//! Set `RUST_LOG=baton=debug` to see the harness events.

use std::time::Duration;

use baton::{
    chain, step_fn, AsyncStep, BoxError, HarnessConfig, HarnessError, Monitor, Spawned, Step,
    StepCallback, TestContext, TokioBackend,
};

// ============================================================================
// Monitor
// ============================================================================

/// Prints what the chain reports.
struct Printer(&'static str);

impl Monitor for Printer {
    fn on_last_step_completed(&self) {
        println!("  [{}] monitor: last step completed", self.0);
    }

    fn on_failure(&self, error: &HarnessError) {
        println!("  [{}] monitor: failure: {}", self.0, error);
    }
}

// ============================================================================
// Step implementations
// ============================================================================

/// Simulates a request that answers after `latency`.
struct FetchGreeting {
    latency: Duration,
}

impl Step for FetchGreeting {
    fn process(&self, ctx: &TestContext, done: StepCallback) {
        println!("  [FetchGreeting] sending request...");
        let checker = ctx.clone();
        ctx.run_after(self.latency, move || {
            let greeting = "hello";
            println!("  [FetchGreeting] got {greeting:?}");
            if checker.assert_equals("hello", greeting) {
                done.on_step_completed();
            }
        });
    }
}

/// Rejects every request.
struct RejectOrder;

impl Step for RejectOrder {
    fn process(&self, ctx: &TestContext, done: StepCallback) {
        println!("  [RejectOrder] submitting order...");
        ctx.run_later(move || done.on_failure("order rejected: out of stock"));
    }
}

/// Waits for an answer that never comes.
struct AwaitNothing;

impl Step for AwaitNothing {
    fn process(&self, _ctx: &TestContext, _done: StepCallback) {
        println!("  [AwaitNothing] waiting for a reply that never comes...");
    }
}

/// Async lookup on the tokio runtime.
struct Lookup;

#[async_trait::async_trait]
impl AsyncStep for Lookup {
    async fn run(&self, ctx: &TestContext) -> Result<(), BoxError> {
        println!("  [Lookup] resolving...");
        tokio::time::sleep(Duration::from_millis(50)).await;
        ctx.assert_true(true);
        println!("  [Lookup] resolved");
        Ok(())
    }
}

// ============================================================================
// Scenarios
// ============================================================================

fn main() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("off")),
        )
        .try_init();

    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║           Baton Chain Demo                                   ║");
    println!("╚══════════════════════════════════════════════════════════════╝\n");

    let config = match HarnessConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("invalid configuration: {err}");
            std::process::exit(2);
        }
    };

    // Scenario 1: every step completes
    run_happy_path(&config);

    // Scenario 2: the second step fails, the third never runs
    run_failing_step(&config);

    // Scenario 3: a step never signals and the watchdog fires
    run_stalled_step(&config);

    // Scenario 4: async steps on a tokio runtime
    run_async_steps(&config);

    println!("\n✓ All demos completed!");
}

fn run_happy_path(config: &HarnessConfig) {
    println!("━━━ Scenario 1: Happy path ━━━\n");

    let ctx = TestContext::new(baton::ThreadBackend::new(), config.clone());
    let handle = chain![
        FetchGreeting {
            latency: Duration::from_millis(100),
        },
        step_fn(|ctx, done| {
            println!("  [Finish] wrapping up");
            ctx.run_later(move || done.on_step_completed());
        }),
    ]
    .launch(&ctx, Printer("happy"))
    .expect("chain has steps");

    match handle.wait() {
        Ok(()) => println!("\n  ✓ Test passed"),
        Err(err) => println!("\n  ✗ Test failed: {err}"),
    }

    for timing in handle.report().timings {
        println!(
            "  step {} -> {:?} ({:?} ms)",
            timing.step_index,
            timing.status,
            timing.duration_ms()
        );
    }
    println!();
}

fn run_failing_step(config: &HarnessConfig) {
    println!("━━━ Scenario 2: Failing step ━━━\n");

    let ctx = TestContext::new(baton::ThreadBackend::new(), config.clone());
    let result = chain![
        FetchGreeting {
            latency: Duration::from_millis(50),
        },
        RejectOrder,
        step_fn(|_, done| {
            println!("  [Unreachable] this should never print");
            done.on_step_completed();
        }),
    ]
    .run(&ctx, Printer("failing"));

    match result {
        Ok(()) => println!("\n  ✓ Test passed (unexpected)\n"),
        Err(err) => println!("\n  ✗ Test failed as expected: {err}\n"),
    }
}

fn run_stalled_step(config: &HarnessConfig) {
    println!("━━━ Scenario 3: Stalled step ━━━\n");

    let ctx = TestContext::new(baton::ThreadBackend::new(), config.clone());
    let result = chain![AwaitNothing]
        .with_timeout(Duration::from_millis(300))
        .run(&ctx, Printer("stalled"));

    match result {
        Err(err) if err.is_timeout() => println!("\n  ✗ Timed out as expected: {err}\n"),
        Err(err) => println!("\n  ✗ Failed: {err}\n"),
        Ok(()) => println!("\n  ✓ Test passed (unexpected)\n"),
    }
}

fn run_async_steps(config: &HarnessConfig) {
    println!("━━━ Scenario 4: Async steps ━━━\n");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_time()
        .build()
        .expect("tokio runtime");
    let handle = runtime.handle().clone();

    let ctx = TestContext::new(TokioBackend::new(handle.clone()), config.clone());
    let result = chain![
        Spawned::new(Lookup, handle.clone()),
        Spawned::new(Lookup, handle),
    ]
    .run(&ctx, Printer("async"));

    match result {
        Ok(()) => println!("\n  ✓ Test passed"),
        Err(err) => println!("\n  ✗ Test failed: {err}"),
    }
}
