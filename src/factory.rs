//! Context factories and the one-call test entry point.

use std::sync::Arc;

use crate::backend::{Backend, SerialBackend, ThreadBackend};
use crate::config::HarnessConfig;
use crate::context::TestContext;
use crate::error::HarnessError;

/// Produces a fresh [`TestContext`] for every test run.
///
/// This is the seam between production backends and the deterministic one
/// used in the crate's own tests.
pub trait ContextFactory: Send + Sync {
    /// Create a context for a new run.
    fn new_context(&self) -> TestContext;
}

impl<F> ContextFactory for F
where
    F: Fn() -> TestContext + Send + Sync,
{
    fn new_context(&self) -> TestContext {
        self()
    }
}

/// Creates contexts on a new [`ThreadBackend`] each.
#[derive(Debug, Clone, Default)]
pub struct ThreadContextFactory {
    config: HarnessConfig,
}

impl ThreadContextFactory {
    /// Factory producing contexts with `config`.
    pub fn new(config: HarnessConfig) -> Self {
        Self { config }
    }
}

impl ContextFactory for ThreadContextFactory {
    fn new_context(&self) -> TestContext {
        TestContext::new(ThreadBackend::new(), self.config.clone())
    }
}

/// Creates contexts on a new [`SerialBackend`] each.
#[derive(Debug, Clone, Default)]
pub struct SerialContextFactory {
    config: HarnessConfig,
}

impl SerialContextFactory {
    /// Factory producing contexts with `config`.
    pub fn new(config: HarnessConfig) -> Self {
        Self { config }
    }
}

impl ContextFactory for SerialContextFactory {
    fn new_context(&self) -> TestContext {
        TestContext::new(SerialBackend::new(), self.config.clone())
    }
}

/// Creates contexts that all share one backend.
pub struct SharedBackendFactory {
    backend: Arc<dyn Backend>,
    config: HarnessConfig,
}

impl SharedBackendFactory {
    /// Factory scheduling every context onto `backend`.
    pub fn new(backend: Arc<dyn Backend>, config: HarnessConfig) -> Self {
        Self { backend, config }
    }
}

impl ContextFactory for SharedBackendFactory {
    fn new_context(&self) -> TestContext {
        TestContext::with_backend(Arc::clone(&self.backend), self.config.clone())
    }
}

/// Run `def` against a fresh context and block until the run resolves.
///
/// `def` runs deferred on the context's backend; a panic inside it fails the
/// run. The watchdog uses the factory's configured timeout.
pub fn new_test<C, F>(factory: &C, def: F) -> Result<(), HarnessError>
where
    C: ContextFactory + ?Sized,
    F: FnOnce(&TestContext) + Send + 'static,
{
    let ctx = factory.new_context();
    let runner = ctx.clone();
    ctx.run_later(move || def(&runner));
    ctx.delay_test_finish_default()
}
