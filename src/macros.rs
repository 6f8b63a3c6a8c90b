//! Macros for building chains.

/// Build a [`Chain`](crate::Chain) from a list of steps.
///
/// Steps are run in the order they are listed. Closures must be wrapped with
/// [`step_fn`](crate::step_fn) so their signature can be inferred.
///
/// ```ignore
/// let chain = chain![
///     step_fn(|ctx, done| ctx.run_later(move || done.on_step_completed())),
///     LoadFixture,
/// ];
/// ```
#[macro_export]
macro_rules! chain {
    () => {
        $crate::Chain::new()
    };
    ($($step:expr),+ $(,)?) => {
        $crate::Chain::new()$(.then($step))+
    };
}
