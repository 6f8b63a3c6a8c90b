//! Tests for step chains and the watchdog protocol.
//!
//! ## Test Organization
//!
//! - `common`: Shared journal, monitor and step implementations
//! - `basic`: Successful chains, ordering and the empty chain
//! - `failure`: Step failures, panics, assertions and first-failure-wins
//! - `timeout`: Watchdog behaviour and late callbacks
//! - `async_steps`: `AsyncStep` on a tokio runtime
//! - `factory`: Context factories and `new_test`
//!
//! ## Test Steps
//!
//! All tests use a "journal" domain with these steps:
//! - `Record`: Writes `label:start`, then `label:done` from deferred work
//! - `FailWith`: Writes `label:start`, then fails from deferred work
//! - `Hang`: Writes `label:start` and never signals
//! - `Explode`: Panics inside `process`

mod common;

mod async_steps;
