//! Error types for runs, backends and configuration.

use std::sync::Arc;
use std::time::Duration;

/// Boxed error accepted from steps and `fail_test`.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The recorded cause of a failed run.
///
/// Every way a run can fail, other than running out of time, converges on
/// this type. It is cheap to clone so both the monitor and the waiting
/// thread can receive it.
#[derive(thiserror::Error, Debug, Clone)]
pub enum Failure {
    /// A step (or test code) reported failure explicitly.
    #[error("{0}")]
    Step(Arc<dyn std::error::Error + Send + Sync + 'static>),

    /// A step or deferred work panicked instead of using its callback.
    #[error("panicked: {0}")]
    Panic(String),

    /// An assertion helper detected a violated expectation.
    #[error("{0}")]
    Assertion(String),
}

impl Failure {
    /// Wrap any error (or message) as an explicit step failure.
    pub fn step(cause: impl Into<BoxError>) -> Self {
        Self::Step(Arc::from(cause.into()))
    }

    /// Build a failure from a caught panic payload.
    pub fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        Self::Panic(panic_message(&*payload))
    }
}

/// Extract the message out of a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Outcome error surfaced by the blocking watchdog wait.
#[derive(thiserror::Error, Debug, Clone)]
pub enum HarnessError {
    /// The run failed; carries the first recorded cause.
    #[error("test failed: {0}")]
    Failed(Failure),

    /// Nobody finished the run before the watchdog fired.
    #[error("finish_test() not called in time (waited {after:?})")]
    TimedOut {
        /// The watchdog duration that elapsed.
        after: Duration,
    },
}

impl HarnessError {
    /// Returns `true` if this is a watchdog timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::TimedOut { .. })
    }

    /// The recorded failure, if the run failed rather than timed out.
    pub fn failure(&self) -> Option<&Failure> {
        match self {
            Self::Failed(f) => Some(f),
            Self::TimedOut { .. } => None,
        }
    }
}

/// Errors reported by a backend when joining outstanding work.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// A unit of scheduled work panicked.
    #[error("scheduled work panicked: {0}")]
    WorkPanicked(String),
}

/// Invalid harness configuration.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A field holds a value outside its allowed range.
    #[error("invalid config value for '{field}': {reason}")]
    InvalidValue {
        /// Name of the offending field.
        field: &'static str,
        /// Why the value was rejected.
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_failure_keeps_message() {
        let f = Failure::step("boom");
        assert_eq!(f.to_string(), "boom");

        let err = HarnessError::Failed(f);
        assert!(err.to_string().contains("boom"));
        assert!(!err.is_timeout());
        assert!(err.failure().is_some());
    }

    #[test]
    fn panic_payloads_are_rendered() {
        let f = Failure::from_panic(Box::new("static str"));
        assert_eq!(f.to_string(), "panicked: static str");

        let f = Failure::from_panic(Box::new(String::from("owned")));
        assert_eq!(f.to_string(), "panicked: owned");

        let f = Failure::from_panic(Box::new(42_u32));
        assert_eq!(f.to_string(), "panicked: non-string panic payload");
    }

    #[test]
    fn timeout_is_its_own_kind() {
        let err = HarnessError::TimedOut {
            after: Duration::from_millis(100),
        };
        assert!(err.is_timeout());
        assert!(err.failure().is_none());
        assert!(err.to_string().contains("finish_test() not called in time"));
    }
}
