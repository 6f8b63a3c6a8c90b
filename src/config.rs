//! Harness configuration.
//!
//! [`HarnessConfig`] carries the defaults a [`TestContext`](crate::TestContext)
//! is created with. Values come from, in order of precedence:
//!
//! 1. Environment variables (`BATON_TIMEOUT_MS`, `BATON_STEP_DELAY_MS`,
//!    `BATON_NARRATE`) via [`HarnessConfig::from_env`]
//! 2. Whatever the caller deserialized or built
//! 3. Defaults (`Default` impl)

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default watchdog duration in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 15_000;

/// Default delay applied by `run_later` in milliseconds.
pub const DEFAULT_STEP_DELAY_MS: u64 = 1;

/// Settings shared by every context a factory produces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HarnessConfig {
    /// Watchdog duration used by `delay_test_finish_default` and chains.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Delay between a `run_later` call and the work running.
    #[serde(default = "default_step_delay_ms")]
    pub step_delay_ms: u64,
    /// Emit `will`/`has` narration lines.
    #[serde(default)]
    pub narrate: bool,
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

fn default_step_delay_ms() -> u64 {
    DEFAULT_STEP_DELAY_MS
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_TIMEOUT_MS,
            step_delay_ms: DEFAULT_STEP_DELAY_MS,
            narrate: false,
        }
    }
}

impl HarnessConfig {
    /// Defaults with environment overrides applied.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Set the watchdog duration.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Set the `run_later` delay.
    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Enable or disable narration.
    pub fn with_narration(mut self, narrate: bool) -> Self {
        self.narrate = narrate;
        self
    }

    /// Watchdog duration.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// `run_later` delay.
    pub fn step_delay(&self) -> Duration {
        Duration::from_millis(self.step_delay_ms)
    }

    /// Reject values the harness cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "timeout_ms",
                reason: "watchdog duration must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    /// Apply `BATON_*` environment variables. Unparseable values are ignored.
    pub fn apply_env_overrides(&mut self) {
        if let Some(v) = env_parse::<u64>("BATON_TIMEOUT_MS") {
            self.timeout_ms = v;
        }
        if let Some(v) = env_parse::<u64>("BATON_STEP_DELAY_MS") {
            self.step_delay_ms = v;
        }
        if let Some(v) = env_parse::<bool>("BATON_NARRATE") {
            self.narrate = v;
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            #[cfg(feature = "tracing")]
            tracing::warn!(key, value = %raw, "ignoring unparseable environment override");
            None
        }
    }
}
