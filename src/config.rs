//! Runtime configuration for an [`EventLoop`](crate::EventLoop).
//!
//! Defaults work out of the box. `RunnerConfig::from_env` loads a `.env` file
//! if present and then reads:
//!
//! - `DEFERRON_IO_THREADS`: size of the I/O worker pool
//! - `DEFERRON_CLOCK`: `system` or `virtual`
//! - `DEFERRON_HTTP_TIMEOUT_MS`: timeout applied to HTTP requests

use std::time::Duration;

use dotenv::dotenv;

use crate::error::RunnerError;

const IO_THREADS_VAR: &str = "DEFERRON_IO_THREADS";
const CLOCK_VAR: &str = "DEFERRON_CLOCK";
const HTTP_TIMEOUT_VAR: &str = "DEFERRON_HTTP_TIMEOUT_MS";

/// Which clock drives the timers of a loop.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ClockKind {
    /// Wall-clock time; the loop parks the thread until the next deadline.
    #[default]
    System,

    /// Simulated time; an idle loop jumps straight to the next deadline.
    Virtual,
}

impl std::str::FromStr for ClockKind {
    type Err = RunnerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "system" => Ok(ClockKind::System),
            "virtual" => Ok(ClockKind::Virtual),
            other => Err(RunnerError::Config(format!(
                "{CLOCK_VAR} must be `system` or `virtual`, got `{other}`"
            ))),
        }
    }
}

#[derive(Clone, Debug)]
pub struct RunnerConfig {
    pub(crate) io_threads: usize,
    pub(crate) clock: ClockKind,
    pub(crate) http_timeout: Duration,
    pub(crate) io_wait_slice: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            io_threads: 4,
            clock: ClockKind::System,
            http_timeout: Duration::from_secs(30),
            io_wait_slice: Duration::from_millis(5),
        }
    }
}

impl RunnerConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a configuration from the process environment.
    ///
    /// Unset variables keep their default. A variable that is set but cannot
    /// be parsed is an error.
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError::Config`] describing the offending variable.
    pub fn from_env() -> Result<Self, RunnerError> {
        dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, RunnerError> {
        let mut config = Self::default();
        if let Some(threads) = lookup(IO_THREADS_VAR) {
            let threads = threads.trim().parse::<usize>().map_err(|e| {
                RunnerError::Config(format!("{IO_THREADS_VAR}=`{threads}`: {e}"))
            })?;
            config = config.io_threads(threads)?;
        }
        if let Some(clock) = lookup(CLOCK_VAR) {
            config.clock = clock.parse()?;
        }
        if let Some(timeout) = lookup(HTTP_TIMEOUT_VAR) {
            let millis = timeout.trim().parse::<u64>().map_err(|e| {
                RunnerError::Config(format!("{HTTP_TIMEOUT_VAR}=`{timeout}`: {e}"))
            })?;
            config.http_timeout = Duration::from_millis(millis);
        }
        Ok(config)
    }

    /// Sets the number of worker threads used for I/O requests.
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError::Config`] if `threads` is zero.
    pub fn io_threads(mut self, threads: usize) -> Result<Self, RunnerError> {
        if threads == 0 {
            return Err(RunnerError::Config(
                "the I/O pool needs at least one thread".to_string(),
            ));
        }
        self.io_threads = threads;
        Ok(self)
    }

    pub fn clock(mut self, clock: ClockKind) -> Self {
        self.clock = clock;
        self
    }

    pub fn http_timeout(mut self, timeout: Duration) -> Self {
        self.http_timeout = timeout;
        self
    }

    /// How long a virtual-clock loop parks at a time while waiting for I/O.
    pub fn io_wait_slice(mut self, slice: Duration) -> Self {
        self.io_wait_slice = slice;
        self
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn unset_variables_keep_defaults() {
        let config = RunnerConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.io_threads, 4);
        assert_eq!(config.clock, ClockKind::System);
        assert_eq!(config.http_timeout, Duration::from_secs(30));
    }

    #[test]
    fn variables_override_defaults() {
        let config = RunnerConfig::from_lookup(lookup(&[
            (IO_THREADS_VAR, "2"),
            (CLOCK_VAR, " Virtual "),
            (HTTP_TIMEOUT_VAR, "1500"),
        ]))
        .unwrap();
        assert_eq!(config.io_threads, 2);
        assert_eq!(config.clock, ClockKind::Virtual);
        assert_eq!(config.http_timeout, Duration::from_millis(1500));
    }

    #[test]
    fn bad_values_are_rejected() {
        assert!(matches!(
            RunnerConfig::from_lookup(lookup(&[(IO_THREADS_VAR, "0")])),
            Err(RunnerError::Config(_))
        ));
        assert!(matches!(
            RunnerConfig::from_lookup(lookup(&[(CLOCK_VAR, "lunar")])),
            Err(RunnerError::Config(_))
        ));
        assert!(matches!(
            RunnerConfig::from_lookup(lookup(&[(HTTP_TIMEOUT_VAR, "soon")])),
            Err(RunnerError::Config(_))
        ));
    }
}
