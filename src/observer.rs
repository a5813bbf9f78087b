//! Where task outcomes are presented.
//!
//! The loop reports unhandled rejections to its [`Observer`] on its own;
//! everything else is reported by user code through
//! [`Handle::report`](crate::Handle::report) and
//! [`Handle::report_failure`](crate::Handle::report_failure).

use std::{cell::RefCell, fmt, rc::Rc, time::Duration};

use crate::error::Failure;

/// How a reported failure was dealt with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Handling {
    /// A handler received the failure.
    Recovered,

    /// The task was rejected and dropped without anyone observing it.
    Unhandled,
}

impl fmt::Display for Handling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Handling::Recovered => write!(f, "recovered"),
            Handling::Unhandled => write!(f, "unhandled"),
        }
    }
}

/// Receives outcomes from the event loop. `at` is the loop time of the report.
pub trait Observer {
    fn report(&self, at: Duration, value: &dyn fmt::Display);

    fn report_failure(&self, at: Duration, failure: &Failure, handling: Handling);
}

/// Emits every report as a `tracing` event. This is the default observer.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingObserver;

impl Observer for TracingObserver {
    fn report(&self, at: Duration, value: &dyn fmt::Display) {
        tracing::info!(target: "deferron::observer", ?at, "{value}");
    }

    fn report_failure(&self, at: Duration, failure: &Failure, handling: Handling) {
        match handling {
            Handling::Recovered => tracing::warn!(
                target: "deferron::observer",
                ?at,
                kind = failure.kind(),
                "{failure}"
            ),
            Handling::Unhandled => tracing::error!(
                target: "deferron::observer",
                ?at,
                kind = failure.kind(),
                "unhandled rejection: {failure}"
            ),
        }
    }
}

/// Prints values to stdout and failures to stderr.
#[derive(Clone, Copy, Debug, Default)]
pub struct ConsoleObserver;

impl Observer for ConsoleObserver {
    fn report(&self, _at: Duration, value: &dyn fmt::Display) {
        println!("{value}");
    }

    fn report_failure(&self, _at: Duration, failure: &Failure, handling: Handling) {
        match handling {
            Handling::Recovered => eprintln!("{failure}"),
            Handling::Unhandled => eprintln!("unhandled rejection: {failure}"),
        }
    }
}

/// One entry captured by a [`RecordingObserver`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Report {
    Value {
        at: Duration,
        text: String,
    },
    Failure {
        at: Duration,
        failure: Failure,
        handling: Handling,
    },
}

impl Report {
    #[must_use]
    pub fn at(&self) -> Duration {
        match self {
            Report::Value { at, .. } | Report::Failure { at, .. } => *at,
        }
    }
}

/// Keeps every report in memory. Clones share the same log.
#[derive(Clone, Debug, Default)]
pub struct RecordingObserver {
    log: Rc<RefCell<Vec<Report>>>,
}

impl RecordingObserver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn reports(&self) -> Vec<Report> {
        self.log.borrow().clone()
    }

    /// Texts of the value reports, in order.
    #[must_use]
    pub fn values(&self) -> Vec<String> {
        self.log
            .borrow()
            .iter()
            .filter_map(|r| match r {
                Report::Value { text, .. } => Some(text.clone()),
                Report::Failure { .. } => None,
            })
            .collect()
    }

    /// Failures with their handling, in order.
    #[must_use]
    pub fn failures(&self) -> Vec<(Failure, Handling)> {
        self.log
            .borrow()
            .iter()
            .filter_map(|r| match r {
                Report::Failure {
                    failure, handling, ..
                } => Some((failure.clone(), *handling)),
                Report::Value { .. } => None,
            })
            .collect()
    }
}

impl Observer for RecordingObserver {
    fn report(&self, at: Duration, value: &dyn fmt::Display) {
        self.log.borrow_mut().push(Report::Value {
            at,
            text: value.to_string(),
        });
    }

    fn report_failure(&self, at: Duration, failure: &Failure, handling: Handling) {
        self.log.borrow_mut().push(Report::Failure {
            at,
            failure: failure.clone(),
            handling,
        });
    }
}
