//! Failure descriptors carried by rejected tasks and errors returned by the
//! loop driver itself.
//!
//! A [`Failure`] is what a [`Task`](crate::Task) settles with when it is
//! rejected. It is cheap to clone because the same failure is handed to every
//! continuation registered on the task. [`RunnerError`] is different: it is
//! returned by [`EventLoop`](crate::EventLoop) methods when the loop itself
//! cannot make progress, never through a task.

use thiserror::Error;

/// Errors raised by an [`IoProvider`](crate::io::IoProvider).
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum IoError {
    /// The named file or URL does not exist.
    #[error("resource not found: {resource}")]
    NotFound { resource: String },

    /// The request could not be completed (connection, timeout, bad status).
    #[error("network failure: {message}")]
    NetworkFailure { message: String },

    /// The payload arrived but could not be decoded.
    #[error("decode failure: {message}")]
    DecodeFailure { message: String },

    /// Any other provider error, e.g. a permission problem on a local file.
    #[error("i/o failure: {message}")]
    Other { message: String },
}

impl IoError {
    /// Short kind name, used as the `kind` of the enclosing [`Failure`].
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            IoError::NotFound { .. } => "NotFound",
            IoError::NetworkFailure { .. } => "NetworkFailure",
            IoError::DecodeFailure { .. } => "DecodeFailure",
            IoError::Other { .. } => "Other",
        }
    }

    pub(crate) fn from_fs(path: &std::path::Path, err: &std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => IoError::NotFound {
                resource: path.display().to_string(),
            },
            _ => IoError::Other {
                message: format!("{}: {err}", path.display()),
            },
        }
    }
}

/// The reason a task was rejected.
///
/// Every failure has a `kind` and a human readable `message`. Failures coming
/// out of a [`Workflow`](crate::workflow::Workflow) keep the failure of the
/// step that stopped it, reachable through [`Failure::origin`].
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum Failure {
    /// An I/O request failed.
    #[error("{0}")]
    Io(#[from] IoError),

    /// A workflow step (1-based) signaled failure.
    #[error("workflow step {step} failed: {cause}")]
    Workflow { step: usize, cause: Box<Failure> },

    /// Rejection raised by user code.
    #[error("{kind}: {message}")]
    Rejected { kind: String, message: String },
}

impl Failure {
    /// Creates a user rejection with the given kind and message.
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Failure::Rejected {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Wraps `cause` as the failure of workflow step `step`.
    #[must_use]
    pub fn at_step(step: usize, cause: Failure) -> Self {
        Failure::Workflow {
            step,
            cause: Box::new(cause),
        }
    }

    #[must_use]
    pub fn kind(&self) -> &str {
        match self {
            Failure::Io(e) => e.kind(),
            Failure::Workflow { .. } => "WorkflowFailure",
            Failure::Rejected { kind, .. } => kind,
        }
    }

    #[must_use]
    pub fn message(&self) -> String {
        match self {
            Failure::Io(e) => e.to_string(),
            Failure::Workflow { cause, .. } => cause.message(),
            Failure::Rejected { message, .. } => message.clone(),
        }
    }

    /// Returns the failure that started the propagation, unwrapping any
    /// workflow layers.
    #[must_use]
    pub fn origin(&self) -> &Failure {
        let mut current = self;
        while let Failure::Workflow { cause, .. } = current {
            current = cause;
        }
        current
    }
}

/// Errors returned by the loop driver.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// `run` or `run_until` was called from inside a job of the same loop.
    #[error("event loop is already running")]
    AlreadyRunning,

    /// The loop ran out of work while the awaited task was still pending.
    #[error("event loop drained with task {0} still pending")]
    Stalled(crate::TaskId),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),
}
