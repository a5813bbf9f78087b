//! Defines the `Task` handle and the machinery that settles it.
//!
//! A `Task<T>` is a handle to the eventual outcome of deferred work: it starts
//! `Pending` and settles exactly once, either `Fulfilled` with a `T` or
//! `Rejected` with a [`Failure`]. Handles are cheap to clone and all clones
//! observe the same outcome.
//!
//! Continuations registered with [`Task::then`] and friends never run inline.
//! When the task settles (or right away, if it already has) each continuation
//! is pushed onto the event loop's queue in registration order. A continuation
//! may return another `Task`, in which case the task returned by `then` stays
//! pending until that inner task settles.
//!
//! This module also provides [`Settler`], the write side of a task, and the
//! [`IntoOutcome`] trait that lets handlers return either a plain `Result` or a
//! nested `Task`.
use std::{
    cell::RefCell,
    fmt,
    future::IntoFuture,
    pin::Pin,
    rc::{Rc, Weak},
    sync::atomic::{AtomicU64, Ordering},
    task::{Context, Poll, Waker},
};

use crate::{error::Failure, event_loop::Shared, observer::Handling};

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier of a task, allocated when the task is created.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(u64);

impl TaskId {
    fn next() -> Self {
        TaskId(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[must_use]
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Observable lifecycle state of a task.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Fulfilled,
    Rejected,
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskState::Pending => write!(f, "pending"),
            TaskState::Fulfilled => write!(f, "fulfilled"),
            TaskState::Rejected => write!(f, "rejected"),
        }
    }
}

type Continuation<T> = Box<dyn FnOnce(Result<T, Failure>)>;

// Result and failure share one enum so that a settled task holds exactly one
// of them.
enum Slot<T> {
    Pending(Vec<Continuation<T>>),
    Fulfilled(T),
    Rejected(Failure),
}

impl<T: Clone> Slot<T> {
    fn outcome(&self) -> Option<Result<T, Failure>> {
        match self {
            Slot::Pending(_) => None,
            Slot::Fulfilled(value) => Some(Ok(value.clone())),
            Slot::Rejected(failure) => Some(Err(failure.clone())),
        }
    }
}

struct Inner<T> {
    id: TaskId,
    slot: Slot<T>,
    // Set once anything looks at the outcome: a continuation, an await or a
    // peek. Rejections that are never observed get reported on drop.
    observed: bool,
    wakers: Vec<Waker>,
    runtime: Weak<Shared>,
}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        let Slot::Rejected(failure) = &self.slot else {
            return;
        };
        if self.observed {
            return;
        }
        tracing::warn!(task = %self.id, "rejected task dropped without a handler: {failure}");
        if let Some(shared) = self.runtime.upgrade() {
            shared.report_failure(failure, Handling::Unhandled);
        }
    }
}

/// A handle to the eventual outcome of deferred work.
///
/// Tasks are created by the event loop (timers, I/O requests, workflows,
/// [`Handle::deferred`](crate::Handle::deferred)) and by registering
/// continuations on other tasks. They can be awaited inside a workflow, which
/// yields `Result<T, Failure>`.
pub struct Task<T> {
    inner: Rc<RefCell<Inner<T>>>,
}

impl<T> Clone for Task<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}

impl<T> Task<T> {
    pub(crate) fn pending(runtime: Weak<Shared>) -> (Task<T>, Settler<T>) {
        let inner = Rc::new(RefCell::new(Inner {
            id: TaskId::next(),
            slot: Slot::Pending(Vec::new()),
            observed: false,
            wakers: Vec::new(),
            runtime,
        }));
        let task = Task {
            inner: Rc::clone(&inner),
        };
        (task, Settler { inner })
    }

    #[must_use]
    pub fn id(&self) -> TaskId {
        self.inner.borrow().id
    }

    #[must_use]
    pub fn state(&self) -> TaskState {
        match self.inner.borrow().slot {
            Slot::Pending(_) => TaskState::Pending,
            Slot::Fulfilled(_) => TaskState::Fulfilled,
            Slot::Rejected(_) => TaskState::Rejected,
        }
    }

    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.state() != TaskState::Pending
    }

    fn runtime(&self) -> Weak<Shared> {
        self.inner.borrow().runtime.clone()
    }
}

impl<T: Clone + 'static> Task<T> {
    /// Builds a task that settles with whatever `outcome` settles with.
    pub(crate) fn from_outcome<R: IntoOutcome<T>>(runtime: Weak<Shared>, outcome: R) -> Task<T> {
        let (task, settler) = Task::pending(runtime);
        outcome.settle_into(settler);
        task
    }

    /// Returns the outcome if the task has settled.
    ///
    /// Peeking counts as observing the outcome, so a rejection that was
    /// peeked at is not reported as unhandled.
    #[must_use]
    pub fn peek(&self) -> Option<Result<T, Failure>> {
        let mut inner = self.inner.borrow_mut();
        let outcome = inner.slot.outcome();
        if outcome.is_some() {
            inner.observed = true;
        }
        outcome
    }

    // Registers a continuation, or enqueues it straight away when the task has
    // already settled.
    fn subscribe(&self, continuation: Continuation<T>) {
        let mut inner = self.inner.borrow_mut();
        inner.observed = true;
        let outcome = match &mut inner.slot {
            Slot::Pending(continuations) => {
                continuations.push(continuation);
                return;
            }
            Slot::Fulfilled(value) => Ok(value.clone()),
            Slot::Rejected(failure) => Err(failure.clone()),
        };
        let runtime = inner.runtime.clone();
        let id = inner.id;
        drop(inner);

        match runtime.upgrade() {
            Some(shared) => shared.enqueue(Box::new(move || continuation(outcome))),
            None => tracing::warn!(task = %id, "event loop is gone, continuation dropped"),
        }
    }

    /// Registers a pair of handlers and returns a task for their outcome.
    ///
    /// Exactly one of `on_success` or `on_failure` runs, once, on the event
    /// loop after this task settles. Either handler may return a
    /// `Result<U, Failure>` or a `Task<U>`; in the latter case the returned
    /// task settles only when that inner task does.
    ///
    /// # Example
    /// ```
    /// # use deferron::{EventLoop, Failure};
    /// # use std::time::Duration;
    /// let lp = EventLoop::builder().virtual_clock().build();
    /// let h = lp.handle();
    ///
    /// let price = lp
    ///     .schedule_after(Duration::from_millis(10), || Ok::<_, Failure>(41))
    ///     .then(
    ///         move |n| h.schedule_after(Duration::from_millis(10), move || Ok::<_, Failure>(n + 1)),
    ///         |failure| Err::<i32, _>(failure),
    ///     );
    ///
    /// assert_eq!(lp.run_until(&price).unwrap(), Ok(42));
    /// ```
    pub fn then<U, S, RS, F, RF>(&self, on_success: S, on_failure: F) -> Task<U>
    where
        U: Clone + 'static,
        S: FnOnce(T) -> RS + 'static,
        RS: IntoOutcome<U>,
        F: FnOnce(Failure) -> RF + 'static,
        RF: IntoOutcome<U>,
    {
        let (task, settler) = Task::pending(self.runtime());
        self.subscribe(Box::new(move |outcome| match outcome {
            Ok(value) => on_success(value).settle_into(settler),
            Err(failure) => on_failure(failure).settle_into(settler),
        }));
        task
    }

    /// Runs `on_success` if the task is fulfilled; a rejection passes through
    /// unchanged.
    pub fn and_then<U, S, RS>(&self, on_success: S) -> Task<U>
    where
        U: Clone + 'static,
        S: FnOnce(T) -> RS + 'static,
        RS: IntoOutcome<U>,
    {
        self.then(on_success, Err::<U, Failure>)
    }

    /// Runs `on_failure` if the task is rejected; a value passes through
    /// unchanged.
    pub fn or_else<F, RF>(&self, on_failure: F) -> Task<T>
    where
        F: FnOnce(Failure) -> RF + 'static,
        RF: IntoOutcome<T>,
    {
        self.then(Ok::<T, Failure>, on_failure)
    }

    /// Transforms the fulfilled value.
    pub fn map<U, M>(&self, map: M) -> Task<U>
    where
        U: Clone + 'static,
        M: FnOnce(T) -> U + 'static,
    {
        self.and_then(move |value| Ok::<U, Failure>(map(value)))
    }

    /// Error-first style callback: `callback` receives the outcome once.
    pub fn on_settle(&self, callback: impl FnOnce(Result<T, Failure>) + 'static) {
        self.subscribe(Box::new(callback));
    }

    // Settles `settler` with this task's outcome once it is known.
    fn forward(&self, settler: Settler<T>) {
        self.subscribe(Box::new(move |outcome| settler.settle(outcome)));
    }
}

/// The write side of a task.
///
/// A `Settler` is consumed by settling, so a task it belongs to can only be
/// settled through it once. Dropping it without settling leaves the task
/// pending forever.
pub struct Settler<T> {
    inner: Rc<RefCell<Inner<T>>>,
}

impl<T> fmt::Debug for Settler<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settler")
            .field("task", &self.inner.borrow().id)
            .finish()
    }
}

impl<T: Clone + 'static> Settler<T> {
    #[must_use]
    pub fn id(&self) -> TaskId {
        self.inner.borrow().id
    }

    pub fn resolve(self, value: T) {
        self.settle(Ok(value));
    }

    pub fn reject(self, failure: Failure) {
        self.settle(Err(failure));
    }

    /// Moves the task out of `Pending` and schedules its continuations.
    ///
    /// A task that has already settled keeps its first outcome.
    pub fn settle(self, outcome: Result<T, Failure>) {
        let mut inner = self.inner.borrow_mut();
        let id = inner.id;
        let continuations = match &mut inner.slot {
            Slot::Pending(continuations) => std::mem::take(continuations),
            _ => {
                tracing::debug!(task = %id, "ignoring second settlement");
                return;
            }
        };
        inner.slot = match &outcome {
            Ok(value) => Slot::Fulfilled(value.clone()),
            Err(failure) => Slot::Rejected(failure.clone()),
        };
        let wakers = std::mem::take(&mut inner.wakers);
        let runtime = inner.runtime.clone();
        drop(inner);

        tracing::debug!(
            task = %id,
            state = if outcome.is_ok() { "fulfilled" } else { "rejected" },
            continuations = continuations.len(),
            "task settled"
        );

        match runtime.upgrade() {
            Some(shared) => {
                for continuation in continuations {
                    let outcome = outcome.clone();
                    shared.enqueue(Box::new(move || continuation(outcome)));
                }
            }
            None if !continuations.is_empty() => {
                tracing::warn!(task = %id, "event loop is gone, continuations dropped");
            }
            None => {}
        }
        for waker in wakers {
            waker.wake();
        }
    }
}

/// Something a handler can hand back to settle a task: a plain `Result`, or
/// another `Task` whose outcome is adopted once it settles.
pub trait IntoOutcome<T> {
    fn settle_into(self, settler: Settler<T>);
}

impl<T: Clone + 'static> IntoOutcome<T> for Result<T, Failure> {
    fn settle_into(self, settler: Settler<T>) {
        settler.settle(self);
    }
}

impl<T: Clone + 'static> IntoOutcome<T> for Task<T> {
    fn settle_into(self, settler: Settler<T>) {
        self.forward(settler);
    }
}

/// Future returned by awaiting a [`Task`].
///
/// Awaiting always suspends at least once, even on a task that has already
/// settled, so other queued work gets a turn before the workflow resumes.
#[must_use = "futures do nothing unless polled or .awaited"]
pub struct Awaiting<T> {
    task: Task<T>,
    yielded: bool,
}

impl<T: Clone> Future for Awaiting<T> {
    type Output = Result<T, Failure>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut inner = this.task.inner.borrow_mut();
        inner.observed = true;

        let outcome = inner.slot.outcome();
        match outcome {
            None => {
                if !inner.wakers.iter().any(|w| w.will_wake(cx.waker())) {
                    inner.wakers.push(cx.waker().clone());
                }
                this.yielded = true;
                Poll::Pending
            }
            Some(_) if !this.yielded => {
                this.yielded = true;
                cx.waker().wake_by_ref();
                Poll::Pending
            }
            Some(outcome) => Poll::Ready(outcome),
        }
    }
}

impl<T: Clone> IntoFuture for Task<T> {
    type Output = Result<T, Failure>;
    type IntoFuture = Awaiting<T>;

    fn into_future(self) -> Self::IntoFuture {
        Awaiting {
            task: self,
            yielded: false,
        }
    }
}
