//! Failure handling combinators for futures that resolve to a task outcome.

use std::{
    future::IntoFuture,
    pin::Pin,
    rc::Weak,
    task::{Context, Poll},
};

use pin_project_lite::pin_project;

use crate::{
    Handle, Task,
    error::Failure,
    event_loop::Shared,
    observer::Handling,
    task::{Awaiting, IntoOutcome},
};

/// Extend outcome futures (`Future<Output = Result<T, Failure>>`) with
/// failure handling used by workflows.
pub trait TaskExt<T>: Future<Output = Result<T, Failure>> {
    /// Wraps a failure of this future as the failure of workflow step `step`.
    fn at_step(self, step: usize) -> AtStep<Self>
    where
        Self: Sized,
    {
        AtStep { future: self, step }
    }

    /// Hands a failure to `handler` and continues with the handler's outcome.
    ///
    /// The failure is reported to the loop's observer as recovered before the
    /// handler runs. The handler may return a `Result` or a `Task`.
    fn recover<H, R>(self, handle: &Handle, handler: H) -> Recover<Self, H, T>
    where
        Self: Sized,
        H: FnOnce(Failure) -> R,
        R: IntoOutcome<T>,
    {
        Recover {
            future: self,
            handler: Some(handler),
            runtime: handle.shared.weak(),
            recovering: None,
        }
    }
}

impl<T, F> TaskExt<T> for F where F: Future<Output = Result<T, Failure>> {}

pin_project! {
    /// Future returned by [`TaskExt::at_step`].
    #[must_use = "futures do nothing unless polled or .awaited"]
    pub struct AtStep<F> {
        #[pin]
        future: F,
        step: usize,
    }
}

impl<T, F> Future for AtStep<F>
where
    F: Future<Output = Result<T, Failure>>,
{
    type Output = Result<T, Failure>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let step = *this.step;
        this.future
            .poll(cx)
            .map(|outcome| outcome.map_err(|failure| Failure::at_step(step, failure)))
    }
}

pin_project! {
    /// Future returned by [`TaskExt::recover`].
    #[must_use = "futures do nothing unless polled or .awaited"]
    pub struct Recover<F, H, T> {
        #[pin]
        future: F,
        handler: Option<H>,
        runtime: Weak<Shared>,
        recovering: Option<Awaiting<T>>,
    }
}

impl<T, F, H, R> Future for Recover<F, H, T>
where
    T: Clone + 'static,
    F: Future<Output = Result<T, Failure>>,
    H: FnOnce(Failure) -> R,
    R: IntoOutcome<T>,
{
    type Output = Result<T, Failure>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        if let Some(recovering) = this.recovering.as_mut() {
            return Pin::new(recovering).poll(cx);
        }

        let failure = match this.future.poll(cx) {
            Poll::Ready(Ok(value)) => return Poll::Ready(Ok(value)),
            Poll::Ready(Err(failure)) => failure,
            Poll::Pending => return Poll::Pending,
        };
        let Some(handler) = this.handler.take() else {
            return Poll::Ready(Err(failure));
        };

        if let Some(shared) = this.runtime.upgrade() {
            shared.report_failure(&failure, Handling::Recovered);
        }
        tracing::debug!(kind = failure.kind(), "recovering from failure");
        let task = Task::from_outcome(this.runtime.clone(), handler(failure));
        let recovering = this.recovering.insert(task.into_future());
        Pin::new(recovering).poll(cx)
    }
}
