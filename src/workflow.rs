//! Sequential workflows that suspend on tasks.
//!
//! A workflow is a future that runs on the event loop. Inside it, awaiting a
//! [`Task`] suspends the workflow and lets other queued jobs run; it resumes
//! once the task settles, with the value or with the failure ready for `?`.
//!
//! Workflows can be written as `async` blocks and started with
//! [`Handle::spawn_workflow`], or assembled step by step with [`Workflow`] and
//! started with [`Handle::run_workflow`].

use std::{
    cell::{Cell, RefCell},
    collections::{HashMap, VecDeque},
    future::IntoFuture,
    pin::Pin,
    rc::Weak,
    sync::{Arc, Mutex, PoisonError},
    task::{Context, Poll, Waker},
    thread::Thread,
};

use futures::task::{ArcWake, waker};
use pin_project_lite::pin_project;

use crate::{
    Handle, Task,
    error::Failure,
    event_loop::Shared,
    task::{IntoOutcome, Settler},
    task_ext::TaskExt,
};

type LocalFuture = Pin<Box<dyn Future<Output = ()>>>;

// A suspended workflow with the one waker it is always polled with, so that
// tasks it awaits can recognise repeat registrations.
struct Parked {
    future: LocalFuture,
    waker: Waker,
}

// Woken workflow ids. Wakers are `Send + Sync`, so this is the one piece of
// workflow state that is behind a lock.
type WakeList = Arc<Mutex<VecDeque<u64>>>;

struct WorkflowWaker {
    id: u64,
    woken: WakeList,
    loop_thread: Thread,
}

impl ArcWake for WorkflowWaker {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self
            .woken
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(arc_self.id);
        arc_self.loop_thread.unpark();
    }
}

/// Workflows known to a loop. A workflow is polled only from a queued job,
/// and only after something woke it.
pub(crate) struct Workflows {
    next_id: Cell<u64>,
    parked: RefCell<HashMap<u64, Parked>>,
    woken: WakeList,
    loop_thread: Thread,
}

impl Workflows {
    pub(crate) fn new(loop_thread: Thread) -> Self {
        Self {
            next_id: Cell::new(0),
            parked: RefCell::new(HashMap::with_capacity(8)),
            woken: Arc::new(Mutex::new(VecDeque::new())),
            loop_thread,
        }
    }

    fn spawn(&self, future: LocalFuture) -> u64 {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        let waker = waker(Arc::new(WorkflowWaker {
            id,
            woken: Arc::clone(&self.woken),
            loop_thread: self.loop_thread.clone(),
        }));
        self.parked.borrow_mut().insert(id, Parked { future, waker });
        // First poll happens on a later turn, like any other wake.
        self.lock_woken().push_back(id);
        id
    }

    fn lock_woken(&self) -> std::sync::MutexGuard<'_, VecDeque<u64>> {
        self.woken.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Turns every wake since the last call into a queued poll job.
    pub(crate) fn drain_wakes(&self, shared: &Shared) {
        let woken: Vec<u64> = self.lock_woken().drain(..).collect();
        for id in woken {
            let runtime = shared.weak();
            shared.enqueue(Box::new(move || {
                if let Some(shared) = runtime.upgrade() {
                    shared.workflows.poll(id);
                }
            }));
        }
    }

    pub(crate) fn has_wakes(&self) -> bool {
        !self.lock_woken().is_empty()
    }

    pub(crate) fn parked(&self) -> usize {
        self.parked.borrow().len()
    }

    fn poll(&self, id: u64) {
        // Taken out of the map so the workflow can spawn others while polled.
        let parked = self.parked.borrow_mut().remove(&id);
        let Some(mut parked) = parked else {
            // Already finished; a late or duplicate wake.
            return;
        };
        let mut cx = Context::from_waker(&parked.waker);
        match parked.future.as_mut().poll(&mut cx) {
            Poll::Ready(()) => tracing::trace!(workflow = id, "workflow finished"),
            Poll::Pending => {
                self.parked.borrow_mut().insert(id, parked);
            }
        }
    }

    pub(crate) fn clear(&self) {
        let parked = std::mem::take(&mut *self.parked.borrow_mut());
        drop(parked);
        self.lock_woken().clear();
    }
}

pin_project! {
    // Drives a workflow future and settles its task with the result.
    struct Driver<F, T> {
        #[pin]
        future: F,
        settler: Option<Settler<T>>,
    }
}

impl<F, T> Future for Driver<F, T>
where
    T: Clone + 'static,
    F: Future<Output = Result<T, Failure>>,
{
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.project();
        let outcome = match this.future.poll(cx) {
            Poll::Ready(outcome) => outcome,
            Poll::Pending => return Poll::Pending,
        };
        if let Some(settler) = this.settler.take() {
            settler.settle(outcome);
        }
        Poll::Ready(())
    }
}

type Step<T> = Box<dyn FnOnce(T, Weak<Shared>) -> Task<T>>;
type Recovery<T> = Box<dyn FnOnce(Failure, Weak<Shared>) -> Task<T>>;

/// A sequence of steps that each take the previous value and may suspend.
///
/// The first step to fail stops the workflow; later steps never run. With a
/// recovery handler installed the failure goes to the handler, which decides
/// the workflow's outcome. Without one the workflow task rejects with
/// [`Failure::Workflow`] naming the failing step (counted from 1).
///
/// # Example
/// ```
/// # use deferron::{EventLoop, Failure, workflow::Workflow};
/// # use std::time::Duration;
/// let lp = EventLoop::builder().virtual_clock().build();
/// let h = lp.handle();
///
/// let total = lp.run_workflow(
///     Workflow::new(1)
///         .step(move |n| h.schedule_after(Duration::from_millis(5), move || Ok::<_, Failure>(n + 1)))
///         .step(|n| Ok::<_, Failure>(n * 10)),
/// );
///
/// assert_eq!(lp.run_until(&total).unwrap(), Ok(20));
/// ```
pub struct Workflow<T> {
    initial: T,
    steps: Vec<Step<T>>,
    recovery: Option<Recovery<T>>,
}

impl<T: Clone + 'static> Workflow<T> {
    pub fn new(initial: T) -> Self {
        Self {
            initial,
            steps: Vec::new(),
            recovery: None,
        }
    }

    /// Appends a step. It may return a `Result` or a `Task`.
    pub fn step<S, R>(mut self, step: S) -> Self
    where
        S: FnOnce(T) -> R + 'static,
        R: IntoOutcome<T>,
    {
        self.steps.push(Box::new(move |value, runtime| {
            Task::from_outcome(runtime, step(value))
        }));
        self
    }

    /// Installs the handler that receives the failure of the failing step.
    pub fn recover<H, R>(mut self, handler: H) -> Self
    where
        H: FnOnce(Failure) -> R + 'static,
        R: IntoOutcome<T>,
    {
        self.recovery = Some(Box::new(move |failure, runtime| {
            Task::from_outcome(runtime, handler(failure))
        }));
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

impl Handle {
    /// Starts `future` as a workflow and returns a task for its outcome.
    ///
    /// The workflow first runs on a later turn of the loop. Inside it, tasks
    /// are awaited with `.await` and failures propagate with `?`.
    ///
    /// # Example
    /// ```
    /// # use deferron::{EventLoop, Failure};
    /// # use std::time::Duration;
    /// let lp = EventLoop::builder().virtual_clock().build();
    /// let h = lp.handle();
    ///
    /// let greeting = lp.spawn_workflow(async move {
    ///     let name = h.schedule_after(Duration::from_secs(1), || Ok::<_, Failure>("world")).await?;
    ///     h.sleep(Duration::from_secs(1)).await?;
    ///     Ok::<_, Failure>(format!("hello {name}"))
    /// });
    ///
    /// assert_eq!(lp.run_until(&greeting).unwrap(), Ok("hello world".to_string()));
    /// assert_eq!(lp.now(), Duration::from_secs(2));
    /// ```
    pub fn spawn_workflow<T, F>(&self, future: F) -> Task<T>
    where
        T: Clone + 'static,
        F: Future<Output = Result<T, Failure>> + 'static,
    {
        let (task, settler) = Task::pending(self.shared.weak());
        let id = self.shared.workflows.spawn(Box::pin(Driver {
            future,
            settler: Some(settler),
        }));
        tracing::debug!(task = %task.id(), workflow = id, "workflow spawned");
        task
    }

    /// Runs the steps of `workflow` in order, see [`Workflow`].
    pub fn run_workflow<T: Clone + 'static>(&self, workflow: Workflow<T>) -> Task<T> {
        let Workflow {
            initial,
            steps,
            recovery,
        } = workflow;
        let runtime = self.shared.weak();
        let steps_runtime = runtime.clone();
        let run = async move {
            let mut value = initial;
            for (index, step) in steps.into_iter().enumerate() {
                value = step(value, steps_runtime.clone())
                    .into_future()
                    .at_step(index + 1)
                    .await?;
            }
            Ok::<T, Failure>(value)
        };

        match recovery {
            Some(recovery) => {
                self.spawn_workflow(run.recover(self, move |failure| recovery(failure, runtime)))
            }
            None => self.spawn_workflow(run),
        }
    }
}
