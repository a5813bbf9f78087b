//! Provides the `EventLoop` that drives timers, I/O completions, continuations
//! and workflows.
//!
//! The loop is single threaded and cooperative. Ready work sits in one FIFO
//! queue of jobs and exactly one job runs at a time, to completion. Between
//! jobs the loop collects finished I/O requests, woken workflows and due
//! timers, and turns each of them into queued jobs. When nothing is ready it
//! asks its [`Clock`] to wait for the next deadline or I/O completion.
//!
//! [`Handle`] is the cheap, clonable entry point for scheduling work from
//! inside handlers. `EventLoop` derefs to its `Handle`.

use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    fmt,
    ops::Deref,
    rc::{Rc, Weak},
    sync::Arc,
    time::Duration,
};

use crate::{
    Task,
    clock::{self, Clock},
    config::{ClockKind, RunnerConfig},
    error::{Failure, RunnerError},
    io::{IoBridge, IoProvider, SystemProvider},
    observer::{Handling, Observer, TracingObserver},
    task::{IntoOutcome, Settler},
    timer::TimerQueue,
    workflow::Workflows,
};

pub(crate) type Job = Box<dyn FnOnce()>;

/// State shared by the loop, its handles and the tasks it created.
pub(crate) struct Shared {
    this: Weak<Shared>,
    clock: Box<dyn Clock>,
    observer: Rc<dyn Observer>,
    queue: RefCell<VecDeque<Job>>,
    timers: RefCell<TimerQueue>,
    pub(crate) io: IoBridge,
    pub(crate) workflows: Workflows,
    running: Cell<bool>,
}

impl Shared {
    pub(crate) fn weak(&self) -> Weak<Shared> {
        self.this.clone()
    }

    pub(crate) fn enqueue(&self, job: Job) {
        self.queue.borrow_mut().push_back(job);
    }

    pub(crate) fn now(&self) -> Duration {
        self.clock.now()
    }

    pub(crate) fn report_failure(&self, failure: &Failure, handling: Handling) {
        self.observer.report_failure(self.now(), failure, handling);
    }

    // Moves every due timer onto the queue, earliest deadline first.
    fn fire_due_timers(&self) -> usize {
        let now = self.now();
        let mut fired = 0;
        loop {
            let due = self.timers.borrow_mut().pop_due(now);
            let Some((seq, job)) = due else {
                break;
            };
            tracing::trace!(timer = seq, ?now, "timer fired");
            self.enqueue(job);
            fired += 1;
        }
        fired
    }

    // Drops everything still queued. Jobs and timers hold handles to this
    // state, so they have to go before the state can.
    fn clear(&self) {
        let jobs = std::mem::take(&mut *self.queue.borrow_mut());
        let timers = self.timers.borrow_mut().clear();
        drop(jobs);
        drop(timers);
        self.workflows.clear();
        self.io.clear();
    }
}

/// Counters for one call to [`EventLoop::run`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunStats {
    /// Jobs popped from the queue and run.
    pub jobs: usize,
    pub timers_fired: usize,
    pub io_completed: usize,
}

/// A clonable handle used to schedule work on an [`EventLoop`].
#[derive(Clone)]
pub struct Handle {
    pub(crate) shared: Rc<Shared>,
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("now", &self.now())
            .field("queued", &self.shared.queue.borrow().len())
            .field("timers", &self.shared.timers.borrow().len())
            .finish()
    }
}

impl Handle {
    /// Current loop time.
    #[must_use]
    pub fn now(&self) -> Duration {
        self.shared.now()
    }

    /// Arms a timer that runs `work` on the loop once `delay` has elapsed.
    ///
    /// The returned task settles with the outcome of `work`, which can be a
    /// `Result` or another `Task`. Timers with the same deadline fire in the
    /// order they were armed.
    pub fn schedule_after<T, R, W>(&self, delay: Duration, work: W) -> Task<T>
    where
        T: Clone + 'static,
        R: IntoOutcome<T>,
        W: FnOnce() -> R + 'static,
    {
        let (task, settler) = Task::pending(self.shared.weak());
        let deadline = self.now().saturating_add(delay);
        let seq = self
            .shared
            .timers
            .borrow_mut()
            .arm(deadline, Box::new(move || work().settle_into(settler)));
        tracing::debug!(task = %task.id(), timer = seq, ?delay, ?deadline, "timer armed");
        task
    }

    /// A task that fulfills with `()` after `delay`.
    pub fn sleep(&self, delay: Duration) -> Task<()> {
        self.schedule_after(delay, || Ok::<(), Failure>(()))
    }

    /// Creates a pending task together with the settler that completes it.
    #[must_use]
    pub fn deferred<T: Clone + 'static>(&self) -> (Task<T>, Settler<T>) {
        Task::pending(self.shared.weak())
    }

    /// Runs `executor` right away with the settler of a new task.
    ///
    /// The executor decides whether the task resolves or rejects; it may also
    /// move the settler into a timer or continuation and settle it later.
    ///
    /// # Example
    /// ```
    /// # use deferron::{EventLoop, Failure};
    /// let lp = EventLoop::builder().virtual_clock().build();
    ///
    /// let task = lp.promise(|settler| {
    ///     if 2 + 2 == 4 {
    ///         settler.resolve("math works");
    ///     } else {
    ///         settler.reject(Failure::new("Math", "broken"));
    ///     }
    /// });
    ///
    /// assert_eq!(lp.run_until(&task).unwrap(), Ok("math works"));
    /// ```
    pub fn promise<T, E>(&self, executor: E) -> Task<T>
    where
        T: Clone + 'static,
        E: FnOnce(Settler<T>),
    {
        let (task, settler) = self.deferred();
        executor(settler);
        task
    }

    /// A task that is already fulfilled with `value`.
    pub fn resolved<T: Clone + 'static>(&self, value: T) -> Task<T> {
        Task::from_outcome(self.shared.weak(), Ok::<T, Failure>(value))
    }

    /// A task that is already rejected with `failure`.
    pub fn rejected<T: Clone + 'static>(&self, failure: Failure) -> Task<T> {
        Task::from_outcome(self.shared.weak(), Err::<T, Failure>(failure))
    }

    /// Hands `value` to the loop's observer.
    pub fn report(&self, value: impl fmt::Display) {
        self.shared.observer.report(self.now(), &value);
    }

    /// Hands a failure that user code dealt with to the loop's observer.
    pub fn report_failure(&self, failure: &Failure) {
        self.shared.report_failure(failure, Handling::Recovered);
    }
}

/// Single threaded cooperative event loop.
///
/// Work scheduled through the loop (or any of its [`Handle`]s) only makes
/// progress while [`run`](EventLoop::run) or
/// [`run_until`](EventLoop::run_until) is executing. Dropping the loop drops
/// all work that has not run yet.
pub struct EventLoop {
    handle: Handle,
}

impl EventLoop {
    /// Creates a loop with the default configuration: wall-clock time, the
    /// file system and HTTP as the I/O provider, and `tracing` as the observer.
    #[must_use]
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Creates a loop configured from the environment, see
    /// [`RunnerConfig::from_env`].
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError::Config`] if a variable cannot be parsed.
    pub fn from_env() -> Result<Self, RunnerError> {
        Ok(Self::builder().config(RunnerConfig::from_env()?).build())
    }

    #[must_use]
    pub fn builder() -> EventLoopBuilder {
        EventLoopBuilder::default()
    }

    /// Returns a handle that can be moved into handlers.
    #[must_use]
    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }

    /// Runs until no job, timer, I/O request or woken workflow is left.
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError::AlreadyRunning`] when called from a job running
    /// on this same loop.
    pub fn run(&self) -> Result<RunStats, RunnerError> {
        let stats = self.drive(|| false)?;
        tracing::info!(
            jobs = stats.jobs,
            timers = stats.timers_fired,
            io = stats.io_completed,
            "event loop drained"
        );
        Ok(stats)
    }

    /// Runs until `task` settles and returns its outcome.
    ///
    /// Work that is still queued when the task settles stays queued for the
    /// next call.
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError::Stalled`] if the loop runs out of work while the
    /// task is still pending, and [`RunnerError::AlreadyRunning`] when called
    /// from a job running on this same loop.
    pub fn run_until<T: Clone + 'static>(
        &self,
        task: &Task<T>,
    ) -> Result<Result<T, Failure>, RunnerError> {
        self.drive(|| task.is_settled())?;
        task.peek().ok_or(RunnerError::Stalled(task.id()))
    }

    fn drive(&self, mut done: impl FnMut() -> bool) -> Result<RunStats, RunnerError> {
        let shared = &self.handle.shared;
        if shared.running.replace(true) {
            return Err(RunnerError::AlreadyRunning);
        }
        let _running = RunningGuard(&shared.running);
        let span = tracing::debug_span!("event_loop");
        let _enter = span.enter();

        let mut stats = RunStats::default();
        loop {
            if done() {
                break;
            }
            stats.io_completed += shared.io.drain_completions();
            shared.workflows.drain_wakes(shared);
            stats.timers_fired += shared.fire_due_timers();

            let job = shared.queue.borrow_mut().pop_front();
            if let Some(job) = job {
                tracing::trace!(turn = stats.jobs, "running job");
                job();
                stats.jobs += 1;
                continue;
            }

            if shared.workflows.has_wakes() {
                continue;
            }
            let io_in_flight = shared.io.in_flight() > 0;
            let deadline = shared.timers.borrow().next_deadline();
            if deadline.is_none() && !io_in_flight {
                break;
            }
            tracing::trace!(?deadline, io_in_flight, "waiting");
            shared.clock.wait(deadline, io_in_flight);
        }

        let parked = shared.workflows.parked();
        if parked > 0 && !done() {
            tracing::debug!(parked, "workflows left waiting on tasks nobody settles");
        }
        Ok(stats)
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl Deref for EventLoop {
    type Target = Handle;

    fn deref(&self) -> &Self::Target {
        &self.handle
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.handle.shared.clear();
    }
}

struct RunningGuard<'a>(&'a Cell<bool>);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

/// Assembles an [`EventLoop`] from a configuration and optional overrides.
#[derive(Default)]
pub struct EventLoopBuilder {
    config: RunnerConfig,
    observer: Option<Rc<dyn Observer>>,
    provider: Option<Arc<dyn IoProvider>>,
    clock: Option<Box<dyn Clock>>,
}

impl EventLoopBuilder {
    pub fn config(mut self, config: RunnerConfig) -> Self {
        self.config = config;
        self
    }

    /// Shorthand for a [`ClockKind::Virtual`] clock.
    pub fn virtual_clock(mut self) -> Self {
        self.config = self.config.clock(ClockKind::Virtual);
        self
    }

    /// Uses `clock` instead of the one named by the configuration.
    pub fn clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Some(Box::new(clock));
        self
    }

    pub fn observer(mut self, observer: impl Observer + 'static) -> Self {
        self.observer = Some(Rc::new(observer));
        self
    }

    pub fn provider(mut self, provider: impl IoProvider + 'static) -> Self {
        self.provider = Some(Arc::new(provider));
        self
    }

    #[must_use]
    pub fn build(self) -> EventLoop {
        let EventLoopBuilder {
            config,
            observer,
            provider,
            clock,
        } = self;
        let clock = clock.unwrap_or_else(|| clock::from_kind(config.clock, config.io_wait_slice));
        let observer = observer.unwrap_or_else(|| Rc::new(TracingObserver));
        let provider = provider
            .unwrap_or_else(|| Arc::new(SystemProvider::new(config.http_timeout)));
        let loop_thread = std::thread::current();

        let shared = Rc::new_cyclic(|this| Shared {
            this: this.clone(),
            clock,
            observer,
            queue: RefCell::new(VecDeque::with_capacity(16)),
            timers: RefCell::new(TimerQueue::default()),
            io: IoBridge::new(provider, config.io_threads, loop_thread.clone()),
            workflows: Workflows::new(loop_thread),
            running: Cell::new(false),
        });
        tracing::debug!(clock = ?config.clock, io_threads = config.io_threads, "event loop created");
        EventLoop {
            handle: Handle { shared },
        }
    }
}
