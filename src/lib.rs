//! A single-threaded deferred task runner.
//!
//! `deferron` runs deferred work on a cooperative event loop: timers, I/O
//! requests handed to worker threads, continuations registered on tasks, and
//! sequential workflows written as `async` blocks. Everything user code
//! schedules runs on the loop's thread, one job at a time, in a well defined
//! order.
//!
//! Features include:
//! - An [`EventLoop`] with a FIFO job queue, a timer queue and a pluggable
//!   [`Clock`](clock::Clock), including a virtual clock for deterministic runs
//! - A [`Task`] handle with `Pending`, `Fulfilled` and `Rejected` states,
//!   continuations via [`Task::then`] and automatic flattening of nested tasks
//! - I/O tasks for file reads and HTTP GET requests through an
//!   [`IoProvider`](io::IoProvider)
//! - Workflows that `.await` tasks and propagate failures with `?`, either as
//!   `async` blocks or as a [`Workflow`] of numbered steps
//! - An [`Observer`](observer::Observer) that receives reported values,
//!   recovered failures and rejections nobody handled
//!
//! # Example
//! ```
//! use deferron::{EventLoop, Failure};
//! use std::time::Duration;
//!
//! let lp = EventLoop::builder().virtual_clock().build();
//! let h = lp.handle();
//!
//! let doubled = lp
//!     .schedule_after(Duration::from_millis(100), || Ok::<_, Failure>(21))
//!     .map(|n| n * 2);
//! doubled.on_settle(move |outcome| {
//!     if let Ok(n) = outcome {
//!         h.report(n);
//!     }
//! });
//!
//! lp.run().unwrap();
//! assert_eq!(doubled.peek(), Some(Ok(42)));
//! assert_eq!(lp.now(), Duration::from_millis(100));
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod event_loop;
pub mod io;
pub mod observer;
pub mod task;
pub mod task_ext;
pub(crate) mod timer;
pub mod workflow;

pub use config::{ClockKind, RunnerConfig};
pub use error::{Failure, IoError, RunnerError};
pub use event_loop::{EventLoop, EventLoopBuilder, Handle, RunStats};
pub use io::{IoOperation, IoProvider, MemoryProvider, SystemProvider};
pub use observer::{
    ConsoleObserver, Handling, Observer, RecordingObserver, Report, TracingObserver,
};
pub use task::{Awaiting, IntoOutcome, Settler, Task, TaskId, TaskState};
pub use task_ext::TaskExt;
pub use workflow::Workflow;
