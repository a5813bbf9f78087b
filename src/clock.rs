//! Time sources for the event loop.
//!
//! Times are expressed as a [`Duration`] since the loop was created. The loop
//! asks its clock for the current time when arming timers and asks it to wait
//! when there is nothing to run.

use std::{
    cell::Cell,
    time::{Duration, Instant},
};

use crate::config::ClockKind;

pub trait Clock {
    /// Time elapsed since the clock was created.
    fn now(&self) -> Duration;

    /// Blocks or advances until `deadline`, or until an I/O completion may be
    /// waiting when `io_in_flight` is set.
    ///
    /// Returning early is allowed; the loop re-checks its state after every
    /// wait.
    fn wait(&self, deadline: Option<Duration>, io_in_flight: bool);
}

/// Wall-clock time.
///
/// Waiting parks the loop thread so that a finishing I/O request can unpark
/// it before the deadline.
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn wait(&self, deadline: Option<Duration>, io_in_flight: bool) {
        match deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_sub(self.now());
                if !remaining.is_zero() {
                    std::thread::park_timeout(remaining);
                }
            }
            None if io_in_flight => std::thread::park(),
            None => {}
        }
    }
}

/// Simulated time that only moves when the loop is idle.
///
/// With no I/O in flight, waiting jumps straight to the deadline, so a test
/// with a one second timer finishes instantly while still observing the one
/// second gap. While I/O is in flight the thread parks for `io_slice` of real
/// time without moving the simulated clock.
pub struct VirtualClock {
    now: Cell<Duration>,
    io_slice: Duration,
}

impl VirtualClock {
    #[must_use]
    pub fn new(io_slice: Duration) -> Self {
        Self {
            now: Cell::new(Duration::ZERO),
            io_slice,
        }
    }
}

impl Clock for VirtualClock {
    fn now(&self) -> Duration {
        self.now.get()
    }

    fn wait(&self, deadline: Option<Duration>, io_in_flight: bool) {
        if io_in_flight {
            std::thread::park_timeout(self.io_slice);
            return;
        }
        if let Some(deadline) = deadline {
            if deadline > self.now.get() {
                self.now.set(deadline);
            }
        }
    }
}

pub(crate) fn from_kind(kind: ClockKind, io_slice: Duration) -> Box<dyn Clock> {
    match kind {
        ClockKind::System => Box::new(SystemClock::new()),
        ClockKind::Virtual => Box::new(VirtualClock::new(io_slice)),
    }
}
