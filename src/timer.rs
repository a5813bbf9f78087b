//! Timers armed on the event loop.
//!
//! Timers live in a min-heap keyed by `(deadline, sequence)`. The sequence
//! number is taken from a counter at arming time, so timers with the same
//! deadline come out in the order they were armed.

use std::{cmp::Ordering, collections::BinaryHeap, time::Duration};

use crate::event_loop::Job;

pub(crate) struct TimerEntry {
    deadline: Duration,
    seq: u64,
    job: Job,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    // Reversed so that `BinaryHeap` pops the earliest deadline first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
pub(crate) struct TimerQueue {
    heap: BinaryHeap<TimerEntry>,
    next_seq: u64,
}

impl TimerQueue {
    pub(crate) fn arm(&mut self, deadline: Duration, job: Job) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(TimerEntry { deadline, seq, job });
        seq
    }

    pub(crate) fn next_deadline(&self) -> Option<Duration> {
        self.heap.peek().map(|t| t.deadline)
    }

    /// Pops the earliest timer if it is due at `now`.
    pub(crate) fn pop_due(&mut self, now: Duration) -> Option<(u64, Job)> {
        if self.heap.peek()?.deadline > now {
            return None;
        }
        self.heap.pop().map(|t| (t.seq, t.job))
    }

    pub(crate) fn len(&self) -> usize {
        self.heap.len()
    }

    pub(crate) fn clear(&mut self) -> Vec<Job> {
        self.heap.drain().map(|t| t.job).collect()
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, rc::Rc};

    use super::*;

    fn recording_job(log: &Rc<RefCell<Vec<&'static str>>>, name: &'static str) -> Job {
        let log = Rc::clone(log);
        Box::new(move || log.borrow_mut().push(name))
    }

    #[test]
    fn earliest_deadline_first_then_arming_order() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut timers = TimerQueue::default();
        timers.arm(Duration::from_millis(20), recording_job(&log, "late"));
        timers.arm(Duration::from_millis(10), recording_job(&log, "first"));
        timers.arm(Duration::from_millis(10), recording_job(&log, "second"));

        assert_eq!(timers.next_deadline(), Some(Duration::from_millis(10)));
        while let Some((_, job)) = timers.pop_due(Duration::from_millis(20)) {
            job();
        }
        assert_eq!(*log.borrow(), vec!["first", "second", "late"]);
        assert_eq!(timers.len(), 0);
    }

    #[test]
    fn timers_in_the_future_stay_armed() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut timers = TimerQueue::default();
        timers.arm(Duration::from_millis(50), recording_job(&log, "later"));
        assert!(timers.pop_due(Duration::from_millis(49)).is_none());
        assert_eq!(timers.len(), 1);
    }
}
