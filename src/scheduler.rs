//! Deadline-ordered event queue and the worker's virtual clock.
//!
//! The queue is a min-heap keyed by `(deadline, seq)`; the monotonic `seq`
//! makes equal deadlines pop in insertion order, so runs are reproducible.
//! The clock either tracks wall time by spinning (live mode) or jumps
//! straight to the next deadline (offline mode, used by simulations and
//! tests).

use crate::pool::Handle;

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

/// Spin until we are within this much of the deadline, then dispatch.
const LIVE_SLACK: Duration = Duration::from_micros(30);

/// Falling behind by more than this shifts the whole schedule instead of
/// trying to catch up packet by packet.
const LIVE_CATCHUP: Duration = Duration::from_micros(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockMode {
    /// spin/sleep until each deadline is reached in wall time
    Live,
    /// jump the virtual clock directly, no real wait
    Offline,
}

#[derive(Debug)]
struct QueueEntry<T> {
    deadline: Duration,
    seq: u64,
    event: Handle<T>,
}

impl<T> PartialEq for QueueEntry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}
impl<T> Eq for QueueEntry<T> {}

impl<T> PartialOrd for QueueEntry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl<T> Ord for QueueEntry<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.deadline, self.seq).cmp(&(other.deadline, other.seq))
    }
}

pub struct Scheduler<T> {
    heap: BinaryHeap<Reverse<QueueEntry<T>>>,
    seq: u64,
    mode: ClockMode,
    epoch: Instant,
    /// accumulated lateness in live mode, added to every deadline
    offset: Duration,
    now: Duration,
}

impl<T> Scheduler<T> {
    pub fn new(mode: ClockMode) -> Self {
        Scheduler {
            heap: BinaryHeap::new(),
            seq: 0,
            mode,
            epoch: Instant::now(),
            offset: Duration::ZERO,
            now: Duration::ZERO,
        }
    }

    /// Current virtual time, non-decreasing.
    pub fn now(&self) -> Duration {
        self.now
    }

    pub fn mode(&self) -> ClockMode {
        self.mode
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Insert an event. The caller guarantees `deadline >= now()`.
    pub fn schedule(&mut self, event: Handle<T>, deadline: Duration) {
        debug_assert!(deadline >= self.now, "deadline in the past");
        self.heap.push(Reverse(QueueEntry {
            deadline,
            seq: self.seq,
            event,
        }));
        self.seq += 1;
    }

    /// Pop the earliest event, waiting for its deadline according to the
    /// clock mode, and advance the virtual clock to it.
    pub fn pop(&mut self) -> Option<(Duration, Handle<T>)> {
        let Reverse(entry) = self.heap.pop()?;
        if self.mode == ClockMode::Live {
            self.wait_until(entry.deadline);
        }
        self.now = entry.deadline;
        Some((entry.deadline, entry.event))
    }

    /// Pop without waiting, teardown path.
    pub fn pop_immediate(&mut self) -> Option<(Duration, Handle<T>)> {
        let Reverse(entry) = self.heap.pop()?;
        self.now = entry.deadline;
        Some((entry.deadline, entry.event))
    }

    fn wait_until(&mut self, deadline: Duration) {
        let target = deadline + self.offset;
        loop {
            let elapsed = self.epoch.elapsed();
            if elapsed + LIVE_SLACK >= target {
                // lateness beyond the catch-up threshold becomes a
                // permanent offset so the pacing shape is preserved
                if elapsed > target + LIVE_CATCHUP {
                    self.offset += elapsed - target;
                }
                return;
            }
            std::hint::spin_loop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::Pool;

    #[test]
    fn pops_in_non_decreasing_deadline_order() {
        let mut pool: Pool<u32> = Pool::new("events", 64);
        let mut sched: Scheduler<u32> = Scheduler::new(ClockMode::Offline);
        // scrambled deadlines
        for ms in [7u64, 1, 9, 3, 3, 8, 0, 5, 2, 4] {
            let h = pool.alloc(ms as u32).unwrap();
            sched.schedule(h, Duration::from_millis(ms));
        }
        let mut last = Duration::ZERO;
        while let Some((deadline, h)) = sched.pop() {
            assert!(deadline >= last);
            assert_eq!(sched.now(), deadline);
            last = deadline;
            pool.free(h);
        }
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn equal_deadlines_pop_in_insertion_order() {
        let mut pool: Pool<u32> = Pool::new("events", 8);
        let mut sched: Scheduler<u32> = Scheduler::new(ClockMode::Offline);
        let deadline = Duration::from_millis(5);
        let handles: Vec<_> = (0..5u32).map(|i| pool.alloc(i).unwrap()).collect();
        for &h in &handles {
            sched.schedule(h, deadline);
        }
        let mut order = vec![];
        while let Some((_, h)) = sched.pop() {
            order.push(*pool.get(h).unwrap());
        }
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn offline_clock_jumps_without_waiting() {
        let mut pool: Pool<()> = Pool::new("events", 2);
        let mut sched: Scheduler<()> = Scheduler::new(ClockMode::Offline);
        let h = pool.alloc(()).unwrap();
        sched.schedule(h, Duration::from_secs(3600));
        let t0 = Instant::now();
        sched.pop().unwrap();
        assert!(t0.elapsed() < Duration::from_secs(1));
        assert_eq!(sched.now(), Duration::from_secs(3600));
    }
}
