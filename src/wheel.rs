//! Two-level hierarchical timer wheel.
//!
//! Level 0 covers one small fixed tick per bucket; level 1 aggregates a full
//! level-0 sweep per bucket and carries the longer timeouts (aging, deferred
//! port release). Insertion and expiry are O(1) amortized regardless of how
//! many timers are armed, which is what lets one worker keep millions of
//! short per-flow timers without priority-queue cost.
//!
//! Timers live in a fixed slab of cells linked into their bucket by index,
//! and are referred to by generation-checked [`TimerId`]s.

use thiserror::Error;

const NONE: u32 = u32::MAX;
const LEVELS: usize = 2;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WheelError {
    #[error("no free timer cells left")]
    NoResources,
    #[error("wheel size must be a power of two")]
    NoLog2,
}

/// Reference to an armed timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerId {
    index: u32,
    gen: u32,
}

struct Cell<T> {
    payload: Option<T>,
    gen: u32,
    next: u32,
    prev: u32,
    level: u8,
    bucket: u32,
    /// ticks beyond the level-1 horizon, burned down on each re-arm
    ticks_left: u32,
}

pub struct TimerWheel<T> {
    wheel_size: u32,
    mask: u32,
    shift: u32,
    ticks: [u64; LEVELS],
    bucket_index: [u32; LEVELS],
    heads: [Vec<u32>; LEVELS],
    cells: Vec<Cell<T>>,
    free: Vec<u32>,
    total_events: u64,
}

impl<T> TimerWheel<T> {
    pub fn new(wheel_size: u32, capacity: usize) -> Result<Self, WheelError> {
        if !wheel_size.is_power_of_two() || wheel_size < 2 {
            return Err(WheelError::NoLog2);
        }
        let mut cells = Vec::with_capacity(capacity);
        cells.resize_with(capacity, || Cell {
            payload: None,
            gen: 0,
            next: NONE,
            prev: NONE,
            level: 0,
            bucket: NONE,
            ticks_left: 0,
        });
        Ok(TimerWheel {
            wheel_size,
            mask: wheel_size - 1,
            shift: wheel_size.trailing_zeros(),
            ticks: [0; LEVELS],
            bucket_index: [0; LEVELS],
            heads: [vec![NONE; wheel_size as usize], vec![NONE; wheel_size as usize]],
            cells,
            free: (0..capacity as u32).rev().collect(),
            total_events: 0,
        })
    }

    /// Arm a timer `ticks` level-0 ticks from now. The level is picked by
    /// magnitude: anything past one level-0 sweep goes to level 1, with the
    /// residue kept for re-arming. A delta of 0 is bumped to 1 so the timer
    /// never lands in the bucket currently expiring.
    pub fn timer_start(&mut self, payload: T, ticks: u32) -> Result<TimerId, WheelError> {
        let index = self.free.pop().ok_or(WheelError::NoResources)?;
        self.cells[index as usize].payload = Some(payload);
        let gen = self.cells[index as usize].gen;
        self.place(index, ticks.max(1));
        self.total_events += 1;
        Ok(TimerId { index, gen })
    }

    /// Detach a running timer. `None` if the id is stale (already expired or
    /// stopped); a timer is in at most one bucket so a live id detaches
    /// exactly one cell.
    pub fn timer_stop(&mut self, id: TimerId) -> Option<T> {
        let cell = self.cells.get(id.index as usize)?;
        if cell.gen != id.gen || cell.bucket == NONE {
            return None;
        }
        self.unlink(id.index);
        self.total_events -= 1;
        self.release(id.index)
    }

    /// Advance level 0 by one bucket, expiring everything in it. Every full
    /// level-0 sweep advances level 1 once: residents with no ticks left
    /// expire, the rest re-arm closer to the front.
    pub fn tick(&mut self, mut expired: impl FnMut(T)) {
        let bucket = self.bucket_index[0];
        while let Some(payload) = self.pop_bucket(0, bucket) {
            self.total_events -= 1;
            expired(payload);
        }
        self.bucket_index[0] = (self.bucket_index[0] + 1) & self.mask;
        self.ticks[0] += 1;

        if self.bucket_index[0] == 0 {
            self.tick_level1(&mut expired);
        }
    }

    /// Drain every armed timer across both levels, shutdown path. Calling it
    /// again is a no-op.
    pub fn detach_all(&mut self, mut expired: impl FnMut(T)) {
        for level in 0..LEVELS {
            for bucket in 0..self.wheel_size {
                while let Some(payload) = self.pop_bucket(level, bucket) {
                    self.total_events -= 1;
                    expired(payload);
                }
            }
        }
        debug_assert_eq!(self.total_events, 0);
    }

    pub fn events_left(&self) -> u64 {
        self.total_events
    }

    pub fn ticks(&self, level: usize) -> u64 {
        self.ticks[level]
    }

    fn tick_level1(&mut self, expired: &mut impl FnMut(T)) {
        let bucket = self.bucket_index[1];
        loop {
            let index = self.heads[1][bucket as usize];
            if index == NONE {
                break;
            }
            self.unlink(index);
            let ticks_left = self.cells[index as usize].ticks_left;
            if ticks_left == 0 {
                self.total_events -= 1;
                if let Some(payload) = self.release(index) {
                    expired(payload);
                }
            } else {
                self.place(index, ticks_left);
            }
        }
        self.bucket_index[1] = (self.bucket_index[1] + 1) & self.mask;
        self.ticks[1] += 1;
    }

    fn place(&mut self, index: u32, ticks: u32) {
        if ticks < self.wheel_size {
            self.cells[index as usize].ticks_left = 0;
            let bucket = (self.bucket_index[0] + ticks) & self.mask;
            self.link(index, 0, bucket);
            return;
        }
        // round up to whole level-0 sweeps
        let sweeps = (ticks + self.mask) >> self.shift;
        if sweeps < self.wheel_size {
            self.cells[index as usize].ticks_left = 0;
            // at least one full bucket away, never the one being expired
            let sweeps = sweeps.max(2);
            let bucket = (self.bucket_index[1] + sweeps - 1) & self.mask;
            self.link(index, 1, bucket);
        } else {
            // beyond the level-1 horizon, park at the far edge and re-arm
            // with the residue when it comes around
            self.cells[index as usize].ticks_left = ticks - ((self.wheel_size - 1) << self.shift);
            let bucket = (self.bucket_index[1] + self.wheel_size - 1) & self.mask;
            self.link(index, 1, bucket);
        }
    }

    fn link(&mut self, index: u32, level: usize, bucket: u32) {
        let head = self.heads[level][bucket as usize];
        {
            let cell = &mut self.cells[index as usize];
            cell.level = level as u8;
            cell.bucket = bucket;
            cell.next = head;
            cell.prev = NONE;
        }
        if head != NONE {
            self.cells[head as usize].prev = index;
        }
        self.heads[level][bucket as usize] = index;
    }

    fn unlink(&mut self, index: u32) {
        let (level, bucket, next, prev) = {
            let cell = &self.cells[index as usize];
            (cell.level as usize, cell.bucket, cell.next, cell.prev)
        };
        debug_assert_ne!(bucket, NONE);
        if prev == NONE {
            self.heads[level][bucket as usize] = next;
        } else {
            self.cells[prev as usize].next = next;
        }
        if next != NONE {
            self.cells[next as usize].prev = prev;
        }
        let cell = &mut self.cells[index as usize];
        cell.bucket = NONE;
        cell.next = NONE;
        cell.prev = NONE;
    }

    /// Pop one timer off a bucket; the caller owns the event count.
    fn pop_bucket(&mut self, level: usize, bucket: u32) -> Option<T> {
        let index = self.heads[level][bucket as usize];
        if index == NONE {
            return None;
        }
        self.unlink(index);
        self.release(index)
    }

    fn release(&mut self, index: u32) -> Option<T> {
        let cell = &mut self.cells[index as usize];
        cell.gen = cell.gen.wrapping_add(1);
        cell.ticks_left = 0;
        let payload = cell.payload.take();
        self.free.push(index);
        payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain_ticks(w: &mut TimerWheel<u32>, n: u32) -> Vec<(u64, u32)> {
        let mut fired = vec![];
        for _ in 0..n {
            let at = w.ticks(0);
            w.tick(|p| fired.push((at, p)));
        }
        fired
    }

    #[test]
    fn short_timer_fires_on_level0() {
        let mut w: TimerWheel<u32> = TimerWheel::new(8, 16).unwrap();
        w.timer_start(7, 3).unwrap();
        let fired = drain_ticks(&mut w, 8);
        assert_eq!(fired, vec![(3, 7)]);
        assert_eq!(w.events_left(), 0);
    }

    #[test]
    fn zero_delta_fires_next_tick() {
        let mut w: TimerWheel<u32> = TimerWheel::new(8, 16).unwrap();
        w.timer_start(1, 0).unwrap();
        let fired = drain_ticks(&mut w, 2);
        assert_eq!(fired, vec![(1, 1)]);
    }

    #[test]
    fn long_timer_goes_to_level1_and_fires_in_window() {
        let mut w: TimerWheel<u32> = TimerWheel::new(8, 16).unwrap();
        // 20 ticks > one sweep of 8, so level 1 with coarser accuracy
        w.timer_start(42, 20).unwrap();
        let fired = drain_ticks(&mut w, 64);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].1, 42);
        let at = fired[0].0;
        // level-1 resolution is one sweep
        assert!((16..=24).contains(&at), "fired at {at}");
    }

    #[test]
    fn far_timer_rearms_with_residue() {
        let mut w: TimerWheel<u32> = TimerWheel::new(4, 8).unwrap();
        // horizon is (4-1)*4 = 12 ticks, this needs one re-arm
        w.timer_start(5, 30).unwrap();
        let fired = drain_ticks(&mut w, 64);
        assert_eq!(fired.len(), 1);
        assert!(fired[0].0 >= 24, "fired too early at {}", fired[0].0);
    }

    #[test]
    fn timer_stop_detaches_once() {
        let mut w: TimerWheel<u32> = TimerWheel::new(8, 16).unwrap();
        let id = w.timer_start(9, 5).unwrap();
        assert_eq!(w.timer_stop(id), Some(9));
        // second stop with the same id is stale
        assert_eq!(w.timer_stop(id), None);
        assert!(drain_ticks(&mut w, 16).is_empty());
    }

    #[test]
    fn stale_id_after_expiry() {
        let mut w: TimerWheel<u32> = TimerWheel::new(8, 16).unwrap();
        let id = w.timer_start(1, 1).unwrap();
        drain_ticks(&mut w, 2);
        assert_eq!(w.timer_stop(id), None);
    }

    #[test]
    fn detach_all_drains_both_levels_and_is_idempotent() {
        let mut w: TimerWheel<u32> = TimerWheel::new(8, 32).unwrap();
        w.timer_start(1, 2).unwrap();
        w.timer_start(2, 20).unwrap();
        w.timer_start(3, 100).unwrap();
        let mut drained = vec![];
        w.detach_all(|p| drained.push(p));
        drained.sort_unstable();
        assert_eq!(drained, vec![1, 2, 3]);
        assert_eq!(w.events_left(), 0);
        // no timer remains armed, a second call sees nothing
        let mut again = vec![];
        w.detach_all(|p| again.push(p));
        assert!(again.is_empty());
    }

    #[test]
    fn slab_exhaustion_is_reported() {
        let mut w: TimerWheel<u32> = TimerWheel::new(8, 2).unwrap();
        w.timer_start(1, 1).unwrap();
        w.timer_start(2, 1).unwrap();
        assert_eq!(w.timer_start(3, 1), Err(WheelError::NoResources));
    }

    #[test]
    fn wheel_size_must_be_log2() {
        assert!(TimerWheel::<u32>::new(6, 8).is_err());
    }

    #[test]
    fn dense_timers_expire_in_tick_order() {
        let mut w: TimerWheel<u32> = TimerWheel::new(16, 4096).unwrap();
        for i in 0..1000u32 {
            w.timer_start(i, 1 + (i % 10)).unwrap();
        }
        let fired = drain_ticks(&mut w, 16);
        assert_eq!(fired.len(), 1000);
        // non-decreasing expiry ticks
        assert!(fired.windows(2).all(|p| p[0].0 <= p[1].0));
        assert_eq!(w.events_left(), 0);
    }
}
