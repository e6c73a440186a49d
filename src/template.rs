use crate::config::{AddressPool, FlowTemplate, Pacing, RunConfig};
use crate::structs::PacketDirection;

use rand_core::{RngCore, SeedableRng};
use rand_pcg::Pcg32;
use std::time::Duration;

/// Deferred port releases are batched this many at a time before a release
/// timer is armed; partial batches are flushed at teardown.
pub const DEFER_BATCH: usize = 16;

/// Leaky-bucket rate limiter. Units accrue with elapsed virtual time up to
/// the bucket size, which is what allows short admission bursts after idle
/// stretches.
#[derive(Debug, Clone)]
pub struct Policer {
    cir: f64,
    bucket_size: f64,
    level: f64,
    last_time: f64,
}

impl Policer {
    pub fn new(cir: f64, bucket_size: f64) -> Self {
        Policer {
            cir,
            bucket_size,
            level: 0.0,
            last_time: 0.0,
        }
    }

    /// True when `units` can be admitted at virtual time `now_sec`. The
    /// first call always grants, establishing the time base.
    pub fn update(&mut self, units: f64, now_sec: f64) -> bool {
        if self.last_time == 0.0 {
            self.last_time = now_sec;
            return true;
        }
        if self.cir == 0.0 {
            return false;
        }
        if now_sec > self.last_time {
            let dtime = now_sec - self.last_time;
            self.level += dtime * self.cir;
            if self.level > self.bucket_size {
                self.level = self.bucket_size;
            }
            self.last_time = now_sec;
        }
        if self.level > units {
            self.level -= units;
            return true;
        }
        false
    }
}

/// Split a global instance limit across threads: integer division with the
/// remainder credited to thread 0, so the per-thread limits sum to the
/// configured global limit exactly.
pub fn split_limit(global: u32, thread_id: usize, n_threads: usize) -> u32 {
    let mut limit = global / n_threads as u32;
    if thread_id == 0 {
        limit += global % n_threads as u32;
    }
    limit
}

pub fn split_cps(global: f64, n_threads: usize) -> f64 {
    global / n_threads as f64
}

/// Outcome of one admission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// This template starts one flow now.
    Admitted(usize),
    /// Nothing admitted this round, retry at the caller's pacing delta.
    Throttled,
    /// Every template reached its limit, no retries needed.
    Done,
}

/// Per-thread mutable state of one template.
#[derive(Debug)]
pub struct TemplateState {
    pub info: FlowTemplate,
    pub policer: Policer,
    /// this thread's share of the configured limit
    pub limit: Option<u32>,
    pub flow_count: u32,
}

impl TemplateState {
    fn at_limit(&self) -> bool {
        match self.limit {
            Some(limit) => self.flow_count >= limit,
            None => false,
        }
    }
}

/// Rate-limited round-robin selection of which template starts its next
/// flow. The cursor persists across calls and advances after every attempt,
/// successful or not, to keep cross-template fairness.
#[derive(Debug)]
pub struct TemplatePool {
    templates: Vec<TemplateState>,
    cur: usize,
    total_cps: f64,
}

impl TemplatePool {
    pub fn new(cfg: &RunConfig, thread_id: usize) -> Self {
        let n = cfg.threads;
        let mut total_cps = 0.0;
        let templates = cfg
            .templates
            .iter()
            .map(|info| {
                let cps = split_cps(info.cps, n);
                total_cps += cps;
                TemplateState {
                    policer: Policer::new(cps, cps.max(1.0)),
                    limit: info.limit.map(|l| split_limit(l, thread_id, n)),
                    flow_count: 0,
                    info: info.clone(),
                }
            })
            .collect();
        TemplatePool {
            templates,
            cur: 0,
            total_cps,
        }
    }

    pub fn get(&self, idx: usize) -> &TemplateState {
        &self.templates[idx]
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    /// Pacing delta of the flow-start pump: one attempt per expected flow
    /// across all templates.
    pub fn start_delta(&self) -> Duration {
        if self.total_cps <= 0.0 {
            return Duration::from_secs(1);
        }
        Duration::from_secs_f64(1.0 / self.total_cps)
    }

    /// One round-robin admission attempt at virtual time `now_sec`.
    pub fn admit(&mut self, now_sec: f64) -> Admission {
        let mut admitted = None;
        let mut done = true;
        for _ in 0..self.templates.len() {
            let cur = &mut self.templates[self.cur];
            if !cur.at_limit() {
                done = false;
                if cur.policer.update(1.0, now_sec) {
                    cur.flow_count += 1;
                    admitted = Some(self.cur);
                }
            }
            self.cur = (self.cur + 1) % self.templates.len();
            if admitted.is_some() {
                break;
            }
        }
        match admitted {
            Some(idx) => Admission::Admitted(idx),
            None if done => Admission::Done,
            None => Admission::Throttled,
        }
    }
}

/// Ephemeral client port pool for one address pool. Draws are seeded-random
/// for address-spread, frees come back through deferred release batches.
#[derive(Debug)]
pub struct PortPool {
    free: Vec<u16>,
    capacity: usize,
    rng: Pcg32,
}

impl PortPool {
    pub fn new(pool: &AddressPool, seed: u64) -> Self {
        let free: Vec<u16> = (pool.port_min..=pool.port_max).collect();
        PortPool {
            capacity: free.len(),
            free,
            rng: Pcg32::seed_from_u64(seed),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn alloc(&mut self) -> Option<u16> {
        if self.free.is_empty() {
            return None;
        }
        let i = (self.rng.next_u32() as usize) % self.free.len();
        Some(self.free.swap_remove(i))
    }

    pub fn release(&mut self, port: u16) {
        self.free.push(port);
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }
}

/// A batch of (pool, port) pairs waiting for their release delay, so ports
/// are not immediately reused while the device under test may still hold
/// state for them.
#[derive(Debug, Default, Clone)]
pub struct DeferredPorts {
    pub entries: Vec<(usize, u16)>,
}

impl DeferredPorts {
    /// True once the batch is full and should be armed for release.
    pub fn add(&mut self, pool: usize, port: u16) -> bool {
        self.entries.push((pool, port));
        self.entries.len() >= DEFER_BATCH
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Template packet programs, shared helpers over the two pacing modes.
impl Pacing {
    pub fn pkt_count(&self) -> usize {
        match self {
            Pacing::Recorded { packets } => packets.len(),
            Pacing::FixedGap { count, .. } => *count as usize,
        }
    }

    /// Gap between packet `idx - 1` and packet `idx` (index 0 starts at the
    /// flow's admission time).
    pub fn gap(&self, idx: usize) -> Duration {
        match self {
            Pacing::Recorded { packets } => Duration::from_micros(packets[idx].gap_us),
            Pacing::FixedGap { gap_us, .. } => {
                if idx == 0 {
                    Duration::ZERO
                } else {
                    Duration::from_micros(*gap_us)
                }
            }
        }
    }

    pub fn direction(&self, idx: usize) -> PacketDirection {
        match self {
            Pacing::Recorded { packets } => packets[idx].direction,
            Pacing::FixedGap { .. } => PacketDirection::Forward,
        }
    }
}
