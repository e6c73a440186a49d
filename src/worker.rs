//! The per-core worker: one deadline-ordered event loop owning its flows,
//! pools, timer wheel and ring endpoints outright. Workers never share
//! mutable state; everything crossing cores goes through the rings and is
//! drained at the sync tick.

use crate::config::RunConfig;
use crate::error::Error;
use crate::nat::NatEngine;
use crate::pool::{Handle, Pool};
use crate::ring::{ring, RingReceiver, RingSender};
use crate::scheduler::{ClockMode, Scheduler};
use crate::stats::WorkerStats;
use crate::structs::{
    Command, CorrelationId, FlowInstance, Message, NatState, PacketDirection, PacketRecord,
    PacketSink, Watchdog,
};
use crate::template::{Admission, DeferredPorts, PortPool, TemplatePool};
use crate::wheel::TimerWheel;

use rand_core::{RngCore, SeedableRng};
use rand_pcg::Pcg32;
use std::sync::Arc;
use std::time::Duration;

/// Everything the event loop dispatches. Allocated from the event pool on
/// scheduling, returned to it when popped; periodic events reschedule
/// themselves with a fresh allocation.
enum Event {
    /// flow-start pump, one admission attempt per expected flow
    FlowStart,
    PacketSend { flow: Handle<FlowInstance> },
    /// ring drain + watchdog + early-exit check
    SyncTick,
    /// advances the coarse timer wheel by one tick
    WheelTick,
    /// a quarantined port batch whose release delay expired
    PortRelease { ports: DeferredPorts },
    Command { cmd: Command },
    /// end-of-run sentinel at the configured duration
    Exit,
}

/// Payloads armed on the timer wheel.
enum WheelJob {
    ReleasePorts(DeferredPorts),
}

/// The worker's three ring endpoints.
pub struct WorkerRings {
    /// messages from the receive-side core (NAT reports, latency probes)
    pub from_rx: RingReceiver<Message>,
    /// messages back to the receive-side core
    pub to_rx: RingSender<Message>,
    /// control-plane commands
    pub from_ctrl: RingReceiver<Command>,
}

/// Counterpart endpoints kept by the spawning side.
pub struct WorkerEndpoints {
    pub to_worker: RingSender<Message>,
    pub from_worker: RingReceiver<Message>,
    pub ctrl: RingSender<Command>,
}

pub fn worker_rings(capacity: usize) -> (WorkerRings, WorkerEndpoints) {
    let (in_tx, in_rx) = ring("worker-in", capacity);
    let (out_tx, out_rx) = ring("worker-out", capacity);
    let (ctrl_tx, ctrl_rx) = ring("ctrl", capacity);
    (
        WorkerRings {
            from_rx: in_rx,
            to_rx: out_tx,
            from_ctrl: ctrl_rx,
        },
        WorkerEndpoints {
            to_worker: in_tx,
            from_worker: out_rx,
            ctrl: ctrl_tx,
        },
    )
}

pub struct Worker<S: PacketSink, W: Watchdog> {
    cfg: Arc<RunConfig>,
    thread_id: usize,
    sched: Scheduler<Event>,
    events: Pool<Event>,
    flows: Pool<FlowInstance>,
    wheel: TimerWheel<WheelJob>,
    templates: TemplatePool,
    ports: Vec<PortPool>,
    nat: NatEngine,
    from_rx: RingReceiver<Message>,
    to_rx: RingSender<Message>,
    from_ctrl: RingReceiver<Command>,
    sink: S,
    watchdog: W,
    stats: WorkerStats,
    /// partial port-release batch still filling up
    defer: DeferredPorts,
    rng: Pcg32,
    /// queued events that do not represent pending work (the exit sentinel
    /// and the wheel pump); when only these remain the run is over
    non_active: u64,
    next_flow_id: u32,
    /// port quarantine expressed in wheel ticks
    release_ticks: u32,
}

impl<S: PacketSink, W: Watchdog> Worker<S, W> {
    pub fn new(
        cfg: Arc<RunConfig>,
        thread_id: usize,
        mode: ClockMode,
        rings: WorkerRings,
        sink: S,
        watchdog: W,
    ) -> Result<Self, Error> {
        let wheel = TimerWheel::new(cfg.wheel_size, cfg.wheel_pool)
            .map_err(|e| Error::Config(format!("timer wheel: {e:?}")))?;
        let templates = TemplatePool::new(&cfg, thread_id);
        let ports = cfg
            .pools
            .iter()
            .enumerate()
            .map(|(i, p)| PortPool::new(p, cfg.seed ^ ((thread_id as u64) << 32) ^ i as u64))
            .collect();
        let release_ticks =
            (cfg.port_release_delay.as_nanos() / cfg.wheel_tick.as_nanos().max(1)).max(1) as u32;
        Ok(Worker {
            sched: Scheduler::new(mode),
            events: Pool::new("events", cfg.event_pool),
            flows: Pool::new("flows", cfg.flow_pool),
            wheel,
            templates,
            ports,
            nat: NatEngine::new(cfg.learn_mode, cfg.learn_verify),
            from_rx: rings.from_rx,
            to_rx: rings.to_rx,
            from_ctrl: rings.from_ctrl,
            sink,
            watchdog,
            stats: WorkerStats::default(),
            defer: DeferredPorts::default(),
            rng: Pcg32::seed_from_u64(cfg.seed.wrapping_add(thread_id as u64)),
            non_active: 0,
            next_flow_id: 1,
            release_ticks,
            thread_id,
            cfg,
        })
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn nat_outstanding(&self) -> usize {
        self.nat.outstanding()
    }

    /// True once every pooled resource has been returned.
    pub fn leak_free(&self) -> bool {
        self.events.in_use() == 0 && self.flows.in_use() == 0 && self.wheel.events_left() == 0
    }

    /// Run to the configured duration (or an early stop), then finalize
    /// everything still in flight.
    pub fn run(&mut self) -> Result<(), Error> {
        log::info!(
            "worker {}: starting {:?} run, {} templates",
            self.thread_id,
            self.cfg.duration,
            self.templates.len()
        );
        // never start the pump at exactly t=0 (the policers treat 0.0 as
        // unset), and stagger threads so they do not admit in lockstep
        let stagger =
            Duration::from_millis(10) + self.templates.start_delta() * self.thread_id as u32;
        self.schedule(Event::FlowStart, stagger)?;
        self.schedule(Event::SyncTick, self.cfg.sync_interval)?;
        self.schedule(Event::WheelTick, self.cfg.wheel_tick)?;
        self.schedule(Event::Exit, self.cfg.duration)?;
        let result = self.main_loop();
        self.teardown();
        self.stats.dump(&format!("worker {}", self.thread_id));
        debug_assert_eq!(self.events.in_use(), 0);
        debug_assert_eq!(self.flows.in_use(), 0);
        result
    }

    fn schedule(&mut self, event: Event, deadline: Duration) -> Result<(), Error> {
        if matches!(event, Event::WheelTick | Event::Exit) {
            self.non_active += 1;
        }
        let handle = self.events.alloc(event)?;
        self.sched.schedule(handle, deadline);
        Ok(())
    }

    fn main_loop(&mut self) -> Result<(), Error> {
        while let Some((deadline, handle)) = self.sched.pop() {
            let Some(event) = self.events.free(handle) else {
                debug_assert!(false, "stale event handle in the queue");
                continue;
            };
            self.stats.events_dispatched += 1;
            if matches!(event, Event::WheelTick | Event::Exit) {
                self.non_active -= 1;
            }
            match event {
                Event::FlowStart => self.on_flow_start(deadline)?,
                Event::PacketSend { flow } => self.on_packet_send(deadline, flow)?,
                Event::SyncTick => {
                    if self.on_sync(deadline)? {
                        log::debug!("worker {}: queue drained, exiting early", self.thread_id);
                        break;
                    }
                }
                Event::WheelTick => self.on_wheel_tick(deadline)?,
                Event::PortRelease { ports } => self.release_ports(ports),
                Event::Command { cmd } => match cmd {
                    Command::Stop => {
                        log::info!("worker {}: stop command", self.thread_id);
                        break;
                    }
                },
                Event::Exit => break,
            }
        }
        Ok(())
    }

    /// One admission attempt, then re-arm the pump unless every template hit
    /// its limit.
    fn on_flow_start(&mut self, now: Duration) -> Result<(), Error> {
        match self.templates.admit(now.as_secs_f64()) {
            Admission::Admitted(idx) => self.start_flow(idx, now)?,
            Admission::Throttled => {}
            Admission::Done => {
                log::info!("worker {}: all template limits reached", self.thread_id);
                return Ok(());
            }
        }
        let delta = self.templates.start_delta();
        self.schedule(Event::FlowStart, now + delta)?;
        Ok(())
    }

    fn start_flow(&mut self, template: usize, now: Duration) -> Result<(), Error> {
        let (pool_idx, server_port, protocol, pkt_count, first_gap) = {
            let info = &self.templates.get(template).info;
            (
                info.pool,
                info.server_port,
                info.protocol,
                info.pacing.pkt_count(),
                info.pacing.gap(0),
            )
        };
        let src_port = match self.ports[pool_idx].alloc() {
            Some(p) => p,
            None => {
                return Err(Error::PoolExhausted {
                    what: "client ports",
                    capacity: self.ports[pool_idx].capacity(),
                })
            }
        };
        let flow_id = self.next_flow_id;
        self.next_flow_id += 1;
        let nat_state = if self.nat.is_active() {
            NatState::First
        } else {
            NatState::Learned
        };
        let pool = &self.cfg.pools[pool_idx];
        let flow = FlowInstance {
            template,
            flow_id,
            correlation: CorrelationId::new(self.thread_id as u8, flow_id),
            protocol,
            pkt_index: 0,
            pkt_count,
            src_ip: pool.client_ip,
            dst_ip: pool.server_ip,
            src_port,
            dst_port: server_port,
            nat_state,
            external: None,
            server_seq_base: self.rng.next_u32(),
            seq_delta: 0,
        };
        let fh = self.flows.alloc(flow)?;
        self.stats.flows_opened += 1;
        self.schedule(Event::PacketSend { flow: fh }, now + first_gap)?;
        Ok(())
    }

    fn on_packet_send(&mut self, now: Duration, fh: Handle<FlowInstance>) -> Result<(), Error> {
        let (template, pkt_index, state, correlation) = match self.flows.get(fh) {
            Some(f) => (f.template, f.pkt_index, f.nat_state, f.correlation),
            None => {
                debug_assert!(false, "packet event for a freed flow");
                return Ok(());
            }
        };
        let dir = self.templates.get(template).info.pacing.direction(pkt_index);

        match state {
            NatState::First => {
                // first send: the correlation id goes on the wire, the
                // report is expected before the peer's first packet is due
                self.nat.register(correlation, fh);
                if let Some(f) = self.flows.get_mut(fh) {
                    f.nat_state = NatState::Wait;
                }
            }
            NatState::Wait | NatState::WaitAck => {
                if dir == PacketDirection::Backward {
                    // the translation was never reported and the peer's side
                    // is due: the flow cannot proceed
                    return self.terminate_unlearned(fh);
                }
            }
            NatState::Learned => {}
        }

        self.emit_packet(now, fh, dir);

        let (template, next_index, pkt_count) = {
            let Some(f) = self.flows.get_mut(fh) else {
                return Ok(());
            };
            f.pkt_index += 1;
            (f.template, f.pkt_index, f.pkt_count)
        };
        if next_index >= pkt_count {
            self.complete_flow(fh)
        } else {
            let gap = self.templates.get(template).info.pacing.gap(next_index);
            self.schedule(Event::PacketSend { flow: fh }, now + gap)
        }
    }

    fn emit_packet(&mut self, now: Duration, fh: Handle<FlowInstance>, dir: PacketDirection) {
        let Some(flow) = self.flows.get(fh) else {
            return;
        };
        let embed = self.nat.embed_for(flow);
        let (src_ip, src_port, dst_ip, dst_port) = match dir {
            PacketDirection::Forward => (flow.src_ip, flow.src_port, flow.dst_ip, flow.dst_port),
            PacketDirection::Backward => {
                // the server answers toward the translated client address
                // once it is known
                let (dip, dport) = flow.external.unwrap_or((flow.src_ip, flow.src_port));
                (flow.dst_ip, flow.dst_port, dip, dport)
            }
        };
        let record = PacketRecord {
            time: now,
            template: flow.template,
            flow_id: flow.flow_id,
            protocol: flow.protocol,
            direction: dir,
            pkt_index: flow.pkt_index,
            src_ip,
            src_port,
            dst_ip,
            dst_port,
            embed,
            seq_delta: if dir == PacketDirection::Backward {
                flow.seq_delta
            } else {
                0
            },
        };
        self.sink.send(&record);
        self.stats.pkts_sent += 1;
    }

    /// Normal last-packet completion.
    fn complete_flow(&mut self, fh: Handle<FlowInstance>) -> Result<(), Error> {
        let Some(flow) = self.flows.free(fh) else {
            return Ok(());
        };
        if flow.is_learning() {
            // forward-only flow that finished before any report arrived
            self.nat.forget(flow.correlation);
        }
        self.stats.flows_closed += 1;
        let pool = self.templates.get(flow.template).info.pool;
        self.defer_port(pool, flow.src_port)
    }

    /// Learn-window timeout: a server-side packet came due while the
    /// translation was still unknown.
    fn terminate_unlearned(&mut self, fh: Handle<FlowInstance>) -> Result<(), Error> {
        let Some(flow) = self.flows.free(fh) else {
            return Ok(());
        };
        self.nat.forget(flow.correlation);
        self.stats.nat_timeout += 1;
        log::debug!(
            "flow {} timed out waiting for its translation",
            flow.correlation
        );
        let pool = self.templates.get(flow.template).info.pool;
        self.defer_port(pool, flow.src_port)
    }

    /// Quarantine a client port. A full batch arms one wheel timer for the
    /// whole group; partial batches are flushed at teardown.
    fn defer_port(&mut self, pool: usize, port: u16) -> Result<(), Error> {
        if self.defer.add(pool, port) {
            let batch = std::mem::take(&mut self.defer);
            self.stats.defer_batches += 1;
            self.wheel
                .timer_start(WheelJob::ReleasePorts(batch), self.release_ticks)
                .map_err(|_| Error::PoolExhausted {
                    what: "wheel timers",
                    capacity: self.cfg.wheel_pool,
                })?;
        }
        Ok(())
    }

    /// Ring drain, watchdog tickle and the end-of-run check. Returns true
    /// when nothing but housekeeping events remain.
    fn on_sync(&mut self, now: Duration) -> Result<bool, Error> {
        while let Some(cmd) = self.from_ctrl.try_recv() {
            self.schedule(Event::Command { cmd }, now)?;
        }
        while let Some(msg) = self.from_rx.try_recv() {
            match msg {
                Message::NatReport(batch) => {
                    self.nat.handle_batch(&batch, &mut self.flows, &mut self.stats)
                }
                Message::LatencyEcho { port, .. } => {
                    // bounce it back with a fresh timestamp
                    self.stats.latency_echoes += 1;
                    self.to_rx.send(Message::LatencyEcho {
                        timestamp_ns: now.as_nanos() as u64,
                        port,
                    })?;
                }
            }
        }
        self.watchdog.tickle();
        if self.wheel.events_left() == 0 && self.sched.len() as u64 == self.non_active {
            return Ok(true);
        }
        self.schedule(Event::SyncTick, now + self.cfg.sync_interval)?;
        Ok(false)
    }

    fn on_wheel_tick(&mut self, now: Duration) -> Result<(), Error> {
        let mut fired = Vec::new();
        self.wheel.tick(|job| fired.push(job));
        for job in fired {
            match job {
                WheelJob::ReleasePorts(batch) => {
                    self.schedule(Event::PortRelease { ports: batch }, now)?
                }
            }
        }
        self.schedule(Event::WheelTick, now + self.cfg.wheel_tick)?;
        Ok(())
    }

    fn release_ports(&mut self, batch: DeferredPorts) {
        for (pool, port) in batch.entries {
            self.ports[pool].release(port);
            self.stats.ports_released += 1;
        }
    }

    /// Drain the queue without waiting and finalize every event instead of
    /// discarding it, so pools and ports all come back.
    fn teardown(&mut self) {
        while let Some((_, handle)) = self.sched.pop_immediate() {
            let Some(event) = self.events.free(handle) else {
                continue;
            };
            match event {
                Event::PacketSend { flow } => {
                    if let Some(f) = self.flows.free(flow) {
                        if f.is_learning() {
                            self.nat.forget(f.correlation);
                        }
                        let pool = self.templates.get(f.template).info.pool;
                        self.ports[pool].release(f.src_port);
                        self.stats.ports_released += 1;
                    }
                }
                Event::PortRelease { ports } => self.release_ports(ports),
                _ => {}
            }
        }
        let mut jobs = Vec::new();
        self.wheel.detach_all(|job| jobs.push(job));
        for job in jobs {
            match job {
                WheelJob::ReleasePorts(batch) => self.release_ports(batch),
            }
        }
        let pending = std::mem::take(&mut self.defer);
        if !pending.is_empty() {
            self.release_ports(pending);
        }
        self.non_active = 0;
        log::debug!("worker {}: teardown complete", self.thread_id);
    }
}
