use flowgen::config;
use flowgen::config::RunConfig;
use flowgen::error::Error;
use flowgen::ring::{NatBatcher, RingSender};
use flowgen::scheduler::ClockMode;
use flowgen::stats::WorkerStats;
use flowgen::structs::*;
use flowgen::worker::{worker_rings, Worker, WorkerEndpoints};
mod cmd;

use std::fs;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};

/// Depth of the packet-record channel standing in for the wire.
const WIRE_CHANNEL_SIZE: usize = 4096;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = cmd::Args::parse();

    let (config_path, mode, verbose) = match &args.command {
        cmd::Command::Run { config } => (config.clone(), ClockMode::Live, false),
        cmd::Command::Simulate { config, verbose } => {
            (config.clone(), ClockMode::Offline, *verbose)
        }
    };

    let config_str = match fs::read_to_string(&config_path) {
        Ok(s) => s,
        Err(e) => {
            log::error!("cannot read {config_path}: {e}");
            process::exit(1);
        }
    };
    let mut cfg = match config::import_config(&config_str) {
        Ok(c) => c,
        Err(e) => {
            log::error!("{e}");
            process::exit(1);
        }
    };
    if let Some(seed) = args.seed {
        log::info!("running with seed {seed}");
        cfg.seed = seed;
    }
    if let Some(d) = args.duration {
        cfg.duration = Duration::from_secs_f64(d);
    }
    if let Some(t) = args.threads {
        cfg.threads = t;
        if let Err(e) = cfg.validate() {
            log::error!("{e}");
            process::exit(1);
        }
    }

    run(Arc::new(cfg), mode, verbose);
}

/// A worker's per-packet collaborator during a full run: every record goes
/// over the wire channel toward the reflector.
struct ReflectorSink {
    thread_id: usize,
    tx: Sender<(usize, PacketRecord)>,
    verbose: bool,
}

impl PacketSink for ReflectorSink {
    fn send(&mut self, pkt: &PacketRecord) {
        if self.verbose {
            println!(
                "{:>14?} t{} flow {} {} pkt {} {}:{} -> {}:{}",
                pkt.time,
                self.thread_id,
                pkt.flow_id,
                pkt.protocol,
                pkt.pkt_index,
                pkt.src_ip,
                pkt.src_port,
                pkt.dst_ip,
                pkt.dst_port
            );
        }
        if self.tx.send((self.thread_id, pkt.clone())).is_err() {
            log::warn!("wire channel closed, packet dropped");
        }
    }
}

fn run(cfg: Arc<RunConfig>, mode: ClockMode, verbose: bool) {
    let mut worker_threads = vec![];
    let mut endpoints: Vec<WorkerEndpoints> = vec![];

    let (wire_tx, wire_rx) = bounded::<(usize, PacketRecord)>(WIRE_CHANNEL_SIZE);

    for i in 0..cfg.threads {
        let (rings, ends) = worker_rings(cfg.ring_capacity);
        endpoints.push(ends);
        let sink = ReflectorSink {
            thread_id: i,
            tx: wire_tx.clone(),
            verbose,
        };
        let cfg = Arc::clone(&cfg);
        let builder = thread::Builder::new().name(format!("Worker-{i}"));
        worker_threads.push(
            builder
                .spawn(move || {
                    let mut worker = match Worker::new(cfg, i, mode, rings, sink, NullWatchdog) {
                        Ok(w) => w,
                        Err(e) => {
                            log::error!("worker {i}: {e}");
                            return WorkerStats::default();
                        }
                    };
                    if let Err(e) = worker.run() {
                        log::error!("worker {i}: {e}");
                    }
                    worker.stats().clone()
                })
                .unwrap(),
        );
    }
    // the workers hold the remaining clones
    drop(wire_tx);

    // Ctrl+C: first one asks the workers to stop, second one aborts
    let ctrls: Vec<RingSender<Command>> = endpoints.iter().map(|e| e.ctrl.clone()).collect();
    let stopping = Arc::new(AtomicBool::new(false));
    ctrlc::set_handler(move || {
        if !stopping.swap(true, Ordering::Relaxed) {
            log::warn!("stopping the run, please wait");
            for ctrl in &ctrls {
                if ctrl.send(Command::Stop).is_err() {
                    log::warn!("a worker is not answering its control ring");
                }
            }
        } else {
            log::warn!("ending immediately");
            process::abort();
        }
    })
    .expect("Error setting Ctrl-C handler");

    // The reflector plays the second vantage point on the calling thread:
    // it observes the wire, decodes embedded correlation ids and reports the
    // addressing back to the owning worker.
    let to_workers: Vec<RingSender<Message>> =
        endpoints.iter().map(|e| e.to_worker.clone()).collect();
    let builder = thread::Builder::new().name("Reflector".into());
    let reflector = builder
        .spawn(move || run_reflector(wire_rx, to_workers))
        .unwrap();

    let mut total = WorkerStats::default();
    for handle in worker_threads {
        match handle.join() {
            Ok(stats) => total.merge(&stats),
            Err(_) => log::error!("a worker panicked"),
        }
    }
    // nothing drains the out-rings past this point
    drop(endpoints);
    match reflector.join() {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            log::error!("reflector: {e}");
            process::exit(1);
        }
        Err(_) => log::error!("the reflector panicked"),
    }
    total.dump("total");
}

/// Turn observed learning packets into translated-address reports. Without a
/// translating device in the loop the reported address is the one observed,
/// which is exactly what `learn_verify` checks for.
fn run_reflector(
    wire: Receiver<(usize, PacketRecord)>,
    to_workers: Vec<RingSender<Message>>,
) -> Result<(), Error> {
    let flush_after = Duration::from_millis(1);
    let mut batchers: Vec<NatBatcher> = to_workers.iter().map(|_| NatBatcher::new(flush_after)).collect();
    let epoch = Instant::now();
    loop {
        match wire.recv_timeout(flush_after) {
            Ok((thread_id, pkt)) => {
                let Some(embed) = pkt.embed else { continue };
                // the 16-bit embed cannot carry the thread byte; recover it
                // from the channel tag
                let correlation = embed
                    .decode()
                    .unwrap_or_else(|| CorrelationId::new(thread_id as u8, pkt.flow_id));
                let entry = NatEntry {
                    correlation,
                    external_ip: pkt.src_ip,
                    external_port: pkt.src_port,
                    external_ip_server: pkt.dst_ip,
                    observed_seq: 0,
                };
                if let Some(batch) = batchers[thread_id].push(entry, epoch.elapsed()) {
                    send_report(&to_workers[thread_id], thread_id, batch)?;
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        let now = epoch.elapsed();
        for (i, batcher) in batchers.iter_mut().enumerate() {
            if let Some(batch) = batcher.flush_due(now) {
                send_report(&to_workers[i], i, batch)?;
            }
        }
    }
    Ok(())
}

/// Reports cannot be dropped while the worker is alive: a ring that stays
/// full across the retries ends the run. A worker that already exited just
/// means its late reports have nowhere to go.
fn send_report(
    ring: &RingSender<Message>,
    thread_id: usize,
    batch: NatBatch,
) -> Result<(), Error> {
    match ring.send(Message::NatReport(batch)) {
        Ok(()) => Ok(()),
        Err(Error::RingDisconnected { .. }) => {
            log::debug!("worker {thread_id} already finished, report batch discarded");
            Ok(())
        }
        Err(e) => Err(e),
    }
}
