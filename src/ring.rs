use crate::error::Error;
use crate::structs::{NatBatch, NatEntry};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use std::time::Duration;

/// Default ring depth between two cores.
pub const DEFAULT_RING_CAPACITY: usize = 1024;

/// Attempts before a full ring is declared stalled.
const SEND_RETRIES: u32 = 3;

/// Producer side of a bounded single-producer/single-consumer ring. A full
/// ring rejects the message instead of overwriting; after a bounded number of
/// retries the consumer is presumed stuck and the error is fatal.
pub struct RingSender<T> {
    name: &'static str,
    tx: Sender<T>,
}

/// Consumer side. Drained only at the owning worker's sync tick, which keeps
/// the hot send path free of cross-core synchronization and bounds delivery
/// latency to one sync interval.
pub struct RingReceiver<T> {
    rx: Receiver<T>,
}

pub fn ring<T>(name: &'static str, capacity: usize) -> (RingSender<T>, RingReceiver<T>) {
    let (tx, rx) = bounded(capacity);
    (RingSender { name, tx }, RingReceiver { rx })
}

impl<T> Clone for RingSender<T> {
    fn clone(&self) -> Self {
        RingSender {
            name: self.name,
            tx: self.tx.clone(),
        }
    }
}

impl<T> RingSender<T> {
    /// Enqueue with bounded retry. Used on paths where losing the message
    /// would wedge the protocol (NAT reports, commands). A ring whose
    /// consumer has exited reports [`Error::RingDisconnected`] instead of a
    /// stall, so shutdown races stay distinguishable from a wedged peer.
    pub fn send(&self, msg: T) -> Result<(), Error> {
        let mut msg = msg;
        for _ in 0..SEND_RETRIES {
            match self.tx.try_send(msg) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Full(m)) => {
                    msg = m;
                    std::thread::yield_now();
                }
                Err(TrySendError::Disconnected(_)) => {
                    return Err(Error::RingDisconnected { ring: self.name })
                }
            }
        }
        Err(Error::RingStalled {
            ring: self.name,
            attempts: SEND_RETRIES,
        })
    }

    /// Single attempt, for paths with a drop policy. Returns the message on
    /// failure so the caller can count the drop.
    pub fn try_send(&self, msg: T) -> Result<(), T> {
        self.tx.try_send(msg).map_err(|e| match e {
            TrySendError::Full(m) | TrySendError::Disconnected(m) => m,
        })
    }
}

impl<T> RingReceiver<T> {
    pub fn try_recv(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

/// Collects NAT observations into ring slots of up to
/// [`crate::structs::NAT_BATCH_MAX`] entries. A batch goes out when full, or
/// once its oldest entry has been sitting for `flush_after`, bounding
/// delivery latency under light load.
pub struct NatBatcher {
    pending: NatBatch,
    oldest: Option<Duration>,
    flush_after: Duration,
}

impl NatBatcher {
    pub fn new(flush_after: Duration) -> Self {
        NatBatcher {
            pending: NatBatch::default(),
            oldest: None,
            flush_after,
        }
    }

    /// Returns a full batch ready to be enqueued, if this push completed one.
    pub fn push(&mut self, entry: NatEntry, now: Duration) -> Option<NatBatch> {
        if self.pending.entries.is_empty() {
            self.oldest = Some(now);
        }
        self.pending.entries.push(entry);
        if self.pending.is_full() {
            self.take()
        } else {
            None
        }
    }

    /// Returns a partial batch whose residency time is up.
    pub fn flush_due(&mut self, now: Duration) -> Option<NatBatch> {
        match self.oldest {
            Some(t0) if now.saturating_sub(t0) >= self.flush_after => self.take(),
            _ => None,
        }
    }

    /// Unconditional flush, for teardown.
    pub fn flush(&mut self) -> Option<NatBatch> {
        if self.pending.entries.is_empty() {
            None
        } else {
            self.take()
        }
    }

    fn take(&mut self) -> Option<NatBatch> {
        self.oldest = None;
        Some(std::mem::take(&mut self.pending))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structs::{CorrelationId, NAT_BATCH_MAX};
    use std::net::Ipv4Addr;

    fn entry(flow_id: u32) -> NatEntry {
        NatEntry {
            correlation: CorrelationId::new(0, flow_id),
            external_ip: Ipv4Addr::new(10, 0, 0, 1),
            external_port: 1000,
            external_ip_server: Ipv4Addr::new(10, 0, 0, 2),
            observed_seq: 0,
        }
    }

    #[test]
    fn full_ring_rejects_without_corruption() {
        let (tx, rx) = ring::<u32>("test", 4);
        for i in 0..4 {
            tx.try_send(i).unwrap();
        }
        // fifth enqueue fails, first four stay intact
        assert_eq!(tx.try_send(4), Err(4));
        let got: Vec<u32> = std::iter::from_fn(|| rx.try_recv()).collect();
        assert_eq!(got, vec![0, 1, 2, 3]);
    }

    #[test]
    fn bounded_retry_reports_stall() {
        let (tx, _rx) = ring::<u32>("stalled", 1);
        tx.send(0).unwrap();
        match tx.send(1) {
            Err(Error::RingStalled { ring, attempts }) => {
                assert_eq!(ring, "stalled");
                assert_eq!(attempts, SEND_RETRIES);
            }
            other => panic!("expected stall, got {other:?}"),
        }
    }

    #[test]
    fn hung_up_consumer_is_not_a_stall() {
        let (tx, rx) = ring::<u32>("gone", 4);
        drop(rx);
        match tx.send(1) {
            Err(Error::RingDisconnected { ring }) => assert_eq!(ring, "gone"),
            other => panic!("expected disconnect, got {other:?}"),
        }
    }

    #[test]
    fn batcher_emits_on_full() {
        let mut b = NatBatcher::new(Duration::from_millis(1));
        let now = Duration::ZERO;
        for i in 0..NAT_BATCH_MAX - 1 {
            assert!(b.push(entry(i as u32), now).is_none());
        }
        let batch = b.push(entry(99), now).expect("batch should be full");
        assert_eq!(batch.entries.len(), NAT_BATCH_MAX);
        assert!(b.flush().is_none());
    }

    #[test]
    fn batcher_flushes_by_residency() {
        let mut b = NatBatcher::new(Duration::from_millis(1));
        b.push(entry(1), Duration::from_micros(100));
        assert!(b.flush_due(Duration::from_micros(900)).is_none());
        let batch = b.flush_due(Duration::from_micros(1100)).unwrap();
        assert_eq!(batch.entries.len(), 1);
        // nothing left pending
        assert!(b.flush_due(Duration::from_secs(1)).is_none());
    }
}
