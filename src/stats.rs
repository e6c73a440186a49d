/// Per-worker counters. Exposed for an external reporting collaborator;
/// the only output this crate does itself is a log dump at run end.
#[derive(Debug, Default, Clone)]
pub struct WorkerStats {
    pub flows_opened: u64,
    pub flows_closed: u64,
    pub pkts_sent: u64,
    pub events_dispatched: u64,
    pub nat_learned: u64,
    pub nat_lookup_miss: u64,
    pub nat_timeout: u64,
    pub nat_learn_error: u64,
    pub latency_echoes: u64,
    pub ports_released: u64,
    pub defer_batches: u64,
}

impl WorkerStats {
    pub fn merge(&mut self, other: &WorkerStats) {
        self.flows_opened += other.flows_opened;
        self.flows_closed += other.flows_closed;
        self.pkts_sent += other.pkts_sent;
        self.events_dispatched += other.events_dispatched;
        self.nat_learned += other.nat_learned;
        self.nat_lookup_miss += other.nat_lookup_miss;
        self.nat_timeout += other.nat_timeout;
        self.nat_learn_error += other.nat_learn_error;
        self.latency_echoes += other.latency_echoes;
        self.ports_released += other.ports_released;
        self.defer_batches += other.defer_batches;
    }

    pub fn dump(&self, label: &str) {
        log::info!(
            "{label}: {} flows opened, {} closed, {} packets, {} events",
            self.flows_opened,
            self.flows_closed,
            self.pkts_sent,
            self.events_dispatched
        );
        log::info!(
            "{label}: nat learned {}, miss {}, timeout {}, learn errors {}",
            self.nat_learned,
            self.nat_lookup_miss,
            self.nat_timeout,
            self.nat_learn_error
        );
        log::debug!(
            "{label}: {} latency echoes, {} ports released in {} batches",
            self.latency_echoes,
            self.ports_released,
            self.defer_batches
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_adds_counters() {
        let mut a = WorkerStats {
            flows_opened: 2,
            nat_timeout: 1,
            ..Default::default()
        };
        let b = WorkerStats {
            flows_opened: 3,
            pkts_sent: 10,
            ..Default::default()
        };
        a.merge(&b);
        assert_eq!(a.flows_opened, 5);
        assert_eq!(a.pkts_sent, 10);
        assert_eq!(a.nat_timeout, 1);
    }
}
