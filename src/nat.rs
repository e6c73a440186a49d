//! NAT learning engine: correlates translated-address reports arriving over
//! the inter-core rings with the pending flow that triggered them.

use crate::pool::{Handle, Pool};
use crate::stats::WorkerStats;
use crate::structs::{
    CorrelationEmbed, CorrelationId, FlowInstance, LearnMode, NatBatch, NatState, Protocol,
};

use rustc_hash::FxHashMap;

/// Per-worker learning state. At most one outstanding record per
/// correlation id; ids derive from unique flow ids so this holds by
/// construction.
pub struct NatEngine {
    learn_mode: LearnMode,
    learn_verify: bool,
    table: FxHashMap<CorrelationId, Handle<FlowInstance>>,
}

impl NatEngine {
    pub fn new(learn_mode: LearnMode, learn_verify: bool) -> Self {
        NatEngine {
            learn_mode,
            learn_verify,
            table: FxHashMap::default(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.learn_mode.is_enabled()
    }

    pub fn outstanding(&self) -> usize {
        self.table.len()
    }

    /// Register a pending flow when its first packet goes on the wire.
    pub fn register(&mut self, cid: CorrelationId, flow: Handle<FlowInstance>) {
        let prev = self.table.insert(cid, flow);
        debug_assert!(prev.is_none(), "duplicate correlation id {cid}");
    }

    /// Drop a pending record (learn timeout or flow cancellation). Later
    /// reports for this id become harmless lookup misses.
    pub fn forget(&mut self, cid: CorrelationId) -> bool {
        self.table.remove(&cid).is_some()
    }

    /// How the correlation id rides in this flow's early packets. `None`
    /// once the flow is learned or when learning is off.
    pub fn embed_for(&self, flow: &FlowInstance) -> Option<CorrelationEmbed> {
        if !flow.is_learning() {
            return None;
        }
        match (self.learn_mode, flow.protocol) {
            (LearnMode::Disabled, _) => None,
            (LearnMode::IpOption, _) => Some(CorrelationEmbed::IpOption(flow.correlation)),
            (LearnMode::TcpAck, Protocol::TCP) => {
                Some(CorrelationEmbed::TcpAck(flow.correlation.as_tcp_ack()))
            }
            (LearnMode::TcpAck, Protocol::UDP) => {
                Some(CorrelationEmbed::IpId(flow.correlation.flow_id() as u16))
            }
        }
    }

    /// Apply one batch of reports. Misses are counted and discarded (the
    /// flow already aged out, or the id was mangled); hits advance the state
    /// machine and unregister the record unless a second report is still
    /// expected.
    pub fn handle_batch(
        &mut self,
        batch: &NatBatch,
        flows: &mut Pool<FlowInstance>,
        stats: &mut WorkerStats,
    ) {
        for entry in &batch.entries {
            let handle = match self.table.get(&entry.correlation) {
                Some(h) => *h,
                None => {
                    stats.nat_lookup_miss += 1;
                    continue;
                }
            };
            let flow = match flows.get_mut(handle) {
                Some(f) => f,
                None => {
                    // record outlived its flow, clean up and count the miss
                    self.table.remove(&entry.correlation);
                    stats.nat_lookup_miss += 1;
                    continue;
                }
            };

            if self.learn_verify && entry.external_ip != flow.src_ip {
                stats.nat_learn_error += 1;
            }

            match flow.nat_state {
                NatState::Wait => {
                    flow.external = Some((entry.external_ip, entry.external_port));
                    if flow.protocol == Protocol::TCP {
                        // still need the SYN-ACK observation for the
                        // server-side sequence delta
                        flow.nat_state = NatState::WaitAck;
                    } else {
                        flow.nat_state = NatState::Learned;
                        stats.nat_learned += 1;
                        self.table.remove(&entry.correlation);
                    }
                }
                NatState::WaitAck => {
                    flow.seq_delta = entry.observed_seq.wrapping_sub(flow.server_seq_base);
                    flow.nat_state = NatState::Learned;
                    stats.nat_learned += 1;
                    self.table.remove(&entry.correlation);
                }
                // a registered flow is in Wait or WaitAck by construction
                NatState::First | NatState::Learned => {
                    log::debug!(
                        "unexpected report for flow {} in {:?}",
                        entry.correlation,
                        flow.nat_state
                    );
                    stats.nat_lookup_miss += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structs::NatEntry;
    use std::net::Ipv4Addr;

    fn test_flow(protocol: Protocol, flow_id: u32) -> FlowInstance {
        FlowInstance {
            template: 0,
            flow_id,
            correlation: CorrelationId::new(0, flow_id),
            protocol,
            pkt_index: 0,
            pkt_count: 2,
            src_ip: Ipv4Addr::new(16, 0, 0, 1),
            dst_ip: Ipv4Addr::new(48, 0, 0, 1),
            src_port: 1025,
            dst_port: 53,
            nat_state: NatState::Wait,
            external: None,
            server_seq_base: 1000,
            seq_delta: 0,
        }
    }

    fn report(cid: CorrelationId, port: u16, seq: u32) -> NatBatch {
        NatBatch {
            entries: vec![NatEntry {
                correlation: cid,
                external_ip: Ipv4Addr::new(77, 0, 0, 1),
                external_port: port,
                external_ip_server: Ipv4Addr::new(48, 0, 0, 1),
                observed_seq: seq,
            }],
        }
    }

    #[test]
    fn udp_flow_learns_in_one_report() {
        let mut nat = NatEngine::new(LearnMode::TcpAck, false);
        let mut flows = Pool::new("flows", 4);
        let mut stats = WorkerStats::default();
        let flow = test_flow(Protocol::UDP, 1);
        let cid = flow.correlation;
        let h = flows.alloc(flow).unwrap();
        nat.register(cid, h);

        nat.handle_batch(&report(cid, 5555, 0), &mut flows, &mut stats);
        let flow = flows.get(h).unwrap();
        assert_eq!(flow.nat_state, NatState::Learned);
        assert_eq!(flow.external, Some((Ipv4Addr::new(77, 0, 0, 1), 5555)));
        assert_eq!(stats.nat_learned, 1);
        assert_eq!(nat.outstanding(), 0);
    }

    #[test]
    fn tcp_flow_needs_two_reports_for_seq_delta() {
        let mut nat = NatEngine::new(LearnMode::TcpAck, false);
        let mut flows = Pool::new("flows", 4);
        let mut stats = WorkerStats::default();
        let flow = test_flow(Protocol::TCP, 2);
        let cid = flow.correlation;
        let h = flows.alloc(flow).unwrap();
        nat.register(cid, h);

        nat.handle_batch(&report(cid, 6000, 0), &mut flows, &mut stats);
        assert_eq!(flows.get(h).unwrap().nat_state, NatState::WaitAck);
        assert_eq!(nat.outstanding(), 1);
        assert_eq!(stats.nat_learned, 0);

        nat.handle_batch(&report(cid, 6000, 1500), &mut flows, &mut stats);
        let flow = flows.get(h).unwrap();
        assert_eq!(flow.nat_state, NatState::Learned);
        assert_eq!(flow.seq_delta, 500);
        assert_eq!(stats.nat_learned, 1);
        assert_eq!(nat.outstanding(), 0);
    }

    #[test]
    fn repeated_report_is_a_miss_not_a_double_apply() {
        let mut nat = NatEngine::new(LearnMode::TcpAck, false);
        let mut flows = Pool::new("flows", 4);
        let mut stats = WorkerStats::default();
        let flow = test_flow(Protocol::UDP, 3);
        let cid = flow.correlation;
        let h = flows.alloc(flow).unwrap();
        nat.register(cid, h);

        nat.handle_batch(&report(cid, 5555, 0), &mut flows, &mut stats);
        nat.handle_batch(&report(cid, 9999, 0), &mut flows, &mut stats);
        let flow = flows.get(h).unwrap();
        // first report sticks, the replay only bumps the miss counter
        assert_eq!(flow.external, Some((Ipv4Addr::new(77, 0, 0, 1), 5555)));
        assert_eq!(stats.nat_learned, 1);
        assert_eq!(stats.nat_lookup_miss, 1);
    }

    #[test]
    fn report_for_unknown_id_is_counted_and_discarded() {
        let mut nat = NatEngine::new(LearnMode::TcpAck, false);
        let mut flows = Pool::new("flows", 4);
        let mut stats = WorkerStats::default();
        nat.handle_batch(
            &report(CorrelationId::new(0, 404), 1, 0),
            &mut flows,
            &mut stats,
        );
        assert_eq!(stats.nat_lookup_miss, 1);
    }

    #[test]
    fn stale_flow_handle_counts_as_miss() {
        let mut nat = NatEngine::new(LearnMode::TcpAck, false);
        let mut flows = Pool::new("flows", 4);
        let mut stats = WorkerStats::default();
        let flow = test_flow(Protocol::UDP, 5);
        let cid = flow.correlation;
        let h = flows.alloc(flow).unwrap();
        nat.register(cid, h);
        // flow cancelled without forgetting the record
        flows.free(h);

        nat.handle_batch(&report(cid, 5555, 0), &mut flows, &mut stats);
        assert_eq!(stats.nat_lookup_miss, 1);
        assert_eq!(nat.outstanding(), 0);
    }

    #[test]
    fn learn_verify_flags_translated_address() {
        let mut nat = NatEngine::new(LearnMode::TcpAck, true);
        let mut flows = Pool::new("flows", 4);
        let mut stats = WorkerStats::default();
        let flow = test_flow(Protocol::UDP, 6);
        let cid = flow.correlation;
        let h = flows.alloc(flow).unwrap();
        nat.register(cid, h);
        // reported external ip (77.0.0.1) != internal source (16.0.0.1)
        nat.handle_batch(&report(cid, 5555, 0), &mut flows, &mut stats);
        assert_eq!(stats.nat_learn_error, 1);
    }

    #[test]
    fn embed_selection_follows_mode_and_protocol() {
        let nat = NatEngine::new(LearnMode::TcpAck, false);
        let udp = test_flow(Protocol::UDP, 7);
        let tcp = test_flow(Protocol::TCP, 8);
        assert!(matches!(nat.embed_for(&udp), Some(CorrelationEmbed::IpId(_))));
        assert!(matches!(nat.embed_for(&tcp), Some(CorrelationEmbed::TcpAck(_))));

        let nat = NatEngine::new(LearnMode::IpOption, false);
        assert!(matches!(
            nat.embed_for(&udp),
            Some(CorrelationEmbed::IpOption(_))
        ));

        let mut learned = test_flow(Protocol::TCP, 9);
        learned.nat_state = NatState::Learned;
        assert_eq!(nat.embed_for(&learned), None);
    }
}
