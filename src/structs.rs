use serde::Deserialize;
use std::fmt::Display;
use std::net::Ipv4Addr;
use std::time::Duration;

/// Maximum number of NAT entries batched into a single ring slot.
pub const NAT_BATCH_MAX: usize = 7;

/// A transport protocol
#[allow(clippy::upper_case_acronyms)]
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    #[serde(alias = "tcp")]
    TCP,
    #[serde(alias = "udp")]
    UDP,
}

impl Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::TCP => write!(f, "TCP"),
            Protocol::UDP => write!(f, "UDP"),
        }
    }
}

/// The direction of a packet
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PacketDirection {
    /// client to server
    #[default]
    Forward,
    /// server to client
    Backward,
}

/// How the translation learning engine embeds correlation ids on the wire.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LearnMode {
    #[default]
    Disabled,
    /// Overload the TCP acknowledgment number (IP identification for UDP).
    /// Deliberate wire hack: those fields are reserved from randomization
    /// while a flow is still learning.
    TcpAck,
    /// Dedicated IP option field carrying the raw id.
    IpOption,
}

impl LearnMode {
    pub fn is_enabled(&self) -> bool {
        *self != LearnMode::Disabled
    }
}

/// Compact id embedded on the wire so a second vantage point can report the
/// translated addressing back to the worker that owns the flow. Packs the
/// owning thread in the top byte and the flow id in the low 24 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CorrelationId(u32);

impl CorrelationId {
    pub fn new(thread_id: u8, flow_id: u32) -> Self {
        CorrelationId(((thread_id as u32) << 24) | (flow_id & 0x00ff_ffff))
    }

    pub fn thread_id(&self) -> u8 {
        (self.0 >> 24) as u8
    }

    pub fn flow_id(&self) -> u32 {
        self.0 & 0x00ff_ffff
    }

    /// Value carried in the overloaded TCP acknowledgment number.
    pub fn as_tcp_ack(&self) -> u32 {
        self.0
    }

    pub fn from_tcp_ack(ack: u32) -> Self {
        CorrelationId(ack)
    }

    /// Raw value for the dedicated option field.
    pub fn as_raw(&self) -> u32 {
        self.0
    }
}

impl Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.thread_id(), self.flow_id())
    }
}

/// Where the correlation id ended up in the packet, if anywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrelationEmbed {
    /// TCP acknowledgment number (learn mode `tcp_ack`, TCP flows)
    TcpAck(u32),
    /// IP identification field (learn mode `tcp_ack`, UDP flows; truncated)
    IpId(u16),
    /// Dedicated IP option (learn mode `ip_option`)
    IpOption(CorrelationId),
}

impl CorrelationEmbed {
    pub fn decode(&self) -> Option<CorrelationId> {
        match self {
            CorrelationEmbed::TcpAck(ack) => Some(CorrelationId::from_tcp_ack(*ack)),
            CorrelationEmbed::IpOption(cid) => Some(*cid),
            // the 16-bit field cannot carry the thread byte, the observer
            // recovers it from the ring it reports into
            CorrelationEmbed::IpId(_) => None,
        }
    }
}

/// One translated-address observation reported by the second vantage point.
#[derive(Debug, Clone, Copy)]
pub struct NatEntry {
    pub correlation: CorrelationId,
    pub external_ip: Ipv4Addr,
    pub external_port: u16,
    pub external_ip_server: Ipv4Addr,
    /// Sequence number observed on the server side, used to undo sequence
    /// randomization performed by the device under test (TCP only).
    pub observed_seq: u32,
}

/// Up to [`NAT_BATCH_MAX`] observations amortized into one ring slot.
#[derive(Debug, Clone, Default)]
pub struct NatBatch {
    pub entries: Vec<NatEntry>,
}

impl NatBatch {
    pub fn is_full(&self) -> bool {
        self.entries.len() >= NAT_BATCH_MAX
    }
}

/// Fixed-size tagged payload crossing the inter-core rings.
#[derive(Debug, Clone)]
pub enum Message {
    NatReport(NatBatch),
    LatencyEcho { timestamp_ns: u64, port: u8 },
}

/// Control-plane commands, delivered through the control ring and dispatched
/// as scheduler events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Stop,
}

/// Everything the scheduler knows about one packet send. The external
/// collaborator owns the bytes; the scheduler only measures timing and hands
/// over addressing.
#[derive(Debug, Clone)]
pub struct PacketRecord {
    pub time: Duration,
    pub template: usize,
    pub flow_id: u32,
    pub protocol: Protocol,
    pub direction: PacketDirection,
    pub pkt_index: usize,
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    /// Correlation id placement while the flow is still learning
    pub embed: Option<CorrelationEmbed>,
    /// Correction added to server-side sequence numbers once learned
    pub seq_delta: u32,
}

/// Learning progress of one flow behind a translating device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NatState {
    /// flow admitted, correlation id not yet on the wire
    First,
    /// first packet sent carrying the id, waiting for the report
    Wait,
    /// TCP only: address known, still waiting for the peer's SYN-ACK to
    /// capture server-side sequence randomization
    WaitAck,
    /// translation known, flow proceeds normally
    Learned,
}

/// Mutable per-flow state. Created on admission, destroyed on last-packet
/// delivery or learn timeout; owned exclusively by its creating worker.
#[derive(Debug, Clone)]
pub struct FlowInstance {
    pub template: usize,
    pub flow_id: u32,
    pub correlation: CorrelationId,
    pub protocol: Protocol,
    /// next packet to send
    pub pkt_index: usize,
    pub pkt_count: usize,
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub nat_state: NatState,
    /// learned external (ip, port) of the client side
    pub external: Option<(Ipv4Addr, u16)>,
    /// server ISN this side generated, baseline for the sequence delta
    pub server_seq_base: u32,
    /// correction for sequence rewriting by the device under test
    pub seq_delta: u32,
}

impl FlowInstance {
    pub fn is_learning(&self) -> bool {
        matches!(self.nat_state, NatState::First | NatState::Wait | NatState::WaitAck)
    }

    pub fn is_last_packet(&self) -> bool {
        self.pkt_index + 1 >= self.pkt_count
    }
}

/// Per-packet collaborator invoked once per send. Address rewriting and
/// checksum fixup happen behind this seam.
pub trait PacketSink {
    fn send(&mut self, pkt: &PacketRecord);
}

/// Counts sends and drops the records, the default for live runs.
#[derive(Debug, Default)]
pub struct CountingSink {
    pub sent: u64,
}

impl PacketSink for CountingSink {
    fn send(&mut self, _pkt: &PacketRecord) {
        self.sent += 1;
    }
}

/// Keeps every record, for offline runs and tests.
#[derive(Debug, Default)]
pub struct CollectSink {
    pub packets: Vec<PacketRecord>,
}

impl PacketSink for CollectSink {
    fn send(&mut self, pkt: &PacketRecord) {
        self.packets.push(pkt.clone());
    }
}

/// Liveness collaborator, tickled at least once per sync tick so a
/// supervisor can detect a stalled worker.
pub trait Watchdog {
    fn tickle(&mut self);
}

#[derive(Debug, Default)]
pub struct NullWatchdog;

impl Watchdog for NullWatchdog {
    fn tickle(&mut self) {}
}
