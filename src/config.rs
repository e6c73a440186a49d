use serde::Deserialize;
use std::net::Ipv4Addr;
use std::time::Duration;

use crate::error::Error;
use crate::structs::{LearnMode, PacketDirection, Protocol};

/// One packet of a recorded template program: gap since the previous packet
/// and which side emits it.
#[derive(Deserialize, Debug, Clone, Copy)]
#[serde(deny_unknown_fields)]
pub struct PacketSpec {
    pub gap_us: u64,
    #[serde(default)]
    pub direction: PacketDirection,
}

/// Pacing of packets within one flow.
#[derive(Deserialize, Debug, Clone)]
#[serde(try_from = "PacingYaml")]
pub enum Pacing {
    /// Replay the recorded inter-packet timing.
    Recorded { packets: Vec<PacketSpec> },
    /// Fixed inter-packet gap, client side only.
    FixedGap { count: u32, gap_us: u64 },
}

/// Wire form of [`Pacing`]: a map keyed by the mode name, so plain YAML maps
/// and JSON both parse without YAML-specific enum tags.
#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
struct PacingYaml {
    recorded: Option<RecordedYaml>,
    fixed_gap: Option<FixedGapYaml>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
struct RecordedYaml {
    packets: Vec<PacketSpec>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
struct FixedGapYaml {
    count: u32,
    gap_us: u64,
}

impl TryFrom<PacingYaml> for Pacing {
    type Error = String;

    fn try_from(y: PacingYaml) -> Result<Self, Self::Error> {
        match (y.recorded, y.fixed_gap) {
            (Some(r), None) => Ok(Pacing::Recorded { packets: r.packets }),
            (None, Some(f)) => Ok(Pacing::FixedGap {
                count: f.count,
                gap_us: f.gap_us,
            }),
            _ => Err("pacing needs exactly one of 'recorded' or 'fixed_gap'".into()),
        }
    }
}

/// Static description of one flow template. Immutable after load; mutable
/// counters live in the per-thread template pool.
#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct FlowTemplate {
    pub name: String,
    /// target flow-start rate, calls per second across all threads
    pub cps: f64,
    /// global cap on started flows, split across threads
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub plugin_id: u32,
    pub protocol: Protocol,
    /// index into the address pool list
    #[serde(default)]
    pub pool: usize,
    pub server_port: u16,
    pub pacing: Pacing,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct AddressPool {
    pub client_ip: Ipv4Addr,
    pub server_ip: Ipv4Addr,
    #[serde(default = "default_port_min")]
    pub port_min: u16,
    #[serde(default = "default_port_max")]
    pub port_max: u16,
}

fn default_port_min() -> u16 {
    1024
}
fn default_port_max() -> u16 {
    65535
}

/// The resolved run configuration. Built once, then passed immutably into
/// the scheduler, template pool and NAT engine at construction; nothing
/// reads global state.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub threads: usize,
    pub duration: Duration,
    pub sync_interval: Duration,
    /// level-0 timer wheel tick
    pub wheel_tick: Duration,
    pub wheel_size: u32,
    pub event_pool: usize,
    pub flow_pool: usize,
    pub wheel_pool: usize,
    pub ring_capacity: usize,
    pub learn_mode: LearnMode,
    /// count a learn error when the reported external address differs from
    /// the internal one (runs without a translating device)
    pub learn_verify: bool,
    /// how long released client ports stay quarantined
    pub port_release_delay: Duration,
    pub seed: u64,
    pub pools: Vec<AddressPool>,
    pub templates: Vec<FlowTemplate>,
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
struct RunConfigYaml {
    threads: Option<usize>,
    duration_sec: Option<f64>,
    sync_interval_us: Option<u64>,
    wheel_tick_us: Option<u64>,
    wheel_size: Option<u32>,
    event_pool: Option<usize>,
    flow_pool: Option<usize>,
    wheel_pool: Option<usize>,
    ring_capacity: Option<usize>,
    learn_mode: Option<LearnMode>,
    learn_verify: Option<bool>,
    port_release_delay_ms: Option<u64>,
    seed: Option<u64>,
    pools: Vec<AddressPool>,
    templates: Vec<FlowTemplate>,
}

impl From<RunConfigYaml> for RunConfig {
    fn from(y: RunConfigYaml) -> Self {
        RunConfig {
            threads: y.threads.unwrap_or(1),
            duration: Duration::from_secs_f64(y.duration_sec.unwrap_or(10.0)),
            sync_interval: Duration::from_micros(y.sync_interval_us.unwrap_or(1000)),
            wheel_tick: Duration::from_micros(y.wheel_tick_us.unwrap_or(20)),
            wheel_size: y.wheel_size.unwrap_or(256),
            event_pool: y.event_pool.unwrap_or(1 << 16),
            flow_pool: y.flow_pool.unwrap_or(1 << 16),
            wheel_pool: y.wheel_pool.unwrap_or(1 << 12),
            ring_capacity: y.ring_capacity.unwrap_or(crate::ring::DEFAULT_RING_CAPACITY),
            learn_mode: y.learn_mode.unwrap_or_default(),
            learn_verify: y.learn_verify.unwrap_or(false),
            port_release_delay: Duration::from_millis(y.port_release_delay_ms.unwrap_or(1000)),
            seed: y.seed.unwrap_or(0x5eed),
            pools: y.pools,
            templates: y.templates,
        }
    }
}

/// Import a configuration from a string, either YAML or JSON (YAML is a
/// superset of JSON).
pub fn import_config(config_string: &str) -> Result<RunConfig, Error> {
    let config: RunConfig = serde_yaml::from_str::<RunConfigYaml>(config_string)
        .map_err(|e| Error::Config(e.to_string()))?
        .into();
    config.validate()?;
    log::info!(
        "configuration loaded: {} templates, {} threads, {:?}",
        config.templates.len(),
        config.threads,
        config.duration
    );
    log::trace!("configuration: {config:?}");
    Ok(config)
}

impl RunConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.threads == 0 {
            return Err(Error::Config("threads must be >= 1".into()));
        }
        if self.threads > 255 {
            // the thread id must fit the correlation id's top byte
            return Err(Error::Config("threads must be <= 255".into()));
        }
        if !self.wheel_size.is_power_of_two() {
            return Err(Error::Config("wheel_size must be a power of two".into()));
        }
        if self.templates.is_empty() {
            return Err(Error::Config("no templates defined".into()));
        }
        if self.pools.is_empty() {
            return Err(Error::Config("no address pools defined".into()));
        }
        for (i, p) in self.pools.iter().enumerate() {
            if p.port_min > p.port_max {
                return Err(Error::Config(format!(
                    "pool {i}: port_min {} > port_max {}",
                    p.port_min, p.port_max
                )));
            }
        }
        for t in &self.templates {
            if t.pool >= self.pools.len() {
                return Err(Error::Config(format!(
                    "template '{}' references pool {} but only {} pools exist",
                    t.name,
                    t.pool,
                    self.pools.len()
                )));
            }
            if t.cps <= 0.0 {
                return Err(Error::Config(format!(
                    "template '{}' has non-positive cps",
                    t.name
                )));
            }
            if t.pacing.pkt_count() == 0 {
                return Err(Error::Config(format!(
                    "template '{}' has no packets",
                    t.name
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Two UDP templates at 10 and 20 cps on one thread, used across the
    /// admission and scheduler tests.
    pub(crate) fn two_template_config() -> RunConfig {
        import_config(
            r#"
threads: 1
duration_sec: 10
pools:
  - client_ip: 16.0.0.1
    server_ip: 48.0.0.1
templates:
  - name: dns-a
    cps: 10
    protocol: udp
    server_port: 53
    pacing:
      fixed_gap:
        count: 2
        gap_us: 1000
  - name: dns-b
    cps: 20
    protocol: udp
    server_port: 53
    pacing:
      fixed_gap:
        count: 2
        gap_us: 1000
"#,
        )
        .unwrap()
    }

    #[test]
    fn config_defaults_apply() {
        let cfg = two_template_config();
        assert_eq!(cfg.threads, 1);
        assert_eq!(cfg.wheel_size, 256);
        assert_eq!(cfg.learn_mode, LearnMode::Disabled);
        assert_eq!(cfg.sync_interval, Duration::from_millis(1));
        assert_eq!(cfg.pools[0].port_min, 1024);
    }

    #[test]
    fn config_json_is_accepted() {
        let cfg = import_config(
            r#"
{
  "threads": 2,
  "learn_mode": "tcp_ack",
  "pools": [{"client_ip": "16.0.0.1", "server_ip": "48.0.0.1"}],
  "templates": [{
    "name": "http",
    "cps": 1,
    "protocol": "tcp",
    "server_port": 80,
    "pacing": {"fixed_gap": {"count": 4, "gap_us": 500}}
  }]
}
"#,
        )
        .unwrap();
        assert_eq!(cfg.threads, 2);
        assert_eq!(cfg.learn_mode, LearnMode::TcpAck);
    }

    #[test]
    fn pacing_parses_from_plain_maps() {
        // fixed_gap as an ordinary nested map, no YAML enum tag
        let cfg = two_template_config();
        assert!(matches!(
            cfg.templates[0].pacing,
            Pacing::FixedGap {
                count: 2,
                gap_us: 1000
            }
        ));
        let cfg = import_config(
            r#"
pools:
  - client_ip: 16.0.0.1
    server_ip: 48.0.0.1
templates:
  - name: replayed
    cps: 1
    protocol: udp
    server_port: 53
    pacing:
      recorded:
        packets:
          - gap_us: 0
          - gap_us: 5000
            direction: backward
"#,
        )
        .unwrap();
        assert!(matches!(
            &cfg.templates[0].pacing,
            Pacing::Recorded { packets } if packets.len() == 2
        ));
    }

    #[test]
    fn pacing_rejects_ambiguous_modes() {
        let err = import_config(
            r#"
pools:
  - client_ip: 16.0.0.1
    server_ip: 48.0.0.1
templates:
  - name: both
    cps: 1
    protocol: udp
    server_port: 53
    pacing:
      recorded:
        packets:
          - gap_us: 0
      fixed_gap:
        count: 1
        gap_us: 0
"#,
        );
        assert!(err.is_err());
    }

    #[test]
    fn config_rejects_inverted_port_range() {
        let mut cfg = two_template_config();
        cfg.pools[0].port_min = 5000;
        cfg.pools[0].port_max = 4000;
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn config_rejects_bad_pool_index() {
        let mut cfg = two_template_config();
        cfg.templates[0].pool = 3;
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn config_rejects_unknown_fields() {
        let err = import_config("bogus_field: 1\npools: []\ntemplates: []");
        assert!(err.is_err());
    }
}
