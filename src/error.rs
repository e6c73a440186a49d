use thiserror::Error;

/// Fatal conditions. Everything recoverable (stale NAT reports, learn
/// timeouts) is handled locally and only surfaces through counters.
#[derive(Debug, Error)]
pub enum Error {
    /// A fixed-size pool ran dry. This means the configuration undersizes the
    /// run, not a transient fault, so the worker terminates.
    #[error("{what} pool exhausted ({capacity} objects), increase the configured pool size")]
    PoolExhausted { what: &'static str, capacity: usize },

    /// A messaging ring stayed full across all retry attempts, so the
    /// consumer on the other side is presumed stuck.
    #[error("ring '{ring}' still full after {attempts} attempts, consumer presumed stuck")]
    RingStalled { ring: &'static str, attempts: u32 },

    /// The consumer side of a ring has been dropped. Expected once the
    /// owning worker exits; callers on shutdown paths treat it as benign.
    #[error("ring '{ring}' has no consumer anymore")]
    RingDisconnected { ring: &'static str },

    #[error("invalid configuration: {0}")]
    Config(String),
}
