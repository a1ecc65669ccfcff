use anyhow::bail;
use std::time::Duration;

/// Top-level configuration for the receive-side RPC core. All values have defaults that are
///  reasonable for a LAN / data-center deployment; [RpcConfig::validate] catches combinations
///  that cannot work.
#[derive(Clone, Debug)]
pub struct RpcConfig {
    pub receive_queue: ReceiveQueueConfig,
    pub conn_table: ConnTableConfig,

    /// Upper bound for one WAY challenge/response round trip. Expiry is a recoverable
    ///  validation failure for the affected call, not a fatal error.
    pub way_timeout: Duration,

    /// The largest fragment payload this node will place into a single outgoing datagram.
    ///
    /// This assumes full Ethernet frames without optional IP headers: `1500 - 20 - 8 = 1472`
    ///  bytes of UDP payload for IPV4, minus the fixed packet header. As with the MTU itself,
    ///  there is no reliable discovery for this, so the application carries the responsibility
    ///  of configuring a value all routes support.
    pub max_fragment_payload: usize,
}

#[derive(Clone, Debug)]
pub struct ReceiveQueueConfig {
    /// Minimum number of in-order payload bytes that must be queued before a blocked consumer
    ///  is woken, amortizing wake/schedule cost against the packet arrival rate. A completed
    ///  call body wakes the consumer regardless of this threshold.
    pub wake_threshold_bytes: usize,

    /// Maximum number of fragments buffered per call. Admissions beyond this bound are
    ///  reported as 'queue full' for the call layer to translate into backpressure; the queue
    ///  never discards buffered data to stay under it.
    pub max_queued_fragments: usize,
}

#[derive(Clone, Debug)]
pub struct ConnTableConfig {
    /// Number of independently locked shards of the connection table.
    pub num_shards: usize,

    /// How long an entry must have been idle (no call holding a reference) before the
    ///  reclamation sweep may evict it.
    pub idle_retention: Duration,

    /// Interval of the background reclamation sweep.
    pub sweep_interval: Duration,
}

impl Default for RpcConfig {
    fn default() -> RpcConfig {
        RpcConfig {
            receive_queue: ReceiveQueueConfig {
                wake_threshold_bytes: 4096,
                max_queued_fragments: 96,
            },
            conn_table: ConnTableConfig {
                num_shards: 16,
                idle_retention: Duration::from_secs(300),
                sweep_interval: Duration::from_secs(60),
            },
            way_timeout: Duration::from_secs(2),
            max_fragment_payload: 1464,
        }
    }
}

impl RpcConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.receive_queue.max_queued_fragments == 0 {
            bail!("receive queue must admit at least one fragment");
        }
        if self.conn_table.num_shards == 0 {
            bail!("connection table needs at least one shard");
        }
        if self.conn_table.sweep_interval.is_zero() {
            bail!("reclamation sweep interval must not be zero");
        }
        if self.max_fragment_payload < 100 {
            bail!("fragment payload size is too small");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(RpcConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_queue() {
        let mut config = RpcConfig::default();
        config.receive_queue.max_queued_fragments = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_shards() {
        let mut config = RpcConfig::default();
        config.conn_table.num_shards = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_tiny_payload() {
        let mut config = RpcConfig::default();
        config.max_fragment_payload = 10;
        assert!(config.validate().is_err());
    }
}
