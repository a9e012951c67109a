// Core configuration — every protocol constant lives here so tests can vary it.

use std::time::Duration;

/// Kademlia parameters and DHT server behavior.
#[derive(Debug, Clone)]
pub struct DhtConfig {
    /// Replication factor and k-bucket capacity.
    pub k: usize,
    /// Lookup parallelism: concurrent outstanding queries per iteration.
    pub alpha: usize,
    /// Timeout for a single outbound RPC.
    pub request_timeout: Duration,
    /// Timeout for reading one frame from an accepted connection.
    pub read_timeout: Duration,
    /// TTL applied to values cached locally after a successful FIND_VALUE.
    pub found_value_cache_ttl: Duration,
    /// Interval between republish passes over locally stored values.
    pub republish_interval: Duration,
    /// Rate limit applied to inbound RPC connections.
    pub rpc_rate: RateLimitConfig,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            k: 20,
            alpha: 3,
            request_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(10),
            found_value_cache_ttl: Duration::from_secs(3600),
            republish_interval: Duration::from_secs(3600),
            rpc_rate: RateLimitConfig {
                burst: 50.0,
                per_second: 10.0,
                idle_eviction: Duration::from_secs(600),
            },
        }
    }
}

/// In-memory key/value and offline-mailbox store limits.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Maximum number of stored values.
    pub max_values: usize,
    /// Maximum accumulated value bytes.
    pub max_value_bytes: usize,
    /// Maximum offline messages held per recipient.
    pub max_offline_per_recipient: usize,
    /// Maximum number of recipients with pending mailboxes.
    pub max_offline_recipients: usize,
    /// Default TTL for offline messages.
    pub offline_ttl: Duration,
    /// Minimum interval between cleanup sweeps.
    pub cleanup_interval: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            max_values: 10_000,
            max_value_bytes: 256 * 1024 * 1024,
            max_offline_per_recipient: 100,
            max_offline_recipients: 5_000,
            offline_ttl: Duration::from_secs(7 * 24 * 3600),
            cleanup_interval: Duration::from_secs(300),
        }
    }
}

/// Per-IP token bucket parameters.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    /// Bucket capacity (burst ceiling).
    pub burst: f64,
    /// Refill rate in tokens per second.
    pub per_second: f64,
    /// Buckets untouched for this long are evicted.
    pub idle_eviction: Duration,
}

/// Onion construction and inbound routing parameters.
#[derive(Debug, Clone)]
pub struct OnionConfig {
    /// Fixed padded block size for chat payloads.
    pub block_size: usize,
    /// Number of relay hops sampled for an outbound path.
    pub path_length: usize,
    /// Lower bound of the per-hop forwarding delay.
    pub relay_delay_min: Duration,
    /// Upper bound of the per-hop forwarding delay.
    pub relay_delay_max: Duration,
    /// Accept loopback / link-local next hops. Off outside of tests: a relay
    /// that bounces traffic into its own network is an SSRF primitive.
    pub allow_local_next_hop: bool,
    /// Rate limit applied to inbound onion payloads.
    pub accept_rate: RateLimitConfig,
}

impl Default for OnionConfig {
    fn default() -> Self {
        Self {
            block_size: 16 * 1024,
            path_length: 3,
            relay_delay_min: Duration::from_millis(50),
            relay_delay_max: Duration::from_millis(500),
            allow_local_next_hop: false,
            accept_rate: RateLimitConfig {
                burst: 30.0,
                per_second: 5.0,
                idle_eviction: Duration::from_secs(600),
            },
        }
    }
}

/// Relay circuit quotas and lifetimes.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Global circuit cap.
    pub max_circuits: usize,
    /// Circuits a single requester IP may hold.
    pub max_circuits_per_requester: usize,
    /// Total bytes a circuit may relay before it is closed.
    pub max_circuit_bytes: u64,
    /// Circuits idle for this long are removed.
    pub circuit_idle_timeout: Duration,
    /// Interval of the circuit cleanup loop.
    pub cleanup_interval: Duration,
    /// Timeout for a stateless relay round trip.
    pub relay_request_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_circuits: 1_000,
            max_circuits_per_requester: 10,
            max_circuit_bytes: 100 * 1024 * 1024,
            circuit_idle_timeout: Duration::from_secs(300),
            cleanup_interval: Duration::from_secs(60),
            relay_request_timeout: Duration::from_secs(10),
        }
    }
}

/// Outbound connection establishment and caching.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Timeout for a direct TCP connect.
    pub connect_timeout: Duration,
    /// Relay nodes sampled when a direct connect fails.
    pub relay_attempts: usize,
    /// Cached connections idle for this long are evicted.
    pub idle_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            relay_attempts: 3,
            idle_timeout: Duration::from_secs(600),
        }
    }
}

/// Top-level configuration record handed to the compose root.
#[derive(Debug, Clone, Default)]
pub struct CoreConfig {
    pub dht: DhtConfig,
    pub storage: StorageConfig,
    pub onion: OnionConfig,
    pub relay: RelayConfig,
    pub connection: ConnectionConfig,
    /// Address peers can reach this node on; the listen port is appended.
    /// Falls back to loopback, which only works on single-host networks.
    pub advertised_ip: Option<std::net::IpAddr>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_constants() {
        let config = CoreConfig::default();
        assert_eq!(config.dht.k, 20);
        assert_eq!(config.dht.alpha, 3);
        assert_eq!(config.onion.block_size, 16 * 1024);
        assert_eq!(config.storage.max_offline_per_recipient, 100);
        assert_eq!(config.relay.max_circuit_bytes, 100 * 1024 * 1024);
        assert!(config.advertised_ip.is_none());
    }
}
