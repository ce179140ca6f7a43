//! Configuration types for Fidias
//!
//! One immutable tree built at startup and shared by handle. Every section
//! has defaults, so a partial TOML file or a handful of environment
//! overrides is enough to start a node.

use crate::error::{Error, Result};
use crate::hasher::HashAlgorithm;
use crate::types::WriteOptions;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration for a Fidias node
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Node identity and addresses
    pub node: NodeConfig,
    /// Ring and placement
    pub ring: RingConfig,
    /// Write-ahead log and ballots
    pub wal: WalConfig,
    /// Default write options
    pub write: WriteOptions,
    /// Outbound transport
    pub transport: TransportConfig,
    /// Block device
    pub blocks: BlockConfig,
    /// Key namespaces
    pub namespaces: NamespaceConfig,
    /// Local stores
    pub storage: StorageConfig,
    /// Logging
    pub logging: LoggingConfig,
}

impl Config {
    /// Reject inconsistent values
    pub fn validate(&self) -> Result<()> {
        if self.ring.replicas == 0 {
            return Err(Error::Configuration("ring.replicas must be at least 1".into()));
        }
        if self.wal.min_votes == 0 || self.wal.min_votes > self.ring.replicas {
            return Err(Error::Configuration(format!(
                "wal.min_votes must be within 1..={} (got {})",
                self.ring.replicas, self.wal.min_votes
            )));
        }
        if self.ring.vnodes == 0 {
            return Err(Error::Configuration("ring.vnodes must be at least 1".into()));
        }
        if self.ring.group_bits > 64 {
            return Err(Error::Configuration("ring.group_bits must be at most 64".into()));
        }
        if self.ring.stabilize_min_ms > self.ring.stabilize_max_ms {
            return Err(Error::Configuration(
                "ring.stabilize_min_ms exceeds ring.stabilize_max_ms".into(),
            ));
        }
        if self.ring.rebalance_buffer == 0 {
            return Err(Error::Configuration("ring.rebalance_buffer must be at least 1".into()));
        }
        if self.blocks.block_size == 0 {
            return Err(Error::Configuration("blocks.block_size must be non-zero".into()));
        }
        if self.blocks.fan_out < 2 {
            return Err(Error::Configuration("blocks.fan_out must be at least 2".into()));
        }
        if self.blocks.replicas == 0 {
            return Err(Error::Configuration("blocks.replicas must be at least 1".into()));
        }
        let (kv, fs) = (&self.namespaces.kv, &self.namespaces.fs);
        if kv.starts_with(fs.as_str()) || fs.starts_with(kv.as_str()) {
            return Err(Error::Configuration(format!(
                "namespaces.kv ({kv:?}) and namespaces.fs ({fs:?}) overlap"
            )));
        }
        if self.node.bind_address.is_empty() {
            return Err(Error::Configuration("node.bind_address is empty".into()));
        }
        Ok(())
    }

    /// Address other members reach this node on
    #[must_use]
    pub fn advertise_address(&self) -> &str {
        self.node
            .advertise_address
            .as_deref()
            .unwrap_or(&self.node.bind_address)
    }
}

/// Node identity
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Node name (human-readable identifier)
    pub name: String,
    /// Listen address (`host:port`)
    pub bind_address: String,
    /// Advertised address when it differs from the bind address
    pub advertise_address: Option<String>,
    /// Data directory for stores and the stable file
    pub data_dir: PathBuf,
    /// Members to join at startup
    pub seeds: Vec<String>,
    /// Region label
    pub region: String,
    /// Sector label
    pub sector: String,
    /// Zone label
    pub zone: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "fidias-node".to_string(),
            bind_address: "127.0.0.1:7100".to_string(),
            advertise_address: None,
            data_dir: PathBuf::from("/var/lib/fidias"),
            seeds: Vec::new(),
            region: "default".to_string(),
            sector: "default".to_string(),
            zone: "default".to_string(),
        }
    }
}

/// Ring and placement configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RingConfig {
    /// Replication factor
    pub replicas: usize,
    /// Vnodes per physical node
    pub vnodes: u16,
    /// Successors scoured after each replica on reads
    pub successors: usize,
    /// Width of the affinity bucket in bits
    pub group_bits: u32,
    /// Lower bound of the rebalance period (ms)
    pub stabilize_min_ms: u64,
    /// Upper bound of the rebalance period (ms)
    pub stabilize_max_ms: u64,
    /// Relocate queue capacity and batch size
    pub rebalance_buffer: usize,
    /// Quiet period after a range change before the ring counts as stable (s)
    pub stable_threshold_secs: u64,
    /// Hash function
    pub hash: HashAlgorithm,
    /// Ping period (ms)
    pub ping_interval_ms: u64,
    /// Consecutive failed pings before a member is dropped
    pub ping_failure_limit: u32,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            replicas: 3,
            vnodes: 8,
            successors: 2,
            group_bits: 2,
            stabilize_min_ms: 15_000,
            stabilize_max_ms: 45_000,
            rebalance_buffer: 64,
            stable_threshold_secs: 300,
            hash: HashAlgorithm::Sha256,
            ping_interval_ms: 1_000,
            ping_failure_limit: 5,
        }
    }
}

impl RingConfig {
    /// Stable threshold as a duration
    #[must_use]
    pub const fn stable_threshold(&self) -> Duration {
        Duration::from_secs(self.stable_threshold_secs)
    }
}

/// Write-ahead log configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WalConfig {
    /// Votes (and commit acks) needed to commit
    pub min_votes: usize,
    /// Ballot deadline (ms)
    pub ballot_timeout_ms: u64,
    /// Apply queue capacity
    pub apply_queue: usize,
    /// Heal queue capacity
    pub heal_queue: usize,
    /// Fetch and check queue capacity
    pub fetch_queue: usize,
    /// Default read RPC deadline (s)
    pub read_timeout_secs: u64,
    /// Default write RPC deadline (s)
    pub write_timeout_secs: u64,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            min_votes: 2,
            ballot_timeout_ms: 5_000,
            apply_queue: 1024,
            heal_queue: 256,
            fetch_queue: 256,
            read_timeout_secs: 30,
            write_timeout_secs: 180,
        }
    }
}

impl WalConfig {
    /// Ballot deadline
    #[must_use]
    pub const fn ballot_timeout(&self) -> Duration {
        Duration::from_millis(self.ballot_timeout_ms)
    }

    /// Read deadline
    #[must_use]
    pub const fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    /// Write deadline
    #[must_use]
    pub const fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }
}

/// Outbound transport configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Idle age after which pooled connections are closed (ms)
    pub max_conn_idle_ms: u64,
    /// Reaper period (ms)
    pub reap_interval_ms: u64,
    /// Maximum frame body size
    pub max_frame_size: usize,
    /// Connect deadline (ms)
    pub connect_timeout_ms: u64,
    /// Idle connections kept per host
    pub max_idle_per_host: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_conn_idle_ms: 60_000,
            reap_interval_ms: 10_000,
            max_frame_size: 64 * 1024 * 1024, // 64 MB
            connect_timeout_ms: 3_000,
            max_idle_per_host: 8,
        }
    }
}

/// Block device configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockConfig {
    /// Data block size in bytes
    pub block_size: usize,
    /// Children per index block
    pub fan_out: usize,
    /// Replicas per block
    pub replicas: usize,
}

impl Default for BlockConfig {
    fn default() -> Self {
        Self {
            block_size: 1024 * 1024, // 1 MB
            fan_out: 256,
            replicas: 3,
        }
    }
}

/// Key namespaces
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NamespaceConfig {
    /// Prefix of KV entry keys
    pub kv: String,
    /// Prefix of versioned file entry keys
    pub fs: String,
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        Self {
            kv: "kv/".to_string(),
            fs: "fs/".to_string(),
        }
    }
}

/// Local store backend
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Volatile in-memory stores
    #[default]
    Memory,
    /// redb databases under the data directory
    Disk,
}

/// Local store configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Backend for the entry/index store and block store
    pub backend: StorageBackend,
}

/// Logging configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    pub level: String,
    /// Emit JSON lines
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
