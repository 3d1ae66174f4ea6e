// src/config.rs

//! Manages engine configuration: loading, defaults, and validation.

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Governs how snapshot-phase writes treat keys that already exist on the target.
/// Journal replay is unconditional and never consults this policy.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictPolicy {
    /// Issue writes blindly. Fastest; the recommended default.
    #[default]
    Overwrite,
    /// Probe with EXISTS and abort the run on the first collision.
    Panic,
    /// Probe with EXISTS and skip colliding keys.
    Skip,
}

/// The kind of target deployment the router should expect.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TargetMode {
    /// Probe with CLUSTER SLOTS and fall back to standalone if the target
    /// reports that cluster support is disabled.
    #[default]
    Auto,
    Standalone,
    Cluster,
}

/// Connection settings for the Dragonfly source.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SourceConfig {
    /// `host:port` of the Dragonfly primary.
    pub addr: String,
    /// Password sent via AUTH before the handshake, if the source requires one.
    #[serde(default)]
    pub password: Option<String>,
    /// Address announced to the source via `REPLCONF ip-address`. Falls back
    /// to the local address of the control socket.
    #[serde(default)]
    pub announce_ip: Option<String>,
    /// Port announced via `REPLCONF listening-port`. Falls back to the local
    /// port of the control socket.
    #[serde(default)]
    pub announce_port: Option<u16>,
    #[serde(with = "humantime_serde", default = "default_connect_timeout")]
    pub connect_timeout: Duration,
    /// Read deadline for short control exchanges (handshake replies).
    #[serde(with = "humantime_serde", default = "default_control_timeout")]
    pub control_timeout: Duration,
    /// TCP keepalive period on source sockets.
    #[serde(with = "humantime_serde", default = "default_keepalive")]
    pub keepalive: Duration,
    /// Requested kernel receive buffer size on FLOW sockets. A large buffer
    /// absorbs journal bytes the source sends while workers wait on the
    /// snapshot barrier.
    #[serde(default = "default_recv_buffer_bytes")]
    pub recv_buffer_bytes: usize,
}

/// Connection settings for the Redis target.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TargetConfig {
    /// `host:port` of a seed node. In cluster mode the full topology is
    /// discovered from this node.
    pub addr: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub mode: TargetMode,
    #[serde(with = "humantime_serde", default = "default_connect_timeout")]
    pub connect_timeout: Duration,
    /// Deadline for a single reply (or a full pipeline of replies) from a node.
    #[serde(with = "humantime_serde", default = "default_response_timeout")]
    pub response_timeout: Duration,
    /// How many times a broken node connection is re-dialed before the
    /// failure becomes fatal for the session.
    #[serde(default = "default_node_reconnect_attempts")]
    pub node_reconnect_attempts: u32,
}

/// Tuning knobs for the replication engine itself.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ReplicationConfig {
    #[serde(default)]
    pub conflict_policy: ConflictPolicy,
    /// Snapshot-phase pipeline ceiling per node against a cluster target.
    /// An empirical default, not a protocol constant.
    #[serde(default = "default_cluster_batch_size")]
    pub cluster_batch_size: usize,
    /// Snapshot-phase pipeline ceiling against a standalone target.
    #[serde(default = "default_standalone_batch_size")]
    pub standalone_batch_size: usize,
    /// Journal-phase pipeline ceiling per flush.
    #[serde(default = "default_journal_batch_size")]
    pub journal_batch_size: usize,
    /// Capacity of the shared snapshot entry channel.
    #[serde(default = "default_entry_channel_capacity")]
    pub entry_channel_capacity: usize,
    /// Capacity of each per-FLOW journal channel.
    #[serde(default = "default_journal_channel_capacity")]
    pub journal_channel_capacity: usize,
    /// Collections larger than this are restored with several chained
    /// RPUSH/SADD/HSET/ZADD commands instead of one giant one.
    #[serde(default = "default_value_chunk_size")]
    pub value_chunk_size: usize,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            conflict_policy: ConflictPolicy::default(),
            cluster_batch_size: default_cluster_batch_size(),
            standalone_batch_size: default_standalone_batch_size(),
            journal_batch_size: default_journal_batch_size(),
            entry_channel_capacity: default_entry_channel_capacity(),
            journal_channel_capacity: default_journal_channel_capacity(),
            value_chunk_size: default_value_chunk_size(),
        }
    }
}

/// Where and how often per-shard LSN checkpoints are persisted.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CheckpointConfig {
    #[serde(default = "default_checkpoint_path")]
    pub path: String,
    #[serde(with = "humantime_serde", default = "default_checkpoint_interval")]
    pub interval: Duration,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            path: default_checkpoint_path(),
            interval: default_checkpoint_interval(),
        }
    }
}

/// File sinks consumed by the CLI front-end and the dashboard.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct StatusConfig {
    /// Path of the JSON status document, atomically rewritten while running.
    #[serde(default)]
    pub status_path: Option<String>,
    /// Path of the append-only event log. One JSON line per notable transition.
    #[serde(default)]
    pub event_log_path: Option<String>,
    /// How often the status document is refreshed between events.
    #[serde(with = "humantime_serde", default = "default_status_refresh")]
    pub refresh: Duration,
}

/// The root configuration, loaded from a YAML file.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    pub source: SourceConfig,
    pub target: TargetConfig,
    #[serde(default)]
    pub replication: ReplicationConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub status: StatusConfig,
}

impl Config {
    /// Loads and validates the configuration from a YAML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::new(path, config::FileFormat::Yaml))
            .build()
            .with_context(|| format!("Failed to read config file {path}"))?;

        let cfg: Config = settings
            .try_deserialize()
            .with_context(|| format!("Failed to parse config file {path}"))?;

        cfg.validate()?;
        Ok(cfg)
    }

    /// Rejects configurations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.source.addr.is_empty() {
            return Err(anyhow!("source.addr must not be empty"));
        }
        if self.target.addr.is_empty() {
            return Err(anyhow!("target.addr must not be empty"));
        }
        if self.source.addr == self.target.addr {
            return Err(anyhow!(
                "source.addr and target.addr must not point at the same endpoint"
            ));
        }
        if self.replication.cluster_batch_size == 0
            || self.replication.standalone_batch_size == 0
            || self.replication.journal_batch_size == 0
        {
            return Err(anyhow!("batch sizes must be greater than zero"));
        }
        if self.replication.entry_channel_capacity == 0
            || self.replication.journal_channel_capacity == 0
        {
            return Err(anyhow!("channel capacities must be greater than zero"));
        }
        if self.replication.value_chunk_size == 0 {
            return Err(anyhow!("replication.value_chunk_size must be greater than zero"));
        }
        if self.checkpoint.path.is_empty() {
            return Err(anyhow!("checkpoint.path must not be empty"));
        }
        if self.checkpoint.interval < Duration::from_millis(100) {
            return Err(anyhow!("checkpoint.interval must be at least 100ms"));
        }
        Ok(())
    }

    /// The pipeline ceiling for the snapshot phase, by target kind.
    pub fn snapshot_batch_size(&self, cluster: bool) -> usize {
        if cluster {
            self.replication.cluster_batch_size
        } else {
            self.replication.standalone_batch_size
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_connect_timeout() -> Duration {
    Duration::from_secs(5)
}
fn default_control_timeout() -> Duration {
    Duration::from_secs(5)
}
fn default_response_timeout() -> Duration {
    Duration::from_secs(60)
}
fn default_keepalive() -> Duration {
    Duration::from_secs(30)
}
fn default_recv_buffer_bytes() -> usize {
    16 * 1024 * 1024
}
fn default_node_reconnect_attempts() -> u32 {
    3
}
fn default_cluster_batch_size() -> usize {
    20_000
}
fn default_standalone_batch_size() -> usize {
    2_000
}
fn default_journal_batch_size() -> usize {
    256
}
fn default_entry_channel_capacity() -> usize {
    8_192
}
fn default_journal_channel_capacity() -> usize {
    4_096
}
fn default_value_chunk_size() -> usize {
    512
}
fn default_checkpoint_path() -> String {
    "riptide-checkpoint.json".to_string()
}
fn default_checkpoint_interval() -> Duration {
    Duration::from_secs(5)
}
fn default_status_refresh() -> Duration {
    Duration::from_secs(2)
}
