//! Plain configuration structs, one per concern.
//!
//! A `GridConfig` can be built in code (usually through `GridBuilder`) or read
//! from a YAML document. Durations use the humantime format (`"10s"`, `"250ms"`).
//!
//! ```
//! use fibre_grid::config::{validate, GridConfig};
//!
//! let config = GridConfig::from_yaml_str(
//!   r#"
//! clustering:
//!   num_owners: 3
//!   num_segments: 64
//! locking:
//!   acquire_timeout: 500ms
//! memory:
//!   max_count: 10000
//!   eviction: FIFO
//! "#,
//! )
//! .unwrap();
//! assert_eq!(config.clustering.num_owners, 3);
//! assert!(validate(&config).is_ok());
//! ```

use crate::distribution::AvailabilityMode;
use crate::error::ConfigError;

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Complete configuration of one grid cache instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConfig {
  pub clustering: ClusteringConfig,
  pub locking: LockingConfig,
  pub expiration: ExpirationConfig,
  pub memory: MemoryConfig,
  pub persistence: PersistenceConfig,
  pub state_transfer: StateTransferConfig,
  pub partition_handling: PartitionHandlingConfig,
}

impl GridConfig {
  /// Parses a YAML document. Missing sections and fields take their defaults.
  pub fn from_yaml_str(document: &str) -> Result<Self, ConfigError> {
    serde_yaml::from_str(document).map_err(|e| ConfigError::Parse(e.to_string()))
  }
}

/// Data distribution and remote invocation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusteringConfig {
  /// Number of owners (replicas) per segment.
  pub num_owners: usize,
  /// Number of hash space segments. Immutable for the lifetime of the cache.
  pub num_segments: u32,
  /// Timeout for a single remote request.
  #[serde(with = "humantime_serde")]
  pub remote_timeout: Duration,
  /// How many times an operation issued against a stale topology is retried.
  pub max_retries: u32,
  /// Base delay between retries; a random jitter of up to the same amount is added.
  #[serde(with = "humantime_serde")]
  pub retry_backoff: Duration,
}

impl Default for ClusteringConfig {
  fn default() -> Self {
    Self {
      num_owners: 2,
      num_segments: 256,
      remote_timeout: Duration::from_secs(15),
      max_retries: 5,
      retry_backoff: Duration::from_millis(10),
    }
  }
}

/// Per-key lock settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockingConfig {
  /// Maximum time a writer waits for a key lock.
  #[serde(with = "humantime_serde")]
  pub acquire_timeout: Duration,
  /// Number of lock table stripes. Rounded up to a power of two.
  pub concurrency_level: usize,
}

impl Default for LockingConfig {
  fn default() -> Self {
    Self {
      acquire_timeout: Duration::from_secs(10),
      concurrency_level: (num_cpus::get() * 4).max(1).next_power_of_two(),
    }
  }
}

/// Default expiration applied to writes that do not carry their own metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExpirationConfig {
  /// Default lifespan. `None` means entries never expire by age.
  #[serde(with = "humantime_serde")]
  pub lifespan: Option<Duration>,
  /// Default max-idle. `None` means entries never expire by inactivity.
  #[serde(with = "humantime_serde")]
  pub max_idle: Option<Duration>,
  /// Interval of the background expiration reaper. `None` disables it; expired
  /// entries are then only removed lazily on access.
  #[serde(with = "humantime_serde")]
  pub reaper_interval: Option<Duration>,
}

impl Default for ExpirationConfig {
  fn default() -> Self {
    Self {
      lifespan: None,
      max_idle: None,
      reaper_interval: Some(Duration::from_secs(1)),
    }
  }
}

/// Strategy used to pick eviction victims when the container is bounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EvictionStrategy {
  /// Least recently used entries go first.
  #[default]
  Lru,
  /// Oldest inserted entries go first.
  Fifo,
}

/// Memory bounds of the entry container.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
  /// Maximum number of entries held in memory on this node. `None` is unbounded.
  pub max_count: Option<u64>,
  pub eviction: EvictionStrategy,
}

/// How the container uses the persistence collaborator, if one is configured.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
  /// When `true`, entries are written to the store only when evicted from memory
  /// and removed from the store when activated again. When `false`, every write
  /// goes through to the store.
  pub passivation: bool,
  /// Load the store contents into memory on start.
  pub preload: bool,
}

/// Rebalance settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateTransferConfig {
  /// Upper bound for fetching the segments of one provider.
  #[serde(with = "humantime_serde")]
  pub timeout: Duration,
}

impl Default for StateTransferConfig {
  fn default() -> Self {
    Self {
      timeout: Duration::from_secs(240),
    }
  }
}

/// What a partition that lost every owner of some segment still serves.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PartitionHandling {
  /// Every partition keeps serving reads and writes and never degrades.
  #[default]
  AllowReadWrites,
  /// A degraded partition serves reads but rejects writes.
  AllowReads,
  /// A degraded partition rejects reads and writes.
  DenyReadWrites,
}

impl PartitionHandling {
  pub fn allows_reads(self, mode: AvailabilityMode) -> bool {
    mode == AvailabilityMode::Available || self != PartitionHandling::DenyReadWrites
  }

  pub fn allows_writes(self, mode: AvailabilityMode) -> bool {
    mode == AvailabilityMode::Available || self == PartitionHandling::AllowReadWrites
  }
}

/// Behaviour while the cluster is split and when partitions merge back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartitionHandlingConfig {
  pub when_split: PartitionHandling,
  /// Name of the merge policy applied automatically on merge. `None` (or `"NONE"`)
  /// leaves conflicts in place for a manual `resolve_conflicts` call.
  pub merge_policy: Option<String>,
}

impl Default for PartitionHandlingConfig {
  fn default() -> Self {
    Self {
      when_split: PartitionHandling::default(),
      merge_policy: Some(crate::conflict::policy::PREFERRED_ALWAYS.to_string()),
    }
  }
}

/// Validates a configuration.
pub fn validate(config: &GridConfig) -> Result<(), ConfigError> {
  if config.clustering.num_owners == 0 {
    return Err(ConfigError::ZeroOwners);
  }
  if config.clustering.num_segments == 0 {
    return Err(ConfigError::ZeroSegments);
  }
  if config.clustering.remote_timeout.is_zero() {
    return Err(ConfigError::ZeroTimeout("clustering.remote_timeout"));
  }
  if config.locking.acquire_timeout.is_zero() {
    return Err(ConfigError::ZeroTimeout("locking.acquire_timeout"));
  }
  if config.locking.concurrency_level == 0 {
    return Err(ConfigError::ZeroConcurrencyLevel);
  }
  if config.memory.max_count == Some(0) {
    return Err(ConfigError::ZeroMaxCount);
  }
  if config.state_transfer.timeout.is_zero() {
    return Err(ConfigError::ZeroTimeout("state_transfer.timeout"));
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use pretty_assertions::assert_eq;

  #[test]
  fn defaults_are_valid() {
    let config = GridConfig::default();
    assert!(validate(&config).is_ok());
    assert_eq!(config.clustering.num_owners, 2);
    assert_eq!(config.clustering.num_segments, 256);
    assert!(config.locking.concurrency_level.is_power_of_two());
    assert_eq!(config.memory.eviction, EvictionStrategy::Lru);
  }

  #[test]
  fn yaml_overrides_only_given_fields() {
    let config = GridConfig::from_yaml_str(
      r#"
clustering:
  num_owners: 1
  remote_timeout: 2s
expiration:
  lifespan: 1m
  reaper_interval: 50ms
partition_handling:
  when_split: DENY_READ_WRITES
  merge_policy: REMOVE_ALL
"#,
    )
    .unwrap();

    assert_eq!(config.clustering.num_owners, 1);
    assert_eq!(config.clustering.num_segments, 256);
    assert_eq!(config.clustering.remote_timeout, Duration::from_secs(2));
    assert_eq!(config.expiration.lifespan, Some(Duration::from_secs(60)));
    assert_eq!(config.expiration.max_idle, None);
    assert_eq!(
      config.expiration.reaper_interval,
      Some(Duration::from_millis(50))
    );
    assert_eq!(
      config.partition_handling.merge_policy.as_deref(),
      Some("REMOVE_ALL")
    );
    assert_eq!(config.partition_handling.when_split, PartitionHandling::DenyReadWrites);
  }

  #[test]
  fn degraded_partitions_follow_when_split() {
    use AvailabilityMode::*;
    let deny = PartitionHandling::DenyReadWrites;
    let reads = PartitionHandling::AllowReads;
    let all = PartitionHandling::AllowReadWrites;

    for policy in [deny, reads, all] {
      assert!(policy.allows_reads(Available) && policy.allows_writes(Available));
    }
    assert!(all.allows_reads(Degraded) && all.allows_writes(Degraded));
    assert!(reads.allows_reads(Degraded) && !reads.allows_writes(Degraded));
    assert!(!deny.allows_reads(Degraded) && !deny.allows_writes(Degraded));
  }

  #[test]
  fn invalid_values_are_rejected() {
    let mut config = GridConfig::default();
    config.clustering.num_owners = 0;
    assert_eq!(validate(&config), Err(ConfigError::ZeroOwners));

    let mut config = GridConfig::default();
    config.memory.max_count = Some(0);
    assert_eq!(validate(&config), Err(ConfigError::ZeroMaxCount));

    let mut config = GridConfig::default();
    config.locking.acquire_timeout = Duration::ZERO;
    assert_eq!(
      validate(&config),
      Err(ConfigError::ZeroTimeout("locking.acquire_timeout"))
    );
  }

  #[test]
  fn malformed_yaml_is_a_parse_error() {
    let err = GridConfig::from_yaml_str("clustering: [1, 2").unwrap_err();
    assert!(matches!(err, ConfigError::Parse(_)));
  }
}
