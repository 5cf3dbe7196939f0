use crate::remoting::Address;

use std::time::Duration;

use thiserror::Error;

/// A convenience alias used throughout the grid.
pub type Result<T> = std::result::Result<T, GridError>;

/// Errors that can occur when validating a configuration or building a grid node.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
  /// `num_owners` must be at least one.
  #[error("num_owners must be at least 1")]
  ZeroOwners,
  /// `num_segments` must be at least one.
  #[error("num_segments must be at least 1")]
  ZeroSegments,
  /// A bounded container was configured with a `max_count` of zero.
  /// Leave `max_count` unset for an unbounded container.
  #[error("bounded container max_count cannot be zero")]
  ZeroMaxCount,
  /// The lock table was configured with zero stripes.
  #[error("lock concurrency level cannot be zero")]
  ZeroConcurrencyLevel,
  /// A timeout that must be positive was configured as zero.
  #[error("{0} cannot be zero")]
  ZeroTimeout(&'static str),
  /// The configured merge policy name is not registered.
  #[error("unknown merge policy '{0}'")]
  UnknownMergePolicy(String),
  /// The builder was not given a transport or a network to join.
  #[error("a transport or local network is required to build a grid node")]
  TransportRequired,
  /// The configuration document could not be parsed.
  #[error("invalid configuration document: {0}")]
  Parse(String),
}

/// Failures surfaced by a `Transport` implementation.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
  /// The target is not part of the sender's view (left, crashed or partitioned away).
  #[error("node {0} is unreachable")]
  Unreachable(Address),
  /// The target did not answer within the request timeout.
  #[error("request to {target} timed out after {timeout:?}")]
  Timeout { target: Address, timeout: Duration },
  /// The target executed the command and it failed there.
  #[error("remote failure: {0}")]
  Remote(Box<GridError>),
}

/// The error type returned by every fallible grid operation.
#[derive(Debug, Clone, Error)]
pub enum GridError {
  /// The per-key lock could not be acquired in time. Retryable.
  #[error("unable to acquire lock on key {key} for {owner} after {timeout:?}")]
  LockTimeout {
    key: String,
    owner: String,
    timeout: Duration,
  },
  /// A remote request (e.g. version collection) timed out. Retryable.
  #[error("operation timed out: {0}")]
  Timeout(String),
  /// The command was issued against an outdated topology.
  #[error("stale topology: command topology {command} but node is at {current}")]
  StaleTopology { command: u32, current: u32 },
  /// Retries against refreshed topologies were exhausted.
  #[error("cluster unavailable for key {key} after {retries} retries")]
  ClusterAvailability { key: String, retries: u32 },
  /// The cluster is in a state that does not allow the operation (e.g. a rebalance
  /// started while scanning for conflicts).
  #[error("cluster state changed: {0}")]
  ClusterState(String),
  /// This node's partition is degraded and its `when_split` setting denies the
  /// operation. Clears once the partitions merge.
  #[error("partition unavailable: {0}")]
  Availability(String),
  /// The component is in a state that forbids the call (stopped, or an overlapping
  /// conflict resolution run).
  #[error("illegal state: {0}")]
  IllegalState(String),
  /// The calling thread was interrupted while waiting.
  #[error("interrupted while waiting for lock on key {0}")]
  Interrupted(String),
  /// A transaction commit failed after `applied` of its `total` writes took
  /// effect. Applied writes are not undone.
  #[error("transaction commit applied {applied} of {total} writes: {source}")]
  PartialCommit {
    applied: usize,
    total: usize,
    #[source]
    source: Box<GridError>,
  },
  /// The persistence collaborator failed.
  #[error("persistence failure: {0}")]
  Persistence(String),
  /// The transport collaborator failed.
  #[error(transparent)]
  Transport(TransportError),
  /// An argument violated an invariant.
  #[error("illegal argument: {0}")]
  IllegalArgument(String),
  /// The configuration is invalid.
  #[error(transparent)]
  Config(#[from] ConfigError),
}

impl From<TransportError> for GridError {
  fn from(err: TransportError) -> Self {
    match err {
      // Unwrap the failure raised by the remote node so callers see the typed error.
      TransportError::Remote(inner) => *inner,
      other => GridError::Transport(other),
    }
  }
}

impl GridError {
  /// Returns `true` for failures the caller may retry (timeouts, stale topology).
  pub fn is_retryable(&self) -> bool {
    matches!(
      self,
      GridError::LockTimeout { .. }
        | GridError::Timeout(_)
        | GridError::StaleTopology { .. }
        | GridError::ClusterState(_)
        | GridError::Transport(TransportError::Timeout { .. })
    )
  }
}
