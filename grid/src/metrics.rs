use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crossbeam_utils::CachePadded;

/// A thread-safe, internal metrics collector for one grid node.
/// All fields are atomic to allow for lock-free updates.
#[derive(Debug)]
pub struct Metrics {
  // --- Reads ---
  pub(crate) hits: CachePadded<AtomicU64>,
  pub(crate) misses: CachePadded<AtomicU64>,

  // --- Writes ---
  pub(crate) stores: CachePadded<AtomicU64>,
  pub(crate) removes: CachePadded<AtomicU64>,

  // --- Container bounds ---
  pub(crate) evictions: CachePadded<AtomicU64>,
  pub(crate) expirations: CachePadded<AtomicU64>,
  pub(crate) passivations: CachePadded<AtomicU64>,
  pub(crate) activations: CachePadded<AtomicU64>,

  // --- Concurrency control ---
  pub(crate) lock_timeouts: CachePadded<AtomicU64>,
  pub(crate) retries: CachePadded<AtomicU64>,

  // --- Topology ---
  pub(crate) rebalances: CachePadded<AtomicU64>,
  pub(crate) state_transfer_segments: CachePadded<AtomicU64>,
  pub(crate) state_transfer_entries: CachePadded<AtomicU64>,
  pub(crate) segments_lost: CachePadded<AtomicU64>,
  pub(crate) availability_rejections: CachePadded<AtomicU64>,
  // f64 bit pattern of the last estimated data loss fraction.
  last_loss_fraction: CachePadded<AtomicU64>,

  // --- Partition merges ---
  pub(crate) conflicts_detected: CachePadded<AtomicU64>,
  pub(crate) conflicts_resolved: CachePadded<AtomicU64>,

  created_at: Instant,
}

impl Default for Metrics {
  fn default() -> Self {
    Self {
      hits: CachePadded::new(AtomicU64::new(0)),
      misses: CachePadded::new(AtomicU64::new(0)),
      stores: CachePadded::new(AtomicU64::new(0)),
      removes: CachePadded::new(AtomicU64::new(0)),
      evictions: CachePadded::new(AtomicU64::new(0)),
      expirations: CachePadded::new(AtomicU64::new(0)),
      passivations: CachePadded::new(AtomicU64::new(0)),
      activations: CachePadded::new(AtomicU64::new(0)),
      lock_timeouts: CachePadded::new(AtomicU64::new(0)),
      retries: CachePadded::new(AtomicU64::new(0)),
      rebalances: CachePadded::new(AtomicU64::new(0)),
      state_transfer_segments: CachePadded::new(AtomicU64::new(0)),
      state_transfer_entries: CachePadded::new(AtomicU64::new(0)),
      segments_lost: CachePadded::new(AtomicU64::new(0)),
      availability_rejections: CachePadded::new(AtomicU64::new(0)),
      last_loss_fraction: CachePadded::new(AtomicU64::new(0f64.to_bits())),
      conflicts_detected: CachePadded::new(AtomicU64::new(0)),
      conflicts_resolved: CachePadded::new(AtomicU64::new(0)),
      created_at: Instant::now(),
    }
  }
}

impl Metrics {
  pub(crate) fn new() -> Self {
    Self::default()
  }

  #[inline]
  pub(crate) fn incr(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
  }

  #[inline]
  pub(crate) fn add(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
  }

  pub(crate) fn record_loss_fraction(&self, fraction: f64) {
    self
      .last_loss_fraction
      .store(fraction.to_bits(), Ordering::Relaxed);
  }

  /// Creates a point-in-time snapshot of the current metrics.
  pub(crate) fn snapshot(&self) -> MetricsSnapshot {
    let hits = self.hits.load(Ordering::Relaxed);
    let misses = self.misses.load(Ordering::Relaxed);
    let total_lookups = hits + misses;

    MetricsSnapshot {
      hits,
      misses,
      hit_ratio: if total_lookups == 0 {
        0.0
      } else {
        hits as f64 / total_lookups as f64
      },
      stores: self.stores.load(Ordering::Relaxed),
      removes: self.removes.load(Ordering::Relaxed),
      evictions: self.evictions.load(Ordering::Relaxed),
      expirations: self.expirations.load(Ordering::Relaxed),
      passivations: self.passivations.load(Ordering::Relaxed),
      activations: self.activations.load(Ordering::Relaxed),
      lock_timeouts: self.lock_timeouts.load(Ordering::Relaxed),
      retries: self.retries.load(Ordering::Relaxed),
      rebalances: self.rebalances.load(Ordering::Relaxed),
      state_transfer_segments: self.state_transfer_segments.load(Ordering::Relaxed),
      state_transfer_entries: self.state_transfer_entries.load(Ordering::Relaxed),
      segments_lost: self.segments_lost.load(Ordering::Relaxed),
      availability_rejections: self.availability_rejections.load(Ordering::Relaxed),
      last_loss_fraction: f64::from_bits(self.last_loss_fraction.load(Ordering::Relaxed)),
      conflicts_detected: self.conflicts_detected.load(Ordering::Relaxed),
      conflicts_resolved: self.conflicts_resolved.load(Ordering::Relaxed),
      uptime_secs: self.created_at.elapsed().as_secs(),
    }
  }
}

/// A point-in-time, public-facing snapshot of a node's metrics.
#[derive(Clone)]
pub struct MetricsSnapshot {
  /// Reads that found a live entry.
  pub hits: u64,
  /// Reads that found nothing (or only an expired entry).
  pub misses: u64,
  /// The cache hit ratio (hits / (hits + misses)).
  pub hit_ratio: f64,
  /// Entries written into the local container, including backups.
  pub stores: u64,
  /// Entries removed from the local container by explicit deletes.
  pub removes: u64,
  /// Entries evicted because the container exceeded `max_count`.
  pub evictions: u64,
  /// Entries removed because their lifespan or max-idle elapsed.
  pub expirations: u64,
  /// Evicted entries written to the store.
  pub passivations: u64,
  /// Entries brought back into memory from the store.
  pub activations: u64,
  /// Lock acquisitions that gave up after the timeout.
  pub lock_timeouts: u64,
  /// Operations retried against a newer topology.
  pub retries: u64,
  /// Topologies with a pending hash processed by this node.
  pub rebalances: u64,
  /// Segments received through state transfer.
  pub state_transfer_segments: u64,
  /// Entries received through state transfer.
  pub state_transfer_entries: u64,
  /// Segments that lost every owner at once.
  pub segments_lost: u64,
  /// Operations refused because this node's partition was degraded.
  pub availability_rejections: u64,
  /// The last estimated fraction of data lost to simultaneous departures.
  pub last_loss_fraction: f64,
  /// Conflicting keys found after partition merges.
  pub conflicts_detected: u64,
  /// Conflicting keys resolved by a merge policy.
  pub conflicts_resolved: u64,
  /// The number of seconds the node has been running.
  pub uptime_secs: u64,
}

impl fmt::Debug for MetricsSnapshot {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("MetricsSnapshot")
      .field("hits", &self.hits)
      .field("misses", &self.misses)
      .field("hit_ratio", &format!("{:.2}%", self.hit_ratio * 100.0))
      .field("stores", &self.stores)
      .field("removes", &self.removes)
      .field("evictions", &self.evictions)
      .field("expirations", &self.expirations)
      .field("passivations", &self.passivations)
      .field("activations", &self.activations)
      .field("lock_timeouts", &self.lock_timeouts)
      .field("retries", &self.retries)
      .field("rebalances", &self.rebalances)
      .field("state_transfer_segments", &self.state_transfer_segments)
      .field("state_transfer_entries", &self.state_transfer_entries)
      .field("segments_lost", &self.segments_lost)
      .field("availability_rejections", &self.availability_rejections)
      .field(
        "last_loss_fraction",
        &format!("{:.2}%", self.last_loss_fraction * 100.0),
      )
      .field("conflicts_detected", &self.conflicts_detected)
      .field("conflicts_resolved", &self.conflicts_resolved)
      .field("uptime_secs", &self.uptime_secs)
      .finish()
  }
}
