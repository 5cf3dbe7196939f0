use crate::container::{EntryVersion, Metadata};

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A key, its value and the metadata needed for expiry and conflict detection.
///
/// Timestamps are wall-clock milliseconds from the node's `TimeService`.
pub struct CacheEntry<K, V> {
  key: K,
  /// The user's value, wrapped in an Arc for shared ownership.
  value: Arc<V>,
  metadata: Metadata,
  created: u64,
  /// Updated on reads, which only hold the segment's read lock.
  last_used: AtomicU64,
}

impl<K: Clone, V> Clone for CacheEntry<K, V> {
  fn clone(&self) -> Self {
    Self {
      key: self.key.clone(),
      value: self.value.clone(),
      metadata: self.metadata.clone(),
      created: self.created,
      last_used: AtomicU64::new(self.last_used()),
    }
  }
}

impl<K: fmt::Debug, V> fmt::Debug for CacheEntry<K, V> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CacheEntry")
      .field("key", &self.key)
      .field("version", &self.metadata.version())
      .field("created", &self.created)
      .field("last_used", &self.last_used())
      .finish_non_exhaustive()
  }
}

impl<K, V> CacheEntry<K, V> {
  pub fn new(key: K, value: Arc<V>, metadata: Metadata, now: u64) -> Self {
    Self {
      key,
      value,
      metadata,
      created: now,
      last_used: AtomicU64::new(now),
    }
  }

  /// Rebuilds an entry with explicit timestamps, e.g. when received from
  /// another node or loaded from a store.
  pub fn with_timestamps(key: K, value: Arc<V>, metadata: Metadata, created: u64, last_used: u64) -> Self {
    Self {
      key,
      value,
      metadata,
      created,
      last_used: AtomicU64::new(last_used),
    }
  }

  /// `true` if both are copies of the same write.
  pub(crate) fn is_same_write(&self, other: &CacheEntry<K, V>) -> bool {
    Arc::ptr_eq(&self.value, &other.value)
      && self.created == other.created
      && self.metadata.version() == other.metadata.version()
  }

  #[inline]
  pub fn key(&self) -> &K {
    &self.key
  }

  #[inline]
  pub fn value(&self) -> &Arc<V> {
    &self.value
  }

  #[inline]
  pub fn metadata(&self) -> &Metadata {
    &self.metadata
  }

  #[inline]
  pub fn version(&self) -> Option<&EntryVersion> {
    self.metadata.version()
  }

  #[inline]
  pub fn created(&self) -> u64 {
    self.created
  }

  #[inline]
  pub fn last_used(&self) -> u64 {
    self.last_used.load(Ordering::Relaxed)
  }

  /// Records an access. This is a cheap atomic store.
  #[inline]
  pub fn touch(&self, now: u64) {
    self.last_used.fetch_max(now, Ordering::Relaxed);
  }

  /// The absolute time at which the entry expires, if it is mortal. With both
  /// bounds set the earlier one wins.
  pub fn expiry_time(&self) -> Option<u64> {
    let by_lifespan = self
      .metadata
      .get_lifespan()
      .map(|l| self.created.saturating_add(l.as_millis() as u64));
    let by_idle = self
      .metadata
      .get_max_idle()
      .map(|i| self.last_used().saturating_add(i.as_millis() as u64));
    match (by_lifespan, by_idle) {
      (Some(a), Some(b)) => Some(a.min(b)),
      (a, b) => a.or(b),
    }
  }

  #[inline]
  pub fn is_expired(&self, now: u64) -> bool {
    self.expiry_time().is_some_and(|expiry| now >= expiry)
  }

  pub(crate) fn into_parts(self) -> (K, Arc<V>, Metadata) {
    (self.key, self.value, self.metadata)
  }
}
