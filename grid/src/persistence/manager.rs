use crate::component::Lifecycle;
use crate::config::PersistenceConfig;
use crate::container::CacheEntry;
use crate::error::Result;
use crate::metrics::Metrics;
use crate::persistence::{Characteristic, NonBlockingStore};

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, info};

/// Mediates every interaction between the entry container and the store.
///
/// In write-through mode every write and delete reaches the store. In
/// passivation mode the store only receives entries evicted from memory, and an
/// entry is deleted from the store when it is activated again. `READ_ONLY`
/// stores are never written, `WRITE_ONLY` stores are never read.
pub struct PersistenceManager<K, V> {
  store: Arc<dyn NonBlockingStore<K, V>>,
  config: PersistenceConfig,
  metrics: Arc<Metrics>,
}

impl<K, V> fmt::Debug for PersistenceManager<K, V> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("PersistenceManager")
      .field("characteristics", &self.store.characteristics())
      .field("passivation", &self.config.passivation)
      .field("preload", &self.config.preload)
      .finish()
  }
}

impl<K, V> PersistenceManager<K, V> {
  pub fn new(store: Arc<dyn NonBlockingStore<K, V>>, config: PersistenceConfig, metrics: Arc<Metrics>) -> Self {
    Self {
      store,
      config,
      metrics,
    }
  }

  #[inline]
  fn can_read(&self) -> bool {
    !self.store.characteristics().contains(Characteristic::WriteOnly)
  }

  #[inline]
  fn can_write(&self) -> bool {
    !self.store.characteristics().contains(Characteristic::ReadOnly)
  }

  pub fn is_passivation(&self) -> bool {
    self.config.passivation
  }

  pub fn is_shared(&self) -> bool {
    self.store.characteristics().contains(Characteristic::Shareable)
  }

  pub fn start(&self) -> Result<()> {
    self.store.start()?;
    info!(
      characteristics = ?self.store.characteristics(),
      passivation = self.config.passivation,
      "persistence started"
    );
    Ok(())
  }

  pub fn stop(&self) -> Result<()> {
    self.store.stop()
  }

  /// Entries to load into memory on start, if preloading is enabled.
  pub fn preload(&self, num_segments: u32) -> Result<Vec<CacheEntry<K, V>>> {
    if !self.config.preload || !self.can_read() {
      return Ok(Vec::new());
    }
    let entries = self.store.entries(&(0..num_segments).collect())?;
    debug!(count = entries.len(), "preloading entries");
    Ok(entries)
  }

  /// Looks up a key missing from memory.
  pub fn load(&self, segment: u32, key: &K) -> Result<Option<CacheEntry<K, V>>> {
    if !self.can_read() {
      return Ok(None);
    }
    self.store.load(segment, key)
  }

  /// Called after an entry loaded by `load` was put back into memory.
  pub fn activated(&self, segment: u32, key: &K) -> Result<()> {
    Metrics::incr(&self.metrics.activations);
    if self.config.passivation && self.can_write() && !self.is_shared() {
      self.store.delete(segment, key)?;
    }
    Ok(())
  }

  /// Write-through of a modification. A no-op in passivation mode.
  pub fn write(&self, segment: u32, entry: CacheEntry<K, V>) -> Result<()> {
    if self.config.passivation || !self.can_write() {
      return Ok(());
    }
    self.store.write(segment, entry)
  }

  /// Write-through of a removal. In passivation mode the store may still hold a
  /// passivated copy, so it is deleted as well.
  pub fn delete(&self, segment: u32, key: &K) -> Result<bool> {
    if !self.can_write() {
      return Ok(false);
    }
    self.store.delete(segment, key)
  }

  /// Saves an entry that is being evicted from memory.
  pub fn passivate(&self, segment: u32, entry: CacheEntry<K, V>) -> Result<()> {
    if !self.config.passivation || !self.can_write() {
      return Ok(());
    }
    self.store.write(segment, entry)?;
    Metrics::incr(&self.metrics.passivations);
    Ok(())
  }

  /// Entries only a private store can contribute to a state transfer. Shared
  /// stores are visible to the receiver already.
  pub fn entries_for_transfer(&self, segments: &BTreeSet<u32>) -> Result<Vec<CacheEntry<K, V>>> {
    if self.is_shared() || !self.can_read() {
      return Ok(Vec::new());
    }
    self.store.entries(segments)
  }

  /// Drops segments this node no longer owns from a private store.
  pub fn remove_segments(&self, segments: &BTreeSet<u32>) -> Result<()> {
    if self.is_shared() || !self.can_write() || segments.is_empty() {
      return Ok(());
    }
    self.store.remove_segments(segments)
  }

  pub fn clear(&self) -> Result<()> {
    if !self.can_write() {
      return Ok(());
    }
    self.store.clear()
  }
}

impl<K: Send + Sync + 'static, V: Send + Sync + 'static> Lifecycle for PersistenceManager<K, V> {
  fn name(&self) -> &'static str {
    "persistence"
  }

  fn start(&self) -> Result<()> {
    PersistenceManager::start(self)
  }

  fn stop(&self) -> Result<()> {
    PersistenceManager::stop(self)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::container::Metadata;
  use crate::persistence::{Characteristics, DummyInMemoryStore};
  use std::sync::atomic::Ordering;

  fn manager(
    characteristics: Characteristics,
    passivation: bool,
  ) -> (Arc<DummyInMemoryStore<String, u32>>, PersistenceManager<String, u32>) {
    let store = Arc::new(DummyInMemoryStore::new(characteristics));
    let manager = PersistenceManager::new(
      store.clone(),
      PersistenceConfig {
        passivation,
        preload: false,
      },
      Arc::new(Metrics::new()),
    );
    manager.start().unwrap();
    (store, manager)
  }

  fn entry(key: &str) -> CacheEntry<String, u32> {
    CacheEntry::new(key.to_string(), Arc::new(1), Metadata::new(), 0)
  }

  #[test]
  fn read_only_store_is_never_written() {
    let (store, persistence) = manager(Characteristics::empty().with(Characteristic::ReadOnly), false);
    persistence.write(0, entry("a")).unwrap();
    assert!(!persistence.delete(0, &"a".to_string()).unwrap());
    assert_eq!(store.stats().writes.load(Ordering::Relaxed), 0);
  }

  #[test]
  fn write_only_store_is_never_read() {
    let (store, persistence) = manager(Characteristics::empty().with(Characteristic::WriteOnly), false);
    persistence.write(0, entry("a")).unwrap();
    assert!(store.contains(0, &"a".to_string()));
    assert!(persistence.load(0, &"a".to_string()).unwrap().is_none());
    assert_eq!(store.stats().loads.load(Ordering::Relaxed), 0);
  }

  #[test]
  fn passivation_only_writes_evicted_entries() {
    let (store, persistence) = manager(Characteristics::empty(), true);
    persistence.write(0, entry("a")).unwrap();
    assert_eq!(store.size(), 0);

    persistence.passivate(0, entry("a")).unwrap();
    assert!(store.contains(0, &"a".to_string()));
    persistence.activated(0, &"a".to_string()).unwrap();
    assert_eq!(store.size(), 0);
  }
}
