use crate::config::MemoryConfig;
use crate::container::policy::{self, EvictionPolicy};
use crate::container::store::SegmentedStore;
use crate::container::{CacheEntry, EntryVersion, Metadata, VersionComparison};
use crate::distribution::DistributionManager;
use crate::error::Result;
use crate::metrics::Metrics;
use crate::notifications::{CacheEvent, ListenerRegistry};
use crate::persistence::PersistenceManager;
use crate::time::TimeService;

use std::collections::BTreeSet;
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, trace, warn};

struct Bounds<K> {
  max_count: u64,
  policy: Box<dyn EvictionPolicy<K>>,
}

/// The local key -> entry map of one node.
///
/// Reads only take the segment's read lock; they never use the lock manager.
/// Writers are expected to hold the key lock (primary) or to be ordered by the
/// primary (backups), so the container itself only guarantees that a reader
/// sees either the old or the new entry.
pub struct DataContainer<K, V> {
  store: SegmentedStore<K, V>,
  distribution: Arc<DistributionManager>,
  time: Arc<dyn TimeService>,
  bounds: Option<Bounds<K>>,
  count: AtomicU64,
  metrics: Arc<Metrics>,
  listeners: Arc<ListenerRegistry<K, V>>,
  persistence: Option<Arc<PersistenceManager<K, V>>>,
}

impl<K, V> fmt::Debug for DataContainer<K, V> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("DataContainer")
      .field("count", &self.count.load(Ordering::Relaxed))
      .field("max_count", &self.bounds.as_ref().map(|b| b.max_count))
      .field("persistence", &self.persistence.is_some())
      .finish()
  }
}

impl<K, V> DataContainer<K, V>
where
  K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
  V: Send + Sync + 'static,
{
  pub fn new(
    distribution: Arc<DistributionManager>,
    time: Arc<dyn TimeService>,
    memory: &MemoryConfig,
    metrics: Arc<Metrics>,
    listeners: Arc<ListenerRegistry<K, V>>,
    persistence: Option<Arc<PersistenceManager<K, V>>>,
  ) -> Self {
    let bounds = memory.max_count.map(|max_count| Bounds {
      max_count,
      policy: policy::for_strategy(memory.eviction),
    });
    Self {
      store: SegmentedStore::new(distribution.num_segments()),
      distribution,
      time,
      bounds,
      count: AtomicU64::new(0),
      metrics,
      listeners,
      persistence,
    }
  }

  #[inline]
  pub fn segment_of(&self, key: &K) -> u32 {
    self.distribution.get_segment(key)
  }

  #[inline]
  fn now(&self) -> u64 {
    self.time.wall_clock_millis()
  }

  pub fn time_service(&self) -> &Arc<dyn TimeService> {
    &self.time
  }

  /// The live entry for `key`, activating it from the store on a miss.
  /// Records the access for max-idle and eviction ordering.
  pub fn get(&self, key: &K) -> Result<Option<CacheEntry<K, V>>> {
    let segment = self.segment_of(key);
    let now = self.now();
    let expired = {
      let guard = self.store.segment(segment).read();
      match guard.get(key) {
        Some(entry) if !entry.is_expired(now) => {
          entry.touch(now);
          if let Some(bounds) = &self.bounds {
            bounds.policy.on_access(key);
          }
          return Ok(Some(entry.clone()));
        }
        Some(_) => true,
        None => false,
      }
    };
    if expired {
      self.remove_expired(segment, key, now)?;
      return Ok(None);
    }
    self.activate(segment, key, now)
  }

  /// The live entry for `key` without touching it or the store.
  pub fn peek(&self, key: &K) -> Option<CacheEntry<K, V>> {
    let now = self.now();
    self
      .store
      .segment(self.segment_of(key))
      .read()
      .get(key)
      .filter(|e| !e.is_expired(now))
      .cloned()
  }

  pub fn contains_key(&self, key: &K) -> Result<bool> {
    Ok(self.get(key)?.is_some())
  }

  fn activate(&self, segment: u32, key: &K, now: u64) -> Result<Option<CacheEntry<K, V>>> {
    let Some(persistence) = &self.persistence else {
      return Ok(None);
    };
    let Some(loaded) = persistence.load(segment, key)? else {
      return Ok(None);
    };
    if loaded.is_expired(now) {
      persistence.delete(segment, key)?;
      return Ok(None);
    }
    let inserted = {
      let mut guard = self.store.segment(segment).write();
      if guard.contains_key(key) {
        false
      } else {
        guard.insert(key.clone(), loaded.clone());
        true
      }
    };
    if inserted {
      self.count.fetch_add(1, Ordering::Relaxed);
      if let Some(bounds) = &self.bounds {
        bounds.policy.on_insert(key);
      }
      persistence.activated(segment, key)?;
      trace!(?key, segment, "activated entry");
      self.evict_if_needed();
    }
    Ok(Some(loaded))
  }

  /// The version the next write of `key` on this node gets.
  pub fn next_version(&self, key: &K) -> EntryVersion {
    let previous = self
      .store
      .segment(self.segment_of(key))
      .read()
      .get(key)
      .and_then(|e| e.version().cloned());
    EntryVersion::next(
      previous.as_ref(),
      self.distribution.topology_id(),
      self.distribution.local_address().clone(),
    )
  }

  /// Writes `value`, stamping a fresh version unless `metadata` carries one.
  /// Returns the previous live entry.
  pub fn put(&self, key: K, value: Arc<V>, metadata: Metadata) -> Result<Option<CacheEntry<K, V>>> {
    let metadata = match metadata.version() {
      Some(_) => metadata,
      None => {
        let version = self.next_version(&key);
        metadata.with_version(version)
      }
    };
    let entry = CacheEntry::new(key, value, metadata, self.now());
    self.put_entry(entry)
  }

  /// Stores a fully formed entry, e.g. one replicated by the primary owner.
  ///
  /// The store is written first: a failed store write leaves memory unchanged
  /// and notifies no listener.
  pub fn put_entry(&self, entry: CacheEntry<K, V>) -> Result<Option<CacheEntry<K, V>>> {
    let key = entry.key().clone();
    let segment = self.segment_of(&key);
    let now = self.now();

    if let Some(persistence) = &self.persistence {
      persistence.write(segment, entry.clone())?;
    }

    self.listeners.notify_with(|| CacheEvent::Modified {
      key: key.clone(),
      previous: self.peek(&key).map(|e| e.value().clone()),
      value: entry.value().clone(),
      pre: true,
    });

    let value = entry.value().clone();
    let previous = {
      let mut guard = self.store.segment(segment).write();
      guard.insert(key.clone(), entry)
    };
    if previous.is_none() {
      self.count.fetch_add(1, Ordering::Relaxed);
    }
    let previous = previous.filter(|p| !p.is_expired(now));

    if let Some(bounds) = &self.bounds {
      bounds.policy.on_insert(&key);
    }
    Metrics::incr(&self.metrics.stores);

    self.listeners.notify_with(|| CacheEvent::Modified {
      key: key.clone(),
      previous: previous.as_ref().map(|e| e.value().clone()),
      value,
      pre: false,
    });

    self.evict_if_needed();
    Ok(previous)
  }

  /// Writes only if no live entry exists. Returns the existing entry otherwise.
  pub fn put_if_absent(&self, key: K, value: Arc<V>, metadata: Metadata) -> Result<Option<CacheEntry<K, V>>> {
    if let Some(existing) = self.get(&key)? {
      return Ok(Some(existing));
    }
    self.put(key, value, metadata)?;
    Ok(None)
  }

  /// Writes only if a live entry exists. Returns the replaced entry.
  pub fn replace(&self, key: K, value: Arc<V>, metadata: Metadata) -> Result<Option<CacheEntry<K, V>>> {
    if self.get(&key)?.is_none() {
      return Ok(None);
    }
    self.put(key, value, metadata)
  }

  /// Removes `key` and returns the previous live entry. The store copy is
  /// deleted first, so a failed delete leaves the entry in place.
  pub fn remove(&self, key: &K) -> Result<Option<CacheEntry<K, V>>> {
    let segment = self.segment_of(key);
    let now = self.now();

    if let Some(persistence) = &self.persistence {
      persistence.delete(segment, key)?;
    }

    self.listeners.notify_with(|| CacheEvent::Removed {
      key: key.clone(),
      previous: self.peek(key).map(|e| e.value().clone()),
      pre: true,
    });

    let previous = self.store.segment(segment).write().remove(key);
    if previous.is_some() {
      self.count.fetch_sub(1, Ordering::Relaxed);
      if let Some(bounds) = &self.bounds {
        bounds.policy.on_remove(key);
      }
    }
    Metrics::incr(&self.metrics.removes);
    let previous = previous.filter(|p| !p.is_expired(now));

    self.listeners.notify_with(|| CacheEvent::Removed {
      key: key.clone(),
      previous: previous.as_ref().map(|e| e.value().clone()),
      pre: false,
    });
    Ok(previous)
  }

  /// Applies an entry received through state transfer. Only an absent, expired
  /// or older local entry is overwritten. No listener is notified.
  pub fn apply_state(&self, entry: CacheEntry<K, V>) -> Result<bool> {
    let now = self.now();
    if entry.is_expired(now) {
      return Ok(false);
    }
    let key = entry.key().clone();
    let segment = self.segment_of(&key);
    let for_store = self.persistence.as_ref().map(|_| entry.clone());
    let (applied, added) = {
      let mut guard = self.store.segment(segment).write();
      let newer = match guard.get(&key) {
        None => true,
        Some(existing) if existing.is_expired(now) => true,
        Some(existing) => match (entry.version(), existing.version()) {
          (Some(incoming), Some(local)) => incoming.compare(local) == VersionComparison::After,
          (Some(_), None) => true,
          (None, _) => false,
        },
      };
      if newer {
        let added = guard.insert(key.clone(), entry).is_none();
        (true, added)
      } else {
        (false, false)
      }
    };
    if !applied {
      return Ok(false);
    }
    if added {
      self.count.fetch_add(1, Ordering::Relaxed);
    }
    if let Some(bounds) = &self.bounds {
      bounds.policy.on_insert(&key);
    }
    if let (Some(persistence), Some(entry)) = (&self.persistence, for_store) {
      persistence.write(segment, entry)?;
    }
    self.evict_if_needed();
    Ok(true)
  }

  fn remove_expired(&self, segment: u32, key: &K, now: u64) -> Result<()> {
    let removed = {
      let mut guard = self.store.segment(segment).write();
      match guard.get(key) {
        Some(entry) if entry.is_expired(now) => guard.remove(key),
        _ => None,
      }
    };
    if let Some(entry) = removed {
      self.expired(segment, entry)?;
    }
    Ok(())
  }

  fn expired(&self, segment: u32, entry: CacheEntry<K, V>) -> Result<()> {
    self.count.fetch_sub(1, Ordering::Relaxed);
    Metrics::incr(&self.metrics.expirations);
    if let Some(bounds) = &self.bounds {
      bounds.policy.on_remove(entry.key());
    }
    if let Some(persistence) = &self.persistence {
      persistence.delete(segment, entry.key())?;
    }
    trace!(key = ?entry.key(), segment, "entry expired");
    let (key, value, _) = entry.into_parts();
    self
      .listeners
      .notify_with(|| CacheEvent::Expired { key, value });
    Ok(())
  }

  /// Removes every expired entry. Returns how many were removed.
  pub fn purge_expired(&self) -> usize {
    let now = self.now();
    let mut purged = 0;
    for (segment, lock) in self.store.iter_segments() {
      let expired: Vec<CacheEntry<K, V>> = {
        let mut guard = lock.write();
        let keys: Vec<K> = guard
          .iter()
          .filter(|(_, e)| e.is_expired(now))
          .map(|(k, _)| k.clone())
          .collect();
        keys.iter().filter_map(|k| guard.remove(k)).collect()
      };
      for entry in expired {
        purged += 1;
        if let Err(e) = self.expired(segment, entry) {
          warn!(segment, error = %e, "failed to delete expired entry from store");
        }
      }
    }
    if purged > 0 {
      debug!(purged, "purged expired entries");
    }
    purged
  }

  /// Brings the container back within its bounds. Each victim is passivated
  /// while still readable and only then dropped from memory; a victim whose
  /// passivation fails stays in memory and is tracked again.
  fn evict_if_needed(&self) {
    let Some(bounds) = &self.bounds else {
      return;
    };
    let count = self.count.load(Ordering::Relaxed);
    if count <= bounds.max_count {
      return;
    }
    for key in bounds.policy.evict((count - bounds.max_count) as usize) {
      let segment = self.segment_of(&key);
      let Some(victim) = self.store.segment(segment).read().get(&key).cloned() else {
        continue;
      };
      if let Some(persistence) = &self.persistence {
        if let Err(e) = persistence.passivate(segment, victim.clone()) {
          warn!(?key, segment, error = %e, "passivation failed, entry stays in memory");
          bounds.policy.on_insert(&key);
          continue;
        }
      }

      let (removed, rewritten) = {
        let mut guard = self.store.segment(segment).write();
        match guard.get(&key) {
          Some(current) if current.is_same_write(&victim) => (guard.remove(&key), false),
          Some(_) => (None, true),
          None => (None, false),
        }
      };
      let Some(entry) = removed else {
        if rewritten {
          bounds.policy.on_insert(&key);
        } else if let Some(persistence) = self.persistence.as_ref().filter(|p| !p.is_shared()) {
          // Removed while being passivated: the copy just written is obsolete.
          if let Err(e) = persistence.delete(segment, &key) {
            warn!(?key, segment, error = %e, "failed to drop obsolete passivated entry");
          }
        }
        trace!(?key, segment, rewritten, "eviction victim changed, skipped");
        continue;
      };

      self.count.fetch_sub(1, Ordering::Relaxed);
      Metrics::incr(&self.metrics.evictions);
      trace!(?key, segment, "evicted entry");
      let value = entry.value().clone();
      self
        .listeners
        .notify_with(|| CacheEvent::Evicted { key, value });
    }
  }

  /// The number of live entries in memory.
  pub fn size(&self) -> usize {
    let now = self.now();
    self
      .store
      .iter_segments()
      .map(|(_, lock)| lock.read().values().filter(|e| !e.is_expired(now)).count())
      .sum()
  }

  /// The number of entries in memory, including expired ones not yet purged.
  pub fn size_including_expired(&self) -> usize {
    self.store.len()
  }

  pub fn keys(&self) -> Vec<K> {
    let now = self.now();
    self
      .store
      .iter_segments()
      .flat_map(|(_, lock)| {
        lock
          .read()
          .iter()
          .filter(|(_, e)| !e.is_expired(now))
          .map(|(k, _)| k.clone())
          .collect::<Vec<_>>()
      })
      .collect()
  }

  /// Live entries of the given segments, read without touching them.
  pub fn entries_for_segments(&self, segments: &BTreeSet<u32>) -> Vec<CacheEntry<K, V>> {
    let now = self.now();
    segments
      .iter()
      .flat_map(|s| {
        self
          .store
          .segment(*s)
          .read()
          .values()
          .filter(|e| !e.is_expired(now))
          .cloned()
          .collect::<Vec<_>>()
      })
      .collect()
  }

  /// Drops segments this node stopped owning. No listener is notified.
  pub fn remove_segments(&self, segments: &BTreeSet<u32>) -> Result<usize> {
    let mut removed = 0;
    for segment in segments {
      let drained: Vec<K> = self
        .store
        .segment(*segment)
        .write()
        .drain()
        .map(|(k, _)| k)
        .collect();
      removed += drained.len();
      if let Some(bounds) = &self.bounds {
        for key in &drained {
          bounds.policy.on_remove(key);
        }
      }
    }
    self.count.fetch_sub(removed as u64, Ordering::Relaxed);
    if let Some(persistence) = &self.persistence {
      persistence.remove_segments(segments)?;
    }
    if removed > 0 {
      debug!(segments = segments.len(), removed, "removed segments no longer owned");
    }
    Ok(removed)
  }

  /// Loads store contents into memory on start.
  pub(crate) fn preload(&self) -> Result<usize> {
    let Some(persistence) = &self.persistence else {
      return Ok(0);
    };
    let mut loaded = 0;
    for entry in persistence.preload(self.distribution.num_segments())? {
      let key = entry.key().clone();
      let segment = self.segment_of(&key);
      let added = self.store.segment(segment).write().insert(key.clone(), entry).is_none();
      if added {
        self.count.fetch_add(1, Ordering::Relaxed);
        if let Some(bounds) = &self.bounds {
          bounds.policy.on_insert(&key);
        }
        loaded += 1;
      }
    }
    self.evict_if_needed();
    Ok(loaded)
  }

  pub fn clear(&self) -> Result<()> {
    for (_, lock) in self.store.iter_segments() {
      lock.write().clear();
    }
    self.count.store(0, Ordering::Relaxed);
    if let Some(bounds) = &self.bounds {
      bounds.policy.clear();
    }
    if let Some(persistence) = &self.persistence {
      persistence.clear()?;
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::{EvictionStrategy, PersistenceConfig};
  use crate::distribution::{CacheTopology, ConsistentHashFactory};
  use crate::persistence::{Characteristics, DummyInMemoryStore};
  use crate::remoting::Address;
  use crate::time::ControlledTimeService;
  use std::time::Duration;

  struct Fixture {
    container: DataContainer<String, u32>,
    time: Arc<ControlledTimeService>,
    metrics: Arc<Metrics>,
  }

  fn fixture(memory: MemoryConfig, store: Option<Arc<DummyInMemoryStore<String, u32>>>) -> Fixture {
    let local = Address::new("a");
    let dm = Arc::new(DistributionManager::new(local.clone(), 1, 8));
    dm.set_topology(CacheTopology::stable(
      1,
      ConsistentHashFactory.create(1, 8, &[local]),
    ));
    let time = Arc::new(ControlledTimeService::default());
    let metrics = Arc::new(Metrics::new());
    let persistence = store.map(|store| {
      let manager = PersistenceManager::new(
        store,
        PersistenceConfig {
          passivation: true,
          preload: false,
        },
        metrics.clone(),
      );
      manager.start().unwrap();
      Arc::new(manager)
    });
    let container = DataContainer::new(
      dm,
      time.clone(),
      &memory,
      metrics.clone(),
      Arc::new(ListenerRegistry::new()),
      persistence,
    );
    Fixture {
      container,
      time,
      metrics,
    }
  }

  #[test]
  fn every_put_stamps_a_newer_version() {
    let f = fixture(MemoryConfig::default(), None);
    f.container.put("k".into(), Arc::new(1), Metadata::new()).unwrap();
    let v1 = f.container.peek(&"k".into()).unwrap().version().cloned().unwrap();
    let previous = f.container.put("k".into(), Arc::new(2), Metadata::new()).unwrap();
    let v2 = f.container.peek(&"k".into()).unwrap().version().cloned().unwrap();

    assert_eq!(**previous.unwrap().value(), 1);
    assert_eq!(v2.compare(&v1), VersionComparison::After);
  }

  #[test]
  fn expired_entries_vanish_on_access() {
    let f = fixture(MemoryConfig::default(), None);
    let metadata = Metadata::new().lifespan(Duration::from_millis(100));
    f.container.put("k".into(), Arc::new(1), metadata).unwrap();

    f.time.advance(Duration::from_millis(99));
    assert!(f.container.get(&"k".into()).unwrap().is_some());
    f.time.advance(Duration::from_millis(2));
    assert!(f.container.get(&"k".into()).unwrap().is_none());
    assert_eq!(f.container.size_including_expired(), 0);
    assert_eq!(f.metrics.snapshot().expirations, 1);
  }

  #[test]
  fn state_application_keeps_newer_local_entries() {
    let f = fixture(MemoryConfig::default(), None);
    f.container.put("k".into(), Arc::new(1), Metadata::new()).unwrap();
    f.container.put("k".into(), Arc::new(2), Metadata::new()).unwrap();
    let stale = CacheEntry::new(
      "k".to_string(),
      Arc::new(0),
      Metadata::new().with_version(EntryVersion::initial(1, Address::new("b"))),
      0,
    );
    assert!(!f.container.apply_state(stale).unwrap());
    assert_eq!(**f.container.peek(&"k".into()).unwrap().value(), 2);

    let fresh = CacheEntry::new(
      "other".to_string(),
      Arc::new(7),
      Metadata::new().with_version(EntryVersion::initial(1, Address::new("b"))),
      f.time.wall_clock_millis(),
    );
    assert!(f.container.apply_state(fresh).unwrap());
    assert_eq!(f.container.size(), 2);
  }

  #[test]
  fn eviction_passivates_and_activation_restores() {
    let store = Arc::new(DummyInMemoryStore::new(Characteristics::empty()));
    let f = fixture(
      MemoryConfig {
        max_count: Some(2),
        eviction: EvictionStrategy::Lru,
      },
      Some(store.clone()),
    );
    for (i, key) in ["a", "b", "c"].into_iter().enumerate() {
      f.container.put(key.into(), Arc::new(i as u32), Metadata::new()).unwrap();
    }
    assert_eq!(f.container.size(), 2);
    assert!(f.container.peek(&"a".into()).is_none());
    assert_eq!(store.size(), 1);

    // Activation brings "a" back and evicts the least recently used of the rest.
    let restored = f.container.get(&"a".into()).unwrap().unwrap();
    assert_eq!(**restored.value(), 0);
    assert_eq!(f.container.size(), 2);
    assert!(f.container.peek(&"b".into()).is_none());

    let snapshot = f.metrics.snapshot();
    assert_eq!(snapshot.evictions, 2);
    assert_eq!(snapshot.passivations, 2);
    assert_eq!(snapshot.activations, 1);
  }

  #[test]
  fn segments_can_be_dropped() {
    let f = fixture(MemoryConfig::default(), None);
    for i in 0..20u32 {
      f.container.put(i.to_string(), Arc::new(i), Metadata::new()).unwrap();
    }
    let segment = f.container.segment_of(&"0".to_string());
    let in_segment = f.container.entries_for_segments(&BTreeSet::from([segment])).len();
    assert!(in_segment >= 1);

    let removed = f.container.remove_segments(&BTreeSet::from([segment])).unwrap();
    assert_eq!(removed, in_segment);
    assert_eq!(f.container.size(), 20 - in_segment);
    assert!(f.container.peek(&"0".to_string()).is_none());
  }
}
