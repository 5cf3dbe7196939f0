use crate::container::CacheEntry;
use crate::error::{GridError, Result};
use crate::persistence::{Characteristics, NonBlockingStore};

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::RwLock;

/// Operation counters of a `DummyInMemoryStore`.
#[derive(Debug, Default)]
pub struct StoreStats {
  pub loads: AtomicU64,
  pub writes: AtomicU64,
  pub deletes: AtomicU64,
  pub clears: AtomicU64,
}

/// An in-memory, segmented store.
///
/// Clones of an `Arc<DummyInMemoryStore>` handed to several nodes behave like a
/// shared store when created with `Characteristic::Shareable`.
pub struct DummyInMemoryStore<K, V> {
  segments: RwLock<HashMap<u32, HashMap<K, CacheEntry<K, V>>>>,
  characteristics: Characteristics,
  running: AtomicBool,
  failing_writes: AtomicBool,
  stats: StoreStats,
}

impl<K, V> fmt::Debug for DummyInMemoryStore<K, V> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("DummyInMemoryStore")
      .field("characteristics", &self.characteristics)
      .field("running", &self.running.load(Ordering::Relaxed))
      .field("stats", &self.stats)
      .finish()
  }
}

impl<K, V> DummyInMemoryStore<K, V>
where
  K: Eq + Hash + Clone,
{
  pub fn new(characteristics: Characteristics) -> Self {
    Self {
      segments: RwLock::new(HashMap::new()),
      characteristics,
      running: AtomicBool::new(false),
      failing_writes: AtomicBool::new(false),
      stats: StoreStats::default(),
    }
  }

  /// While set, every write and delete fails with a persistence error.
  pub fn fail_writes(&self, failing: bool) {
    self.failing_writes.store(failing, Ordering::Release);
  }

  pub fn stats(&self) -> &StoreStats {
    &self.stats
  }

  pub fn size(&self) -> usize {
    self.segments.read().values().map(HashMap::len).sum()
  }

  pub fn contains(&self, segment: u32, key: &K) -> bool {
    self
      .segments
      .read()
      .get(&segment)
      .is_some_and(|s| s.contains_key(key))
  }

  fn ensure_running(&self) -> Result<()> {
    if self.running.load(Ordering::Acquire) {
      Ok(())
    } else {
      Err(GridError::Persistence("store is not running".into()))
    }
  }

  fn ensure_writable(&self) -> Result<()> {
    self.ensure_running()?;
    if self.failing_writes.load(Ordering::Acquire) {
      return Err(GridError::Persistence("store rejected the write".into()));
    }
    Ok(())
  }
}

impl<K, V> NonBlockingStore<K, V> for DummyInMemoryStore<K, V>
where
  K: Eq + Hash + Clone + Send + Sync,
  V: Send + Sync,
{
  fn start(&self) -> Result<()> {
    self.running.store(true, Ordering::Release);
    Ok(())
  }

  fn stop(&self) -> Result<()> {
    self.running.store(false, Ordering::Release);
    Ok(())
  }

  fn characteristics(&self) -> Characteristics {
    self.characteristics
  }

  fn load(&self, segment: u32, key: &K) -> Result<Option<CacheEntry<K, V>>> {
    self.ensure_running()?;
    self.stats.loads.fetch_add(1, Ordering::Relaxed);
    Ok(
      self
        .segments
        .read()
        .get(&segment)
        .and_then(|s| s.get(key))
        .cloned(),
    )
  }

  fn write(&self, segment: u32, entry: CacheEntry<K, V>) -> Result<()> {
    self.ensure_writable()?;
    self.stats.writes.fetch_add(1, Ordering::Relaxed);
    self
      .segments
      .write()
      .entry(segment)
      .or_default()
      .insert(entry.key().clone(), entry);
    Ok(())
  }

  fn delete(&self, segment: u32, key: &K) -> Result<bool> {
    self.ensure_writable()?;
    self.stats.deletes.fetch_add(1, Ordering::Relaxed);
    Ok(
      self
        .segments
        .write()
        .get_mut(&segment)
        .is_some_and(|s| s.remove(key).is_some()),
    )
  }

  fn clear(&self) -> Result<()> {
    self.ensure_running()?;
    self.stats.clears.fetch_add(1, Ordering::Relaxed);
    self.segments.write().clear();
    Ok(())
  }

  fn entries(&self, segments: &BTreeSet<u32>) -> Result<Vec<CacheEntry<K, V>>> {
    self.ensure_running()?;
    let guard = self.segments.read();
    Ok(
      segments
        .iter()
        .filter_map(|s| guard.get(s))
        .flat_map(|s| s.values().cloned())
        .collect(),
    )
  }

  fn remove_segments(&self, segments: &BTreeSet<u32>) -> Result<()> {
    self.ensure_running()?;
    let mut guard = self.segments.write();
    for segment in segments {
      guard.remove(segment);
    }
    Ok(())
  }
}
