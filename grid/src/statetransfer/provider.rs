use crate::container::{CacheEntry, DataContainer};
use crate::error::Result;
use crate::persistence::PersistenceManager;

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use tracing::debug;

/// Serves segment contents to nodes that became owners of them.
pub(crate) struct StateProvider<K, V> {
  container: Arc<DataContainer<K, V>>,
  persistence: Option<Arc<PersistenceManager<K, V>>>,
}

impl<K, V> fmt::Debug for StateProvider<K, V> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("StateProvider")
      .field("persistence", &self.persistence.is_some())
      .finish()
  }
}

impl<K, V> StateProvider<K, V>
where
  K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
  V: Send + Sync + 'static,
{
  pub(crate) fn new(
    container: Arc<DataContainer<K, V>>,
    persistence: Option<Arc<PersistenceManager<K, V>>>,
  ) -> Self {
    Self {
      container,
      persistence,
    }
  }

  /// Every live entry of `segments`: the in-memory entries, plus entries only a
  /// private store holds (passivated ones, typically).
  pub(crate) fn entries(&self, segments: &[u32]) -> Result<Vec<CacheEntry<K, V>>> {
    let segments: BTreeSet<u32> = segments.iter().copied().collect();
    let mut entries = self.container.entries_for_segments(&segments);
    if let Some(persistence) = &self.persistence {
      let stored = persistence.entries_for_transfer(&segments)?;
      if !stored.is_empty() {
        let now = self.container.time_service().wall_clock_millis();
        let in_memory: HashSet<K, ahash::RandomState> = entries.iter().map(|e| e.key().clone()).collect();
        entries.extend(
          stored
            .into_iter()
            .filter(|e| !in_memory.contains(e.key()) && !e.is_expired(now)),
        );
      }
    }
    debug!(segments = segments.len(), entries = entries.len(), "providing state");
    Ok(entries)
  }
}
