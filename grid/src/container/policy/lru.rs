use super::lru_list::LruList;
use super::EvictionPolicy;

use parking_lot::Mutex;
use std::hash::Hash;

/// An eviction policy that evicts the least recently used entries.
#[derive(Debug)]
pub struct Lru<K: Eq + Hash + Clone> {
  list: Mutex<LruList<K>>,
}

impl<K: Eq + Hash + Clone> Lru<K> {
  pub fn new() -> Self {
    Self {
      list: Mutex::new(LruList::new()),
    }
  }
}

impl<K: Eq + Hash + Clone> Default for Lru<K> {
  fn default() -> Self {
    Self::new()
  }
}

impl<K> EvictionPolicy<K> for Lru<K>
where
  K: Eq + Hash + Clone + Send + Sync,
{
  /// A written key is the most recently used one.
  fn on_insert(&self, key: &K) {
    self.list.lock().push_front(key.clone());
  }

  fn on_access(&self, key: &K) {
    self.list.lock().move_to_front(key);
  }

  fn on_remove(&self, key: &K) {
    self.list.lock().remove(key);
  }

  fn evict(&self, count: usize) -> Vec<K> {
    let mut list = self.list.lock();
    (0..count).map_while(|_| list.pop_back()).collect()
  }

  fn clear(&self) {
    self.list.lock().clear();
  }
}
