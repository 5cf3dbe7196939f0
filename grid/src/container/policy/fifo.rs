use super::lru_list::LruList;
use super::EvictionPolicy;

use parking_lot::Mutex;
use std::hash::Hash;

/// An eviction policy that evicts entries in insertion order.
#[derive(Debug)]
pub struct Fifo<K: Eq + Hash + Clone> {
  list: Mutex<LruList<K>>,
}

impl<K: Eq + Hash + Clone> Fifo<K> {
  pub fn new() -> Self {
    Self {
      list: Mutex::new(LruList::new()),
    }
  }
}

impl<K: Eq + Hash + Clone> Default for Fifo<K> {
  fn default() -> Self {
    Self::new()
  }
}

impl<K> EvictionPolicy<K> for Fifo<K>
where
  K: Eq + Hash + Clone + Send + Sync,
{
  /// Overwriting a key keeps its original position in the queue.
  fn on_insert(&self, key: &K) {
    let mut list = self.list.lock();
    if !list.contains(key) {
      list.push_front(key.clone());
    }
  }

  /// Access order is irrelevant for FIFO.
  fn on_access(&self, _key: &K) {}

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

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn evicts_oldest_insert_regardless_of_access() {
    let policy = Fifo::new();
    policy.on_insert(&1);
    policy.on_insert(&2);
    policy.on_access(&1);
    policy.on_insert(&1);

    assert_eq!(policy.list.lock().victims_last(), vec![2, 1]);
    assert_eq!(policy.evict(1), vec![1]);
  }

  #[test]
  fn clear_resets_state() {
    let policy = Fifo::new();
    policy.on_insert(&1);
    policy.clear();
    assert!(policy.evict(1).is_empty());
  }
}
