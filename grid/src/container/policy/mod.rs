mod fifo;
mod lru;
mod lru_list;

pub use fifo::Fifo;
pub use lru::Lru;

use crate::config::EvictionStrategy;

use std::hash::Hash;

/// Picks eviction victims for a bounded entry container.
///
/// The container reports every insertion, access and removal; the policy only
/// tracks keys and never touches the entries themselves.
pub trait EvictionPolicy<K>: Send + Sync {
  /// A key was written. Re-inserting a tracked key is allowed.
  fn on_insert(&self, key: &K);

  /// A key was read.
  fn on_access(&self, key: &K);

  /// A key left the container for any reason other than this policy's `evict`.
  fn on_remove(&self, key: &K);

  /// Stops tracking and returns up to `count` victims, best victim first.
  fn evict(&self, count: usize) -> Vec<K>;

  fn clear(&self);
}

/// Creates the policy for a configured strategy.
pub fn for_strategy<K>(strategy: EvictionStrategy) -> Box<dyn EvictionPolicy<K>>
where
  K: Eq + Hash + Clone + Send + Sync + 'static,
{
  match strategy {
    EvictionStrategy::Lru => Box::new(Lru::new()),
    EvictionStrategy::Fifo => Box::new(Fifo::new()),
  }
}
