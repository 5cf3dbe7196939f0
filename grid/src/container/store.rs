use crate::container::CacheEntry;

use core::fmt;
use std::collections::HashMap;

use crossbeam_utils::CachePadded;
use parking_lot::RwLock;

pub(crate) type Segment<K, V> = HashMap<K, CacheEntry<K, V>, ahash::RandomState>;

/// Entry storage partitioned by segment, one independently locked map each.
///
/// Keying the shards by segment lets whole segments be read or dropped during a
/// rebalance without touching the rest of the container.
pub(crate) struct SegmentedStore<K, V> {
  segments: Box<[CachePadded<RwLock<Segment<K, V>>>]>,
}

impl<K, V> fmt::Debug for SegmentedStore<K, V> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("SegmentedStore")
      .field("num_segments", &self.segments.len())
      .finish()
  }
}

impl<K, V> SegmentedStore<K, V> {
  pub(crate) fn new(num_segments: u32) -> Self {
    let hasher = ahash::RandomState::new();
    let mut segments = Vec::with_capacity(num_segments as usize);
    for _ in 0..num_segments.max(1) {
      segments.push(CachePadded::new(RwLock::new(HashMap::with_hasher(
        hasher.clone(),
      ))));
    }
    Self {
      segments: segments.into_boxed_slice(),
    }
  }

  /// The lock guarding `segment`. Callers must pass a segment computed by the
  /// node's `KeyPartitioner`.
  #[inline]
  pub(crate) fn segment(&self, segment: u32) -> &RwLock<Segment<K, V>> {
    &self.segments[segment as usize % self.segments.len()]
  }

  pub(crate) fn iter_segments(&self) -> impl Iterator<Item = (u32, &RwLock<Segment<K, V>>)> {
    self
      .segments
      .iter()
      .enumerate()
      .map(|(i, padded)| (i as u32, &**padded))
  }

  pub(crate) fn len(&self) -> usize {
    self.segments.iter().map(|s| s.read().len()).sum()
  }
}
