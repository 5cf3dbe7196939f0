use std::hash::{BuildHasher, Hash};

// Fixed seeds: every node must map a key to the same segment.
const SEEDS: [u64; 4] = [
  0x243f_6a88_85a3_08d3,
  0x1319_8a2e_0370_7344,
  0xa409_3822_299f_31d0,
  0x082e_fa98_ec4e_6c89,
];

/// Maps keys to segments.
///
/// The 64-bit hash is reduced to its top 31 bits and the resulting space is cut
/// into `num_segments` contiguous ranges of equal size (the last one may be
/// shorter).
#[derive(Clone)]
pub struct KeyPartitioner {
  num_segments: u32,
  segment_size: u64,
  hasher: ahash::RandomState,
}

impl std::fmt::Debug for KeyPartitioner {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("KeyPartitioner")
      .field("num_segments", &self.num_segments)
      .finish()
  }
}

impl KeyPartitioner {
  pub fn new(num_segments: u32) -> Self {
    let num_segments = num_segments.max(1);
    let space = 1u64 << 31;
    Self {
      num_segments,
      segment_size: space.div_ceil(num_segments as u64),
      hasher: ahash::RandomState::with_seeds(SEEDS[0], SEEDS[1], SEEDS[2], SEEDS[3]),
    }
  }

  #[inline]
  pub fn num_segments(&self) -> u32 {
    self.num_segments
  }

  #[inline]
  pub fn hash<K: Hash + ?Sized>(&self, key: &K) -> u64 {
    self.hasher.hash_one(key)
  }

  #[inline]
  pub fn segment<K: Hash + ?Sized>(&self, key: &K) -> u32 {
    self.segment_for_hash(self.hash(key))
  }

  #[inline]
  pub fn segment_for_hash(&self, hash: u64) -> u32 {
    ((hash >> 33) / self.segment_size) as u32
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn every_hash_lands_in_range() {
    for num_segments in [1, 3, 7, 256, 1000] {
      let partitioner = KeyPartitioner::new(num_segments);
      assert_eq!(partitioner.segment_for_hash(0), 0);
      assert_eq!(partitioner.segment_for_hash(u64::MAX), num_segments - 1);
      for key in 0..2_000u32 {
        assert!(partitioner.segment(&key) < num_segments);
      }
    }
  }

  #[test]
  fn mapping_is_deterministic_across_instances() {
    let a = KeyPartitioner::new(64);
    let b = KeyPartitioner::new(64);
    for key in ["alpha", "beta", "gamma", "delta"] {
      assert_eq!(a.segment(key), b.segment(key));
    }
  }

  #[test]
  fn keys_spread_over_segments() {
    let partitioner = KeyPartitioner::new(16);
    let mut used = [false; 16];
    for key in 0..1_000u32 {
      used[partitioner.segment(&key) as usize] = true;
    }
    assert!(used.iter().all(|u| *u));
  }
}
