use crate::remoting::Address;

use std::cmp::Ordering;
use std::fmt;

/// The outcome of comparing two entry versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionComparison {
  Before,
  Equal,
  After,
  /// The versions were minted independently (e.g. by two partitions) and cannot
  /// be ordered.
  Conflicting,
}

/// A logical clock stamped on every write by the key's primary owner.
///
/// Versions order first by the topology they were minted in, then by a counter
/// that restarts when a newer topology is seen. Two versions with the same
/// position but a different minting node are divergent.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct EntryVersion {
  topology_id: u32,
  counter: u64,
  origin: Address,
}

impl fmt::Debug for EntryVersion {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "v{}.{}@{}", self.topology_id, self.counter, self.origin)
  }
}

impl EntryVersion {
  pub fn new(topology_id: u32, counter: u64, origin: Address) -> Self {
    Self {
      topology_id,
      counter,
      origin,
    }
  }

  /// The version of a key's first write.
  pub fn initial(topology_id: u32, origin: Address) -> Self {
    Self::new(topology_id, 1, origin)
  }

  /// The version following `previous`, minted by `origin` in `topology_id`.
  pub fn next(previous: Option<&EntryVersion>, topology_id: u32, origin: Address) -> Self {
    match previous {
      Some(prev) if prev.topology_id >= topology_id => {
        Self::new(prev.topology_id, prev.counter + 1, origin)
      }
      _ => Self::initial(topology_id, origin),
    }
  }

  #[inline]
  pub fn topology_id(&self) -> u32 {
    self.topology_id
  }

  #[inline]
  pub fn counter(&self) -> u64 {
    self.counter
  }

  #[inline]
  pub fn origin(&self) -> &Address {
    &self.origin
  }

  pub fn compare(&self, other: &EntryVersion) -> VersionComparison {
    match (self.topology_id, self.counter).cmp(&(other.topology_id, other.counter)) {
      Ordering::Less => VersionComparison::Before,
      Ordering::Greater => VersionComparison::After,
      Ordering::Equal if self.origin == other.origin => VersionComparison::Equal,
      Ordering::Equal => VersionComparison::Conflicting,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn counters_order_within_a_topology() {
    let a = Address::new("a");
    let v1 = EntryVersion::initial(3, a.clone());
    let v2 = EntryVersion::next(Some(&v1), 3, a.clone());
    assert_eq!(v2.counter(), 2);
    assert_eq!(v1.compare(&v2), VersionComparison::Before);
    assert_eq!(v2.compare(&v1), VersionComparison::After);
    assert_eq!(v2.compare(&v2.clone()), VersionComparison::Equal);
  }

  #[test]
  fn newer_topology_restarts_the_counter_and_wins() {
    let a = Address::new("a");
    let old = EntryVersion::new(2, 40, a.clone());
    let new = EntryVersion::next(Some(&old), 5, a);
    assert_eq!(new.counter(), 1);
    assert_eq!(new.compare(&old), VersionComparison::After);
  }

  #[test]
  fn independent_writes_conflict() {
    let base = EntryVersion::initial(4, Address::new("a"));
    let left = EntryVersion::next(Some(&base), 4, Address::new("a"));
    let right = EntryVersion::next(Some(&base), 4, Address::new("c"));
    assert_eq!(left.compare(&right), VersionComparison::Conflicting);
  }
}
