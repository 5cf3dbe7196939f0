use crate::remoting::Address;

use std::collections::BTreeSet;
use std::fmt;

/// An immutable mapping from segments to ordered owner lists.
///
/// The first owner of a segment is its primary. A new instance is produced for
/// every membership change; instances are never mutated once published.
#[derive(Clone, PartialEq, Eq)]
pub struct ConsistentHash {
  num_owners: usize,
  members: Vec<Address>,
  segment_owners: Vec<Vec<Address>>,
}

impl fmt::Debug for ConsistentHash {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ConsistentHash")
      .field("num_owners", &self.num_owners)
      .field("num_segments", &self.segment_owners.len())
      .field("members", &self.members)
      .finish()
  }
}

impl ConsistentHash {
  pub(crate) fn from_parts(
    num_owners: usize,
    members: Vec<Address>,
    segment_owners: Vec<Vec<Address>>,
  ) -> Self {
    Self {
      num_owners,
      members,
      segment_owners,
    }
  }

  /// The configured replication factor. Segments may have fewer owners when the
  /// cluster is smaller, and more in a merge union.
  #[inline]
  pub fn num_owners(&self) -> usize {
    self.num_owners
  }

  #[inline]
  pub fn num_segments(&self) -> u32 {
    self.segment_owners.len() as u32
  }

  #[inline]
  pub fn members(&self) -> &[Address] {
    &self.members
  }

  /// Owners of `segment`, primary first.
  #[inline]
  pub fn locate_owners(&self, segment: u32) -> &[Address] {
    self
      .segment_owners
      .get(segment as usize)
      .map(Vec::as_slice)
      .unwrap_or(&[])
  }

  #[inline]
  pub fn locate_primary_owner(&self, segment: u32) -> Option<&Address> {
    self.locate_owners(segment).first()
  }

  pub fn is_segment_local(&self, segment: u32, address: &Address) -> bool {
    self.locate_owners(segment).contains(address)
  }

  pub fn segments_for_owner(&self, address: &Address) -> BTreeSet<u32> {
    self
      .segment_owners
      .iter()
      .enumerate()
      .filter(|(_, owners)| owners.contains(address))
      .map(|(segment, _)| segment as u32)
      .collect()
  }

  pub fn primary_segments_for_owner(&self, address: &Address) -> BTreeSet<u32> {
    self
      .segment_owners
      .iter()
      .enumerate()
      .filter(|(_, owners)| owners.first() == Some(address))
      .map(|(segment, _)| segment as u32)
      .collect()
  }

  /// Number of segments each member owns, in member order.
  pub fn owned_counts(&self) -> Vec<usize> {
    self
      .members
      .iter()
      .map(|m| self.segment_owners.iter().filter(|o| o.contains(m)).count())
      .collect()
  }

  /// Number of segments each member is primary for, in member order.
  pub fn primary_counts(&self) -> Vec<usize> {
    self
      .members
      .iter()
      .map(|m| {
        self
          .segment_owners
          .iter()
          .filter(|o| o.first() == Some(m))
          .count()
      })
      .collect()
  }

  pub(crate) fn segment_owners(&self) -> &[Vec<Address>] {
    &self.segment_owners
  }

  /// Combines two hashes over the same segments. Owners of `self` come first, so
  /// `self`'s primaries stay primary; owners only present in `other` are
  /// appended.
  pub fn union(&self, other: &ConsistentHash) -> ConsistentHash {
    let mut members = self.members.clone();
    for member in &other.members {
      if !members.contains(member) {
        members.push(member.clone());
      }
    }
    let segment_owners = self
      .segment_owners
      .iter()
      .enumerate()
      .map(|(segment, owners)| {
        let mut merged = owners.clone();
        for owner in other.locate_owners(segment as u32) {
          if !merged.contains(owner) {
            merged.push(owner.clone());
          }
        }
        merged
      })
      .collect();
    ConsistentHash {
      num_owners: self.num_owners.max(other.num_owners),
      members,
      segment_owners,
    }
  }
}
