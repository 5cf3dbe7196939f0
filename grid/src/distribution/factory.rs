//! Computes consistent hashes for a member list.
//!
//! Every function is deterministic: the same input hash and member list (in the
//! same order) always produce the same output, and ties are broken by member
//! order. Membership changes only touch the segments they have to.

use crate::distribution::ConsistentHash;
use crate::remoting::Address;

use tracing::trace;

/// Segment and primary counts per member, indexed like the member list.
struct Loads<'a> {
  members: &'a [Address],
  owned: Vec<usize>,
  primaries: Vec<usize>,
}

impl<'a> Loads<'a> {
  fn compute(members: &'a [Address], segment_owners: &[Vec<Address>]) -> Self {
    let mut loads = Loads {
      members,
      owned: vec![0; members.len()],
      primaries: vec![0; members.len()],
    };
    for owners in segment_owners {
      for (position, owner) in owners.iter().enumerate() {
        if let Some(index) = loads.index_of(owner) {
          loads.owned[index] += 1;
          if position == 0 {
            loads.primaries[index] += 1;
          }
        }
      }
    }
    loads
  }

  fn index_of(&self, address: &Address) -> Option<usize> {
    self.members.iter().position(|m| m == address)
  }

  /// The least loaded member that is not already in `owners`. A new primary is
  /// picked by primary count first, a backup by owned segment count first.
  fn least_loaded(&self, owners: &[Address], as_primary: bool) -> Option<usize> {
    self
      .members
      .iter()
      .enumerate()
      .filter(|(_, m)| !owners.contains(m))
      .min_by_key(|(i, _)| {
        if as_primary {
          (self.primaries[*i], self.owned[*i], *i)
        } else {
          (self.owned[*i], self.primaries[*i], *i)
        }
      })
      .map(|(i, _)| i)
  }

  fn assign(&mut self, owners: &mut Vec<Address>, index: usize) {
    if owners.is_empty() {
      self.primaries[index] += 1;
    }
    self.owned[index] += 1;
    owners.push(self.members[index].clone());
  }

  fn extremes(counts: &[usize]) -> Option<(usize, usize)> {
    let most = (0..counts.len()).max_by_key(|i| (counts[*i], usize::MAX - *i))?;
    let least = (0..counts.len()).min_by_key(|i| (counts[*i], *i))?;
    Some((most, least))
  }
}

/// Builds and evolves `ConsistentHash` instances.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsistentHashFactory;

impl ConsistentHashFactory {
  /// A balanced hash for a fresh cluster.
  pub fn create(&self, num_owners: usize, num_segments: u32, members: &[Address]) -> ConsistentHash {
    let actual = num_owners.min(members.len());
    let mut segment_owners: Vec<Vec<Address>> = vec![Vec::with_capacity(actual); num_segments as usize];
    let mut loads = Loads::compute(members, &[]);
    if !members.is_empty() {
      // Primaries round-robin, backups least loaded first.
      for (segment, owners) in segment_owners.iter_mut().enumerate() {
        loads.assign(owners, segment % members.len());
        fill(&mut loads, owners, actual);
      }
    }
    self.rebalance(&ConsistentHash::from_parts(
      num_owners,
      members.to_vec(),
      segment_owners,
    ))
  }

  /// Adapts `ch` to a new member list with minimal movement.
  ///
  /// Departed owners are dropped from each owner list (so the first surviving
  /// backup becomes primary), segments left with fewer than `num_owners` owners
  /// are topped up with the least loaded members, and owner lists that are too
  /// long (a merge union, or a cluster smaller than `num_owners`) are trimmed.
  /// Segments that lost no owner keep their owner list unchanged. New members
  /// only receive segments that are under-owned; `rebalance` hands them the rest.
  pub fn update_members(&self, ch: &ConsistentHash, new_members: &[Address]) -> ConsistentHash {
    let actual = ch.num_owners().min(new_members.len());
    let mut segment_owners = strip(ch, new_members);
    for owners in segment_owners.iter_mut() {
      owners.truncate(actual);
    }
    let mut loads = Loads::compute(new_members, &segment_owners);
    for owners in segment_owners.iter_mut() {
      fill(&mut loads, owners, actual);
    }
    ConsistentHash::from_parts(ch.num_owners(), new_members.to_vec(), segment_owners)
  }

  /// Drops departed members without restoring the replication factor. A segment
  /// whose owners all left gets a new primary so that it stays writable; its data
  /// is gone. Returns the new hash and the lost segments.
  pub fn remove_leavers(&self, ch: &ConsistentHash, new_members: &[Address]) -> (ConsistentHash, Vec<u32>) {
    let mut segment_owners = strip(ch, new_members);
    let mut loads = Loads::compute(new_members, &segment_owners);
    let mut lost = Vec::new();
    for (segment, owners) in segment_owners.iter_mut().enumerate() {
      if owners.is_empty() && !ch.locate_owners(segment as u32).is_empty() {
        lost.push(segment as u32);
        fill(&mut loads, owners, 1.min(new_members.len()));
      }
    }
    (
      ConsistentHash::from_parts(ch.num_owners(), new_members.to_vec(), segment_owners),
      lost,
    )
  }

  /// Evens out ownership after members joined.
  ///
  /// Owner slots move from the most to the least loaded member until no two
  /// members differ by more than one segment, iterating segments from the last
  /// one down. Primaries are then balanced by swapping a primary with one of its
  /// backups.
  pub fn rebalance(&self, ch: &ConsistentHash) -> ConsistentHash {
    let members = ch.members();
    let mut segment_owners = ch.segment_owners().to_vec();
    let mut loads = Loads::compute(members, &segment_owners);
    let num_segments = segment_owners.len();

    let mut moves = 0usize;
    while let Some((most, least)) = Loads::extremes(&loads.owned) {
      if loads.owned[most] <= loads.owned[least] + 1 {
        break;
      }
      let from = &members[most];
      let to = &members[least];
      // Moving a backup slot leaves the primaries alone, so try that first.
      let movable = |s: &usize, backup_only: bool| {
        let owners = &segment_owners[*s];
        !owners.contains(to)
          && match owners.iter().position(|o| o == from) {
            Some(position) => !backup_only || position > 0,
            None => false,
          }
      };
      let Some(segment) = (0..num_segments)
        .rev()
        .find(|s| movable(s, true))
        .or_else(|| (0..num_segments).rev().find(|s| movable(s, false)))
      else {
        break;
      };
      let owners = &mut segment_owners[segment];
      if let Some(position) = owners.iter().position(|o| o == from) {
        owners[position] = to.clone();
        if position == 0 {
          loads.primaries[most] -= 1;
          loads.primaries[least] += 1;
        }
      }
      loads.owned[most] -= 1;
      loads.owned[least] += 1;
      moves += 1;
    }

    let mut swaps = 0usize;
    while let Some((most, least)) = Loads::extremes(&loads.primaries) {
      if loads.primaries[most] <= loads.primaries[least] + 1 {
        break;
      }
      let from = &members[most];
      let to = &members[least];
      let Some(segment) = (0..num_segments)
        .rev()
        .find(|s| segment_owners[*s].first() == Some(from) && segment_owners[*s].contains(to))
      else {
        break;
      };
      let owners = &mut segment_owners[segment];
      if let Some(position) = owners.iter().position(|o| o == to) {
        owners.swap(0, position);
      }
      loads.primaries[most] -= 1;
      loads.primaries[least] += 1;
      swaps += 1;
    }

    trace!(moves, swaps, "rebalanced consistent hash");
    ConsistentHash::from_parts(ch.num_owners(), members.to_vec(), segment_owners)
  }

  /// The union of two partitions' hashes; `preferred` owners come first.
  pub fn union(&self, preferred: &ConsistentHash, other: &ConsistentHash) -> ConsistentHash {
    preferred.union(other)
  }
}

fn strip(ch: &ConsistentHash, new_members: &[Address]) -> Vec<Vec<Address>> {
  ch.segment_owners()
    .iter()
    .map(|owners| {
      owners
        .iter()
        .filter(|o| new_members.contains(o))
        .cloned()
        .collect()
    })
    .collect()
}

fn fill(loads: &mut Loads<'_>, owners: &mut Vec<Address>, target: usize) {
  while owners.len() < target {
    match loads.least_loaded(owners, owners.is_empty()) {
      Some(index) => loads.assign(owners, index),
      None => break,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use pretty_assertions::assert_eq;

  fn members(names: &[&str]) -> Vec<Address> {
    names.iter().map(|n| Address::new(n)).collect()
  }

  fn assert_balanced(ch: &ConsistentHash) {
    let owned = ch.owned_counts();
    let primaries = ch.primary_counts();
    assert!(owned.iter().max().unwrap() - owned.iter().min().unwrap() <= 1, "{:?}", owned);
    assert!(
      primaries.iter().max().unwrap() - primaries.iter().min().unwrap() <= 1,
      "{:?}",
      primaries
    );
  }

  #[test]
  fn create_is_balanced_and_deterministic() {
    let factory = ConsistentHashFactory;
    let m = members(&["a", "b", "c", "d"]);
    let ch = factory.create(2, 64, &m);
    assert_eq!(ch, factory.create(2, 64, &m));
    assert_balanced(&ch);
    for segment in 0..64 {
      let owners = ch.locate_owners(segment);
      assert_eq!(owners.len(), 2);
      assert_ne!(owners[0], owners[1]);
    }
  }

  #[test]
  fn owners_are_capped_by_cluster_size() {
    let factory = ConsistentHashFactory;
    let ch = factory.create(3, 8, &members(&["a", "b"]));
    assert!((0..8).all(|s| ch.locate_owners(s).len() == 2));
    assert_eq!(ch.num_owners(), 3);

    let empty = factory.create(2, 8, &[]);
    assert!(empty.locate_owners(0).is_empty());
  }

  #[test]
  fn removing_a_member_only_touches_its_segments() {
    let factory = ConsistentHashFactory;
    let before = factory.create(2, 128, &members(&["a", "b", "c", "d", "e"]));
    let leaver = Address::new("c");
    let after = factory.update_members(&before, &members(&["a", "b", "d", "e"]));

    for segment in 0..128 {
      let old = before.locate_owners(segment);
      let new = after.locate_owners(segment);
      assert_eq!(new.len(), 2);
      assert!(!new.contains(&leaver));
      if !old.contains(&leaver) {
        assert_eq!(old, new, "segment {} moved", segment);
      } else {
        // The surviving owner keeps its data.
        let survivor = old.iter().find(|o| **o != leaver).unwrap();
        assert!(new.contains(survivor));
      }
    }
  }

  #[test]
  fn first_backup_is_promoted_when_primary_leaves() {
    let factory = ConsistentHashFactory;
    let before = factory.create(3, 16, &members(&["a", "b", "c", "d"]));
    let after = factory.update_members(&before, &members(&["b", "c", "d"]));
    for segment in 0..16 {
      let old = before.locate_owners(segment);
      if old[0] == Address::new("a") {
        assert_eq!(after.locate_primary_owner(segment), Some(&old[1]));
      }
    }
  }

  #[test]
  fn rebalance_gives_joiners_a_fair_share() {
    let factory = ConsistentHashFactory;
    let before = factory.create(2, 60, &members(&["a", "b"]));
    let updated = factory.update_members(&before, &members(&["a", "b", "c"]));
    assert!(updated.segments_for_owner(&Address::new("c")).is_empty());

    let rebalanced = factory.rebalance(&updated);
    assert_balanced(&rebalanced);
    assert_eq!(rebalanced.owned_counts(), vec![40, 40, 40]);
    assert_eq!(rebalanced, factory.rebalance(&updated));
    // A balanced hash is a fixed point.
    assert_eq!(factory.rebalance(&rebalanced), rebalanced);
  }

  #[test]
  fn remove_leavers_reports_lost_segments() {
    let factory = ConsistentHashFactory;
    let before = factory.create(2, 32, &members(&["a", "b", "c", "d"]));
    let survivors = members(&["a", "b"]);
    let (after, lost) = factory.remove_leavers(&before, &survivors);

    let expected: Vec<u32> = (0..32)
      .filter(|s| {
        before
          .locate_owners(*s)
          .iter()
          .all(|o| !survivors.contains(o))
      })
      .collect();
    assert_eq!(lost, expected);
    assert!((0..32).all(|s| !after.locate_owners(s).is_empty()));
  }
}
