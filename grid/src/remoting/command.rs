use crate::container::{CacheEntry, Metadata};
use crate::distribution::CacheTopology;
use crate::lock::LockOwner;
use crate::remoting::Address;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// A modification requested by an originator and executed by the primary owner.
pub enum WriteOp<V> {
  Put { value: Arc<V>, metadata: Metadata },
  PutIfAbsent { value: Arc<V>, metadata: Metadata },
  Replace { value: Arc<V>, metadata: Metadata },
  Remove,
}

impl<V> WriteOp<V> {
  pub(crate) fn name(&self) -> &'static str {
    match self {
      WriteOp::Put { .. } => "put",
      WriteOp::PutIfAbsent { .. } => "put_if_absent",
      WriteOp::Replace { .. } => "replace",
      WriteOp::Remove => "remove",
    }
  }
}

impl<V> Clone for WriteOp<V> {
  fn clone(&self) -> Self {
    match self {
      WriteOp::Put { value, metadata } => WriteOp::Put {
        value: value.clone(),
        metadata: metadata.clone(),
      },
      WriteOp::PutIfAbsent { value, metadata } => WriteOp::PutIfAbsent {
        value: value.clone(),
        metadata: metadata.clone(),
      },
      WriteOp::Replace { value, metadata } => WriteOp::Replace {
        value: value.clone(),
        metadata: metadata.clone(),
      },
      WriteOp::Remove => WriteOp::Remove,
    }
  }
}

impl<V> fmt::Debug for WriteOp<V> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.name())
  }
}

/// Messages exchanged between grid nodes through a `Transport`.
pub enum Command<K, V> {
  /// Originator -> primary owner of `key`.
  Write {
    key: K,
    op: WriteOp<V>,
    owner: LockOwner,
    topology_id: u32,
    /// Locks taken by a transaction stay held until the transaction ends.
    in_transaction: bool,
  },
  /// Primary owner -> other write owners. `None` removes the key.
  Backup {
    key: K,
    entry: Option<CacheEntry<K, V>>,
    topology_id: u32,
  },
  /// Transaction -> primary owner of `key`.
  Lock {
    key: K,
    owner: LockOwner,
    topology_id: u32,
    timeout: Duration,
  },
  /// Releases locks held by `owner`. Unknown keys are ignored.
  Unlock { keys: Vec<K>, owner: LockOwner },
  /// Reads `key` from a read owner.
  Read { key: K, topology_id: u32 },
  /// Reads the local replica of `key` without any ownership check.
  GetEntry { key: K },
  /// Fetches every entry of the given segments held by the target.
  GetSegments { segments: Vec<u32>, topology_id: u32 },
  /// Coordinator -> members: install a new topology.
  TopologyUpdate { topology: CacheTopology },
  /// Coordinator -> members during a merge: report the installed topology.
  Status,
  /// Leaving member -> coordinator: move my data away before I disconnect.
  Leave { leaver: Address },
  /// Coordinator -> members after a merge: resolve conflicts in the segments you
  /// own as primary, preferring the entries held by `preferred` members.
  ResolveConflicts {
    topology_id: u32,
    preferred: Vec<Address>,
  },
}

impl<K: Clone, V> Clone for Command<K, V> {
  fn clone(&self) -> Self {
    match self {
      Command::Write {
        key,
        op,
        owner,
        topology_id,
        in_transaction,
      } => Command::Write {
        key: key.clone(),
        op: op.clone(),
        owner: owner.clone(),
        topology_id: *topology_id,
        in_transaction: *in_transaction,
      },
      Command::Backup {
        key,
        entry,
        topology_id,
      } => Command::Backup {
        key: key.clone(),
        entry: entry.clone(),
        topology_id: *topology_id,
      },
      Command::Lock {
        key,
        owner,
        topology_id,
        timeout,
      } => Command::Lock {
        key: key.clone(),
        owner: owner.clone(),
        topology_id: *topology_id,
        timeout: *timeout,
      },
      Command::Unlock { keys, owner } => Command::Unlock {
        keys: keys.clone(),
        owner: owner.clone(),
      },
      Command::Read { key, topology_id } => Command::Read {
        key: key.clone(),
        topology_id: *topology_id,
      },
      Command::GetEntry { key } => Command::GetEntry { key: key.clone() },
      Command::GetSegments {
        segments,
        topology_id,
      } => Command::GetSegments {
        segments: segments.clone(),
        topology_id: *topology_id,
      },
      Command::TopologyUpdate { topology } => Command::TopologyUpdate {
        topology: topology.clone(),
      },
      Command::Status => Command::Status,
      Command::Leave { leaver } => Command::Leave {
        leaver: leaver.clone(),
      },
      Command::ResolveConflicts {
        topology_id,
        preferred,
      } => Command::ResolveConflicts {
        topology_id: *topology_id,
        preferred: preferred.clone(),
      },
    }
  }
}

impl<K: fmt::Debug, V> fmt::Debug for Command<K, V> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Command::Write {
        key,
        op,
        topology_id,
        ..
      } => write!(f, "Write({:?}, {:?}, topology={})", key, op, topology_id),
      Command::Backup {
        key, topology_id, ..
      } => write!(f, "Backup({:?}, topology={})", key, topology_id),
      Command::Lock { key, owner, .. } => write!(f, "Lock({:?}, {})", key, owner),
      Command::Unlock { keys, owner } => write!(f, "Unlock({:?}, {})", keys, owner),
      Command::Read { key, topology_id } => write!(f, "Read({:?}, topology={})", key, topology_id),
      Command::GetEntry { key } => write!(f, "GetEntry({:?})", key),
      Command::GetSegments {
        segments,
        topology_id,
      } => write!(
        f,
        "GetSegments({} segments, topology={})",
        segments.len(),
        topology_id
      ),
      Command::TopologyUpdate { topology } => write!(f, "TopologyUpdate({})", topology.topology_id()),
      Command::Status => f.write_str("Status"),
      Command::Leave { leaver } => write!(f, "Leave({})", leaver),
      Command::ResolveConflicts { topology_id, .. } => {
        write!(f, "ResolveConflicts(topology={})", topology_id)
      }
    }
  }
}

/// Successful replies to a `Command`. Failures travel as `TransportError::Remote`.
pub enum Response<K, V> {
  Ack,
  Entry(Option<CacheEntry<K, V>>),
  Entries(Vec<CacheEntry<K, V>>),
  Status(Option<CacheTopology>),
}

impl<K, V> Response<K, V> {
  pub(crate) fn into_entry(self) -> Option<CacheEntry<K, V>> {
    match self {
      Response::Entry(entry) => entry,
      _ => None,
    }
  }

  pub(crate) fn into_entries(self) -> Vec<CacheEntry<K, V>> {
    match self {
      Response::Entries(entries) => entries,
      Response::Entry(Some(entry)) => vec![entry],
      _ => Vec::new(),
    }
  }
}

impl<K, V> fmt::Debug for Response<K, V> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Response::Ack => f.write_str("Ack"),
      Response::Entry(entry) => write!(f, "Entry(present={})", entry.is_some()),
      Response::Entries(entries) => write!(f, "Entries({})", entries.len()),
      Response::Status(topology) => write!(
        f,
        "Status({:?})",
        topology.as_ref().map(|t| t.topology_id())
      ),
    }
  }
}
