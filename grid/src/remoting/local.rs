//! An in-process network connecting grid nodes that live in the same process.
//!
//! Commands are executed synchronously on the sender's thread. The network can be
//! split into partitions and healed again, which produces the same view sequence a
//! real group membership service would deliver after a split brain.

use crate::error::TransportError;
use crate::remoting::{Address, Command, InboundHandler, Response, Transport, View};

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, trace};

struct Member<K, V> {
  address: Address,
  handler: Weak<dyn InboundHandler<K, V>>,
  partition: usize,
  unresponsive: bool,
}

struct NetworkState<K, V> {
  // Join order; the first member of each partition coordinates it.
  members: Vec<Member<K, V>>,
  next_view_id: u64,
}

impl<K, V> NetworkState<K, V> {
  fn find(&self, address: &Address) -> Option<&Member<K, V>> {
    self.members.iter().find(|m| &m.address == address)
  }

  fn partition_members(&self, partition: usize) -> Vec<Address> {
    self
      .members
      .iter()
      .filter(|m| m.partition == partition)
      .map(|m| m.address.clone())
      .collect()
  }

  fn partitions(&self) -> Vec<usize> {
    let mut partitions: Vec<usize> = self.members.iter().map(|m| m.partition).collect();
    partitions.sort_unstable();
    partitions.dedup();
    partitions
  }

  fn next_view(&mut self, members: Vec<Address>, subgroups: Vec<Vec<Address>>) -> View {
    self.next_view_id += 1;
    View {
      id: self.next_view_id,
      members,
      subgroups,
    }
  }

  fn handlers_of(&self, members: &[Address]) -> Vec<Arc<dyn InboundHandler<K, V>>> {
    members
      .iter()
      .filter_map(|a| self.find(a))
      .filter_map(|m| m.handler.upgrade())
      .collect()
  }
}

/// A shared, clonable handle to an in-process network.
pub struct LocalNetwork<K, V> {
  state: Arc<RwLock<NetworkState<K, V>>>,
}

impl<K, V> Clone for LocalNetwork<K, V> {
  fn clone(&self) -> Self {
    Self {
      state: self.state.clone(),
    }
  }
}

impl<K, V> fmt::Debug for LocalNetwork<K, V> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let state = self.state.read();
    f.debug_struct("LocalNetwork")
      .field(
        "members",
        &state.members.iter().map(|m| &m.address).collect::<Vec<_>>(),
      )
      .field("view_id", &state.next_view_id)
      .finish()
  }
}

impl<K, V> Default for LocalNetwork<K, V>
where
  K: Send + 'static,
  V: Send + Sync + 'static,
{
  fn default() -> Self {
    Self::new()
  }
}

impl<K, V> LocalNetwork<K, V>
where
  K: Send + 'static,
  V: Send + Sync + 'static,
{
  pub fn new() -> Self {
    Self {
      state: Arc::new(RwLock::new(NetworkState {
        members: Vec::new(),
        next_view_id: 0,
      })),
    }
  }

  /// Creates the transport endpoint for `address`. The node joins the network when
  /// the transport is started.
  pub fn transport(&self, address: Address) -> Arc<LocalTransport<K, V>> {
    Arc::new(LocalTransport {
      address,
      network: self.clone(),
    })
  }

  /// Members of the view `address` currently belongs to.
  pub fn view_of(&self, address: &Address) -> Option<View> {
    let state = self.state.read();
    let member = state.find(address)?;
    Some(View {
      id: state.next_view_id,
      members: state.partition_members(member.partition),
      subgroups: Vec::new(),
    })
  }

  pub fn members(&self) -> Vec<Address> {
    self
      .state
      .read()
      .members
      .iter()
      .map(|m| m.address.clone())
      .collect()
  }

  fn connect(&self, address: Address, handler: Weak<dyn InboundHandler<K, V>>) -> Result<(), TransportError> {
    let (view, handlers) = {
      let mut state = self.state.write();
      if state.find(&address).is_some() {
        return Err(TransportError::Unreachable(address));
      }
      // Joiners always land in the first partition.
      let partition = state.partitions().first().copied().unwrap_or(0);
      state.members.push(Member {
        address: address.clone(),
        handler,
        partition,
        unresponsive: false,
      });
      let members = state.partition_members(partition);
      let view = state.next_view(members, Vec::new());
      let handlers = state.handlers_of(&view.members);
      (view, handlers)
    };
    debug!(node = %address, view_id = view.id, members = ?view.members, "node joined");
    deliver(&view, handlers);
    Ok(())
  }

  /// Removes `address` from the network. Used for both graceful leaves and crashes;
  /// the difference is whether the node moved its data away first.
  pub fn disconnect(&self, address: &Address) {
    let delivery = {
      let mut state = self.state.write();
      let Some(index) = state.members.iter().position(|m| &m.address == address) else {
        return;
      };
      let partition = state.members.remove(index).partition;
      let members = state.partition_members(partition);
      if members.is_empty() {
        None
      } else {
        let view = state.next_view(members, Vec::new());
        let handlers = state.handlers_of(&view.members);
        Some((view, handlers))
      }
    };
    debug!(node = %address, "node left");
    if let Some((view, handlers)) = delivery {
      deliver(&view, handlers);
    }
  }

  /// Splits the network. Every member must appear in exactly one group; members of
  /// different groups can no longer reach each other.
  pub fn split(&self, groups: &[Vec<Address>]) {
    let deliveries = {
      let mut state = self.state.write();
      for member in state.members.iter_mut() {
        if let Some(index) = groups.iter().position(|g| g.contains(&member.address)) {
          member.partition = index;
        }
      }
      let mut deliveries = Vec::new();
      for partition in state.partitions() {
        let members = state.partition_members(partition);
        let view = state.next_view(members, Vec::new());
        let handlers = state.handlers_of(&view.members);
        deliveries.push((view, handlers));
      }
      deliveries
    };
    for (view, handlers) in deliveries {
      debug!(view_id = view.id, members = ?view.members, "partition view");
      deliver(&view, handlers);
    }
  }

  /// Heals every partition into one merge view.
  pub fn heal(&self) {
    let delivery = {
      let mut state = self.state.write();
      let partitions = state.partitions();
      if partitions.len() < 2 {
        return;
      }
      let subgroups: Vec<Vec<Address>> = partitions
        .iter()
        .map(|p| state.partition_members(*p))
        .collect();
      for member in state.members.iter_mut() {
        member.partition = 0;
      }
      let members = state.partition_members(0);
      let view = state.next_view(members, subgroups);
      let handlers = state.handlers_of(&view.members);
      (view, handlers)
    };
    debug!(view_id = delivery.0.id, subgroups = ?delivery.0.subgroups, "merge view");
    deliver(&delivery.0, delivery.1);
  }

  /// An unresponsive member stays in the view but every request to it times out.
  pub fn set_unresponsive(&self, address: &Address, unresponsive: bool) {
    let mut state = self.state.write();
    if let Some(member) = state.members.iter_mut().find(|m| &m.address == address) {
      member.unresponsive = unresponsive;
    }
  }

  fn send(
    &self,
    from: &Address,
    target: &Address,
    command: Command<K, V>,
    timeout: Duration,
  ) -> Result<Response<K, V>, TransportError> {
    let handler = {
      let state = self.state.read();
      let sender_partition = state.find(from).map(|m| m.partition);
      let member = match state.find(target) {
        Some(member) if Some(member.partition) == sender_partition => member,
        _ => return Err(TransportError::Unreachable(target.clone())),
      };
      if member.unresponsive {
        return Err(TransportError::Timeout {
          target: target.clone(),
          timeout,
        });
      }
      member
        .handler
        .upgrade()
        .ok_or_else(|| TransportError::Unreachable(target.clone()))?
    };
    handler
      .handle(from, command)
      .map_err(|e| TransportError::Remote(Box::new(e)))
  }
}

fn deliver<K, V>(view: &View, handlers: Vec<Arc<dyn InboundHandler<K, V>>>) {
  for handler in handlers {
    handler.view_changed(view);
  }
}

/// The `Transport` endpoint of one node on a `LocalNetwork`.
pub struct LocalTransport<K, V> {
  address: Address,
  network: LocalNetwork<K, V>,
}

impl<K, V> fmt::Debug for LocalTransport<K, V> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("LocalTransport")
      .field("address", &self.address)
      .finish()
  }
}

impl<K, V> Transport<K, V> for LocalTransport<K, V>
where
  K: Send + 'static,
  V: Send + Sync + 'static,
{
  fn local_address(&self) -> &Address {
    &self.address
  }

  fn start(&self, handler: Weak<dyn InboundHandler<K, V>>) -> Result<(), TransportError> {
    self.network.connect(self.address.clone(), handler)
  }

  fn stop(&self) {
    self.network.disconnect(&self.address);
  }

  fn send(
    &self,
    target: &Address,
    command: Command<K, V>,
    timeout: Duration,
  ) -> Result<Response<K, V>, TransportError> {
    trace!(from = %self.address, to = %target, "send");
    self.network.send(&self.address, target, command, timeout)
  }

  fn current_view(&self) -> View {
    self.network.view_of(&self.address).unwrap_or(View {
      id: 0,
      members: Vec::new(),
      subgroups: Vec::new(),
    })
  }
}
