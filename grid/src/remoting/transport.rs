use crate::error::{GridError, TransportError};
use crate::remoting::{Address, Command, Response};

use std::sync::Weak;
use std::time::Duration;

/// A cluster membership snapshot delivered on every membership change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct View {
  pub id: u64,
  /// Members in join order. The first member is the coordinator.
  pub members: Vec<Address>,
  /// For a merge view, the member lists of the partitions that merged.
  /// Empty for a regular view.
  pub subgroups: Vec<Vec<Address>>,
}

impl View {
  pub fn coordinator(&self) -> Option<&Address> {
    self.members.first()
  }

  pub fn is_merge(&self) -> bool {
    self.subgroups.len() > 1
  }

  pub fn contains(&self, address: &Address) -> bool {
    self.members.contains(address)
  }
}

/// The receiving side of a transport: executes commands addressed to this node
/// and observes membership changes.
pub trait InboundHandler<K, V>: Send + Sync {
  fn handle(&self, origin: &Address, command: Command<K, V>) -> Result<Response<K, V>, GridError>;

  /// Invoked whenever cluster membership changes. This is the trigger for
  /// recomputing the consistent hash.
  fn view_changed(&self, view: &View);
}

/// The sending side of cluster communication consumed by the grid core.
pub trait Transport<K, V>: Send + Sync {
  fn local_address(&self) -> &Address;

  /// Registers the inbound handler and joins the cluster.
  fn start(&self, handler: Weak<dyn InboundHandler<K, V>>) -> Result<(), TransportError>;

  /// Leaves the cluster. Remaining members observe a view change.
  fn stop(&self);

  fn send(
    &self,
    target: &Address,
    command: Command<K, V>,
    timeout: Duration,
  ) -> Result<Response<K, V>, TransportError>;

  fn current_view(&self) -> View;

  /// Sends `command` to every other member of the current view and collects the
  /// replies in view order.
  fn broadcast(
    &self,
    command: Command<K, V>,
    timeout: Duration,
  ) -> Vec<(Address, Result<Response<K, V>, TransportError>)>
  where
    K: Clone,
  {
    let view = self.current_view();
    view
      .members
      .iter()
      .filter(|member| *member != self.local_address())
      .map(|member| (member.clone(), self.send(member, command.clone(), timeout)))
      .collect()
  }
}
