use crate::cluster::ClusterTopologyManager;
use crate::container::DataContainer;
use crate::distribution::DistributionManager;
use crate::error::{GridError, Result};
use crate::invocation::Invoker;
use crate::remoting::{Address, Command, InboundHandler, Response, View};
use crate::statetransfer::{StateProvider, StateTransferManager};

use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use tracing::trace;

/// Executes the commands other nodes send to this one.
pub(crate) struct CommandHandler<K, V> {
  local: Address,
  distribution: Arc<DistributionManager>,
  invoker: Arc<Invoker<K, V>>,
  container: Arc<DataContainer<K, V>>,
  provider: StateProvider<K, V>,
  state_transfer: Arc<StateTransferManager<K, V>>,
  cluster: Arc<ClusterTopologyManager<K, V>>,
}

impl<K, V> fmt::Debug for CommandHandler<K, V> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CommandHandler").field("node", &self.local).finish()
  }
}

impl<K, V> CommandHandler<K, V>
where
  K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
  V: Send + Sync + 'static,
{
  pub(crate) fn new(
    distribution: Arc<DistributionManager>,
    invoker: Arc<Invoker<K, V>>,
    container: Arc<DataContainer<K, V>>,
    provider: StateProvider<K, V>,
    state_transfer: Arc<StateTransferManager<K, V>>,
    cluster: Arc<ClusterTopologyManager<K, V>>,
  ) -> Self {
    Self {
      local: distribution.local_address().clone(),
      distribution,
      invoker,
      container,
      provider,
      state_transfer,
      cluster,
    }
  }

  fn dispatch(&self, origin: &Address, command: Command<K, V>) -> Result<Response<K, V>> {
    trace!(node = %self.local, %origin, ?command, "handling command");
    match command {
      Command::Write {
        key,
        op,
        owner,
        topology_id,
        in_transaction,
      } => self
        .invoker
        .execute_write(key, op, &owner, topology_id, in_transaction, None)
        .map(Response::Entry),
      Command::Backup {
        key,
        entry,
        topology_id,
      } => self
        .invoker
        .execute_backup(key, entry, topology_id)
        .map(|_| Response::Ack),
      Command::Lock {
        key,
        owner,
        topology_id,
        timeout,
      } => self
        .invoker
        .execute_lock(&key, &owner, topology_id, timeout, None)
        .map(|_| Response::Ack),
      Command::Unlock { keys, owner } => {
        self.invoker.execute_unlock(&keys, &owner);
        Ok(Response::Ack)
      }
      Command::Read { key, topology_id } => self.invoker.execute_read(&key, topology_id).map(Response::Entry),
      Command::GetEntry { key } => self.container.get(&key).map(Response::Entry),
      Command::GetSegments { segments, .. } => self.provider.entries(&segments).map(Response::Entries),
      Command::TopologyUpdate { topology } => self.state_transfer.install(topology).map(|_| Response::Ack),
      Command::Status => Ok(Response::Status(
        self.distribution.try_current_topology().map(|t| (*t).clone()),
      )),
      Command::Leave { leaver } => {
        if !self.cluster.is_coordinator() {
          return Err(GridError::IllegalState(format!(
            "{} asked {} to coordinate its leave, which is not the coordinator",
            leaver, self.local
          )));
        }
        self.cluster.handle_leave(&leaver).map(|_| Response::Ack)
      }
      Command::ResolveConflicts {
        topology_id,
        preferred,
      } => self
        .cluster
        .resolve_local_conflicts(topology_id, &preferred)
        .map(|_| Response::Ack),
    }
  }
}

impl<K, V> InboundHandler<K, V> for CommandHandler<K, V>
where
  K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
  V: Send + Sync + 'static,
{
  fn handle(&self, origin: &Address, command: Command<K, V>) -> Result<Response<K, V>> {
    self.dispatch(origin, command)
  }

  fn view_changed(&self, view: &View) {
    self.cluster.on_view_change(view);
  }
}
