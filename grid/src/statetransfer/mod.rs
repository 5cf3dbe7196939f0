//! Moving segment data between nodes when the topology changes.

mod consumer;
mod lock;
mod manager;
mod provider;

pub use consumer::TransferSummary;
pub use lock::StateTransferLock;

pub(crate) use consumer::StateConsumer;
pub(crate) use manager::StateTransferManager;
pub(crate) use provider::StateProvider;
