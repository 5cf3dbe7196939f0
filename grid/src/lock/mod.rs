//! Per-key exclusive locks held by primary owners.

mod container;
mod manager;
mod owner;

pub use container::LockContainer;
pub use manager::LockManager;
pub use owner::{InvocationContext, Interrupter, LockOwner};
