//! The seam between the grid core and cluster communication.

mod address;
mod command;
mod local;
mod transport;

pub use address::Address;
pub use command::{Command, Response, WriteOp};
pub use local::{LocalNetwork, LocalTransport};
pub use transport::{InboundHandler, Transport, View};
