//! Membership handling: the coordinator turns views into topologies.

mod manager;
mod report;

pub use manager::ClusterTopologyManager;
pub use report::ResiliencyReport;
