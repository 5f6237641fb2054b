//! An in-process ledger, event bus and computation cluster for exercising
//! record exchanges without a network.

pub mod bus;
pub mod cluster;
pub mod network;

pub use bus::ListenerRegistry;
pub use cluster::{ClusterBehavior, ClusterError, LookupJob, SimulatedCluster};
pub use network::{Builder, LocalNetwork, DEFAULT_CLUSTER_OFFSET, DEFAULT_PROGRAM_LABEL};
