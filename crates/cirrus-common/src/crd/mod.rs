//! Custom Resource Definitions for Cirrus

mod cluster;
mod types;

pub use cluster::{CirrusCluster, CirrusClusterSpec, CirrusClusterStatus, TEARDOWN_FINALIZER};
pub use types::{
    AllocatedNetwork, DiskSizes, NetworkSpec, NodePoolSpec, NodeRole, ResourceStatus,
    UpgradeStrategy,
};
