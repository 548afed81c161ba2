//! Instance-group upgrade orchestration
//!
//! Each cluster role (masters, workers) runs as one instance group. The
//! [`InstanceGroupOrchestrator`] moves a group through [`UpgradeState`]
//! across passes: submit the deployment, check it for drift, then replace
//! outdated instances by doubling the group, cordoning and draining the old
//! nodes and shrinking back.
//!
//! Provider access goes through [`ComputeClient`] ([`ArmComputeClient`] in
//! production), tenant nodes through [`NodeClient`], and deployment payloads
//! come from a [`CloudConfig`].

#![deny(missing_docs)]

pub mod arm;
pub mod checksum;
pub mod cloud_config;
pub mod interfaces;
pub mod node;
pub mod orchestrator;
mod phases;
pub mod provider;
pub mod session;
pub mod state;

#[cfg(test)]
pub(crate) mod test_support;

use std::sync::Arc;

use cirrus_common::crd::{CirrusCluster, NodeRole};
use cirrus_reconcile::{PersistedMachine, RecordStore};

pub use arm::ArmComputeClient;
pub use cloud_config::{CloudConfig, ScaleSetTemplate};
pub use node::{KubeNodeClient, NodeClient, NodeInfo};
pub use orchestrator::InstanceGroupOrchestrator;
pub use provider::ComputeClient;
pub use state::UpgradeState;

/// An orchestrator wired into the engine with its status record store
pub type OrchestratedGroup = PersistedMachine<InstanceGroupOrchestrator, CirrusCluster>;

/// Provider name of a role's instance group
pub fn instance_group_name(cluster_id: &str, role: NodeRole) -> String {
    format!("{}-{}", cluster_id, role_suffix(role))
}

/// Provider name of a role's instance group from before rolling replacement
pub fn legacy_instance_group_name(cluster_id: &str, role: NodeRole) -> String {
    format!("{}-{}-legacy", cluster_id, role_suffix(role))
}

/// Name of the template deployment creating a role's instance group
pub fn deployment_name(role: NodeRole) -> String {
    format!("{}-instance-group", role_suffix(role))
}

fn role_suffix(role: NodeRole) -> &'static str {
    match role {
        NodeRole::Master => "master",
        NodeRole::Worker => "worker",
    }
}

/// Build the engine resource for one role
pub fn orchestrated_group(
    role: NodeRole,
    compute: Arc<dyn ComputeClient>,
    nodes: Arc<dyn NodeClient>,
    cloud_config: Arc<dyn CloudConfig>,
    records: Arc<dyn RecordStore<CirrusCluster>>,
) -> OrchestratedGroup {
    PersistedMachine::new(
        InstanceGroupOrchestrator::new(role, compute, nodes, cloud_config),
        records,
    )
}
