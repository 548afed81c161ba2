//! Instance-group upgrade orchestrator
//!
//! One orchestrator per role. Each pass runs the single transition
//! registered for the persisted state; the phase modules hold the
//! transitions themselves.

use std::sync::Arc;

use async_trait::async_trait;
use kube::ResourceExt;
use tracing::{debug, info};

use cirrus_common::crd::{CirrusCluster, NodePoolSpec, NodeRole, ResourceStatus};
use cirrus_common::{resource_group_name, Result};
use cirrus_reconcile::{StateTag, Transition, Transitions};

use crate::cloud_config::CloudConfig;
use crate::node::NodeClient;
use crate::phases;
use crate::provider::ComputeClient;
use crate::state::UpgradeState;

/// Names and spec of the instance group a transition works on
pub struct GroupRef<'a> {
    /// The descriptor being reconciled
    pub cluster: &'a CirrusCluster,
    /// Role of the group
    pub role: NodeRole,
    /// Provider resource group
    pub resource_group: String,
    /// Current instance group
    pub name: String,
    /// Instance group left over from before the instance-group strategy
    pub legacy_name: String,
    /// Template deployment that creates the group
    pub deployment: String,
}

impl<'a> GroupRef<'a> {
    fn new(cluster: &'a CirrusCluster, role: NodeRole) -> Self {
        let id = &cluster.spec.cluster_id;
        Self {
            cluster,
            role,
            resource_group: resource_group_name(id),
            name: crate::instance_group_name(id, role),
            legacy_name: crate::legacy_instance_group_name(id, role),
            deployment: crate::deployment_name(role),
        }
    }

    /// Spec of this role's pool
    pub fn pool(&self) -> &NodePoolSpec {
        self.cluster.spec.pool(self.role)
    }

    /// Desired instance count
    pub fn desired_count(&self) -> u32 {
        self.pool().count
    }
}

/// Drives one role's instance group through [`UpgradeState`]
pub struct InstanceGroupOrchestrator {
    pub(crate) role: NodeRole,
    pub(crate) compute: Arc<dyn ComputeClient>,
    pub(crate) nodes: Arc<dyn NodeClient>,
    pub(crate) cloud_config: Arc<dyn CloudConfig>,
}

impl InstanceGroupOrchestrator {
    /// Create an orchestrator for `role`
    pub fn new(
        role: NodeRole,
        compute: Arc<dyn ComputeClient>,
        nodes: Arc<dyn NodeClient>,
        cloud_config: Arc<dyn CloudConfig>,
    ) -> Self {
        Self {
            role,
            compute,
            nodes,
            cloud_config,
        }
    }

    /// Role this orchestrator manages
    pub fn role(&self) -> NodeRole {
        self.role
    }
}

#[async_trait]
impl Transitions<CirrusCluster> for InstanceGroupOrchestrator {
    type State = UpgradeState;

    fn resource(&self) -> &str {
        self.role.resource_name()
    }

    async fn transition(
        &self,
        cluster: &CirrusCluster,
        state: UpgradeState,
        record: &ResourceStatus,
    ) -> Result<Transition<UpgradeState>> {
        let group = GroupRef::new(cluster, self.role);
        debug!(
            cluster = %cluster.name_any(),
            resource = %self.resource(),
            state = state.as_str(),
            "running transition"
        );

        use UpgradeState::*;
        match state {
            Uninitialized => phases::deploy(self, &group).await,
            DeploymentInProgress => phases::await_deployment(self, &group).await,
            DeploymentCompletedCheck | DeploymentCompleted => {
                phases::check_completed(self, &group, state, record).await
            }
            ProvisioningSuccessful => phases::check_upgrade_required(self, &group, record).await,
            ScaleUpInstances => phases::scale_up(self, &group).await,
            CordonOldInstances => phases::cordon_old(self, &group).await,
            WaitNewInstancesReady => phases::wait_new_ready(self, &group).await,
            ScaleDownInstances => phases::scale_down(self, &group).await,
            CheckMigrationNeeded => phases::check_migration(self, &group).await,
            WaitBackupConfirmation => phases::wait_backup_confirmation(&group),
            DeallocateLegacyInstance => phases::deallocate_legacy(self, &group).await,
            ResizeDisks => phases::resize_disks(self, &group).await,
            RestartAgents => phases::restart_agents(self, &group).await,
        }
    }

    async fn teardown(&self, cluster: &CirrusCluster) -> Result<bool> {
        let group = GroupRef::new(cluster, self.role);
        let mut remaining = false;

        for name in [&group.name, &group.legacy_name] {
            if self
                .compute
                .get_instance_group(&group.resource_group, name)
                .await?
                .is_some()
            {
                info!(cluster = %cluster.name_any(), group = %name, "deleting instance group");
                self.compute
                    .delete_instance_group(&group.resource_group, name)
                    .await?;
                remaining = true;
            }
        }

        if !remaining {
            self.compute
                .delete_deployment(&group.resource_group, &group.deployment)
                .await?;
        }
        Ok(!remaining)
    }
}
