//! Deployment payload rendering
//!
//! The payload is re-rendered every pass from the descriptor alone; its
//! checksums are how drift is detected, so rendering must be deterministic.

use async_trait::async_trait;
use serde_json::json;

#[cfg(test)]
use mockall::automock;

use cirrus_common::crd::{CirrusCluster, NodeRole};
use cirrus_common::{Error, Result};

use crate::provider::DeploymentPayload;

/// Size of the etcd data disk on masters, in GB
pub const ETCD_DISK_GB: u32 = 10;

/// Renders the deployment for one role's instance group
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CloudConfig: Send + Sync {
    /// Template and parameters for `role`
    async fn render(&self, cluster: &CirrusCluster, role: NodeRole) -> Result<DeploymentPayload>;
}

/// Built-in scale set template
///
/// Node bootstrap data is referenced by template version; fetching and
/// rendering it is the job of the image, not of this operator.
#[derive(Clone, Debug, Default)]
pub struct ScaleSetTemplate;

impl ScaleSetTemplate {
    fn data_disks(role: NodeRole) -> serde_json::Value {
        let mut disks = Vec::new();
        if role == NodeRole::Master {
            disks.push(json!({
                "lun": 0,
                "createOption": "Empty",
                "diskSizeGB": ETCD_DISK_GB,
            }));
        }
        disks.push(json!({
            "lun": role.docker_disk_slot(),
            "createOption": "Empty",
            "diskSizeGB": "[parameters('dockerDiskSizeGB')]",
        }));
        disks.push(json!({
            "lun": role.kubelet_disk_slot(),
            "createOption": "Empty",
            "diskSizeGB": "[parameters('kubeletDiskSizeGB')]",
        }));
        serde_json::Value::Array(disks)
    }

    fn template(role: NodeRole) -> serde_json::Value {
        json!({
            "$schema": "https://schema.management.azure.com/schemas/2019-04-01/deploymentTemplate.json#",
            "contentVersion": "1.0.0.0",
            "parameters": {
                "groupName": {"type": "string"},
                "templateVersion": {"type": "string"},
                "vmSize": {"type": "string"},
                "instanceCount": {"type": "int"},
                "subnetCidr": {"type": "string"},
                "dockerDiskSizeGB": {"type": "int"},
                "kubeletDiskSizeGB": {"type": "int"},
            },
            "resources": [{
                "type": "Microsoft.Compute/virtualMachineScaleSets",
                "apiVersion": "2023-03-01",
                "name": "[parameters('groupName')]",
                "location": "[resourceGroup().location]",
                "tags": {
                    "cirrus.dev/role": role.resource_name(),
                    "cirrus.dev/template-version": "[parameters('templateVersion')]",
                },
                "sku": {
                    "name": "[parameters('vmSize')]",
                    "capacity": "[parameters('instanceCount')]",
                },
                "properties": {
                    "overprovision": false,
                    "upgradePolicy": {"mode": "Manual"},
                    "scaleInPolicy": {"rules": ["OldestVM"]},
                    "virtualMachineProfile": {
                        "storageProfile": {
                            "dataDisks": Self::data_disks(role),
                        },
                        "networkProfile": {
                            "networkInterfaceConfigurations": [{
                                "name": "[concat(parameters('groupName'), '-nic')]",
                                "properties": {
                                    "primary": true,
                                    "ipConfigurations": [{
                                        "name": "primary",
                                        "properties": {
                                            "subnet": {"addressPrefix": "[parameters('subnetCidr')]"},
                                        },
                                    }],
                                },
                            }],
                        },
                    },
                },
            }],
        })
    }
}

#[async_trait]
impl CloudConfig for ScaleSetTemplate {
    async fn render(&self, cluster: &CirrusCluster, role: NodeRole) -> Result<DeploymentPayload> {
        let network = cluster.allocated_network().ok_or_else(|| {
            Error::invariant(role.resource_name(), "network not allocated yet")
        })?;
        let subnet = match role {
            NodeRole::Master => &network.master_subnet_cidr,
            NodeRole::Worker => &network.worker_subnet_cidr,
        };
        let pool = cluster.spec.pool(role);

        let parameters = json!({
            "groupName": {"value": crate::instance_group_name(&cluster.spec.cluster_id, role)},
            "templateVersion": {"value": cluster.spec.template_version},
            "vmSize": {"value": pool.vm_size},
            "instanceCount": {"value": pool.count},
            "subnetCidr": {"value": subnet},
            "dockerDiskSizeGB": {"value": pool.disks.docker_gb},
            "kubeletDiskSizeGB": {"value": pool.disks.kubelet_gb},
        });

        Ok(DeploymentPayload {
            template: Self::template(role),
            parameters,
        })
    }
}
