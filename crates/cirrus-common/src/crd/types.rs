//! Shared types used by the CirrusCluster CRD

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::Error;

/// Role an instance group plays in the cluster
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Control-plane nodes
    Master,
    /// Worker nodes
    Worker,
}

impl NodeRole {
    /// Name of the managed resource (and status record) for this role
    pub fn resource_name(&self) -> &'static str {
        match self {
            Self::Master => "masters",
            Self::Worker => "workers",
        }
    }

    /// Data-disk slot index holding the container runtime volume.
    ///
    /// Slot order follows the disk attachment order of the deployment
    /// template for each role.
    pub fn docker_disk_slot(&self) -> u32 {
        match self {
            Self::Master => 1,
            Self::Worker => 0,
        }
    }

    /// Data-disk slot index holding the kubelet volume
    pub fn kubelet_disk_slot(&self) -> u32 {
        match self {
            Self::Master => 2,
            Self::Worker => 1,
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.resource_name())
    }
}

/// Data disk sizes for a node pool, in GB
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DiskSizes {
    /// Size of the container runtime volume
    #[serde(default = "default_docker_disk_gb")]
    pub docker_gb: u32,
    /// Size of the kubelet volume
    #[serde(default = "default_kubelet_disk_gb")]
    pub kubelet_gb: u32,
}

fn default_docker_disk_gb() -> u32 {
    50
}

fn default_kubelet_disk_gb() -> u32 {
    100
}

impl Default for DiskSizes {
    fn default() -> Self {
        Self {
            docker_gb: default_docker_disk_gb(),
            kubelet_gb: default_kubelet_disk_gb(),
        }
    }
}

/// Desired shape of one node pool
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodePoolSpec {
    /// Desired number of instances
    pub count: u32,
    /// Provider VM size (e.g., "Standard_D4s_v3")
    pub vm_size: String,
    /// Data disk sizes
    #[serde(default)]
    pub disks: DiskSizes,
}

impl NodePoolSpec {
    /// Validates the pool specification for the given role
    pub fn validate(&self, role: NodeRole) -> Result<(), Error> {
        if self.count == 0 {
            return Err(Error::validation(format!(
                "{} count must be at least 1",
                role
            )));
        }
        if role == NodeRole::Master && self.count > 1 && self.count % 2 == 0 {
            return Err(Error::validation(
                "master count must be odd for etcd quorum (1, 3, 5, ...)",
            ));
        }
        if self.vm_size.trim().is_empty() {
            return Err(Error::validation(format!("{} vmSize cannot be empty", role)));
        }
        if self.disks.docker_gb == 0 || self.disks.kubelet_gb == 0 {
            return Err(Error::validation(format!(
                "{} disk sizes must be positive",
                role
            )));
        }
        Ok(())
    }
}

/// Network request of a cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkSpec {
    /// Requested prefix length of the cluster block; operator default when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mask_bits: Option<u8>,
}

/// Strategy used to roll new instance models out
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum UpgradeStrategy {
    /// Double the instance group, cordon and drain old instances, scale back down
    #[default]
    InstanceGroup,
    /// Deprecated per-instance path: deallocate, resize disks, restart agents
    LegacyInPlace,
}

/// Persisted record of one managed resource
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceStatus {
    /// Current state tag; empty means the initial state
    #[serde(default)]
    pub state: String,
    /// Content checksums recorded when the state was entered
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub checksums: BTreeMap<String, String>,
}

impl ResourceStatus {
    /// Record with the given state and no checksums
    pub fn with_state(state: impl Into<String>) -> Self {
        Self {
            state: state.into(),
            checksums: BTreeMap::new(),
        }
    }

    /// Checksum stored under `key`, if any
    pub fn checksum(&self, key: &str) -> Option<&str> {
        self.checksums.get(key).map(String::as_str)
    }
}

/// Address ranges allocated to a cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AllocatedNetwork {
    /// The cluster's whole block (e.g., "10.1.0.0/16")
    pub cidr: String,
    /// Overlay network range
    pub overlay_cidr: String,
    /// Subnet hosting master instances
    pub master_subnet_cidr: String,
    /// Subnet hosting worker instances
    pub worker_subnet_cidr: String,
}

impl AllocatedNetwork {
    /// Parse the cluster block
    pub fn block(&self) -> Result<ipnetwork::Ipv4Network, Error> {
        ipnetwork::Ipv4Network::from_str(&self.cidr).map_err(|e| {
            Error::validation_for_field(
                crate::error::UNKNOWN_CONTEXT,
                "status.network.cidr",
                format!("invalid CIDR {:?}: {}", self.cidr, e),
            )
        })
    }
}
