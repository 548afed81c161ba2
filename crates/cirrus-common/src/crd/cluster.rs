//! CirrusCluster Custom Resource Definition
//!
//! A CirrusCluster is the declarative description of one cluster's compute
//! infrastructure. The operator converges instance groups and network ranges
//! toward it, and records its progress per managed resource in the status.

use std::collections::BTreeMap;

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{
    AllocatedNetwork, NetworkSpec, NodePoolSpec, NodeRole, ResourceStatus, UpgradeStrategy,
};

/// Finalizer guarding instance-group teardown
pub const TEARDOWN_FINALIZER: &str = "cirrus.dev/teardown";

/// Specification for a CirrusCluster
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "cirrus.dev",
    version = "v1alpha1",
    kind = "CirrusCluster",
    plural = "cirrusclusters",
    shortname = "cc",
    status = "CirrusClusterStatus",
    namespaced,
    printcolumn = r#"{"name":"Cluster","type":"string","jsonPath":".spec.clusterId"}"#,
    printcolumn = r#"{"name":"Masters","type":"string","jsonPath":".status.resources.masters.state"}"#,
    printcolumn = r#"{"name":"Workers","type":"string","jsonPath":".status.resources.workers.state"}"#,
    printcolumn = r#"{"name":"CIDR","type":"string","jsonPath":".status.network.cidr"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CirrusClusterSpec {
    /// Stable cluster identifier, used to name provider objects
    pub cluster_id: String,

    /// Release/template version the instance groups are rendered from
    pub template_version: String,

    /// Control-plane pool
    pub masters: NodePoolSpec,

    /// Worker pool
    pub workers: NodePoolSpec,

    /// Network request
    #[serde(default)]
    pub network: NetworkSpec,

    /// How new instance models are rolled out
    #[serde(default)]
    pub upgrade_strategy: UpgradeStrategy,
}

impl CirrusClusterSpec {
    /// Pool spec for a role
    pub fn pool(&self, role: NodeRole) -> &NodePoolSpec {
        match role {
            NodeRole::Master => &self.masters,
            NodeRole::Worker => &self.workers,
        }
    }

    /// Validate the cluster specification
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.cluster_id.is_empty() {
            return Err(crate::Error::validation("clusterId cannot be empty"));
        }
        if self.cluster_id.len() > 40
            || !self
                .cluster_id
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
            || self.cluster_id.starts_with('-')
        {
            return Err(crate::Error::validation(format!(
                "clusterId {:?} must be a lowercase DNS label of at most 40 characters",
                self.cluster_id
            )));
        }
        if self.template_version.is_empty() {
            return Err(crate::Error::validation("templateVersion cannot be empty"));
        }

        self.masters.validate(NodeRole::Master)?;
        self.workers.validate(NodeRole::Worker)?;

        if let Some(bits) = self.network.mask_bits {
            if bits > crate::config::MAX_ALLOCATED_MASK_BITS {
                return Err(crate::Error::validation(format!(
                    "network.maskBits {} leaves no room for subnets",
                    bits
                )));
            }
        }

        Ok(())
    }
}

/// Status for a CirrusCluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CirrusClusterStatus {
    /// The generation of the spec that was last processed by the controller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Per managed resource progress, keyed by resource name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub resources: BTreeMap<String, ResourceStatus>,

    /// Allocated address ranges; set once at creation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<AllocatedNetwork>,

    /// Human-readable message about the last pass
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl CirrusCluster {
    /// Status record of a managed resource, default when never reconciled
    pub fn resource_status(&self, resource: &str) -> ResourceStatus {
        self.status
            .as_ref()
            .and_then(|s| s.resources.get(resource))
            .cloned()
            .unwrap_or_default()
    }

    /// Network allocation recorded in status, if any
    pub fn allocated_network(&self) -> Option<&AllocatedNetwork> {
        self.status.as_ref().and_then(|s| s.network.as_ref())
    }

    /// True if the operator's teardown finalizer is present
    pub fn has_teardown_finalizer(&self) -> bool {
        self.finalizers().iter().any(|f| f == TEARDOWN_FINALIZER)
    }

    /// True once deletion has been requested
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::DiskSizes;

    fn sample_spec() -> CirrusClusterSpec {
        CirrusClusterSpec {
            cluster_id: "c7x2k".to_string(),
            template_version: "13.0.0".to_string(),
            masters: NodePoolSpec {
                count: 1,
                vm_size: "Standard_D4s_v3".to_string(),
                disks: DiskSizes::default(),
            },
            workers: NodePoolSpec {
                count: 3,
                vm_size: "Standard_D4s_v3".to_string(),
                disks: DiskSizes::default(),
            },
            network: NetworkSpec::default(),
            upgrade_strategy: UpgradeStrategy::default(),
        }
    }

    #[test]
    fn valid_spec_passes() {
        assert!(sample_spec().validate().is_ok());
    }

    #[test]
    fn cluster_id_must_be_dns_label() {
        let mut spec = sample_spec();
        spec.cluster_id = "My Cluster".into();
        assert!(spec.validate().is_err());

        spec.cluster_id = String::new();
        assert!(spec.validate().is_err());

        spec.cluster_id = "-abc".into();
        assert!(spec.validate().is_err());
    }

    #[test]
    fn oversized_mask_bits_rejected() {
        let mut spec = sample_spec();
        spec.network.mask_bits = Some(29);
        assert!(spec.validate().is_err());
        spec.network.mask_bits = Some(24);
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn resource_status_defaults_when_absent() {
        let mut cluster = CirrusCluster::new("demo", sample_spec());
        assert_eq!(cluster.resource_status("workers").state, "");

        let mut status = CirrusClusterStatus::default();
        status
            .resources
            .insert("workers".into(), ResourceStatus::with_state("DeploymentCompleted"));
        cluster.status = Some(status);
        assert_eq!(
            cluster.resource_status("workers").state,
            "DeploymentCompleted"
        );
    }

    #[test]
    fn finalizer_detection() {
        let mut cluster = CirrusCluster::new("demo", sample_spec());
        assert!(!cluster.has_teardown_finalizer());
        cluster.metadata.finalizers = Some(vec![TEARDOWN_FINALIZER.to_string()]);
        assert!(cluster.has_teardown_finalizer());
    }

    #[test]
    fn crd_schema_generates() {
        use kube::CustomResourceExt;
        let crd = CirrusCluster::crd();
        assert_eq!(crd.spec.group, "cirrus.dev");
        let yaml = serde_yaml::to_string(&crd).unwrap();
        assert!(yaml.contains("CirrusCluster"));
    }
}
