//! Tenant cluster node operations
//!
//! The tenant API server is reached through the admin kubeconfig stored next
//! to the descriptor. Until that Secret exists the tenant is considered down.

use std::net::Ipv4Addr;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{Api, EvictParams, ListParams, Patch, PatchParams};
use kube::{Client, ResourceExt};
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use cirrus_common::crd::CirrusCluster;
use cirrus_common::kube_utils::tenant_client;
use cirrus_common::store::FIELD_MANAGER;
use cirrus_common::{kubeconfig_secret_name, Error, Result};

const MIRROR_POD_ANNOTATION: &str = "kubernetes.io/config.mirror";

/// What the orchestrator needs to know about a tenant node
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeInfo {
    /// Node name
    pub name: String,
    /// First InternalIP address, if reported
    pub internal_ip: Option<Ipv4Addr>,
    /// Ready condition is True
    pub ready: bool,
    /// Marked unschedulable
    pub unschedulable: bool,
}

/// Operations on a tenant cluster's nodes
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NodeClient: Send + Sync {
    /// True if the tenant API server answers
    async fn api_available(&self, cluster: &CirrusCluster) -> Result<bool>;

    /// Every node of the tenant cluster
    async fn list_nodes(&self, cluster: &CirrusCluster) -> Result<Vec<NodeInfo>>;

    /// Mark a node unschedulable
    async fn cordon(&self, cluster: &CirrusCluster, node: &str) -> Result<()>;

    /// Evict every evictable pod from a node
    async fn drain(&self, cluster: &CirrusCluster, node: &str) -> Result<()>;
}

/// [`NodeClient`] over the tenant's kube API
pub struct KubeNodeClient {
    client: Client,
}

impl KubeNodeClient {
    /// Create a node client; `client` talks to the management cluster
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn tenant(&self, cluster: &CirrusCluster) -> Result<Option<Client>> {
        let namespace = cluster.namespace().unwrap_or_default();
        tenant_client(
            &self.client,
            &namespace,
            &kubeconfig_secret_name(&cluster.spec.cluster_id),
        )
        .await
    }

    async fn require_tenant(&self, cluster: &CirrusCluster) -> Result<Client> {
        self.tenant(cluster).await?.ok_or_else(|| {
            Error::not_found("Secret", kubeconfig_secret_name(&cluster.spec.cluster_id))
        })
    }
}

fn node_info(node: &Node) -> NodeInfo {
    let status = node.status.as_ref();
    let internal_ip = status
        .and_then(|s| s.addresses.as_ref())
        .and_then(|addrs| addrs.iter().find(|a| a.type_ == "InternalIP"))
        .and_then(|a| a.address.parse().ok());
    let ready = status
        .and_then(|s| s.conditions.as_ref())
        .map(|conds| conds.iter().any(|c| c.type_ == "Ready" && c.status == "True"))
        .unwrap_or(false);
    let unschedulable = node
        .spec
        .as_ref()
        .and_then(|s| s.unschedulable)
        .unwrap_or(false);

    NodeInfo {
        name: node.name_any(),
        internal_ip,
        ready,
        unschedulable,
    }
}

fn is_evictable(pod: &Pod) -> bool {
    if pod.annotations().contains_key(MIRROR_POD_ANNOTATION) {
        return false;
    }
    !pod.owner_references().iter().any(|o| o.kind == "DaemonSet")
}

#[async_trait]
impl NodeClient for KubeNodeClient {
    async fn api_available(&self, cluster: &CirrusCluster) -> Result<bool> {
        let Some(client) = self.tenant(cluster).await? else {
            debug!(cluster = %cluster.name_any(), "tenant kubeconfig not present yet");
            return Ok(false);
        };
        match client.apiserver_version().await {
            Ok(_) => Ok(true),
            Err(e) => {
                debug!(cluster = %cluster.name_any(), error = %e, "tenant API not reachable");
                Ok(false)
            }
        }
    }

    async fn list_nodes(&self, cluster: &CirrusCluster) -> Result<Vec<NodeInfo>> {
        let client = self.require_tenant(cluster).await?;
        let nodes: Api<Node> = Api::all(client);
        Ok(nodes
            .list(&ListParams::default())
            .await?
            .items
            .iter()
            .map(node_info)
            .collect())
    }

    async fn cordon(&self, cluster: &CirrusCluster, node: &str) -> Result<()> {
        let client = self.require_tenant(cluster).await?;
        let nodes: Api<Node> = Api::all(client);
        let patch = serde_json::json!({ "spec": { "unschedulable": true } });
        nodes
            .patch(node, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        info!(cluster = %cluster.name_any(), node = %node, "node cordoned");
        Ok(())
    }

    async fn drain(&self, cluster: &CirrusCluster, node: &str) -> Result<()> {
        let client = self.require_tenant(cluster).await?;
        let all_pods: Api<Pod> = Api::all(client.clone());
        let pods = all_pods
            .list(&ListParams::default().fields(&format!("spec.nodeName={}", node)))
            .await?;

        let mut blocked = 0usize;
        for pod in pods.items.iter().filter(|p| is_evictable(p)) {
            let namespace = pod.namespace().unwrap_or_default();
            let api: Api<Pod> = Api::namespaced(client.clone(), &namespace);
            match api.evict(&pod.name_any(), &EvictParams::default()).await {
                Ok(_) => {}
                Err(kube::Error::Api(e)) if e.code == 404 => {}
                // A disruption budget refused the eviction
                Err(kube::Error::Api(e)) if e.code == 429 => {
                    warn!(node = %node, pod = %pod.name_any(), "eviction blocked by disruption budget");
                    blocked += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }

        if blocked > 0 {
            return Err(Error::provider(
                node,
                "drain",
                format!("{} pods could not be evicted yet", blocked),
            ));
        }
        info!(cluster = %cluster.name_any(), node = %node, "node drained");
        Ok(())
    }
}
