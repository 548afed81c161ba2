//! Descriptor store: read and update CirrusCluster objects
//!
//! Every write that touches progress carries the resourceVersion the caller
//! read, so a concurrent writer turns into a 409 instead of a lost update.
//! Conflicts surface as [`Error::Conflict`]; the caller re-reads and
//! recomputes on the next pass.

use async_trait::async_trait;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::{Client, ResourceExt};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::crd::{AllocatedNetwork, CirrusCluster, ResourceStatus};
use crate::{Error, Result};

/// Field manager used for all operator writes
pub const FIELD_MANAGER: &str = "cirrus-operator";

/// Trait abstracting descriptor persistence
///
/// This trait allows mocking the Kubernetes client in tests while using
/// the real client in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DescriptorStore: Send + Sync {
    /// Read one descriptor
    async fn get(&self, namespace: &str, name: &str) -> Result<CirrusCluster>;

    /// List every descriptor in every namespace
    async fn list(&self) -> Result<Vec<CirrusCluster>>;

    /// Replace the status record of one managed resource
    ///
    /// Fails with [`Error::Conflict`] if the descriptor changed since it was read.
    /// Returns the descriptor as stored after the write.
    async fn patch_resource_status(
        &self,
        cluster: &CirrusCluster,
        resource: &str,
        status: &ResourceStatus,
    ) -> Result<CirrusCluster>;

    /// Record the network allocation of a descriptor
    ///
    /// Same concurrency contract as [`DescriptorStore::patch_resource_status`].
    async fn patch_network(
        &self,
        cluster: &CirrusCluster,
        network: &AllocatedNetwork,
    ) -> Result<CirrusCluster>;

    /// Record the outcome of a pass (observed generation and message)
    async fn patch_summary(
        &self,
        cluster: &CirrusCluster,
        observed_generation: Option<i64>,
        message: Option<String>,
    ) -> Result<()>;

    /// Add a finalizer if not already present
    async fn add_finalizer(&self, cluster: &CirrusCluster, finalizer: &str) -> Result<()>;

    /// Remove a finalizer
    async fn remove_finalizer(&self, cluster: &CirrusCluster, finalizer: &str) -> Result<()>;
}

/// Real Kubernetes implementation of [`DescriptorStore`]
pub struct KubeDescriptorStore {
    client: Client,
}

impl KubeDescriptorStore {
    /// Create a store wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<CirrusCluster> {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn patch_status_guarded(
        &self,
        cluster: &CirrusCluster,
        status_patch: serde_json::Value,
    ) -> Result<CirrusCluster> {
        let name = cluster.name_any();
        let namespace = namespace_of(cluster)?;
        let resource_version = cluster.resource_version().ok_or_else(|| {
            Error::internal_with_context("store", format!("{} has no resourceVersion", name))
        })?;

        let patch = serde_json::json!({
            "metadata": { "resourceVersion": resource_version },
            "status": status_patch,
        });

        match self
            .api(&namespace)
            .patch_status(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await
        {
            Ok(updated) => Ok(updated),
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                debug!(cluster = %name, "status patch conflict");
                Err(Error::conflict(name, ae.message))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn patch_finalizers(&self, cluster: &CirrusCluster, finalizers: Vec<String>) -> Result<()> {
        let name = cluster.name_any();
        let namespace = namespace_of(cluster)?;
        let patch = serde_json::json!({
            "metadata": {
                "finalizers": finalizers
            }
        });

        self.api(&namespace)
            .patch(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

fn namespace_of(cluster: &CirrusCluster) -> Result<String> {
    cluster.namespace().ok_or_else(|| {
        Error::internal_with_context(
            "store",
            format!("{} is namespaced but has no namespace", cluster.name_any()),
        )
    })
}

#[async_trait]
impl DescriptorStore for KubeDescriptorStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<CirrusCluster> {
        Ok(self.api(namespace).get(name).await?)
    }

    async fn list(&self) -> Result<Vec<CirrusCluster>> {
        let api: Api<CirrusCluster> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn patch_resource_status(
        &self,
        cluster: &CirrusCluster,
        resource: &str,
        status: &ResourceStatus,
    ) -> Result<CirrusCluster> {
        // Merge patch on a map key replaces nested maps key by key; the
        // checksums map must be replaced wholesale, so null out stale keys.
        let mut checksums = serde_json::Map::new();
        for key in cluster.resource_status(resource).checksums.keys() {
            checksums.insert(key.clone(), serde_json::Value::Null);
        }
        for (key, value) in &status.checksums {
            checksums.insert(key.clone(), serde_json::Value::String(value.clone()));
        }

        self.patch_status_guarded(
            cluster,
            serde_json::json!({
                "resources": {
                    resource: {
                        "state": status.state,
                        "checksums": checksums,
                    }
                }
            }),
        )
        .await
    }

    async fn patch_network(
        &self,
        cluster: &CirrusCluster,
        network: &AllocatedNetwork,
    ) -> Result<CirrusCluster> {
        self.patch_status_guarded(cluster, serde_json::json!({ "network": network }))
            .await
    }

    async fn patch_summary(
        &self,
        cluster: &CirrusCluster,
        observed_generation: Option<i64>,
        message: Option<String>,
    ) -> Result<()> {
        let name = cluster.name_any();
        let namespace = namespace_of(cluster)?;
        let patch = serde_json::json!({
            "status": {
                "observedGeneration": observed_generation,
                "message": message,
            }
        });

        self.api(&namespace)
            .patch_status(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn add_finalizer(&self, cluster: &CirrusCluster, finalizer: &str) -> Result<()> {
        let mut finalizers = cluster.finalizers().to_vec();
        if finalizers.iter().any(|f| f == finalizer) {
            return Ok(());
        }
        finalizers.push(finalizer.to_string());
        self.patch_finalizers(cluster, finalizers).await
    }

    async fn remove_finalizer(&self, cluster: &CirrusCluster, finalizer: &str) -> Result<()> {
        let finalizers: Vec<String> = cluster
            .finalizers()
            .iter()
            .filter(|f| *f != finalizer)
            .cloned()
            .collect();
        self.patch_finalizers(cluster, finalizers).await
    }
}
