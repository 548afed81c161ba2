//! Capabilities the allocator resource is assembled from
//!
//! Each trait is one seam: the resource never talks to the descriptor
//! store or the coordination API directly.

use std::sync::Arc;

use async_trait::async_trait;
use ipnetwork::Ipv4Network;
use kube::ResourceExt;

#[cfg(test)]
use mockall::automock;

use cirrus_common::crd::{AllocatedNetwork, CirrusCluster};
use cirrus_common::store::DescriptorStore;
use cirrus_common::{Error, Result};

/// Decides whether a descriptor still needs a block
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Checker: Send + Sync {
    /// Allocation already recorded for `cluster`, read fresh from the store
    async fn existing(&self, cluster: &CirrusCluster) -> Result<Option<AllocatedNetwork>>;

    /// Ranges that must never be handed out
    async fn reserved(&self) -> Result<Vec<Ipv4Network>>;
}

/// Gathers the blocks already in use
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Collector: Send + Sync {
    /// Every allocated block across all descriptors
    async fn collect(&self) -> Result<Vec<Ipv4Network>>;
}

/// Records a chosen block on its descriptor
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Persister: Send + Sync {
    /// Store `network` on `cluster`, returning the updated descriptor
    async fn persist(
        &self,
        cluster: &CirrusCluster,
        network: &AllocatedNetwork,
    ) -> Result<CirrusCluster>;
}

/// Proof of one acquisition, handed back on release
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LockToken(pub String);

/// Cross-process mutual exclusion
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Locker: Send + Sync {
    /// Block until `key` is held or the configured timeout elapses
    ///
    /// Timing out yields [`Error::LockTimeout`].
    async fn lock(&self, key: &str) -> Result<LockToken>;

    /// Release the acquisition `token` of `key`
    ///
    /// A no-op when the lock is no longer held under `token`.
    async fn unlock(&self, key: &str, token: &LockToken) -> Result<()>;
}

/// [`Checker`] backed by the descriptor store and a static reserved list
pub struct StoreChecker {
    store: Arc<dyn DescriptorStore>,
    reserved: Vec<Ipv4Network>,
}

impl StoreChecker {
    /// Create a checker
    pub fn new(store: Arc<dyn DescriptorStore>, reserved: Vec<Ipv4Network>) -> Self {
        Self { store, reserved }
    }
}

#[async_trait]
impl Checker for StoreChecker {
    async fn existing(&self, cluster: &CirrusCluster) -> Result<Option<AllocatedNetwork>> {
        let namespace = cluster.namespace().unwrap_or_default();
        let fresh = self.store.get(&namespace, &cluster.name_any()).await?;
        Ok(fresh.allocated_network().cloned())
    }

    async fn reserved(&self) -> Result<Vec<Ipv4Network>> {
        Ok(self.reserved.clone())
    }
}

/// [`Collector`] listing every descriptor in the store
pub struct StoreCollector {
    store: Arc<dyn DescriptorStore>,
}

impl StoreCollector {
    /// Create a collector
    pub fn new(store: Arc<dyn DescriptorStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Collector for StoreCollector {
    async fn collect(&self) -> Result<Vec<Ipv4Network>> {
        let mut used = Vec::new();
        for cluster in self.store.list().await? {
            if let Some(network) = cluster.allocated_network() {
                // A block that cannot be parsed cannot be proven free.
                let block = network.block().map_err(|e| {
                    Error::invariant(cluster.name_any(), format!("stored allocation: {}", e))
                })?;
                used.push(block);
            }
        }
        Ok(used)
    }
}

/// [`Persister`] writing `status.network` through the descriptor store
pub struct StorePersister {
    store: Arc<dyn DescriptorStore>,
}

impl StorePersister {
    /// Create a persister
    pub fn new(store: Arc<dyn DescriptorStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Persister for StorePersister {
    async fn persist(
        &self,
        cluster: &CirrusCluster,
        network: &AllocatedNetwork,
    ) -> Result<CirrusCluster> {
        self.store.patch_network(cluster, network).await
    }
}
