//! The allocator as an engine resource
//!
//! A descriptor without `status.network` gets one block from the pool.
//! Reading the used set, choosing a block and persisting it all happen under
//! the allocator lock so two passes can never choose the same block.

use std::sync::Arc;

use async_trait::async_trait;
use ipnetwork::Ipv4Network;
use kube::ResourceExt;
use tracing::{info, instrument, warn};

use cirrus_common::config::validate_mask_bits;
use cirrus_common::crd::{AllocatedNetwork, CirrusCluster};
use cirrus_common::Result;
use cirrus_reconcile::{Applied, ChangeOp, Desired, ManagedResource, Outcome};

use crate::allocator::{first_fit, split};
use crate::capabilities::{Checker, Collector, LockToken, Locker, Persister};

/// Managed resource name; also the status record key
pub const RESOURCE_NAME: &str = "ipam";

/// Everything an [`IpamResource`] is built from
pub struct IpamConfig {
    /// Decides whether a block is still needed
    pub checker: Arc<dyn Checker>,
    /// Lists used blocks
    pub collector: Arc<dyn Collector>,
    /// Serializes allocations across replicas
    pub locker: Arc<dyn Locker>,
    /// Writes the chosen block
    pub persister: Arc<dyn Persister>,
    /// Pool blocks are carved from
    pub network_range: Ipv4Network,
    /// Default block prefix
    pub allocated_mask_bits: u8,
    /// Lock key; one per installation
    pub lock_key: String,
}

/// What the allocator wants for a descriptor
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Allocation {
    /// A block of this prefix must exist
    Required {
        /// Block prefix length
        mask_bits: u8,
    },
    /// Nothing to allocate (descriptor going away)
    NotRequired,
}

/// Allocates one block per descriptor
pub struct IpamResource {
    checker: Arc<dyn Checker>,
    collector: Arc<dyn Collector>,
    locker: Arc<dyn Locker>,
    persister: Arc<dyn Persister>,
    network_range: Ipv4Network,
    allocated_mask_bits: u8,
    lock_key: String,
}

impl IpamResource {
    /// Validate the configuration and build the resource
    pub fn new(config: IpamConfig) -> Result<Self> {
        if config.network_range.prefix() == 0 {
            return Err(cirrus_common::Error::validation(
                "IPAM network range must not be empty",
            ));
        }
        validate_mask_bits(config.allocated_mask_bits, &config.network_range)?;
        if config.lock_key.is_empty() {
            return Err(cirrus_common::Error::validation("IPAM lock key must not be empty"));
        }

        Ok(Self {
            checker: config.checker,
            collector: config.collector,
            locker: config.locker,
            persister: config.persister,
            network_range: config.network_range,
            allocated_mask_bits: config.allocated_mask_bits,
            lock_key: config.lock_key,
        })
    }

    async fn allocate_locked(
        &self,
        cluster: &CirrusCluster,
        mask_bits: u8,
    ) -> Result<Applied<CirrusCluster>> {
        // The descriptor this pass holds may predate an allocation made by
        // another replica; the checker reads it fresh.
        if let Some(existing) = self.checker.existing(cluster).await? {
            info!(cluster = %cluster.name_any(), cidr = %existing.cidr, "block already allocated");
            return Ok(Applied {
                updated: None,
                outcome: Outcome::CancelPass,
            });
        }

        let mut used = self.collector.collect().await?;
        used.extend(self.checker.reserved().await?);

        let block = first_fit(&self.network_range, &used, mask_bits)?;
        let layout = split(&block)?;
        let updated = self.persister.persist(cluster, &layout).await?;

        info!(
            cluster = %cluster.name_any(),
            cidr = %layout.cidr,
            overlay = %layout.overlay_cidr,
            masters = %layout.master_subnet_cidr,
            workers = %layout.worker_subnet_cidr,
            "allocated block"
        );
        Ok(Applied::wrote(updated))
    }
}

#[async_trait]
impl ManagedResource<CirrusCluster> for IpamResource {
    type Observed = Option<AllocatedNetwork>;
    type Desired = Allocation;
    type Payload = u8;

    fn name(&self) -> &str {
        RESOURCE_NAME
    }

    async fn observe(&self, cluster: &CirrusCluster) -> Result<Option<AllocatedNetwork>> {
        Ok(cluster.allocated_network().cloned())
    }

    async fn desire(&self, cluster: &CirrusCluster) -> Result<Desired<Allocation>> {
        if cluster.is_deleting() {
            return Ok(Desired::proceed(Allocation::NotRequired));
        }
        let mask_bits = cluster
            .spec
            .network
            .mask_bits
            .unwrap_or(self.allocated_mask_bits);
        validate_mask_bits(mask_bits, &self.network_range)?;
        Ok(Desired::proceed(Allocation::Required { mask_bits }))
    }

    fn diff(&self, observed: &Option<AllocatedNetwork>, desired: &Allocation) -> ChangeOp<u8> {
        match (observed, desired) {
            // Blocks are never re-allocated, even if the requested prefix changed.
            (Some(_), _) => ChangeOp::None,
            (None, Allocation::Required { mask_bits }) => ChangeOp::Create(*mask_bits),
            // Released implicitly: the collector stops seeing it once the
            // descriptor is gone.
            (None, Allocation::NotRequired) => ChangeOp::None,
        }
    }

    #[instrument(skip(self, cluster, op), fields(cluster = %cluster.name_any()))]
    async fn apply(&self, cluster: &CirrusCluster, op: ChangeOp<u8>) -> Result<Applied<CirrusCluster>> {
        let ChangeOp::Create(mask_bits) = op else {
            return Ok(Applied::done());
        };

        let token = self.locker.lock(&self.lock_key).await?;
        let result = self.allocate_locked(cluster, mask_bits).await;
        if let Err(e) = self.locker.unlock(&self.lock_key, &token).await {
            warn!(lock = %self.lock_key, error = %e, "failed to release allocator lock");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{MockChecker, MockCollector, MockLocker, MockPersister};
    use cirrus_common::crd::{CirrusClusterSpec, CirrusClusterStatus, DiskSizes, NodePoolSpec};
    use cirrus_common::Error;
    use cirrus_reconcile::Reconcilable;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tokio::sync::Semaphore;

    fn net(s: &str) -> Ipv4Network {
        s.parse().unwrap()
    }

    fn cluster(name: &str) -> CirrusCluster {
        let pool = NodePoolSpec {
            count: 3,
            vm_size: "Standard_D4s_v3".to_string(),
            disks: DiskSizes::default(),
        };
        let mut cluster = CirrusCluster::new(
            name,
            CirrusClusterSpec {
                cluster_id: name.to_string(),
                template_version: "13.0.0".to_string(),
                masters: pool.clone(),
                workers: pool,
                network: Default::default(),
                upgrade_strategy: Default::default(),
            },
        );
        cluster.metadata.namespace = Some("default".to_string());
        cluster.metadata.resource_version = Some("1".to_string());
        cluster
    }

    /// In-memory descriptor registry shared by the fake capabilities
    #[derive(Default)]
    struct Registry {
        networks: Mutex<HashMap<String, AllocatedNetwork>>,
    }

    #[async_trait]
    impl Checker for Registry {
        async fn existing(&self, cluster: &CirrusCluster) -> Result<Option<AllocatedNetwork>> {
            Ok(self.networks.lock().unwrap().get(&cluster.name_any()).cloned())
        }
        async fn reserved(&self) -> Result<Vec<Ipv4Network>> {
            Ok(vec![])
        }
    }

    #[async_trait]
    impl Collector for Registry {
        async fn collect(&self) -> Result<Vec<Ipv4Network>> {
            let blocks: Result<Vec<Ipv4Network>> =
                self.networks.lock().unwrap().values().map(|n| n.block()).collect();
            // Widen the window between read and write so unguarded
            // allocations would collide.
            tokio::task::yield_now().await;
            blocks
        }
    }

    #[async_trait]
    impl Persister for Registry {
        async fn persist(
            &self,
            cluster: &CirrusCluster,
            network: &AllocatedNetwork,
        ) -> Result<CirrusCluster> {
            self.networks
                .lock()
                .unwrap()
                .insert(cluster.name_any(), network.clone());
            let mut updated = cluster.clone();
            updated.status = Some(CirrusClusterStatus {
                network: Some(network.clone()),
                ..Default::default()
            });
            Ok(updated)
        }
    }

    /// In-process lock standing in for the Lease lock
    struct MemoryLocker {
        permits: Semaphore,
    }

    impl MemoryLocker {
        fn new() -> Self {
            Self {
                permits: Semaphore::new(1),
            }
        }
    }

    #[async_trait]
    impl Locker for MemoryLocker {
        async fn lock(&self, _key: &str) -> Result<LockToken> {
            self.permits
                .acquire()
                .await
                .map_err(|e| Error::internal(e.to_string()))?
                .forget();
            Ok(LockToken::default())
        }
        async fn unlock(&self, _key: &str, _token: &LockToken) -> Result<()> {
            self.permits.add_permits(1);
            Ok(())
        }
    }

    fn resource_over(
        registry: Arc<Registry>,
        locker: Arc<dyn Locker>,
        range: &str,
        mask_bits: u8,
    ) -> IpamResource {
        IpamResource::new(IpamConfig {
            checker: registry.clone(),
            collector: registry.clone(),
            locker,
            persister: registry,
            network_range: net(range),
            allocated_mask_bits: mask_bits,
            lock_key: "test".to_string(),
        })
        .unwrap()
    }

    /// Story: two clusters in an empty 10.0.0.0/16 pool with /24 blocks get
    /// 10.0.0.0/24 and 10.0.1.0/24
    #[tokio::test]
    async fn story_sequential_allocations_are_first_fit() {
        let registry = Arc::new(Registry::default());
        let resource = resource_over(
            registry.clone(),
            Arc::new(MemoryLocker::new()),
            "10.0.0.0/16",
            24,
        );

        let first = resource.reconcile_once(&cluster("a")).await.unwrap();
        let second = resource.reconcile_once(&cluster("b")).await.unwrap();

        let first_net = first.updated.unwrap().allocated_network().cloned().unwrap();
        let second_net = second.updated.unwrap().allocated_network().cloned().unwrap();
        assert_eq!(first_net.cidr, "10.0.0.0/24");
        assert_eq!(second_net.cidr, "10.0.1.0/24");
        assert_eq!(first_net.overlay_cidr, "10.0.0.0/25");
        assert_eq!(second_net.master_subnet_cidr, "10.0.1.128/26");
        assert_eq!(second_net.worker_subnet_cidr, "10.0.1.192/26");
    }

    /// Story: many clusters allocating at once under the lock never share a block
    #[tokio::test]
    async fn story_concurrent_allocations_never_overlap() {
        let registry = Arc::new(Registry::default());
        let locker: Arc<dyn Locker> = Arc::new(MemoryLocker::new());
        let resource = Arc::new(resource_over(registry.clone(), locker, "10.0.0.0/16", 24));

        let passes = (0..16).map(|i| {
            let resource = resource.clone();
            async move { resource.reconcile_once(&cluster(&format!("c{}", i))).await }
        });
        for result in futures::future::join_all(passes).await {
            result.unwrap();
        }

        let blocks: Vec<Ipv4Network> = registry
            .networks
            .lock()
            .unwrap()
            .values()
            .map(|n| n.block().unwrap())
            .collect();
        assert_eq!(blocks.len(), 16);
        for (i, a) in blocks.iter().enumerate() {
            for b in &blocks[i + 1..] {
                assert!(!crate::allocator::overlaps(a, b), "{} overlaps {}", a, b);
            }
        }
    }

    /// Story: a descriptor that already holds a block is left alone
    #[tokio::test]
    async fn story_allocated_descriptor_is_not_reallocated() {
        let mut locker = MockLocker::new();
        locker.expect_lock().never();
        let resource = IpamResource::new(IpamConfig {
            checker: Arc::new(MockChecker::new()),
            collector: Arc::new(MockCollector::new()),
            locker: Arc::new(locker),
            persister: Arc::new(MockPersister::new()),
            network_range: net("10.0.0.0/16"),
            allocated_mask_bits: 24,
            lock_key: "test".to_string(),
        })
        .unwrap();

        let mut allocated = cluster("a");
        allocated.status = Some(CirrusClusterStatus {
            network: Some(split(&net("10.0.7.0/24")).unwrap()),
            ..Default::default()
        });

        let applied = resource.reconcile_once(&allocated).await.unwrap();
        assert!(applied.updated.is_none());
        assert_eq!(applied.outcome, Outcome::Continue);
    }

    /// Story: another replica allocated between our read and our lock; the
    /// pass stops instead of allocating twice
    #[tokio::test]
    async fn story_allocation_found_under_lock_cancels_pass() {
        let mut checker = MockChecker::new();
        checker
            .expect_existing()
            .returning(|_| Ok(Some(split(&"10.0.3.0/24".parse().unwrap()).unwrap())));
        let mut collector = MockCollector::new();
        collector.expect_collect().never();
        let mut persister = MockPersister::new();
        persister.expect_persist().never();
        let mut locker = MockLocker::new();
        locker
            .expect_lock()
            .times(1)
            .returning(|_| Ok(LockToken::default()));
        locker.expect_unlock().times(1).returning(|_, _| Ok(()));

        let resource = IpamResource::new(IpamConfig {
            checker: Arc::new(checker),
            collector: Arc::new(collector),
            locker: Arc::new(locker),
            persister: Arc::new(persister),
            network_range: net("10.0.0.0/16"),
            allocated_mask_bits: 24,
            lock_key: "test".to_string(),
        })
        .unwrap();

        let applied = resource.reconcile_once(&cluster("a")).await.unwrap();
        assert_eq!(applied.outcome, Outcome::CancelPass);
    }

    /// Story: the lock is released even when the pool is exhausted
    #[tokio::test]
    async fn story_exhausted_pool_releases_lock() {
        let mut checker = MockChecker::new();
        checker.expect_existing().returning(|_| Ok(None));
        checker.expect_reserved().returning(|| Ok(vec![]));
        let mut collector = MockCollector::new();
        collector
            .expect_collect()
            .returning(|| Ok(vec!["10.0.0.0/24".parse().unwrap(), "10.0.1.0/24".parse().unwrap()]));
        let mut locker = MockLocker::new();
        locker
            .expect_lock()
            .returning(|_| Ok(LockToken::default()));
        locker.expect_unlock().times(1).returning(|_, _| Ok(()));

        let resource = IpamResource::new(IpamConfig {
            checker: Arc::new(checker),
            collector: Arc::new(collector),
            locker: Arc::new(locker),
            persister: Arc::new(MockPersister::new()),
            network_range: net("10.0.0.0/23"),
            allocated_mask_bits: 24,
            lock_key: "test".to_string(),
        })
        .unwrap();

        let err = resource.reconcile_once(&cluster("c")).await.unwrap_err();
        assert!(matches!(err, Error::CapacityExhausted { .. }));
    }

    /// Story: reserved ranges are skipped like used blocks
    #[tokio::test]
    async fn story_reserved_ranges_are_skipped() {
        let mut checker = MockChecker::new();
        checker.expect_existing().returning(|_| Ok(None));
        checker
            .expect_reserved()
            .returning(|| Ok(vec!["10.0.0.0/22".parse().unwrap()]));
        let mut collector = MockCollector::new();
        collector.expect_collect().returning(|| Ok(vec![]));
        let mut persister = MockPersister::new();
        persister
            .expect_persist()
            .withf(|_, network| network.cidr == "10.0.4.0/24")
            .returning(|cluster, _| Ok(cluster.clone()));
        let mut locker = MockLocker::new();
        locker
            .expect_lock()
            .returning(|_| Ok(LockToken::default()));
        locker.expect_unlock().returning(|_, _| Ok(()));

        let resource = IpamResource::new(IpamConfig {
            checker: Arc::new(checker),
            collector: Arc::new(collector),
            locker: Arc::new(locker),
            persister: Arc::new(persister),
            network_range: net("10.0.0.0/16"),
            allocated_mask_bits: 24,
            lock_key: "test".to_string(),
        })
        .unwrap();

        resource.reconcile_once(&cluster("a")).await.unwrap();
    }

    /// Story: a lock timeout surfaces as a retryable error and nothing is
    /// written
    #[tokio::test]
    async fn story_lock_timeout_is_transient() {
        let mut locker = MockLocker::new();
        locker.expect_lock().returning(|key| {
            Err(Error::LockTimeout {
                lock: key.to_string(),
                waited_secs: 30,
            })
        });
        locker.expect_unlock().never();
        let mut persister = MockPersister::new();
        persister.expect_persist().never();

        let resource = IpamResource::new(IpamConfig {
            checker: Arc::new(MockChecker::new()),
            collector: Arc::new(MockCollector::new()),
            locker: Arc::new(locker),
            persister: Arc::new(persister),
            network_range: net("10.0.0.0/16"),
            allocated_mask_bits: 24,
            lock_key: "test".to_string(),
        })
        .unwrap();

        let err = resource.reconcile_once(&cluster("a")).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn config_rejects_mask_bits_below_minimum() {
        let result = IpamResource::new(IpamConfig {
            checker: Arc::new(MockChecker::new()),
            collector: Arc::new(MockCollector::new()),
            locker: Arc::new(MockLocker::new()),
            persister: Arc::new(MockPersister::new()),
            network_range: net("10.0.0.0/8"),
            allocated_mask_bits: 12,
            lock_key: "test".to_string(),
        });
        assert!(result.is_err());
    }

    #[test]
    fn config_rejects_empty_range() {
        let result = IpamResource::new(IpamConfig {
            checker: Arc::new(MockChecker::new()),
            collector: Arc::new(MockCollector::new()),
            locker: Arc::new(MockLocker::new()),
            persister: Arc::new(MockPersister::new()),
            network_range: net("0.0.0.0/0"),
            allocated_mask_bits: 16,
            lock_key: "test".to_string(),
        });
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn per_cluster_mask_bits_override_default() {
        let registry = Arc::new(Registry::default());
        let resource = resource_over(registry, Arc::new(MemoryLocker::new()), "10.0.0.0/8", 16);

        let mut wide = cluster("wide");
        wide.spec.network.mask_bits = Some(20);
        let applied = resource.reconcile_once(&wide).await.unwrap();
        let network = applied.updated.unwrap().allocated_network().cloned().unwrap();
        assert_eq!(network.cidr, "10.0.0.0/20");
    }
}
