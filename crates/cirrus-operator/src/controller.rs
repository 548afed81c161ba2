//! CirrusCluster controller
//!
//! Each reconcile is one engine pass over the descriptor: the allocator
//! first, then the master and worker instance groups. Deletion runs the same
//! engine in reverse and lifts the teardown finalizer once nothing asks to
//! keep it.

use std::sync::Arc;
use std::time::Duration;

use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use cirrus_common::crd::{CirrusCluster, NodeRole, TEARDOWN_FINALIZER};
use cirrus_common::store::{DescriptorStore, KubeDescriptorStore};
use cirrus_common::{Error, OperatorConfig, Result};
use cirrus_instance::{
    orchestrated_group, ArmComputeClient, CloudConfig, ComputeClient, KubeNodeClient, NodeClient,
    ScaleSetTemplate,
};
use cirrus_ipam::{
    IpamConfig, IpamResource, LeaseLocker, StoreChecker, StoreCollector, StorePersister,
};
use cirrus_reconcile::{DescriptorRecordStore, Engine, PassReport};

/// Requeue delay after the finalizer was added
const FINALIZER_REQUEUE: Duration = Duration::from_secs(1);
/// Requeue delay while teardown is still in progress
const TEARDOWN_REQUEUE: Duration = Duration::from_secs(15);

/// Shared context for the CirrusCluster controller
///
/// Use [`ContextBuilder`] to construct instances:
///
/// ```text
/// let ctx = Context::builder(client, config).build()?;
/// ```
pub struct Context {
    /// Descriptor persistence (trait object for testability)
    pub store: Arc<dyn DescriptorStore>,
    /// Engine running the allocator and both instance groups
    pub engine: Engine<CirrusCluster>,
    /// Requeue delay after a pass; status writes trigger earlier passes
    pub pass_interval: Duration,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client, config: OperatorConfig) -> ContextBuilder {
        ContextBuilder::new(client, config)
    }

    /// Create a context for testing with a custom store and engine
    #[cfg(test)]
    pub fn for_testing(
        store: Arc<dyn DescriptorStore>,
        engine: Engine<CirrusCluster>,
        pass_interval: Duration,
    ) -> Self {
        Self {
            store,
            engine,
            pass_interval,
        }
    }
}

/// Builder for constructing [`Context`] instances
pub struct ContextBuilder {
    client: Client,
    config: OperatorConfig,
    store: Option<Arc<dyn DescriptorStore>>,
    compute: Option<Arc<dyn ComputeClient>>,
    nodes: Option<Arc<dyn NodeClient>>,
    cloud_config: Option<Arc<dyn CloudConfig>>,
}

impl ContextBuilder {
    fn new(client: Client, config: OperatorConfig) -> Self {
        Self {
            client,
            config,
            store: None,
            compute: None,
            nodes: None,
            cloud_config: None,
        }
    }

    /// Override the descriptor store
    pub fn store(mut self, store: Arc<dyn DescriptorStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Override the provider client
    pub fn compute(mut self, compute: Arc<dyn ComputeClient>) -> Self {
        self.compute = Some(compute);
        self
    }

    /// Override the tenant node client
    pub fn nodes(mut self, nodes: Arc<dyn NodeClient>) -> Self {
        self.nodes = Some(nodes);
        self
    }

    /// Override the deployment payload renderer
    pub fn cloud_config(mut self, cloud_config: Arc<dyn CloudConfig>) -> Self {
        self.cloud_config = Some(cloud_config);
        self
    }

    /// Build the Context
    ///
    /// Fails if the provider client or the allocator configuration is invalid.
    pub fn build(self) -> Result<Context> {
        let config = self.config;
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(KubeDescriptorStore::new(self.client.clone())));
        let compute: Arc<dyn ComputeClient> = match self.compute {
            Some(compute) => compute,
            None => Arc::new(ArmComputeClient::new(
                &config.arm_endpoint,
                &config.subscription_id,
                &config.access_token,
            )?),
        };
        let nodes = self
            .nodes
            .unwrap_or_else(|| Arc::new(KubeNodeClient::new(self.client.clone())));
        let cloud_config = self
            .cloud_config
            .unwrap_or_else(|| Arc::new(ScaleSetTemplate));

        let ipam = IpamResource::new(IpamConfig {
            checker: Arc::new(StoreChecker::new(
                store.clone(),
                config.ipam_reserved_ranges.clone(),
            )),
            collector: Arc::new(StoreCollector::new(store.clone())),
            locker: Arc::new(LeaseLocker::new(
                self.client.clone(),
                &config.namespace,
                &config.identity,
                config.lock_timeout(),
            )),
            persister: Arc::new(StorePersister::new(store.clone())),
            network_range: config.ipam_network_range,
            allocated_mask_bits: config.allocated_mask_bits,
            lock_key: config.installation_name.clone(),
        })?;

        let records = Arc::new(DescriptorRecordStore::new(store.clone()));
        let engine = Engine::new(config.retry())
            .with_resource(ipam)
            .with_resource(orchestrated_group(
                NodeRole::Master,
                compute.clone(),
                nodes.clone(),
                cloud_config.clone(),
                records.clone(),
            ))
            .with_resource(orchestrated_group(
                NodeRole::Worker,
                compute,
                nodes,
                cloud_config,
                records,
            ));

        info!(resources = ?engine.resource_names(), "engine ready");
        Ok(Context {
            store,
            engine,
            pass_interval: config.pass_interval(),
        })
    }
}

/// Reconcile a CirrusCluster: run one engine pass
///
/// Passes are requeued after `pass_interval`, but the status writes of a
/// pass are watch events of their own, so a cluster mid-upgrade is passed
/// again as soon as its record changes. Every state step tolerates being
/// re-run.
#[instrument(skip(cluster, ctx), fields(cluster = %cluster.name_any()))]
pub async fn reconcile(cluster: Arc<CirrusCluster>, ctx: Arc<Context>) -> Result<Action> {
    if cluster.is_deleting() {
        return handle_deletion(&cluster, &ctx).await;
    }

    if !cluster.has_teardown_finalizer() {
        info!("adding teardown finalizer");
        ctx.store.add_finalizer(&cluster, TEARDOWN_FINALIZER).await?;
        return Ok(Action::requeue(FINALIZER_REQUEUE));
    }

    if let Err(e) = cluster.spec.validate() {
        warn!(error = %e, "cluster validation failed");
        ctx.store
            .patch_summary(&cluster, cluster.metadata.generation, Some(e.to_string()))
            .await?;
        // Invalid specs only change with an edit
        return Ok(Action::await_change());
    }

    let report = ctx.engine.run(cluster.as_ref().clone()).await?;
    ctx.store
        .patch_summary(
            &report.descriptor,
            cluster.metadata.generation,
            summary_message(&report),
        )
        .await?;

    debug!(
        completed = ?report.completed,
        cancelled_by = ?report.cancelled_by,
        "pass finished"
    );
    Ok(Action::requeue(ctx.pass_interval))
}

async fn handle_deletion(cluster: &CirrusCluster, ctx: &Context) -> Result<Action> {
    if !cluster.has_teardown_finalizer() {
        return Ok(Action::await_change());
    }

    let report = ctx.engine.run_deletion(cluster.clone()).await?;
    if report.keep_finalizer {
        info!(
            waiting_on = ?report.cancelled_by,
            "teardown in progress, keeping finalizer"
        );
        return Ok(Action::requeue(TEARDOWN_REQUEUE));
    }

    info!("teardown complete, removing finalizer");
    ctx.store
        .remove_finalizer(cluster, TEARDOWN_FINALIZER)
        .await?;
    Ok(Action::await_change())
}

fn summary_message(report: &PassReport<CirrusCluster>) -> Option<String> {
    report
        .cancelled_by
        .as_ref()
        .map(|resource| format!("pass stopped at {}", resource))
}

/// Error policy for the controller
///
/// Conflicts come back quickly so the next pass re-reads the descriptor;
/// everything else waits a little longer.
pub fn error_policy(cluster: Arc<CirrusCluster>, error: &Error, _ctx: Arc<Context>) -> Action {
    if matches!(error, Error::Conflict { .. }) {
        debug!(cluster = %cluster.name_any(), "descriptor changed during pass, re-reading");
        return Action::requeue(Duration::from_secs(1));
    }

    error!(
        ?error,
        cluster = %cluster.name_any(),
        "reconciliation failed"
    );
    Action::requeue(Duration::from_secs(5))
}
