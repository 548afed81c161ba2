//! Transition handlers, one module per stretch of the upgrade
//!
//! - [`deployment`]: submit the template and watch it for drift
//! - [`rollout`]: replace instances by doubling, cordoning, draining, shrinking
//! - [`legacy`]: deprecated in-place path for groups predating the rollout

mod deployment;
mod legacy;
mod rollout;

pub use deployment::{await_deployment, check_completed, deploy};
pub use legacy::{
    check_migration, deallocate_legacy, resize_disks, restart_agents, wait_backup_confirmation,
};
pub use rollout::{check_upgrade_required, cordon_old, scale_down, scale_up, wait_new_ready};

use kube::ResourceExt;
use tracing::{debug, info};

use cirrus_common::{Error, Result};

use crate::interfaces::private_ips;
use crate::node::NodeInfo;
use crate::orchestrator::{GroupRef, InstanceGroupOrchestrator};
use crate::provider::Instance;

/// List the instances of `name`, or `None` if listing is rate limited
pub(crate) async fn list_instances_safely(
    orch: &InstanceGroupOrchestrator,
    group: &GroupRef<'_>,
    name: &str,
) -> Result<Option<Vec<Instance>>> {
    match orch.compute.list_instances(&group.resource_group, name).await {
        Ok(instances) => Ok(Some(instances)),
        Err(Error::RateLimited { operation }) => {
            info!(
                cluster = %group.cluster.name_any(),
                group = %name,
                operation = %operation,
                "provider rate limit too close, waiting for next pass"
            );
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// Pair each instance with the tenant node backing it
///
/// Nodes are matched by private address first and by host name as a
/// fallback. Instances whose node has not registered yet get `None`.
pub(crate) async fn with_nodes(
    orch: &InstanceGroupOrchestrator,
    group: &GroupRef<'_>,
    instances: Vec<Instance>,
) -> Result<Vec<(Instance, Option<NodeInfo>)>> {
    let interfaces = orch
        .compute
        .list_network_interfaces(&group.resource_group, &group.name)
        .await?;
    let ips = private_ips(&group.name, &interfaces)?;
    let nodes = orch.nodes.list_nodes(group.cluster).await?;

    Ok(instances
        .into_iter()
        .map(|instance| {
            let ip = ips.get(&instance.id);
            let node = nodes
                .iter()
                .find(|n| ip.is_some() && n.internal_ip.as_ref() == ip)
                .or_else(|| {
                    nodes
                        .iter()
                        .find(|n| n.name.eq_ignore_ascii_case(&instance.computer_name))
                })
                .cloned();
            if node.is_none() {
                debug!(instance = %instance.id, "no node registered for instance yet");
            }
            (instance, node)
        })
        .collect())
}
