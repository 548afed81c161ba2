//! Rolling instance replacement
//!
//! The group is grown to twice its size one instance per pass, so every old
//! instance has a new counterpart before anything is drained. The provider
//! removes the oldest instances when the group shrinks back.

use kube::ResourceExt;
use tracing::{debug, info, warn};

use cirrus_common::crd::{ResourceStatus, UpgradeStrategy};
use cirrus_common::Result;
use cirrus_reconcile::Transition;

use super::{list_instances_safely, with_nodes};
use crate::checksum::{payload_checksums, TEMPLATE_CHECKSUM};
use crate::orchestrator::{GroupRef, InstanceGroupOrchestrator};
use crate::session::{UpgradeSession, WorkingSet};
use crate::state::UpgradeState;

/// ProvisioningSuccessful: decide whether instances need replacing
pub async fn check_upgrade_required(
    orch: &InstanceGroupOrchestrator,
    group: &GroupRef<'_>,
    record: &ResourceStatus,
) -> Result<Transition<UpgradeState>> {
    let current = UpgradeState::ProvisioningSuccessful;
    if group.cluster.spec.upgrade_strategy == UpgradeStrategy::LegacyInPlace {
        return Ok(Transition::to(UpgradeState::CheckMigrationNeeded));
    }

    let Some(instance_group) = orch
        .compute
        .get_instance_group(&group.resource_group, &group.name)
        .await?
    else {
        warn!(
            cluster = %group.cluster.name_any(),
            group = %group.name,
            "instance group missing after successful deployment, starting over"
        );
        return Ok(Transition::restart());
    };

    let Some(instances) = list_instances_safely(orch, group, &group.name).await? else {
        return Ok(Transition::stay(current).cancel_pass());
    };

    let payload = orch.cloud_config.render(group.cluster, group.role).await?;
    let desired_checksum = payload_checksums(&payload)?
        .remove(TEMPLATE_CHECKSUM)
        .unwrap_or_default();
    let session = UpgradeSession::new(
        desired_checksum,
        record.checksum(TEMPLATE_CHECKSUM).map(str::to_string),
        group.desired_count(),
        instance_group.capacity,
        instances,
    );

    if session.converged() {
        info!(
            cluster = %group.cluster.name_any(),
            group = %group.name,
            "instances up to date"
        );
        return Ok(Transition::to(UpgradeState::DeploymentCompleted));
    }

    debug!(
        group = %group.name,
        desired = session.desired_count,
        capacity = session.current_count,
        wip = session.working_set.is_wip(),
        "instances need replacing"
    );
    Ok(Transition::to(UpgradeState::ScaleUpInstances))
}

/// ScaleUpInstances: add one instance per pass until the group is doubled
pub async fn scale_up(
    orch: &InstanceGroupOrchestrator,
    group: &GroupRef<'_>,
) -> Result<Transition<UpgradeState>> {
    let current = UpgradeState::ScaleUpInstances;

    if let Some(legacy) = orch
        .compute
        .get_instance_group(&group.resource_group, &group.legacy_name)
        .await?
    {
        if legacy.capacity > 0 {
            info!(
                group = %group.legacy_name,
                capacity = legacy.capacity,
                "legacy instance group still has instances, not scaling up"
            );
            return Ok(Transition::stay(current));
        }
    }

    let Some(instance_group) = orch
        .compute
        .get_instance_group(&group.resource_group, &group.name)
        .await?
    else {
        return Ok(Transition::restart());
    };

    let Some(instances) = list_instances_safely(orch, group, &group.name).await? else {
        return Ok(Transition::stay(current).cancel_pass());
    };
    if !instances.iter().all(|i| i.is_running()) {
        debug!(group = %group.name, "not all instances running yet");
        return Ok(Transition::stay(current));
    }

    // Masters take the same path, so a three-member etcd passes through
    // four, five and six members. The old members stay joined until
    // ScaleDownInstances, so quorum is never formed from new members alone.
    // Each new member joins before the next is requested because a pass only
    // grows the group once every instance is running.
    let target = group.desired_count() * 2;
    if instance_group.capacity < target {
        let capacity = instance_group.capacity + 1;
        orch.compute
            .set_capacity(&group.resource_group, &group.name, capacity)
            .await?;
        info!(
            cluster = %group.cluster.name_any(),
            group = %group.name,
            capacity,
            target,
            "scaled up instance group"
        );
        return Ok(Transition::stay(current));
    }

    Ok(Transition::to(UpgradeState::CordonOldInstances))
}

/// CordonOldInstances: stop scheduling onto nodes of the previous model
pub async fn cordon_old(
    orch: &InstanceGroupOrchestrator,
    group: &GroupRef<'_>,
) -> Result<Transition<UpgradeState>> {
    let current = UpgradeState::CordonOldInstances;
    let Some(instances) = list_instances_safely(orch, group, &group.name).await? else {
        return Ok(Transition::stay(current).cancel_pass());
    };

    let outdated: Vec<_> = WorkingSet::partition(&instances).outdated().cloned().collect();
    for (instance, node) in with_nodes(orch, group, outdated).await? {
        match node {
            Some(node) if !node.unschedulable => {
                orch.nodes.cordon(group.cluster, &node.name).await?;
            }
            Some(_) => {}
            None => debug!(instance = %instance.id, "outdated instance has no node"),
        }
    }

    Ok(Transition::to(UpgradeState::WaitNewInstancesReady))
}

/// WaitNewInstancesReady: once enough new nodes are Ready, drain the old ones
pub async fn wait_new_ready(
    orch: &InstanceGroupOrchestrator,
    group: &GroupRef<'_>,
) -> Result<Transition<UpgradeState>> {
    let current = UpgradeState::WaitNewInstancesReady;
    let Some(instances) = list_instances_safely(orch, group, &group.name).await? else {
        return Ok(Transition::stay(current).cancel_pass());
    };

    let paired = with_nodes(orch, group, instances).await?;
    let ready_new = paired
        .iter()
        .filter(|(instance, node)| {
            instance.latest_model && node.as_ref().map(|n| n.ready).unwrap_or(false)
        })
        .count() as u32;

    if ready_new < group.desired_count() {
        debug!(
            group = %group.name,
            ready = ready_new,
            desired = group.desired_count(),
            "waiting for new nodes"
        );
        return Ok(Transition::stay(current));
    }

    for (instance, node) in &paired {
        if instance.latest_model {
            continue;
        }
        if let Some(node) = node {
            orch.nodes.drain(group.cluster, &node.name).await?;
        }
    }

    Ok(Transition::to(UpgradeState::ScaleDownInstances))
}

/// ScaleDownInstances: shrink back to the desired count
pub async fn scale_down(
    orch: &InstanceGroupOrchestrator,
    group: &GroupRef<'_>,
) -> Result<Transition<UpgradeState>> {
    let desired = group.desired_count();
    orch.compute
        .set_capacity(&group.resource_group, &group.name, desired)
        .await?;
    info!(
        cluster = %group.cluster.name_any(),
        group = %group.name,
        capacity = desired,
        "scaled down instance group"
    );
    Ok(Transition::to(UpgradeState::DeploymentCompleted))
}
