//! Deprecated in-place path
//!
//! Groups created before rolling replacement existed are migrated by
//! stopping the legacy group, growing data volumes one instance at a time
//! and restarting node agents. New clusters never enter this path.

use kube::ResourceExt;
use tracing::{debug, info, warn};

use cirrus_common::{Error, Result};
use cirrus_reconcile::Transition;

use super::list_instances_safely;
use crate::orchestrator::{GroupRef, InstanceGroupOrchestrator};
use crate::provider::{Instance, PowerState};
use crate::state::UpgradeState;

/// In-guest command growing the container runtime volume
pub const GROW_DOCKER_VOLUME: &str = "sudo xfs_growfs /var/lib/docker";
/// In-guest command growing the kubelet volume
pub const GROW_KUBELET_VOLUME: &str = "sudo xfs_growfs /var/lib/kubelet";
/// In-guest command restarting the node agent
pub const RESTART_NODE_AGENT: &str = "sudo systemctl restart k8s-kubelet";

/// CheckMigrationNeeded: a populated legacy group needs a confirmed backup
pub async fn check_migration(
    orch: &InstanceGroupOrchestrator,
    group: &GroupRef<'_>,
) -> Result<Transition<UpgradeState>> {
    let legacy = orch
        .compute
        .get_instance_group(&group.resource_group, &group.legacy_name)
        .await?;
    match legacy {
        Some(legacy) if legacy.capacity > 0 => {
            info!(
                cluster = %group.cluster.name_any(),
                group = %group.legacy_name,
                capacity = legacy.capacity,
                "legacy instance group needs migration"
            );
            Ok(Transition::to(UpgradeState::WaitBackupConfirmation))
        }
        _ => Ok(Transition::to(UpgradeState::ResizeDisks)),
    }
}

/// WaitBackupConfirmation: parked until an operator moves the tag on
pub fn wait_backup_confirmation(group: &GroupRef<'_>) -> Result<Transition<UpgradeState>> {
    warn!(
        cluster = %group.cluster.name_any(),
        resource = %group.role,
        "waiting for backup confirmation; set the state to DeallocateLegacyInstance to continue"
    );
    Ok(Transition::stay(UpgradeState::WaitBackupConfirmation))
}

/// DeallocateLegacyInstance: stop every legacy instance
pub async fn deallocate_legacy(
    orch: &InstanceGroupOrchestrator,
    group: &GroupRef<'_>,
) -> Result<Transition<UpgradeState>> {
    let current = UpgradeState::DeallocateLegacyInstance;
    if orch
        .compute
        .get_instance_group(&group.resource_group, &group.legacy_name)
        .await?
        .is_none()
    {
        return Ok(Transition::to(UpgradeState::ResizeDisks));
    }

    let Some(instances) = list_instances_safely(orch, group, &group.legacy_name).await? else {
        return Ok(Transition::stay(current).cancel_pass());
    };
    let pending: Vec<&Instance> = instances
        .iter()
        .filter(|i| i.power_state != PowerState::Deallocated)
        .collect();
    if pending.is_empty() {
        info!(group = %group.legacy_name, "legacy instances deallocated");
        return Ok(Transition::to(UpgradeState::ResizeDisks));
    }

    for instance in pending {
        info!(group = %group.legacy_name, instance = %instance.id, "deallocating legacy instance");
        orch.compute
            .deallocate_instance(&group.resource_group, &group.legacy_name, &instance.id)
            .await?;
    }
    Ok(Transition::stay(current))
}

/// Grow commands for the volumes of `instance` smaller than the spec,
/// docker first
///
/// Volumes are only ever grown. A missing data-disk slot means the group
/// was not built from our template and cannot be resized in place.
fn grow_commands(group: &GroupRef<'_>, instance: &Instance) -> Result<Vec<&'static str>> {
    let disks = &group.pool().disks;
    let volumes = [
        (group.role.docker_disk_slot(), disks.docker_gb, GROW_DOCKER_VOLUME),
        (group.role.kubelet_disk_slot(), disks.kubelet_gb, GROW_KUBELET_VOLUME),
    ];
    let mut commands = Vec::new();
    for (slot, desired, command) in volumes {
        let Some(size) = instance.disk_size(slot) else {
            return Err(Error::invariant(
                group.role.to_string(),
                format!("instance {} has no data disk in slot {}", instance.id, slot),
            ));
        };
        if size < desired {
            commands.push(command);
        }
    }
    Ok(commands)
}

/// ResizeDisks: bring one instance's volumes to the desired size per pass
pub async fn resize_disks(
    orch: &InstanceGroupOrchestrator,
    group: &GroupRef<'_>,
) -> Result<Transition<UpgradeState>> {
    let current = UpgradeState::ResizeDisks;
    let Some(instances) = list_instances_safely(orch, group, &group.name).await? else {
        return Ok(Transition::stay(current).cancel_pass());
    };

    let mut pending = None;
    for instance in &instances {
        let commands = grow_commands(group, instance)?;
        if !commands.is_empty() {
            pending = Some((instance, commands));
            break;
        }
    }
    let Some((instance, commands)) = pending else {
        debug!(group = %group.name, "all data disks at desired size");
        return Ok(Transition::to(UpgradeState::RestartAgents));
    };

    info!(
        cluster = %group.cluster.name_any(),
        group = %group.name,
        instance = %instance.id,
        volumes = commands.len(),
        "resizing data disks"
    );
    orch.compute
        .deallocate_instance(&group.resource_group, &group.name, &instance.id)
        .await?;
    orch.compute
        .start_instance(&group.resource_group, &group.name, &instance.id)
        .await?;
    for command in commands {
        orch.compute
            .run_command(&group.resource_group, &group.name, &instance.id, command)
            .await?;
    }
    Ok(Transition::stay(current))
}

/// RestartAgents: restart node agents once the tenant API answers
pub async fn restart_agents(
    orch: &InstanceGroupOrchestrator,
    group: &GroupRef<'_>,
) -> Result<Transition<UpgradeState>> {
    let current = UpgradeState::RestartAgents;
    if !orch.nodes.api_available(group.cluster).await? {
        debug!(cluster = %group.cluster.name_any(), "tenant API not up yet, waiting");
        return Ok(Transition::stay(current));
    }

    let Some(instances) = list_instances_safely(orch, group, &group.name).await? else {
        return Ok(Transition::stay(current).cancel_pass());
    };
    for instance in &instances {
        orch.compute
            .run_command(
                &group.resource_group,
                &group.name,
                &instance.id,
                RESTART_NODE_AGENT,
            )
            .await?;
    }
    info!(
        cluster = %group.cluster.name_any(),
        group = %group.name,
        instances = instances.len(),
        "node agents restarted"
    );
    Ok(Transition::to(UpgradeState::DeploymentCompleted))
}
