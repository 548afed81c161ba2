//! Deployment submission and drift detection

use kube::ResourceExt;
use tracing::{debug, info, warn};

use cirrus_common::crd::ResourceStatus;
use cirrus_common::Result;
use cirrus_reconcile::Transition;

use crate::checksum::{payload_checksums, PARAMETERS_CHECKSUM, TEMPLATE_CHECKSUM};
use crate::orchestrator::{GroupRef, InstanceGroupOrchestrator};
use crate::state::UpgradeState;

/// Uninitialized: render, submit and remember what was submitted
pub async fn deploy(
    orch: &InstanceGroupOrchestrator,
    group: &GroupRef<'_>,
) -> Result<Transition<UpgradeState>> {
    let payload = orch.cloud_config.render(group.cluster, group.role).await?;
    let checksums = payload_checksums(&payload)?;

    orch.compute
        .create_or_update_deployment(&group.resource_group, &group.deployment, &payload)
        .await?;
    info!(
        cluster = %group.cluster.name_any(),
        deployment = %group.deployment,
        "deployment submitted"
    );

    Ok(Transition::to(UpgradeState::DeploymentInProgress).with_checksums(checksums))
}

/// DeploymentInProgress: wait for the provider to finish
pub async fn await_deployment(
    orch: &InstanceGroupOrchestrator,
    group: &GroupRef<'_>,
) -> Result<Transition<UpgradeState>> {
    let current = UpgradeState::DeploymentInProgress;
    let Some(deployment) = orch
        .compute
        .get_deployment(&group.resource_group, &group.deployment)
        .await?
    else {
        debug!(deployment = %group.deployment, "deployment not found, waiting for creation");
        return Ok(Transition::stay(current));
    };

    debug!(
        deployment = %group.deployment,
        provisioning_state = %deployment.provisioning_state,
        "deployment state"
    );
    if deployment.is_succeeded() {
        Ok(Transition::to(UpgradeState::DeploymentCompletedCheck))
    } else if deployment.is_final() {
        warn!(
            cluster = %group.cluster.name_any(),
            deployment = %group.deployment,
            provisioning_state = %deployment.provisioning_state,
            "deployment failed, starting over"
        );
        Ok(Transition::restart())
    } else {
        Ok(Transition::stay(current))
    }
}

/// DeploymentCompletedCheck and DeploymentCompleted: compare the live
/// deployment against what the spec renders to now
pub async fn check_completed(
    orch: &InstanceGroupOrchestrator,
    group: &GroupRef<'_>,
    current: UpgradeState,
    record: &ResourceStatus,
) -> Result<Transition<UpgradeState>> {
    let Some(deployment) = orch
        .compute
        .get_deployment(&group.resource_group, &group.deployment)
        .await?
    else {
        debug!(deployment = %group.deployment, "deployment not found, waiting for creation");
        return Ok(Transition::stay(current));
    };

    if deployment.is_succeeded() {
        let payload = orch.cloud_config.render(group.cluster, group.role).await?;
        let desired = payload_checksums(&payload)?;

        let unchanged = [TEMPLATE_CHECKSUM, PARAMETERS_CHECKSUM]
            .iter()
            .all(|key| record.checksum(key) == desired.get(*key).map(String::as_str));
        if !unchanged {
            info!(
                cluster = %group.cluster.name_any(),
                resource = %group.role,
                "template or parameters changed"
            );
            return Ok(Transition::restart());
        }

        debug!(resource = %group.role, "template and parameters unchanged");
        return Ok(match current {
            UpgradeState::DeploymentCompletedCheck => {
                Transition::to(UpgradeState::ProvisioningSuccessful)
            }
            _ => Transition::stay(current),
        });
    }

    if deployment.is_final() {
        warn!(
            cluster = %group.cluster.name_any(),
            deployment = %group.deployment,
            provisioning_state = %deployment.provisioning_state,
            "deployment failed, starting over"
        );
        return Ok(Transition::restart());
    }

    warn!(
        cluster = %group.cluster.name_any(),
        deployment = %group.deployment,
        provisioning_state = %deployment.provisioning_state,
        "deployment in unexpected state, starting over"
    );
    Ok(Transition::restart())
}
