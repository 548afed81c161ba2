//! Upgrade states of an instance group

use cirrus_reconcile::StateTag;

/// Persisted state of one role's instance group
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum UpgradeState {
    /// Nothing deployed yet, or a restart after drift or failure
    Uninitialized,
    /// Deployment submitted, waiting for the provider to finish
    DeploymentInProgress,
    /// Deployment finished; verify it matches what was submitted
    DeploymentCompletedCheck,
    /// Deployment verified; decide whether instances need replacing
    ProvisioningSuccessful,
    /// Growing the group one instance per pass up to twice its size
    ScaleUpInstances,
    /// Marking nodes on the previous model unschedulable
    CordonOldInstances,
    /// Waiting for nodes on the latest model to become Ready
    WaitNewInstancesReady,
    /// Shrinking back to the desired size, removing old instances
    ScaleDownInstances,
    /// Converged; watch for drift
    DeploymentCompleted,
    /// Legacy path: decide whether the legacy group must be migrated
    CheckMigrationNeeded,
    /// Legacy path: parked until an operator confirms a backup
    WaitBackupConfirmation,
    /// Legacy path: stop the legacy instances
    DeallocateLegacyInstance,
    /// Legacy path: grow data volumes, one instance per pass
    ResizeDisks,
    /// Legacy path: restart node agents once the tenant API is up
    RestartAgents,
}

use UpgradeState::*;

const ALL: &[UpgradeState] = &[
    Uninitialized,
    DeploymentInProgress,
    DeploymentCompletedCheck,
    ProvisioningSuccessful,
    ScaleUpInstances,
    CordonOldInstances,
    WaitNewInstancesReady,
    ScaleDownInstances,
    DeploymentCompleted,
    CheckMigrationNeeded,
    WaitBackupConfirmation,
    DeallocateLegacyInstance,
    ResizeDisks,
    RestartAgents,
];

impl StateTag for UpgradeState {
    fn all() -> &'static [Self] {
        ALL
    }

    fn initial() -> Self {
        Uninitialized
    }

    fn as_str(&self) -> &'static str {
        match self {
            Uninitialized => "Uninitialized",
            DeploymentInProgress => "DeploymentInProgress",
            DeploymentCompletedCheck => "DeploymentCompletedCheck",
            ProvisioningSuccessful => "ProvisioningSuccessful",
            ScaleUpInstances => "ScaleUpInstances",
            CordonOldInstances => "CordonOldInstances",
            WaitNewInstancesReady => "WaitNewInstancesReady",
            ScaleDownInstances => "ScaleDownInstances",
            DeploymentCompleted => "DeploymentCompleted",
            CheckMigrationNeeded => "CheckMigrationNeeded",
            WaitBackupConfirmation => "WaitBackupConfirmation",
            DeallocateLegacyInstance => "DeallocateLegacyInstance",
            ResizeDisks => "ResizeDisks",
            RestartAgents => "RestartAgents",
        }
    }

    fn successors(&self) -> &'static [Self] {
        match self {
            Uninitialized => &[DeploymentInProgress],
            DeploymentInProgress => &[DeploymentCompletedCheck],
            DeploymentCompletedCheck => &[ProvisioningSuccessful],
            ProvisioningSuccessful => &[ScaleUpInstances, CheckMigrationNeeded, DeploymentCompleted],
            ScaleUpInstances => &[CordonOldInstances],
            CordonOldInstances => &[WaitNewInstancesReady],
            WaitNewInstancesReady => &[ScaleDownInstances],
            ScaleDownInstances => &[DeploymentCompleted],
            DeploymentCompleted => &[],
            CheckMigrationNeeded => &[WaitBackupConfirmation, ResizeDisks],
            // Left only by an operator editing the tag
            WaitBackupConfirmation => &[DeallocateLegacyInstance],
            DeallocateLegacyInstance => &[ResizeDisks],
            ResizeDisks => &[RestartAgents],
            RestartAgents => &[DeploymentCompleted],
        }
    }
}
