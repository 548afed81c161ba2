//! Compute provider seam
//!
//! Everything the orchestrator needs from the cloud, expressed as the few
//! calls it actually makes. Lookups of objects that may not exist yet return
//! `Ok(None)` rather than an error.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[cfg(test)]
use mockall::automock;

use cirrus_common::Result;

/// Provisioning state reported for finished deployments
pub const PROVISIONING_SUCCEEDED: &str = "Succeeded";
/// Provisioning state of a failed deployment
pub const PROVISIONING_FAILED: &str = "Failed";
/// Provisioning state of a cancelled deployment
pub const PROVISIONING_CANCELED: &str = "Canceled";

/// A template deployment as last reported by the provider
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Deployment {
    /// Provider provisioning state (e.g., "Running", "Succeeded")
    pub provisioning_state: String,
}

impl Deployment {
    /// True once the deployment finished successfully
    pub fn is_succeeded(&self) -> bool {
        self.provisioning_state == PROVISIONING_SUCCEEDED
    }

    /// True for states the provider will not leave on its own
    pub fn is_final(&self) -> bool {
        matches!(
            self.provisioning_state.as_str(),
            PROVISIONING_SUCCEEDED | PROVISIONING_FAILED | PROVISIONING_CANCELED
        )
    }
}

/// Template plus parameters submitted as one deployment
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeploymentPayload {
    /// Deployment template
    pub template: serde_json::Value,
    /// Template parameters
    pub parameters: serde_json::Value,
}

/// An instance group (scale set)
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstanceGroup {
    /// Desired number of instances
    pub capacity: u32,
}

/// Power state of an instance
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PowerState {
    /// Running
    Running,
    /// Stopped but still allocated
    Stopped,
    /// Stopped and released
    Deallocated,
    /// Starting, stopping or unreported
    Transitioning,
}

impl PowerState {
    /// Parse a provider status code such as `PowerState/running`
    pub fn from_code(code: &str) -> Self {
        match code.strip_prefix("PowerState/").unwrap_or(code) {
            "running" => Self::Running,
            "stopped" => Self::Stopped,
            "deallocated" => Self::Deallocated,
            _ => Self::Transitioning,
        }
    }
}

/// A data disk attached to an instance
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataDisk {
    /// Attachment slot
    pub lun: u32,
    /// Size in GB
    pub size_gb: u32,
}

/// One instance of a group
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Instance {
    /// Instance id within the group
    pub id: String,
    /// Host name; also the tenant node name
    pub computer_name: String,
    /// Provider provisioning state
    pub provisioning_state: String,
    /// Current power state
    pub power_state: PowerState,
    /// True if the instance runs the group's latest model
    pub latest_model: bool,
    /// Attached data disks
    pub data_disks: Vec<DataDisk>,
}

impl Instance {
    /// Provisioned and running
    pub fn is_running(&self) -> bool {
        self.provisioning_state == PROVISIONING_SUCCEEDED && self.power_state == PowerState::Running
    }

    /// Size of the disk in `lun`, if attached
    pub fn disk_size(&self, lun: u32) -> Option<u32> {
        self.data_disks.iter().find(|d| d.lun == lun).map(|d| d.size_gb)
    }
}

/// IP configuration of a network interface
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IpConfiguration {
    /// Private address, if assigned
    pub private_ip: Option<String>,
}

/// Network interface of one instance
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetworkInterface {
    /// Instance the interface is attached to
    pub instance_id: String,
    /// IP configurations
    pub ip_configurations: Vec<IpConfiguration>,
}

/// Remote compute provider
///
/// Implementations map transport and throttling failures onto
/// [`cirrus_common::Error`]: throttling is `RateLimited`, timeouts and
/// server errors are retryable `Provider` errors.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ComputeClient: Send + Sync {
    /// Read a deployment
    async fn get_deployment(&self, group: &str, name: &str) -> Result<Option<Deployment>>;

    /// Submit a deployment; returns once accepted
    async fn create_or_update_deployment(
        &self,
        group: &str,
        name: &str,
        payload: &DeploymentPayload,
    ) -> Result<()>;

    /// Delete a deployment record; absent is success
    async fn delete_deployment(&self, group: &str, name: &str) -> Result<()>;

    /// Read an instance group
    async fn get_instance_group(&self, group: &str, name: &str) -> Result<Option<InstanceGroup>>;

    /// Set the desired instance count
    async fn set_capacity(&self, group: &str, name: &str, capacity: u32) -> Result<()>;

    /// Delete an instance group; absent is success
    async fn delete_instance_group(&self, group: &str, name: &str) -> Result<()>;

    /// List instances with their runtime view
    ///
    /// Fails with `RateLimited` when the provider's remaining request budget
    /// is too low to safely keep polling.
    async fn list_instances(&self, group: &str, name: &str) -> Result<Vec<Instance>>;

    /// Stop and release an instance; returns once done
    async fn deallocate_instance(&self, group: &str, name: &str, instance_id: &str) -> Result<()>;

    /// Start an instance; returns once running
    async fn start_instance(&self, group: &str, name: &str, instance_id: &str) -> Result<()>;

    /// Run a shell script inside an instance; returns once finished
    async fn run_command(
        &self,
        group: &str,
        name: &str,
        instance_id: &str,
        script: &str,
    ) -> Result<()>;

    /// List the network interfaces of a group's instances
    async fn list_network_interfaces(&self, group: &str, name: &str)
        -> Result<Vec<NetworkInterface>>;
}
