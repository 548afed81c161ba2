//! [`ComputeClient`] over the Azure Resource Manager REST API
//!
//! Long-running operations (deallocate, start, run-command) are polled to
//! completion within the call, bounded by an operation timeout. Deployments
//! and capacity changes return as soon as ARM accepts them; later passes
//! observe their progress.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tokio::time::Instant;
use tracing::{debug, warn};

use cirrus_common::{Error, Result};

use crate::provider::{
    ComputeClient, DataDisk, Deployment, DeploymentPayload, Instance, InstanceGroup,
    IpConfiguration, NetworkInterface, PowerState,
};

const DEPLOYMENTS_API_VERSION: &str = "2021-04-01";
const COMPUTE_API_VERSION: &str = "2023-03-01";
const INTERFACES_API_VERSION: &str = "2018-10-01";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const OPERATION_TIMEOUT: Duration = Duration::from_secs(600);
const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Remaining-read budget below which instance listing is considered unsafe
pub const DEFAULT_MIN_REMAINING_READS: u32 = 20;

const RATE_LIMIT_HEADER: &str = "x-ms-ratelimit-remaining-resource";

/// ARM-backed compute client
pub struct ArmComputeClient {
    http: reqwest::Client,
    endpoint: String,
    subscription_id: String,
    access_token: String,
    min_remaining_reads: u32,
    operation_timeout: Duration,
    poll_interval: Duration,
}

impl ArmComputeClient {
    /// Create a client for one subscription
    pub fn new(endpoint: &str, subscription_id: &str, access_token: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| {
                Error::internal_with_context("arm", format!("failed to build HTTP client: {}", e))
            })?;

        Ok(Self {
            http,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            subscription_id: subscription_id.to_string(),
            access_token: access_token.to_string(),
            min_remaining_reads: DEFAULT_MIN_REMAINING_READS,
            operation_timeout: OPERATION_TIMEOUT,
            poll_interval: POLL_INTERVAL,
        })
    }

    /// Override the remaining-read floor for instance listing
    pub fn with_min_remaining_reads(mut self, floor: u32) -> Self {
        self.min_remaining_reads = floor;
        self
    }

    fn group_url(&self, group: &str) -> String {
        format!(
            "{}/subscriptions/{}/resourceGroups/{}",
            self.endpoint, self.subscription_id, group
        )
    }

    fn deployment_url(&self, group: &str, name: &str) -> String {
        format!(
            "{}/providers/Microsoft.Resources/deployments/{}?api-version={}",
            self.group_url(group),
            name,
            DEPLOYMENTS_API_VERSION
        )
    }

    fn scale_set_path(&self, group: &str, name: &str) -> String {
        format!(
            "{}/providers/Microsoft.Compute/virtualMachineScaleSets/{}",
            self.group_url(group),
            name
        )
    }

    fn instance_action_url(&self, group: &str, name: &str, instance_id: &str, action: &str) -> String {
        format!(
            "{}/virtualMachines/{}/{}?api-version={}",
            self.scale_set_path(group, name),
            instance_id,
            action,
            COMPUTE_API_VERSION
        )
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        self.http
            .request(method, url)
            .bearer_auth(&self.access_token)
    }

    async fn send(&self, builder: RequestBuilder, resource: &str, operation: &str) -> Result<Response> {
        builder
            .send()
            .await
            .map_err(|e| Error::provider(resource, operation, e.to_string()))
    }

    /// Poll a long-running operation until it finishes
    async fn wait_for(&self, response: Response, resource: &str, operation: &str) -> Result<()> {
        if response.status() != StatusCode::ACCEPTED {
            return Ok(());
        }
        let headers = response.headers();
        let Some(url) = headers
            .get("azure-asyncoperation")
            .or_else(|| headers.get("location"))
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
        else {
            return Ok(());
        };

        let deadline = Instant::now() + self.operation_timeout;
        loop {
            if Instant::now() >= deadline {
                return Err(Error::provider(
                    resource,
                    operation,
                    format!("not finished after {}s", self.operation_timeout.as_secs()),
                ));
            }
            tokio::time::sleep(self.poll_interval).await;

            let poll = self.send(self.request(Method::GET, &url), resource, operation).await?;
            let poll = check(poll, resource, operation).await?;
            if poll.status() == StatusCode::ACCEPTED {
                continue;
            }

            let body = poll
                .text()
                .await
                .map_err(|e| Error::provider(resource, operation, e.to_string()))?;
            let status = serde_json::from_str::<OperationStatus>(&body)
                .ok()
                .and_then(|s| s.status);
            match status.as_deref() {
                None | Some("Succeeded") => return Ok(()),
                Some("Failed") | Some("Canceled") => {
                    return Err(Error::provider_permanent(
                        resource,
                        operation,
                        format!("operation ended {:?}: {}", status, body),
                    ))
                }
                Some(other) => debug!(resource = %resource, operation = %operation, status = %other, "operation still running"),
            }
        }
    }

    async fn instance_action(
        &self,
        group: &str,
        name: &str,
        instance_id: &str,
        action: &str,
        body: Option<serde_json::Value>,
    ) -> Result<()> {
        let url = self.instance_action_url(group, name, instance_id, action);
        let mut builder = self.request(Method::POST, &url);
        builder = match body {
            Some(body) => builder.json(&body),
            None => builder.header(reqwest::header::CONTENT_LENGTH, 0),
        };
        let response = self.send(builder, name, action).await?;
        let response = check(response, name, action).await?;
        self.wait_for(response, name, action).await
    }
}

/// Map a non-success response onto the error taxonomy
async fn check(response: Response, resource: &str, operation: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(Error::rate_limited(operation));
    }
    let message = format!("{}: {}", status, body);
    if status == StatusCode::REQUEST_TIMEOUT || status.is_server_error() {
        Err(Error::provider(resource, operation, message))
    } else {
        Err(Error::provider_permanent(resource, operation, message))
    }
}

/// Smallest remaining count in a rate-limit header such as
/// `Microsoft.Compute/HighCostGetVMScaleSet3Min;107,Microsoft.Compute/HighCostGetVMScaleSet30Min;587`
fn min_remaining(header: &str) -> Option<u32> {
    header
        .split(',')
        .filter_map(|policy| policy.rsplit_once(';'))
        .filter_map(|(_, count)| count.trim().parse::<u32>().ok())
        .min()
}

#[derive(Deserialize)]
struct OperationStatus {
    status: Option<String>,
}

#[derive(Deserialize)]
struct ArmList<T> {
    #[serde(default = "Vec::new")]
    value: Vec<T>,
    #[serde(rename = "nextLink")]
    next_link: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ArmDeployment {
    properties: Option<ArmDeploymentProperties>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ArmDeploymentProperties {
    provisioning_state: Option<String>,
}

#[derive(Deserialize)]
struct ArmScaleSet {
    sku: Option<ArmSku>,
}

#[derive(Deserialize)]
struct ArmSku {
    capacity: Option<u32>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ArmVm {
    instance_id: String,
    #[serde(default)]
    properties: ArmVmProperties,
}

#[derive(Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ArmVmProperties {
    latest_model_applied: Option<bool>,
    provisioning_state: Option<String>,
    os_profile: Option<ArmOsProfile>,
    instance_view: Option<ArmInstanceView>,
    storage_profile: Option<ArmStorageProfile>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ArmOsProfile {
    computer_name: Option<String>,
}

#[derive(Deserialize)]
struct ArmInstanceView {
    #[serde(default)]
    statuses: Vec<ArmStatus>,
}

#[derive(Deserialize)]
struct ArmStatus {
    code: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ArmStorageProfile {
    #[serde(default)]
    data_disks: Vec<ArmDataDisk>,
}

#[derive(Deserialize)]
struct ArmDataDisk {
    lun: u32,
    #[serde(rename = "diskSizeGB")]
    disk_size_gb: Option<u32>,
}

#[derive(Deserialize)]
struct ArmNic {
    properties: ArmNicProperties,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ArmNicProperties {
    virtual_machine: Option<ArmSubResource>,
    #[serde(default)]
    ip_configurations: Vec<ArmIpConfiguration>,
}

#[derive(Deserialize)]
struct ArmSubResource {
    id: String,
}

#[derive(Deserialize)]
struct ArmIpConfiguration {
    properties: Option<ArmIpConfigurationProperties>,
}

#[derive(Deserialize)]
struct ArmIpConfigurationProperties {
    #[serde(rename = "privateIPAddress")]
    private_ip_address: Option<String>,
}

impl From<ArmVm> for Instance {
    fn from(vm: ArmVm) -> Self {
        let props = vm.properties;
        let power_state = props
            .instance_view
            .as_ref()
            .and_then(|v| v.statuses.iter().find(|s| s.code.starts_with("PowerState/")))
            .map(|s| PowerState::from_code(&s.code))
            .unwrap_or(PowerState::Transitioning);

        Instance {
            id: vm.instance_id,
            computer_name: props
                .os_profile
                .and_then(|p| p.computer_name)
                .unwrap_or_default(),
            provisioning_state: props.provisioning_state.unwrap_or_default(),
            power_state,
            latest_model: props.latest_model_applied.unwrap_or(false),
            data_disks: props
                .storage_profile
                .map(|s| s.data_disks)
                .unwrap_or_default()
                .into_iter()
                .map(|d| DataDisk {
                    lun: d.lun,
                    size_gb: d.disk_size_gb.unwrap_or(0),
                })
                .collect(),
        }
    }
}

impl From<ArmNic> for NetworkInterface {
    fn from(nic: ArmNic) -> Self {
        let instance_id = nic
            .properties
            .virtual_machine
            .as_ref()
            .and_then(|vm| vm.id.rsplit('/').next())
            .unwrap_or_default()
            .to_string();
        NetworkInterface {
            instance_id,
            ip_configurations: nic
                .properties
                .ip_configurations
                .into_iter()
                .map(|c| IpConfiguration {
                    private_ip: c.properties.and_then(|p| p.private_ip_address),
                })
                .collect(),
        }
    }
}

#[async_trait]
impl ComputeClient for ArmComputeClient {
    async fn get_deployment(&self, group: &str, name: &str) -> Result<Option<Deployment>> {
        let url = self.deployment_url(group, name);
        let response = self.send(self.request(Method::GET, &url), name, "get_deployment").await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = check(response, name, "get_deployment").await?;
        let deployment: ArmDeployment = response
            .json()
            .await
            .map_err(|e| Error::serialization_for_kind("Deployment", e.to_string()))?;
        Ok(Some(Deployment {
            provisioning_state: deployment
                .properties
                .and_then(|p| p.provisioning_state)
                .unwrap_or_default(),
        }))
    }

    async fn create_or_update_deployment(
        &self,
        group: &str,
        name: &str,
        payload: &DeploymentPayload,
    ) -> Result<()> {
        let url = self.deployment_url(group, name);
        let body = json!({
            "properties": {
                "mode": "Incremental",
                "template": payload.template,
                "parameters": payload.parameters,
            }
        });
        let response = self
            .send(self.request(Method::PUT, &url).json(&body), name, "create_deployment")
            .await?;
        check(response, name, "create_deployment").await?;
        Ok(())
    }

    async fn delete_deployment(&self, group: &str, name: &str) -> Result<()> {
        let url = self.deployment_url(group, name);
        let response = self
            .send(self.request(Method::DELETE, &url), name, "delete_deployment")
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        check(response, name, "delete_deployment").await?;
        Ok(())
    }

    async fn get_instance_group(&self, group: &str, name: &str) -> Result<Option<InstanceGroup>> {
        let url = format!(
            "{}?api-version={}",
            self.scale_set_path(group, name),
            COMPUTE_API_VERSION
        );
        let response = self.send(self.request(Method::GET, &url), name, "get_instance_group").await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = check(response, name, "get_instance_group").await?;
        let scale_set: ArmScaleSet = response
            .json()
            .await
            .map_err(|e| Error::serialization_for_kind("VirtualMachineScaleSet", e.to_string()))?;
        Ok(Some(InstanceGroup {
            capacity: scale_set.sku.and_then(|s| s.capacity).unwrap_or(0),
        }))
    }

    async fn set_capacity(&self, group: &str, name: &str, capacity: u32) -> Result<()> {
        let url = format!(
            "{}?api-version={}",
            self.scale_set_path(group, name),
            COMPUTE_API_VERSION
        );
        let body = json!({ "sku": { "capacity": capacity } });
        let response = self
            .send(self.request(Method::PATCH, &url).json(&body), name, "set_capacity")
            .await?;
        check(response, name, "set_capacity").await?;
        Ok(())
    }

    async fn delete_instance_group(&self, group: &str, name: &str) -> Result<()> {
        let url = format!(
            "{}?api-version={}",
            self.scale_set_path(group, name),
            COMPUTE_API_VERSION
        );
        let response = self
            .send(self.request(Method::DELETE, &url), name, "delete_instance_group")
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        check(response, name, "delete_instance_group").await?;
        Ok(())
    }

    async fn list_instances(&self, group: &str, name: &str) -> Result<Vec<Instance>> {
        let mut url = format!(
            "{}/virtualMachines?api-version={}&$expand=instanceView",
            self.scale_set_path(group, name),
            COMPUTE_API_VERSION
        );
        let mut instances = Vec::new();
        loop {
            let response = self.send(self.request(Method::GET, &url), name, "list_instances").await?;
            let response = check(response, name, "list_instances").await?;

            if let Some(remaining) = response
                .headers()
                .get(RATE_LIMIT_HEADER)
                .and_then(|v| v.to_str().ok())
                .and_then(min_remaining)
            {
                if remaining < self.min_remaining_reads {
                    warn!(group = %name, remaining, "instance read budget nearly exhausted");
                    return Err(Error::rate_limited("list_instances"));
                }
            }

            let page: ArmList<ArmVm> = response
                .json()
                .await
                .map_err(|e| Error::serialization_for_kind("VirtualMachineScaleSetVM", e.to_string()))?;
            instances.extend(page.value.into_iter().map(Instance::from));
            match page.next_link {
                Some(next) => url = next,
                None => return Ok(instances),
            }
        }
    }

    async fn deallocate_instance(&self, group: &str, name: &str, instance_id: &str) -> Result<()> {
        self.instance_action(group, name, instance_id, "deallocate", None)
            .await
    }

    async fn start_instance(&self, group: &str, name: &str, instance_id: &str) -> Result<()> {
        self.instance_action(group, name, instance_id, "start", None)
            .await
    }

    async fn run_command(
        &self,
        group: &str,
        name: &str,
        instance_id: &str,
        script: &str,
    ) -> Result<()> {
        let body = json!({
            "commandId": "RunShellScript",
            "script": [script],
        });
        self.instance_action(group, name, instance_id, "runCommand", Some(body))
            .await
    }

    async fn list_network_interfaces(
        &self,
        group: &str,
        name: &str,
    ) -> Result<Vec<NetworkInterface>> {
        let mut url = format!(
            "{}/networkInterfaces?api-version={}",
            self.scale_set_path(group, name),
            INTERFACES_API_VERSION
        );
        let mut interfaces = Vec::new();
        loop {
            let response = self
                .send(self.request(Method::GET, &url), name, "list_network_interfaces")
                .await?;
            let response = check(response, name, "list_network_interfaces").await?;
            let page: ArmList<ArmNic> = response
                .json()
                .await
                .map_err(|e| Error::serialization_for_kind("NetworkInterface", e.to_string()))?;
            interfaces.extend(page.value.into_iter().map(NetworkInterface::from));
            match page.next_link {
                Some(next) => url = next,
                None => return Ok(interfaces),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_header_minimum() {
        let header = "Microsoft.Compute/HighCostGetVMScaleSet3Min;107,Microsoft.Compute/HighCostGetVMScaleSet30Min;587";
        assert_eq!(min_remaining(header), Some(107));
        assert_eq!(min_remaining("garbage"), None);
    }

    #[test]
    fn vm_listing_maps_to_instances() {
        let page: ArmList<ArmVm> = serde_json::from_value(json!({
            "value": [{
                "instanceId": "3",
                "properties": {
                    "latestModelApplied": true,
                    "provisioningState": "Succeeded",
                    "osProfile": {"computerName": "c7x2k-worker-000003"},
                    "instanceView": {"statuses": [
                        {"code": "ProvisioningState/succeeded"},
                        {"code": "PowerState/running"}
                    ]},
                    "storageProfile": {"dataDisks": [
                        {"lun": 0, "diskSizeGB": 50},
                        {"lun": 1, "diskSizeGB": 100}
                    ]}
                }
            }]
        }))
        .unwrap();
        assert!(page.next_link.is_none());

        let instance = Instance::from(page.value.into_iter().next().unwrap());
        assert_eq!(instance.id, "3");
        assert_eq!(instance.computer_name, "c7x2k-worker-000003");
        assert!(instance.is_running());
        assert!(instance.latest_model);
        assert_eq!(instance.disk_size(1), Some(100));
    }

    #[test]
    fn nic_listing_maps_instance_ids() {
        let nic: ArmNic = serde_json::from_value(json!({
            "properties": {
                "virtualMachine": {"id": "/subscriptions/s/resourceGroups/c7x2k/providers/Microsoft.Compute/virtualMachineScaleSets/c7x2k-master/virtualMachines/2"},
                "ipConfigurations": [{"properties": {"privateIPAddress": "10.1.128.6"}}]
            }
        }))
        .unwrap();
        let nic = NetworkInterface::from(nic);
        assert_eq!(nic.instance_id, "2");
        assert_eq!(nic.ip_configurations[0].private_ip.as_deref(), Some("10.1.128.6"));
    }

    #[test]
    fn urls_are_scoped_to_the_subscription() {
        let client = ArmComputeClient::new("https://management.azure.com/", "sub-1", "t").unwrap();
        assert_eq!(
            client.instance_action_url("c7x2k", "c7x2k-worker", "4", "deallocate"),
            "https://management.azure.com/subscriptions/sub-1/resourceGroups/c7x2k/providers/Microsoft.Compute/virtualMachineScaleSets/c7x2k-worker/virtualMachines/4/deallocate?api-version=2023-03-01"
        );
    }
}
