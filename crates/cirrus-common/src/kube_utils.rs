//! Shared Kubernetes utilities using kube-rs

use std::path::Path;
use std::time::Duration;

use k8s_openapi::api::core::v1::Secret;
use kube::api::Api;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};

use crate::Error;

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Key holding the kubeconfig inside a tenant kubeconfig Secret
pub const KUBECONFIG_SECRET_KEY: &str = "kubeconfig";

/// Create a kube client from optional kubeconfig path with default timeouts
pub async fn create_client(kubeconfig: Option<&Path>) -> Result<Client, Error> {
    let config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::internal_with_context(
                    "create_client",
                    format!("failed to read kubeconfig: {}", e),
                )
            })?;
            config_from_kubeconfig(kubeconfig).await?
        }
        None => Config::infer().await.map_err(|e| {
            Error::internal_with_context("create_client", format!("failed to infer config: {}", e))
        })?,
    };
    client_with_timeouts(config)
}

/// Build a client for a tenant cluster from its kubeconfig Secret
///
/// Returns `Ok(None)` while the Secret does not exist yet (the tenant
/// control plane has not been bootstrapped).
pub async fn tenant_client(
    client: &Client,
    namespace: &str,
    secret_name: &str,
) -> Result<Option<Client>, Error> {
    let secrets: Api<Secret> = Api::namespaced(client.clone(), namespace);
    let Some(secret) = secrets.get_opt(secret_name).await? else {
        return Ok(None);
    };

    let data = secret
        .data
        .as_ref()
        .and_then(|d| d.get(KUBECONFIG_SECRET_KEY))
        .ok_or_else(|| {
            Error::invariant(
                secret_name,
                format!("secret {}/{} missing key {}", namespace, secret_name, KUBECONFIG_SECRET_KEY),
            )
        })?;

    let yaml = std::str::from_utf8(&data.0)
        .map_err(|e| Error::serialization_for_kind("Kubeconfig", e.to_string()))?;
    let kubeconfig = Kubeconfig::from_yaml(yaml)
        .map_err(|e| Error::serialization_for_kind("Kubeconfig", e.to_string()))?;

    let config = config_from_kubeconfig(kubeconfig).await?;
    client_with_timeouts(config).map(Some)
}

async fn config_from_kubeconfig(kubeconfig: Kubeconfig) -> Result<Config, Error> {
    Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| {
            Error::internal_with_context("create_client", format!("failed to load kubeconfig: {}", e))
        })
}

fn client_with_timeouts(mut config: Config) -> Result<Client, Error> {
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);
    Client::try_from(config).map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to create client: {}", e))
    })
}
