//! Common types for Cirrus: the cluster descriptor CRD, errors, retry,
//! startup configuration and descriptor persistence.

#![deny(missing_docs)]

pub mod config;
pub mod crd;
pub mod error;
pub mod kube_utils;
pub mod retry;
pub mod store;

pub use config::OperatorConfig;
pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Namespace for Cirrus system resources (locks, operator)
pub const CIRRUS_SYSTEM_NAMESPACE: &str = "cirrus-system";

/// Name of the Secret holding a tenant cluster's admin kubeconfig
pub fn kubeconfig_secret_name(cluster_id: &str) -> String {
    format!("{}-kubeconfig", cluster_id)
}

/// Provider resource group holding every object of a cluster
pub fn resource_group_name(cluster_id: &str) -> String {
    cluster_id.to_string()
}
