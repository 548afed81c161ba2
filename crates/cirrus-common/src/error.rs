//! Error types for the Cirrus operator
//!
//! Errors are structured with fields to aid debugging in production.
//! Each variant carries the cluster or resource it originated from, so a
//! failure deep in a provider call can still be traced back to the pass
//! that issued it.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for Cirrus operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Validation error for descriptor specs or startup configuration
    #[error("validation error for {cluster}: {message}")]
    Validation {
        /// Name of the cluster with invalid configuration
        cluster: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.workers.count")
        field: Option<String>,
    },

    /// A provider object that was expected to exist is absent
    #[error("{kind} {name} not found")]
    NotFound {
        /// Kind of provider object (deployment, instance group, instance)
        kind: String,
        /// Name of the missing object
        name: String,
    },

    /// Remote provider error
    #[error("provider error [{operation}] for {resource}: {message}")]
    Provider {
        /// Managed resource the call was issued for
        resource: String,
        /// Provider operation that failed (e.g., "deallocate")
        operation: String,
        /// Description of what failed
        message: String,
        /// Whether this error is retryable
        retryable: bool,
    },

    /// The provider refused a safety check because of rate limiting
    #[error("rate limited while {operation}")]
    RateLimited {
        /// Operation that could not be performed
        operation: String,
    },

    /// A configuration invariant of the remote state was violated
    #[error("invariant violated for {resource}: {message}")]
    Invariant {
        /// Resource whose remote state is inconsistent
        resource: String,
        /// Description of the violated invariant
        message: String,
    },

    /// Optimistic concurrency failure on a descriptor update
    #[error("conflict updating {cluster}: {message}")]
    Conflict {
        /// Cluster whose stored version changed since it was read
        cluster: String,
        /// Description of the conflicting update
        message: String,
    },

    /// Cross-process lock could not be acquired in time
    #[error("timed out acquiring lock {lock} after {waited_secs}s")]
    LockTimeout {
        /// Lock identity
        lock: String,
        /// How long acquisition was attempted
        waited_secs: u64,
    },

    /// No free block left in the allocation pool
    #[error("no free /{mask_bits} block left in {pool}")]
    CapacityExhausted {
        /// Pool range that was scanned
        pool: String,
        /// Requested prefix length
        mask_bits: u8,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The payload kind being serialized (if known)
        kind: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "state-machine", "engine")
        context: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            cluster: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with cluster context and field path
    pub fn validation_for_field(
        cluster: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            cluster: cluster.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a not-found error for a provider object
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a retryable provider error with full context
    pub fn provider(
        resource: impl Into<String>,
        operation: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Provider {
            resource: resource.into(),
            operation: operation.into(),
            message: msg.into(),
            retryable: true,
        }
    }

    /// Create a non-retryable provider error (malformed payload, auth failure)
    pub fn provider_permanent(
        resource: impl Into<String>,
        operation: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Provider {
            resource: resource.into(),
            operation: operation.into(),
            message: msg.into(),
            retryable: false,
        }
    }

    /// Create a rate-limit error for an operation
    pub fn rate_limited(operation: impl Into<String>) -> Self {
        Self::RateLimited {
            operation: operation.into(),
        }
    }

    /// Create an invariant violation for a resource
    pub fn invariant(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Invariant {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create an optimistic concurrency conflict
    pub fn conflict(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Conflict {
            cluster: cluster.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with payload kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Validation, invariant and serialization errors need a human to fix
    /// configuration or remote state. Everything caused by timing (rate
    /// limits, lock contention, conflicts, 5xx) is retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => match source {
                kube::Error::Api(ae) => ae.code == 409 || ae.code == 429 || ae.code >= 500,
                _ => true,
            },
            Error::Validation { .. } => false,
            Error::NotFound { .. } => false,
            Error::Provider { retryable, .. } => *retryable,
            Error::RateLimited { .. } => true,
            Error::Invariant { .. } => false,
            Error::Conflict { .. } => true,
            Error::LockTimeout { .. } => true,
            Error::CapacityExhausted { .. } => false,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// True for the expected "object is absent" outcome
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } => true,
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 404,
            _ => false,
        }
    }

    /// Get the cluster name if this error is associated with a specific cluster
    pub fn cluster(&self) -> Option<&str> {
        match self {
            Error::Validation { cluster, .. } => Some(cluster),
            Error::Conflict { cluster, .. } => Some(cluster),
            _ => None,
        }
    }

    /// Get the managed resource if this error is associated with one
    pub fn resource(&self) -> Option<&str> {
        match self {
            Error::Provider { resource, .. } => Some(resource),
            Error::Invariant { resource, .. } => Some(resource),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16) -> Error {
        Error::from(kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "test".to_string(),
            reason: "Test".to_string(),
            code,
        }))
    }

    /// Story: misconfigured descriptors are rejected without retry
    ///
    /// A descriptor with an impossible worker count will never become valid
    /// by waiting, so the controller must not burn passes retrying it.
    #[test]
    fn story_validation_errors_are_not_retried() {
        let err = Error::validation_for_field("prod", "spec.workers.count", "must be at least 1");
        assert!(err.to_string().contains("validation error for prod"));
        assert_eq!(err.cluster(), Some("prod"));
        assert!(!err.is_retryable());

        match &err {
            Error::Validation { field, .. } => {
                assert_eq!(field.as_deref(), Some("spec.workers.count"))
            }
            _ => panic!("Expected Validation variant"),
        }
    }

    /// Story: provider failures carry the resource and operation
    #[test]
    fn story_provider_errors_identify_origin() {
        let err = Error::provider("workers", "set-capacity", "gateway timeout");
        assert!(err.to_string().contains("[set-capacity]"));
        assert!(err.to_string().contains("workers"));
        assert_eq!(err.resource(), Some("workers"));
        assert!(err.is_retryable());

        let err = Error::provider_permanent("workers", "create-deployment", "invalid template");
        assert!(!err.is_retryable());
    }

    /// Story: timing-related failures are transient, remote inconsistencies are fatal
    #[test]
    fn story_error_taxonomy_retryability() {
        assert!(Error::rate_limited("listing instances").is_retryable());
        assert!(Error::conflict("c1", "resourceVersion changed").is_retryable());
        assert!(Error::LockTimeout {
            lock: "ipam".into(),
            waited_secs: 30
        }
        .is_retryable());

        assert!(!Error::invariant("masters", "two ip configurations").is_retryable());
        assert!(!Error::serialization("bad json").is_retryable());
        assert!(!Error::CapacityExhausted {
            pool: "10.0.0.0/16".into(),
            mask_bits: 24
        }
        .is_retryable());
    }

    #[test]
    fn kube_api_errors_retry_only_on_transient_codes() {
        assert!(api_error(500).is_retryable());
        assert!(api_error(503).is_retryable());
        assert!(api_error(429).is_retryable());
        assert!(api_error(409).is_retryable());
        assert!(!api_error(400).is_retryable());
        assert!(!api_error(403).is_retryable());
    }

    #[test]
    fn not_found_detection_covers_kube_and_provider() {
        assert!(Error::not_found("deployment", "workers").is_not_found());
        assert!(api_error(404).is_not_found());
        assert!(!api_error(500).is_not_found());
        assert!(!Error::internal("x").is_not_found());
    }

    #[test]
    fn internal_error_default_context() {
        let err = Error::internal("unexpected state");
        assert!(err.to_string().contains("[unknown]"));
        let err = Error::internal_with_context("engine", "unexpected state");
        assert!(err.to_string().contains("[engine]"));
    }
}
