//! Reconciliation engine and persisted state machine
//!
//! - [`engine`] - observe/desire/diff/apply over an ordered list of managed resources
//! - [`state_machine`] - resumable transition tables persisted in status records

#![deny(missing_docs)]

pub mod engine;
pub mod state_machine;

use std::sync::Arc;

use async_trait::async_trait;
use kube::ResourceExt;

use cirrus_common::crd::{CirrusCluster, ResourceStatus};
use cirrus_common::store::DescriptorStore;
use cirrus_common::Result;

pub use engine::{
    Applied, ChangeOp, Desired, Engine, ManagedResource, Outcome, PassReport, Reconcilable,
};
pub use state_machine::{
    MachineTarget, PersistedMachine, RecordStore, StateMachine, StateTag, Transition, Transitions,
};

/// The declarative unit a pass works on
pub trait Descriptor: Clone + Send + Sync + 'static {
    /// Identity for logs (namespace/name)
    fn key(&self) -> String;

    /// True once deletion has been requested
    fn is_deleting(&self) -> bool;

    /// Persisted record of a managed resource (default when absent)
    fn record(&self, resource: &str) -> ResourceStatus;
}

impl Descriptor for CirrusCluster {
    fn key(&self) -> String {
        format!(
            "{}/{}",
            self.namespace().unwrap_or_default(),
            self.name_any()
        )
    }

    fn is_deleting(&self) -> bool {
        CirrusCluster::is_deleting(self)
    }

    fn record(&self, resource: &str) -> ResourceStatus {
        self.resource_status(resource)
    }
}

/// Writes status records through a [`DescriptorStore`]
pub struct DescriptorRecordStore {
    store: Arc<dyn DescriptorStore>,
}

impl DescriptorRecordStore {
    /// Wrap a descriptor store
    pub fn new(store: Arc<dyn DescriptorStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl RecordStore<CirrusCluster> for DescriptorRecordStore {
    async fn persist(
        &self,
        descriptor: &CirrusCluster,
        resource: &str,
        record: &ResourceStatus,
    ) -> Result<CirrusCluster> {
        self.store
            .patch_resource_status(descriptor, resource, record)
            .await
    }
}
