//! Reconciliation engine
//!
//! A pass runs an ordered list of managed resources against one descriptor.
//! Each resource observes the world, computes what it wants, diffs the two
//! into at most one [`ChangeOp`] and applies it. Transient failures are
//! retried with bounded backoff around the whole observe/desire/apply cycle
//! of that resource; anything else fails the pass for that resource with
//! its status untouched, so the next pass attempts the same diff again.

use std::fmt;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use cirrus_common::retry::{retry_with_backoff_if, RetryConfig};
use cirrus_common::{Error, Result};

use crate::Descriptor;

/// The single change a resource wants to make this pass
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChangeOp<P> {
    /// Observed already matches desired
    None,
    /// Object must be created
    Create(P),
    /// Object must be changed
    Update(P),
    /// Object must be removed
    Delete(P),
}

impl<P> ChangeOp<P> {
    /// Short verb for logs
    pub fn verb(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Create(_) => "create",
            Self::Update(_) => "update",
            Self::Delete(_) => "delete",
        }
    }

    /// True if there is nothing to apply
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }
}

/// What the rest of the pass should do after a resource ran
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum Outcome {
    /// Carry on with the next resource
    #[default]
    Continue,
    /// Stop further work this pass; re-attempted on the next schedule
    CancelPass,
    /// Deletion must not complete yet; implies [`Outcome::CancelPass`]
    KeepFinalizer,
}

/// A desired state plus the outcome the resource asks for
#[derive(Clone, Debug, PartialEq)]
pub struct Desired<D> {
    /// The desired state
    pub state: D,
    /// Requested outcome for the pass
    pub outcome: Outcome,
}

impl<D> Desired<D> {
    /// Desired state that lets the pass continue
    pub fn proceed(state: D) -> Self {
        Self {
            state,
            outcome: Outcome::Continue,
        }
    }

    /// Desired state after which the pass stops
    pub fn cancel(state: D) -> Self {
        Self {
            state,
            outcome: Outcome::CancelPass,
        }
    }
}

/// Result of applying a change
#[derive(Debug)]
pub struct Applied<K> {
    /// The descriptor as stored after the change, if the change wrote it
    pub updated: Option<K>,
    /// Requested outcome for the pass
    pub outcome: Outcome,
}

impl<K> Applied<K> {
    /// Change applied without touching the descriptor
    pub fn done() -> Self {
        Self {
            updated: None,
            outcome: Outcome::Continue,
        }
    }

    /// Change applied and wrote the descriptor
    pub fn wrote(updated: K) -> Self {
        Self {
            updated: Some(updated),
            outcome: Outcome::Continue,
        }
    }

    /// Teardown issued but not yet confirmed
    pub fn keep_finalizer() -> Self {
        Self {
            updated: None,
            outcome: Outcome::KeepFinalizer,
        }
    }
}

/// One named unit reconciled by the engine
#[async_trait]
pub trait ManagedResource<K: Descriptor>: Send + Sync {
    /// What is read from the world
    type Observed: Send + Sync + fmt::Debug;
    /// What the world should look like
    type Desired: Send + Sync + fmt::Debug;
    /// Data carried by a change operation
    type Payload: Send + Sync + fmt::Debug;

    /// Resource name; also the key of its status record
    fn name(&self) -> &str;

    /// Read the current state
    async fn observe(&self, descriptor: &K) -> Result<Self::Observed>;

    /// Compute the desired state
    async fn desire(&self, descriptor: &K) -> Result<Desired<Self::Desired>>;

    /// Reduce observed vs desired to at most one change
    fn diff(&self, observed: &Self::Observed, desired: &Self::Desired) -> ChangeOp<Self::Payload>;

    /// Execute the change with exactly one provider or store call
    ///
    /// "Already exists" on create and "not found" on delete must be
    /// treated as success.
    async fn apply(&self, descriptor: &K, op: ChangeOp<Self::Payload>) -> Result<Applied<K>>;
}

/// Object-safe view of a [`ManagedResource`] so heterogeneous resources can
/// share one ordered list
#[async_trait]
pub trait Reconcilable<K: Descriptor>: Send + Sync {
    /// Resource name
    fn name(&self) -> &str;

    /// Run one observe/desire/diff/apply cycle
    async fn reconcile_once(&self, descriptor: &K) -> Result<Applied<K>>;
}

#[async_trait]
impl<K, R> Reconcilable<K> for R
where
    K: Descriptor,
    R: ManagedResource<K>,
{
    fn name(&self) -> &str {
        ManagedResource::name(self)
    }

    async fn reconcile_once(&self, descriptor: &K) -> Result<Applied<K>> {
        let observed = self.observe(descriptor).await?;
        let desired = self.desire(descriptor).await?;
        let op = self.diff(&observed, &desired.state);

        debug!(
            resource = %ManagedResource::name(self),
            op = op.verb(),
            ?observed,
            desired = ?desired.state,
            "computed change"
        );

        let mut applied = if op.is_none() {
            Applied::done()
        } else {
            let verb = op.verb();
            let applied = self.apply(descriptor, op).await?;
            info!(resource = %ManagedResource::name(self), op = verb, "applied change");
            applied
        };
        applied.outcome = applied.outcome.max(desired.outcome);
        Ok(applied)
    }
}

/// Summary of one pass
#[derive(Debug)]
pub struct PassReport<K> {
    /// The descriptor as last written during the pass
    pub descriptor: K,
    /// Resources that ran to completion, in order
    pub completed: Vec<String>,
    /// Resource that cancelled the rest of the pass, if any
    pub cancelled_by: Option<String>,
    /// True if some resource asked to keep the deletion guard
    pub keep_finalizer: bool,
}

/// Runs managed resources in order against a descriptor
pub struct Engine<K: Descriptor> {
    resources: Vec<Box<dyn Reconcilable<K>>>,
    retry: RetryConfig,
}

impl<K: Descriptor> Engine<K> {
    /// Create an engine with the given retry policy and no resources
    pub fn new(retry: RetryConfig) -> Self {
        Self {
            resources: Vec::new(),
            retry,
        }
    }

    /// Append a resource; resources run in insertion order
    pub fn with_resource(mut self, resource: impl Reconcilable<K> + 'static) -> Self {
        self.resources.push(Box::new(resource));
        self
    }

    /// Names of the registered resources, in run order
    pub fn resource_names(&self) -> Vec<&str> {
        self.resources.iter().map(|r| r.name()).collect()
    }

    /// Run one pass
    ///
    /// While the descriptor is being deleted this is [`Engine::run_deletion`].
    pub async fn run(&self, descriptor: K) -> Result<PassReport<K>> {
        let deleting = descriptor.is_deleting();
        self.run_ordered(descriptor, deleting).await
    }

    /// Run the delete path: resources in reverse order, so the last thing
    /// created is the first thing torn down
    pub async fn run_deletion(&self, descriptor: K) -> Result<PassReport<K>> {
        self.run_ordered(descriptor, true).await
    }

    async fn run_ordered(&self, descriptor: K, reverse: bool) -> Result<PassReport<K>> {
        let key = descriptor.key();
        let mut report = PassReport {
            descriptor,
            completed: Vec::new(),
            cancelled_by: None,
            keep_finalizer: false,
        };

        let ordered: Vec<&dyn Reconcilable<K>> = if reverse {
            self.resources.iter().rev().map(|r| r.as_ref()).collect()
        } else {
            self.resources.iter().map(|r| r.as_ref()).collect()
        };

        for resource in ordered {
            let name = resource.name().to_string();
            let current = report.descriptor.clone();
            let applied = retry_with_backoff_if(
                &self.retry,
                &format!("{}/{}", key, name),
                is_transient,
                || resource.reconcile_once(&current),
            )
            .await
            .map_err(|e| {
                warn!(descriptor = %key, resource = %name, error = %e, "resource failed");
                e
            })?;

            if let Some(updated) = applied.updated {
                report.descriptor = updated;
            }

            match applied.outcome {
                Outcome::Continue => report.completed.push(name),
                Outcome::CancelPass => {
                    debug!(descriptor = %key, resource = %name, "pass cancelled");
                    report.cancelled_by = Some(name);
                    break;
                }
                Outcome::KeepFinalizer => {
                    debug!(descriptor = %key, resource = %name, "deletion guard kept");
                    report.keep_finalizer = true;
                    report.cancelled_by = Some(name);
                    break;
                }
            }
        }

        Ok(report)
    }
}

/// Errors worth retrying inside the pass.
///
/// Conflicts are excluded: retrying with the same stale descriptor cannot
/// succeed, the caller must re-read.
fn is_transient(error: &Error) -> bool {
    error.is_retryable() && !matches!(error, Error::Conflict { .. })
}
