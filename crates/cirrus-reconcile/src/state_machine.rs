//! Persisted state machine
//!
//! A resource whose progress spans many passes keeps a small state tag in
//! its status record. Each pass loads the tag, runs the one transition
//! registered for it and persists whatever tag comes back. Transitions never
//! wait on remote work: they either finish their unit of work or return the
//! same state so the next pass re-enters it.
//!
//! The state type is a closed enumeration. Its `successors()` define the
//! fixed transition graph; a transition returning a state outside the graph
//! is an internal error and nothing is persisted.

use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use cirrus_common::crd::ResourceStatus;
use cirrus_common::{Error, Result};

use crate::engine::{Applied, ChangeOp, Desired, ManagedResource};
use crate::Descriptor;

/// A closed set of states with a fixed transition graph
pub trait StateTag: Copy + Eq + fmt::Debug + Send + Sync + 'static {
    /// Every state, in declaration order
    fn all() -> &'static [Self];

    /// State used for an empty or unknown tag, and the target of restarts
    fn initial() -> Self;

    /// Persisted tag
    fn as_str(&self) -> &'static str;

    /// Forward edges out of this state (self-loops and restarts are implicit)
    fn successors(&self) -> &'static [Self];

    /// True for states with no forward edges other than restarts
    fn is_terminal(&self) -> bool {
        self.successors().is_empty()
    }

    /// Parse a persisted tag
    fn parse(tag: &str) -> Option<Self> {
        Self::all().iter().copied().find(|s| s.as_str() == tag)
    }

    /// Parse a persisted tag, falling back to the initial state
    fn from_tag(tag: &str) -> Self {
        Self::parse(tag).unwrap_or_else(Self::initial)
    }

    /// True if `next` is reachable from `self` in one step
    fn allows(&self, next: Self) -> bool {
        next == *self || next == Self::initial() || self.successors().contains(&next)
    }
}

/// Check the graph has no cycles other than self-loops and restarts
pub fn validate_graph<S: StateTag>() -> Result<()> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        New,
        Active,
        Done,
    }

    fn visit<S: StateTag>(state: S, marks: &mut Vec<(S, Mark)>) -> Result<()> {
        let idx = marks
            .iter()
            .position(|(s, _)| *s == state)
            .ok_or_else(|| Error::internal_with_context("state-machine", "state missing from all()"))?;
        match marks[idx].1 {
            Mark::Done => return Ok(()),
            Mark::Active => {
                return Err(Error::internal_with_context(
                    "state-machine",
                    format!("cycle through {}", state.as_str()),
                ))
            }
            Mark::New => {}
        }
        marks[idx].1 = Mark::Active;
        for next in state.successors() {
            if *next != state && *next != S::initial() {
                visit(*next, marks)?;
            }
        }
        marks[idx].1 = Mark::Done;
        Ok(())
    }

    let mut marks: Vec<(S, Mark)> = S::all().iter().map(|s| (*s, Mark::New)).collect();
    for state in S::all() {
        visit(*state, &mut marks)?;
    }
    Ok(())
}

/// Result of one transition
#[derive(Clone, Debug, PartialEq)]
pub struct Transition<S> {
    /// State to persist
    pub next: S,
    /// Replacement checksums, `None` keeps the stored ones
    pub checksums: Option<BTreeMap<String, String>>,
    /// Stop further work this pass
    pub cancel_pass: bool,
}

impl<S: StateTag> Transition<S> {
    /// Move to `next`
    pub fn to(next: S) -> Self {
        Self {
            next,
            checksums: None,
            cancel_pass: false,
        }
    }

    /// Stay in `current`; re-entered next pass
    pub fn stay(current: S) -> Self {
        Self::to(current)
    }

    /// Restart from the initial state
    pub fn restart() -> Self {
        Self::to(S::initial())
    }

    /// Replace stored checksums
    pub fn with_checksums(mut self, checksums: BTreeMap<String, String>) -> Self {
        self.checksums = Some(checksums);
        self
    }

    /// Stop the rest of the pass after persisting
    pub fn cancel_pass(mut self) -> Self {
        self.cancel_pass = true;
        self
    }
}

/// The transition table of one resource
#[async_trait]
pub trait Transitions<K: Descriptor>: Send + Sync {
    /// State type
    type State: StateTag;

    /// Resource name; also the key of the status record
    fn resource(&self) -> &str;

    /// Run the transition registered for `state`
    async fn transition(
        &self,
        descriptor: &K,
        state: Self::State,
        record: &ResourceStatus,
    ) -> Result<Transition<Self::State>>;

    /// Remove what this resource created; `true` once nothing is left
    async fn teardown(&self, _descriptor: &K) -> Result<bool> {
        Ok(true)
    }
}

/// Drives a [`Transitions`] table one step at a time
pub struct StateMachine<T> {
    transitions: T,
}

impl<T> StateMachine<T> {
    /// Wrap a transition table
    pub fn new(transitions: T) -> Self {
        Self { transitions }
    }

    /// The wrapped transition table
    pub fn transitions(&self) -> &T {
        &self.transitions
    }

    /// Run exactly one transition from the tag in `record`
    ///
    /// Unknown or empty tags start from the initial state. A returned state
    /// outside the graph is rejected.
    pub async fn step<K>(
        &self,
        descriptor: &K,
        record: &ResourceStatus,
    ) -> Result<Transition<<T as Transitions<K>>::State>>
    where
        K: Descriptor,
        T: Transitions<K>,
    {
        let current = <<T as Transitions<K>>::State as StateTag>::from_tag(&record.state);
        let known = <<T as Transitions<K>>::State as StateTag>::parse(&record.state).is_some();
        if !known && !record.state.is_empty() {
            debug!(
                resource = %self.transitions.resource(),
                tag = %record.state,
                "unknown state tag, starting from initial state"
            );
        }

        let transition = self.transitions.transition(descriptor, current, record).await?;

        if !current.allows(transition.next) {
            return Err(Error::internal_with_context(
                "state-machine",
                format!(
                    "{}: illegal transition {} -> {}",
                    self.transitions.resource(),
                    current.as_str(),
                    transition.next.as_str()
                ),
            ));
        }

        if transition.next != current {
            info!(
                descriptor = %descriptor.key(),
                resource = %self.transitions.resource(),
                from = current.as_str(),
                to = transition.next.as_str(),
                "state transition"
            );
        }

        Ok(transition)
    }
}

/// Persists status records of one resource
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RecordStore<K: Descriptor>: Send + Sync {
    /// Write `record` under `resource`, returning the stored descriptor
    async fn persist(&self, descriptor: &K, resource: &str, record: &ResourceStatus) -> Result<K>;
}

/// What a persisted machine wants this pass
#[derive(Clone, Debug, PartialEq)]
pub enum MachineTarget {
    /// Record after one transition
    Record(ResourceStatus),
    /// Everything torn down
    Absent,
}

/// Adapts a [`StateMachine`] into an engine [`ManagedResource`]
///
/// Observed is the persisted record, desired is the record after one
/// transition, and apply writes exactly that record.
pub struct PersistedMachine<T, K: Descriptor> {
    machine: StateMachine<T>,
    store: Arc<dyn RecordStore<K>>,
    _descriptor: PhantomData<fn() -> K>,
}

impl<T, K: Descriptor> PersistedMachine<T, K> {
    /// Create a persisted machine writing through `store`
    pub fn new(transitions: T, store: Arc<dyn RecordStore<K>>) -> Self {
        Self {
            machine: StateMachine::new(transitions),
            store,
            _descriptor: PhantomData,
        }
    }

    /// The underlying machine
    pub fn machine(&self) -> &StateMachine<T> {
        &self.machine
    }
}

#[async_trait]
impl<T, K> ManagedResource<K> for PersistedMachine<T, K>
where
    K: Descriptor,
    T: Transitions<K>,
{
    type Observed = ResourceStatus;
    type Desired = MachineTarget;
    type Payload = MachineTarget;

    fn name(&self) -> &str {
        self.machine.transitions.resource()
    }

    async fn observe(&self, descriptor: &K) -> Result<ResourceStatus> {
        Ok(descriptor.record(ManagedResource::name(self)))
    }

    async fn desire(&self, descriptor: &K) -> Result<Desired<MachineTarget>> {
        if descriptor.is_deleting() {
            return Ok(Desired::proceed(MachineTarget::Absent));
        }

        let record = descriptor.record(ManagedResource::name(self));
        let transition = self.machine.step(descriptor, &record).await?;

        let next = ResourceStatus {
            state: transition.next.as_str().to_string(),
            checksums: transition.checksums.unwrap_or(record.checksums),
        };

        Ok(if transition.cancel_pass {
            Desired::cancel(MachineTarget::Record(next))
        } else {
            Desired::proceed(MachineTarget::Record(next))
        })
    }

    fn diff(&self, observed: &ResourceStatus, desired: &MachineTarget) -> ChangeOp<MachineTarget> {
        match desired {
            MachineTarget::Record(next) if next == observed => ChangeOp::None,
            MachineTarget::Record(next) => ChangeOp::Update(MachineTarget::Record(next.clone())),
            MachineTarget::Absent => ChangeOp::Delete(MachineTarget::Absent),
        }
    }

    async fn apply(&self, descriptor: &K, op: ChangeOp<MachineTarget>) -> Result<Applied<K>> {
        match op {
            ChangeOp::None => Ok(Applied::done()),
            ChangeOp::Create(MachineTarget::Record(record))
            | ChangeOp::Update(MachineTarget::Record(record)) => {
                let updated = self
                    .store
                    .persist(descriptor, ManagedResource::name(self), &record)
                    .await?;
                Ok(Applied::wrote(updated))
            }
            ChangeOp::Delete(_) | ChangeOp::Create(_) | ChangeOp::Update(_) => {
                if self.machine.transitions.teardown(descriptor).await? {
                    Ok(Applied::done())
                } else {
                    Ok(Applied::keep_finalizer())
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Engine;
    use cirrus_common::retry::RetryConfig;
    use std::sync::Mutex;

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    enum Light {
        Off,
        Warming,
        On,
    }

    impl StateTag for Light {
        fn all() -> &'static [Self] {
            &[Light::Off, Light::Warming, Light::On]
        }
        fn initial() -> Self {
            Light::Off
        }
        fn as_str(&self) -> &'static str {
            match self {
                Light::Off => "Off",
                Light::Warming => "Warming",
                Light::On => "On",
            }
        }
        fn successors(&self) -> &'static [Self] {
            match self {
                Light::Off => &[Light::Warming],
                Light::Warming => &[Light::On],
                Light::On => &[],
            }
        }
    }

    #[derive(Clone, Debug)]
    struct Doc {
        record: ResourceStatus,
        deleting: bool,
    }

    impl Descriptor for Doc {
        fn key(&self) -> String {
            "ns/doc".into()
        }
        fn is_deleting(&self) -> bool {
            self.deleting
        }
        fn record(&self, _resource: &str) -> ResourceStatus {
            self.record.clone()
        }
    }

    fn doc(tag: &str) -> Doc {
        Doc {
            record: ResourceStatus::with_state(tag),
            deleting: false,
        }
    }

    /// Table that walks Off -> Warming -> On, with knobs for misbehaviour
    struct Lamp {
        warm: bool,
        jump_to: Option<Light>,
        cancel: bool,
        torn_down: Mutex<bool>,
    }

    impl Lamp {
        fn new() -> Self {
            Self {
                warm: true,
                jump_to: None,
                cancel: false,
                torn_down: Mutex::new(false),
            }
        }
    }

    #[async_trait]
    impl Transitions<Doc> for Lamp {
        type State = Light;

        fn resource(&self) -> &str {
            "lamp"
        }

        async fn transition(
            &self,
            _descriptor: &Doc,
            state: Light,
            _record: &ResourceStatus,
        ) -> Result<Transition<Light>> {
            if let Some(target) = self.jump_to {
                return Ok(Transition::to(target));
            }
            let t = match state {
                Light::Off => Transition::to(Light::Warming).with_checksums(BTreeMap::from([(
                    "template".to_string(),
                    "abc".to_string(),
                )])),
                Light::Warming if self.warm => Transition::to(Light::On),
                Light::Warming => Transition::stay(Light::Warming),
                Light::On => Transition::stay(Light::On),
            };
            Ok(if self.cancel { t.cancel_pass() } else { t })
        }

        async fn teardown(&self, _descriptor: &Doc) -> Result<bool> {
            let mut done = self.torn_down.lock().unwrap();
            let was_done = *done;
            *done = true;
            Ok(was_done)
        }
    }

    #[tokio::test]
    async fn empty_and_unknown_tags_start_from_initial() {
        let machine = StateMachine::new(Lamp::new());
        for tag in ["", "Bogus"] {
            let t = machine.step(&doc(tag), &ResourceStatus::with_state(tag)).await.unwrap();
            assert_eq!(t.next, Light::Warming);
        }
    }

    #[tokio::test]
    async fn step_is_idempotent_for_identical_inputs() {
        let mut lamp = Lamp::new();
        lamp.warm = false;
        let machine = StateMachine::new(lamp);
        let d = doc("Warming");
        let first = machine.step(&d, &d.record).await.unwrap();
        let second = machine.step(&d, &d.record).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.next, Light::Warming);
    }

    #[tokio::test]
    async fn illegal_edges_are_rejected() {
        let mut lamp = Lamp::new();
        lamp.jump_to = Some(Light::On);
        let machine = StateMachine::new(lamp);
        let err = machine.step(&doc("Off"), &ResourceStatus::with_state("Off")).await.unwrap_err();
        assert!(err.to_string().contains("illegal transition Off -> On"));
    }

    #[tokio::test]
    async fn restart_edge_always_allowed() {
        let mut lamp = Lamp::new();
        lamp.jump_to = Some(Light::Off);
        let machine = StateMachine::new(lamp);
        let t = machine.step(&doc("On"), &ResourceStatus::with_state("On")).await.unwrap();
        assert_eq!(t.next, Light::Off);
    }

    #[test]
    fn graph_validation_accepts_dag_with_restarts() {
        assert!(validate_graph::<Light>().is_ok());
    }

    /// Story: a progressing machine persists its new tag and checksums
    #[tokio::test]
    async fn story_progress_is_persisted_through_the_store() {
        let mut store = MockRecordStore::<Doc>::new();
        store
            .expect_persist()
            .withf(|_, resource, record| {
                resource.to_string() == "lamp"
                    && record.state == "Warming"
                    && record.checksum("template") == Some("abc")
            })
            .times(1)
            .returning(|d, _, record| {
                let mut updated = d.clone();
                updated.record = record.clone();
                Ok(updated)
            });

        let engine = Engine::new(RetryConfig::no_retry())
            .with_resource(PersistedMachine::new(Lamp::new(), Arc::new(store)));

        let report = engine.run(doc("")).await.unwrap();
        assert_eq!(report.descriptor.record.state, "Warming");
    }

    /// Story: re-entering the same state writes nothing
    #[tokio::test]
    async fn story_same_state_is_a_pure_no_op() {
        let mut store = MockRecordStore::<Doc>::new();
        store.expect_persist().never();

        let mut lamp = Lamp::new();
        lamp.warm = false;
        let engine = Engine::new(RetryConfig::no_retry())
            .with_resource(PersistedMachine::new(lamp, Arc::new(store)));

        let report = engine.run(doc("Warming")).await.unwrap();
        assert!(report.cancelled_by.is_none());
    }

    #[tokio::test]
    async fn cancel_pass_is_reported_after_persisting() {
        let mut store = MockRecordStore::<Doc>::new();
        store.expect_persist().times(1).returning(|d, _, _| Ok(d.clone()));

        let mut lamp = Lamp::new();
        lamp.cancel = true;
        let engine = Engine::new(RetryConfig::no_retry())
            .with_resource(PersistedMachine::new(lamp, Arc::new(store)));

        let report = engine.run(doc("Off")).await.unwrap();
        assert_eq!(report.cancelled_by.as_deref(), Some("lamp"));
    }

    /// Story: deletion keeps the guard until teardown confirms
    #[tokio::test]
    async fn story_teardown_keeps_finalizer_until_confirmed() {
        let mut store = MockRecordStore::<Doc>::new();
        store.expect_persist().never();
        let engine = Engine::new(RetryConfig::no_retry())
            .with_resource(PersistedMachine::new(Lamp::new(), Arc::new(store)));

        let mut d = doc("On");
        d.deleting = true;

        let first = engine.run(d.clone()).await.unwrap();
        assert!(first.keep_finalizer);

        let second = engine.run(d).await.unwrap();
        assert!(!second.keep_finalizer);
        assert!(second.cancelled_by.is_none());
    }
}
