//! Per-pass view of an upgrade
//!
//! Rebuilt from scratch every pass out of the status record and a fresh
//! instance listing. Nothing here is persisted.

use crate::provider::{Instance, PowerState, PROVISIONING_FAILED};

const IN_FLIGHT_STATES: &[&str] = &["Creating", "Updating", "Deleting"];

/// Instances grouped by what still has to happen to them
///
/// Each instance lands in at most one bucket; instances on the latest model
/// that are healthy land in none.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WorkingSet {
    /// On an old model and not serving; replaced without draining
    pub needs_update: Vec<Instance>,
    /// On an old model and running workloads; drained before removal
    pub needs_drain: Vec<Instance>,
    /// On the latest model but failed to provision
    pub needs_reimage: Vec<Instance>,
    /// The provider is already working on these
    pub already_updating: Vec<Instance>,
}

impl WorkingSet {
    /// Partition a fresh instance listing
    pub fn partition(instances: &[Instance]) -> Self {
        let mut set = Self::default();
        for instance in instances {
            if IN_FLIGHT_STATES.contains(&instance.provisioning_state.as_str()) {
                set.already_updating.push(instance.clone());
            } else if instance.provisioning_state == PROVISIONING_FAILED {
                set.needs_reimage.push(instance.clone());
            } else if !instance.latest_model && instance.power_state == PowerState::Running {
                set.needs_drain.push(instance.clone());
            } else if !instance.latest_model {
                set.needs_update.push(instance.clone());
            }
        }
        set
    }

    /// True if any instance still has work pending
    pub fn is_wip(&self) -> bool {
        !self.needs_update.is_empty()
            || !self.needs_drain.is_empty()
            || !self.needs_reimage.is_empty()
            || !self.already_updating.is_empty()
    }

    /// Instances on a previous model, serving or not
    pub fn outdated(&self) -> impl Iterator<Item = &Instance> {
        self.needs_drain.iter().chain(self.needs_update.iter())
    }
}

/// Transient upgrade view of one instance group
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpgradeSession {
    /// Template checksum the current spec renders to
    pub desired_checksum: String,
    /// Template checksum recorded when the deployment was submitted
    pub current_checksum: Option<String>,
    /// Instance count from the spec
    pub desired_count: u32,
    /// Capacity the group currently has
    pub current_count: u32,
    /// Every instance, as listed this pass
    pub instances: Vec<Instance>,
    /// Pending work by instance
    pub working_set: WorkingSet,
}

impl UpgradeSession {
    /// Build a session from the status record and a fresh listing
    pub fn new(
        desired_checksum: String,
        current_checksum: Option<String>,
        desired_count: u32,
        current_count: u32,
        instances: Vec<Instance>,
    ) -> Self {
        let working_set = WorkingSet::partition(&instances);
        Self {
            desired_checksum,
            current_checksum,
            desired_count,
            current_count,
            instances,
            working_set,
        }
    }

    /// True if the submitted template is the one the spec renders to
    pub fn template_current(&self) -> bool {
        self.current_checksum.as_deref() == Some(self.desired_checksum.as_str())
    }

    /// True if every instance is running
    pub fn all_running(&self) -> bool {
        self.instances.iter().all(Instance::is_running)
    }

    /// True if the group already matches the spec and nothing is pending
    pub fn converged(&self) -> bool {
        self.template_current()
            && self.current_count == self.desired_count
            && self.all_running()
            && !self.working_set.is_wip()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::DataDisk;

    fn instance(id: &str, state: &str, power: PowerState, latest: bool) -> Instance {
        Instance {
            id: id.to_string(),
            computer_name: format!("node-{}", id),
            provisioning_state: state.to_string(),
            power_state: power,
            latest_model: latest,
            data_disks: vec![DataDisk { lun: 0, size_gb: 50 }],
        }
    }

    #[test]
    fn partition_buckets_each_instance_once() {
        let instances = vec![
            instance("0", "Succeeded", PowerState::Running, true),
            instance("1", "Succeeded", PowerState::Running, false),
            instance("2", "Succeeded", PowerState::Deallocated, false),
            instance("3", "Failed", PowerState::Stopped, true),
            instance("4", "Updating", PowerState::Running, false),
        ];
        let set = WorkingSet::partition(&instances);
        assert_eq!(set.needs_drain.len(), 1);
        assert_eq!(set.needs_drain[0].id, "1");
        assert_eq!(set.needs_update[0].id, "2");
        assert_eq!(set.needs_reimage[0].id, "3");
        assert_eq!(set.already_updating[0].id, "4");
        assert_eq!(set.outdated().count(), 2);
        assert!(set.is_wip());
    }

    #[test]
    fn healthy_latest_instances_are_not_wip() {
        let set = WorkingSet::partition(&[instance("0", "Succeeded", PowerState::Running, true)]);
        assert!(!set.is_wip());
    }

    /// Story: three running up-to-date instances at capacity three with a
    /// matching template need nothing
    #[test]
    fn story_matching_group_is_converged() {
        let session = UpgradeSession::new(
            "abc".to_string(),
            Some("abc".to_string()),
            3,
            3,
            (0..3)
                .map(|i| instance(&i.to_string(), "Succeeded", PowerState::Running, true))
                .collect(),
        );
        assert!(session.converged());
    }

    #[test]
    fn stale_template_is_not_converged() {
        let session = UpgradeSession::new("new".to_string(), Some("old".to_string()), 1, 1, vec![
            instance("0", "Succeeded", PowerState::Running, true),
        ]);
        assert!(!session.template_current());
        assert!(!session.converged());
    }
}
