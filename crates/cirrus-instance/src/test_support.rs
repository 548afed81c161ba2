//! Fixtures shared by the unit tests of this crate

use std::collections::BTreeMap;

use cirrus_common::crd::{
    AllocatedNetwork, CirrusCluster, CirrusClusterSpec, CirrusClusterStatus, DiskSizes,
    NodePoolSpec, ResourceStatus,
};

use crate::node::NodeInfo;
use crate::provider::{DataDisk, Instance, PowerState};

fn pool(count: u32) -> NodePoolSpec {
    NodePoolSpec {
        count,
        vm_size: "Standard_D4s_v3".to_string(),
        disks: DiskSizes::default(),
    }
}

/// A cluster with three masters, three workers and an allocated network
pub fn cluster() -> CirrusCluster {
    let mut cluster = CirrusCluster::new(
        "c7x2k",
        CirrusClusterSpec {
            cluster_id: "c7x2k".to_string(),
            template_version: "13.0.0".to_string(),
            masters: pool(3),
            workers: pool(3),
            network: Default::default(),
            upgrade_strategy: Default::default(),
        },
    );
    cluster.metadata.namespace = Some("default".to_string());
    cluster.metadata.resource_version = Some("1".to_string());
    cluster.status = Some(CirrusClusterStatus {
        network: Some(AllocatedNetwork {
            cidr: "10.1.0.0/16".to_string(),
            overlay_cidr: "10.1.0.0/17".to_string(),
            master_subnet_cidr: "10.1.128.0/24".to_string(),
            worker_subnet_cidr: "10.1.129.0/24".to_string(),
        }),
        ..Default::default()
    });
    cluster
}

/// Status record in `state` with the given checksums
pub fn record(state: &str, checksums: BTreeMap<String, String>) -> ResourceStatus {
    ResourceStatus {
        state: state.to_string(),
        checksums,
    }
}

/// A running worker instance with default disk sizes
pub fn instance(id: &str, latest_model: bool) -> Instance {
    Instance {
        id: id.to_string(),
        computer_name: format!("c7x2k-worker-{:0>6}", id),
        provisioning_state: "Succeeded".to_string(),
        power_state: PowerState::Running,
        latest_model,
        data_disks: vec![
            DataDisk { lun: 0, size_gb: 50 },
            DataDisk { lun: 1, size_gb: 100 },
        ],
    }
}

/// The tenant node backing `instance`
pub fn node_for(instance: &Instance, ready: bool) -> NodeInfo {
    NodeInfo {
        name: instance.computer_name.clone(),
        internal_ip: None,
        ready,
        unschedulable: false,
    }
}
