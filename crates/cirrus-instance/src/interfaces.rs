//! Instance to private address mapping

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use cirrus_common::{Error, Result};

use crate::provider::NetworkInterface;

/// Map each instance id to its private address
///
/// Every interface must carry exactly one IP configuration with a non-empty
/// address; anything else means the group was not built by us and nothing
/// about its nodes can be trusted.
pub fn private_ips(
    group: &str,
    interfaces: &[NetworkInterface],
) -> Result<BTreeMap<String, Ipv4Addr>> {
    let mut ips = BTreeMap::new();
    for nic in interfaces {
        let [config] = nic.ip_configurations.as_slice() else {
            return Err(Error::invariant(
                group,
                format!(
                    "instance {} has {} IP configurations, expected exactly 1",
                    nic.instance_id,
                    nic.ip_configurations.len()
                ),
            ));
        };

        let address = config
            .private_ip
            .as_deref()
            .filter(|ip| !ip.is_empty())
            .ok_or_else(|| {
                Error::invariant(
                    group,
                    format!("instance {} has no private IP", nic.instance_id),
                )
            })?;

        let ip = address.parse::<Ipv4Addr>().map_err(|e| {
            Error::invariant(
                group,
                format!("instance {} private IP {:?}: {}", nic.instance_id, address, e),
            )
        })?;
        ips.insert(nic.instance_id.clone(), ip);
    }
    Ok(ips)
}
