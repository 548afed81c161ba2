//! Block selection and subnet layout
//!
//! Pure functions: no I/O, no locking. The caller is responsible for
//! holding the allocator lock while the used set is read and the chosen
//! block is persisted.

use std::net::Ipv4Addr;

use ipnetwork::Ipv4Network;

use cirrus_common::crd::AllocatedNetwork;
use cirrus_common::{Error, Result};

/// Smallest prefix used for master and worker subnets
pub const MIN_SUBNET_MASK_BITS: u8 = 24;

/// True if the two ranges share at least one address
pub fn overlaps(a: &Ipv4Network, b: &Ipv4Network) -> bool {
    a.contains(b.network()) || b.contains(a.network())
}

/// Lowest block of `mask_bits` inside `pool` that overlaps nothing in `used`
///
/// Candidates are scanned in address order, so the result for a given
/// pool and used set never changes.
pub fn first_fit(pool: &Ipv4Network, used: &[Ipv4Network], mask_bits: u8) -> Result<Ipv4Network> {
    if mask_bits < pool.prefix() || mask_bits > 32 {
        return Err(Error::validation(format!(
            "cannot carve a /{} out of {}",
            mask_bits, pool
        )));
    }

    let base = u32::from(pool.network()) as u64;
    let step = 1u64 << (32 - mask_bits);
    let candidates = 1u64 << (mask_bits - pool.prefix());

    for i in 0..candidates {
        let start = Ipv4Addr::from((base + i * step) as u32);
        let candidate = Ipv4Network::new(start, mask_bits)
            .map_err(|e| Error::internal_with_context("ipam", e.to_string()))?;
        if !used.iter().any(|u| overlaps(u, &candidate)) {
            return Ok(candidate);
        }
    }

    Err(Error::CapacityExhausted {
        pool: pool.to_string(),
        mask_bits,
    })
}

/// Partition a cluster block into its overlay range and node subnets
///
/// The lower half is the overlay range. Master and worker subnets of prefix
/// `max(24, block + 2)` are taken first-fit from the upper half, masters
/// first.
pub fn split(block: &Ipv4Network) -> Result<AllocatedNetwork> {
    let prefix = block.prefix();
    if prefix > cirrus_common::config::MAX_ALLOCATED_MASK_BITS {
        return Err(Error::validation(format!(
            "{} is too small to hold overlay, master and worker ranges",
            block
        )));
    }

    let half = 1u32 << (32 - (prefix + 1));
    let network = u32::from(block.network());
    let overlay = Ipv4Network::new(Ipv4Addr::from(network), prefix + 1)
        .map_err(|e| Error::internal_with_context("ipam", e.to_string()))?;
    let upper = Ipv4Network::new(Ipv4Addr::from(network + half), prefix + 1)
        .map_err(|e| Error::internal_with_context("ipam", e.to_string()))?;

    let subnet_bits = MIN_SUBNET_MASK_BITS.max(prefix + 2);
    let master = first_fit(&upper, &[], subnet_bits)?;
    let worker = first_fit(&upper, &[master], subnet_bits)?;

    Ok(AllocatedNetwork {
        cidr: canonical(block)?.to_string(),
        overlay_cidr: overlay.to_string(),
        master_subnet_cidr: master.to_string(),
        worker_subnet_cidr: worker.to_string(),
    })
}

fn canonical(block: &Ipv4Network) -> Result<Ipv4Network> {
    Ipv4Network::new(block.network(), block.prefix())
        .map_err(|e| Error::internal_with_context("ipam", e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> Ipv4Network {
        s.parse().unwrap()
    }

    #[test]
    fn overlap_is_symmetric_and_covers_nesting() {
        assert!(overlaps(&net("10.0.0.0/16"), &net("10.0.3.0/24")));
        assert!(overlaps(&net("10.0.3.0/24"), &net("10.0.0.0/16")));
        assert!(!overlaps(&net("10.0.0.0/24"), &net("10.0.1.0/24")));
    }

    /// Story: the first two clusters in an empty /16 pool get the first two /24s
    #[test]
    fn story_two_clusters_get_adjacent_blocks() {
        let pool = net("10.0.0.0/16");
        let first = first_fit(&pool, &[], 24).unwrap();
        assert_eq!(first, net("10.0.0.0/24"));

        let second = first_fit(&pool, &[first], 24).unwrap();
        assert_eq!(second, net("10.0.1.0/24"));
    }

    /// Story: a freed block in the middle of the pool is reused before the tail
    #[test]
    fn story_gap_is_filled_first() {
        let pool = net("10.0.0.0/16");
        let used = [net("10.0.0.0/24"), net("10.0.2.0/24")];
        assert_eq!(first_fit(&pool, &used, 24).unwrap(), net("10.0.1.0/24"));
    }

    #[test]
    fn larger_used_ranges_block_every_candidate_inside_them() {
        let pool = net("10.0.0.0/16");
        let used = [net("10.0.0.0/20")];
        assert_eq!(first_fit(&pool, &used, 24).unwrap(), net("10.0.16.0/24"));
    }

    #[test]
    fn exhausted_pool_is_reported() {
        let pool = net("10.0.0.0/23");
        let used = [net("10.0.0.0/24"), net("10.0.1.0/24")];
        let err = first_fit(&pool, &used, 24).unwrap_err();
        assert!(matches!(err, Error::CapacityExhausted { mask_bits: 24, .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn prefix_shorter_than_pool_is_rejected() {
        assert!(first_fit(&net("10.0.0.0/16"), &[], 8).is_err());
    }

    #[test]
    fn split_of_a_slash_16() {
        let layout = split(&net("10.1.0.0/16")).unwrap();
        assert_eq!(layout.cidr, "10.1.0.0/16");
        assert_eq!(layout.overlay_cidr, "10.1.0.0/17");
        assert_eq!(layout.master_subnet_cidr, "10.1.128.0/24");
        assert_eq!(layout.worker_subnet_cidr, "10.1.129.0/24");
    }

    #[test]
    fn split_of_a_slash_24_uses_quarter_subnets() {
        let layout = split(&net("10.0.1.0/24")).unwrap();
        assert_eq!(layout.overlay_cidr, "10.0.1.0/25");
        assert_eq!(layout.master_subnet_cidr, "10.0.1.128/26");
        assert_eq!(layout.worker_subnet_cidr, "10.0.1.192/26");
    }

    #[test]
    fn split_is_deterministic() {
        let block = net("10.4.0.0/20");
        assert_eq!(split(&block).unwrap(), split(&block).unwrap());
    }

    #[test]
    fn split_rejects_blocks_without_room() {
        assert!(split(&net("10.0.0.0/29")).is_err());
    }
}
