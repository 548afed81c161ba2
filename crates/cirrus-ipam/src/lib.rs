//! Subnet allocator for cluster virtual networks
//!
//! Hands each cluster one non-overlapping block from a configured pool and
//! splits it into overlay, master and worker ranges.

#![deny(missing_docs)]

pub mod allocator;
pub mod capabilities;
pub mod lock;
pub mod resource;

pub use allocator::{first_fit, overlaps, split};
pub use capabilities::{
    Checker, Collector, LockToken, Locker, Persister, StoreChecker, StoreCollector,
    StorePersister,
};
pub use lock::LeaseLocker;
pub use resource::{Allocation, IpamConfig, IpamResource, RESOURCE_NAME};
