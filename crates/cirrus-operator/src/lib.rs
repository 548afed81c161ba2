//! Cirrus operator: converges cluster compute infrastructure toward
//! CirrusCluster descriptors

#![deny(missing_docs)]

/// CirrusCluster reconcile entry point and its shared context
pub mod controller;
/// Controller construction
pub mod controller_runner;
