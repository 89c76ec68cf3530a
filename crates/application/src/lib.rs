//! Application layer: the provisioner control loop.

pub mod provisioner;

pub use provisioner::{Provisioner, ReconciliationSummary};
