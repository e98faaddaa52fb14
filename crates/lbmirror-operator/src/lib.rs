//! lbmirror operator: cluster wiring for the inner and outer loops

#![deny(missing_docs)]

/// Command line and cluster references
pub mod config;
/// Watch streams feeding each loop
pub mod controller_runner;
/// Kubeconfig publishing
pub mod publish;
/// Keyed work queue
pub mod queue;
