//! Reconcilers that mirror LoadBalancer Services between clusters
//!
//! Two loops cooperate through the MirroredService resource:
//!
//! - [`inner`] projects source-cluster Services and Endpoints onto
//!   MirroredService objects and feeds the assigned address back to the
//!   source Service.
//! - [`outer`] materializes a LoadBalancer Service from each MirroredService
//!   and feeds the address the destination cluster assigned into the mirror
//!   status.
//!
//! Neither loop retries internally. Errors are returned to the caller, which
//! re-delivers the key.

#![deny(missing_docs)]

pub mod client;
pub mod inner;
pub mod outer;
pub mod transform;

pub use client::{
    DestinationClusterClient, KubeDestinationClient, KubeSourceClient, SourceClusterClient,
};
pub use inner::{InnerContext, InnerOutcome};
pub use outer::{OuterContext, OuterOutcome};
