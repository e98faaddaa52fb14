//! Common types for lbmirror: the MirroredService CRD, errors, naming and utilities

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod kube_utils;
pub mod naming;
pub mod retry;
pub mod telemetry;

pub use error::Error;
pub use naming::ObjectKey;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Field manager name for all writes made by lbmirror
pub const FIELD_MANAGER: &str = "lbmirror";

/// The only Service type that is mirrored
pub const LOAD_BALANCER_TYPE: &str = "LoadBalancer";

/// Label that backs the destination Service selector; node names in the
/// source cluster are the names of the pods that run them in the destination
pub const NODE_SELECTOR_LABEL: &str = "statefulset.kubernetes.io/pod-name";

/// Standard managed-by label key
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Value of the managed-by label on objects lbmirror creates
pub const MANAGED_BY_VALUE: &str = "lbmirror";

/// Annotation on a MirroredService naming the source namespace
pub const SOURCE_NAMESPACE_ANNOTATION: &str = "lbmirror.dev/source-namespace";

/// Annotation on a MirroredService naming the source Service
pub const SOURCE_NAME_ANNOTATION: &str = "lbmirror.dev/source-name";

/// Annotation on a MirroredService naming the source cluster
pub const SOURCE_CLUSTER_ANNOTATION: &str = "lbmirror.dev/source-cluster";

/// Annotation on a destination Service naming the MirroredService it came from
pub const MIRROR_ANNOTATION: &str = "lbmirror.dev/mirrored-service";
