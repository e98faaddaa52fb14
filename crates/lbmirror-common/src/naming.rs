//! Object keys, mirror naming and the skip list
//!
//! The mirror of a source Service is found purely by name, so the name must be
//! a stable function of the source key. Plain `<namespace>-<name>` joining is
//! ambiguous (`a-b/c` and `a/b-c` both give `a-b-c`), so a short digest of the
//! unambiguous `namespace/name` form is appended.

use std::fmt;

use kube::ResourceExt;

use crate::crd::MirroredService;
use crate::{SOURCE_NAMESPACE_ANNOTATION, SOURCE_NAME_ANNOTATION};

/// Maximum length of a DNS-1035 label (Service names must be one)
pub const MAX_NAME_LEN: usize = 63;

/// Hex digits of the digest suffix
const DIGEST_LEN: usize = 16;

/// Keys that are never mirrored: control-plane leader-election endpoints
/// which update every few seconds and never back a LoadBalancer.
pub const SKIPPED_KEYS: &[(&str, &str)] = &[
    ("kube-system", "kube-scheduler"),
    ("kube-system", "kube-controller-manager"),
];

/// Namespace and name of an object, the unit of reconciliation
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    /// Object namespace
    pub namespace: String,
    /// Object name
    pub name: String,
}

impl ObjectKey {
    /// Build a key from namespace and name
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of a namespaced Kubernetes object, `None` for cluster-scoped objects
    pub fn from_resource<K: ResourceExt>(obj: &K) -> Option<Self> {
        Some(Self::new(obj.namespace()?, obj.name_any()))
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Whether a key belongs to the fixed skip list
pub fn is_skipped(key: &ObjectKey) -> bool {
    SKIPPED_KEYS
        .iter()
        .any(|(ns, name)| key.namespace == *ns && key.name == *name)
}

/// Name of the MirroredService (and of the destination Service) for a source Service.
///
/// Format: `<namespace>-<name>-<digest>`, where the readable prefix is cut so the
/// result fits in 63 characters and the digest covers the full `namespace/name`.
pub fn mirror_name(namespace: &str, name: &str) -> String {
    let digest = deterministic_hash(&format!("{namespace}/{name}"));

    let mut prefix = format!("{namespace}-{name}");
    if !prefix.starts_with(|c: char| c.is_ascii_lowercase()) {
        prefix.insert_str(0, "m-");
    }

    // one byte for the separator before the digest
    let budget = MAX_NAME_LEN - DIGEST_LEN - 1;
    if prefix.len() > budget {
        prefix.truncate(budget);
    }
    let prefix = prefix.trim_end_matches('-');

    format!("{prefix}-{digest}")
}

/// Source key recorded on a MirroredService by the inner controller
pub fn source_key(mirror: &MirroredService) -> Option<ObjectKey> {
    let annotations = mirror.annotations();
    let namespace = annotations.get(SOURCE_NAMESPACE_ANNOTATION)?;
    let name = annotations.get(SOURCE_NAME_ANNOTATION)?;
    Some(ObjectKey::new(namespace, name))
}

/// Compute a deterministic hash of the input string, returning a 16-char hex digest.
///
/// Uses truncated SHA-256 so names stay stable across toolchain versions.
pub fn deterministic_hash(input: &str) -> String {
    use aws_lc_rs::digest;
    let hash = digest::digest(&digest::SHA256, input.as_bytes());
    hash.as_ref()[..DIGEST_LEN / 2]
        .iter()
        .fold(String::with_capacity(DIGEST_LEN), |mut s, b| {
            use std::fmt::Write;
            let _ = write!(s, "{:02x}", b);
            s
        })
}
