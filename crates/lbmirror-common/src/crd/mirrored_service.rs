//! MirroredService CRD
//!
//! A MirroredService lives in the destination cluster and describes a
//! LoadBalancer Service of the source cluster: which nodes currently back it
//! and which ports it exposes. The inner controller writes the spec; the outer
//! controller materializes a Service from it and writes back the address the
//! destination cluster assigned.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Topology of a source-cluster LoadBalancer Service.
///
/// Example:
/// ```yaml
/// apiVersion: lbmirror.dev/v1alpha1
/// kind: MirroredService
/// metadata:
///   name: default-web-3f2a9c0d1b7e4a65
///   namespace: vms
/// spec:
///   nodeNames: [vm-0, vm-1]
///   ports:
///     - name: http
///       protocol: TCP
///       port: 80
///       nodePort: 31080
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "lbmirror.dev",
    version = "v1alpha1",
    kind = "MirroredService",
    namespaced,
    status = "MirroredServiceStatus",
    shortname = "msvc",
    printcolumn = r#"{"name":"Source","type":"string","jsonPath":".metadata.annotations.lbmirror\\.dev/source-cluster"}"#,
    printcolumn = r#"{"name":"Nodes","type":"string","priority":1,"jsonPath":".spec.nodeNames"}"#,
    printcolumn = r#"{"name":"First Node","type":"string","jsonPath":".spec.nodeNames[0]"}"#,
    printcolumn = r#"{"name":"Load Balancer IP","type":"string","jsonPath":".status.loadBalancerIP"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MirroredServiceSpec {
    /// Nodes backing the source Service, unique, in first-seen endpoint order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub node_names: Vec<String>,

    /// Ports copied from the source Service
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<MirroredServicePort>,
}

/// A port of the source Service.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MirroredServicePort {
    /// Port name, unique within the Service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// IP protocol (TCP, UDP or SCTP)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,

    /// Port exposed by the Service in both clusters
    pub port: i32,

    /// Node port allocated in the source cluster; the destination
    /// Service forwards to it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_port: Option<i32>,
}

/// Address feedback from the destination cluster.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct MirroredServiceStatus {
    /// Address assigned to the materialized Service; empty until assigned
    #[serde(rename = "loadBalancerIP", default)]
    pub load_balancer_ip: String,
}

impl MirroredService {
    /// Address recorded in status, empty when none has been assigned yet
    pub fn load_balancer_ip(&self) -> &str {
        self.status
            .as_ref()
            .map(|s| s.load_balancer_ip.as_str())
            .unwrap_or_default()
    }
}

impl MirroredServiceSpec {
    /// The node the destination Service selects. Only the first node is used.
    pub fn first_node(&self) -> Option<&str> {
        self.node_names.first().map(String::as_str)
    }
}
