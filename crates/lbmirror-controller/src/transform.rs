//! Pure data transformers between the three stages of the pipeline
//!
//! Source Endpoints + Service -> MirroredService spec -> destination Service spec,
//! plus the address extraction used for status feedback in the other
//! direction. Nothing here talks to a cluster.

use std::collections::{BTreeMap, HashSet};

use k8s_openapi::api::core::v1::{
    Endpoints, LoadBalancerIngress, LoadBalancerStatus, Service, ServicePort, ServiceSpec,
    ServiceStatus,
};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use lbmirror_common::crd::{MirroredServicePort, MirroredServiceSpec};
use lbmirror_common::{LOAD_BALANCER_TYPE, NODE_SELECTOR_LABEL};

/// Whether a Service is of the type that gets mirrored
pub fn is_load_balancer(svc: &Service) -> bool {
    service_type(svc) == Some(LOAD_BALANCER_TYPE)
}

/// Declared type of a Service, if any
pub fn service_type(svc: &Service) -> Option<&str> {
    svc.spec.as_ref().and_then(|s| s.type_.as_deref())
}

/// Unique node names of all endpoint addresses, in first-seen order.
///
/// Addresses without a node name (or with an empty one) are skipped.
pub fn collect_node_names(endpoints: &Endpoints) -> Vec<String> {
    let mut seen = HashSet::new();
    endpoints
        .subsets
        .iter()
        .flatten()
        .flat_map(|subset| subset.addresses.iter().flatten())
        .filter_map(|addr| addr.node_name.as_deref())
        .filter(|node| !node.is_empty())
        .filter(|node| seen.insert(*node))
        .map(str::to_string)
        .collect()
}

/// Ports of a source Service, as recorded on the mirror
pub fn mirror_ports(svc: &Service) -> Vec<MirroredServicePort> {
    svc.spec
        .iter()
        .flat_map(|spec| spec.ports.iter().flatten())
        .map(|p| MirroredServicePort {
            name: p.name.clone(),
            protocol: p.protocol.clone(),
            port: p.port,
            node_port: p.node_port,
        })
        .collect()
}

/// Desired MirroredService spec for a source Service and its Endpoints
pub fn desired_mirror_spec(svc: &Service, endpoints: &Endpoints) -> MirroredServiceSpec {
    MirroredServiceSpec {
        node_names: collect_node_names(endpoints),
        ports: mirror_ports(svc),
    }
}

/// Address from the first load balancer ingress entry, empty if none
pub fn load_balancer_ip(svc: &Service) -> String {
    svc.status
        .as_ref()
        .and_then(|s| s.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref())
        .and_then(|ingress| ingress.first())
        .and_then(|i| i.ip.clone())
        .unwrap_or_default()
}

/// Service status announcing `ip`; an empty address clears the ingress list
pub fn load_balancer_status(ip: &str) -> ServiceStatus {
    let ingress = if ip.is_empty() {
        vec![]
    } else {
        vec![LoadBalancerIngress {
            ip: Some(ip.to_string()),
            ..Default::default()
        }]
    };
    ServiceStatus {
        load_balancer: Some(LoadBalancerStatus {
            ingress: Some(ingress),
        }),
        ..Default::default()
    }
}

/// Desired destination Service spec for a mirror.
///
/// The selector names only the first node: a Service can select a single
/// pod-name value, so any further nodes are dropped. Each port forwards to the
/// node port allocated in the source cluster.
pub fn desired_target_spec(mirror: &MirroredServiceSpec) -> ServiceSpec {
    let selector = mirror.first_node().map(|node| {
        BTreeMap::from([(NODE_SELECTOR_LABEL.to_string(), node.to_string())])
    });

    let ports: Vec<ServicePort> = mirror
        .ports
        .iter()
        .map(|p| ServicePort {
            name: p.name.clone(),
            protocol: p.protocol.clone(),
            port: p.port,
            target_port: p.node_port.map(IntOrString::Int),
            ..Default::default()
        })
        .collect();

    ServiceSpec {
        type_: Some(LOAD_BALANCER_TYPE.to_string()),
        ports: if ports.is_empty() { None } else { Some(ports) },
        selector,
        ..Default::default()
    }
}

/// Merge a desired spec onto the spec the destination cluster currently holds.
///
/// Only `type`, `selector` and `ports` come from the mirror. Every other field
/// (cluster IP, session affinity, external traffic policy, IP families, ...) is
/// owned by the destination cluster's allocators and defaulting, so it is
/// taken from `current`. When the port count is unchanged, each port keeps
/// the node port the destination cluster allocated for it.
pub fn merge_target_spec(desired: ServiceSpec, current: &ServiceSpec) -> ServiceSpec {
    let mut ports = desired.ports;
    let current_ports = current.ports.as_deref().unwrap_or_default();
    if let Some(ports) = ports.as_mut() {
        if ports.len() == current_ports.len() {
            for (port, existing) in ports.iter_mut().zip(current_ports) {
                port.node_port = existing.node_port;
                port.app_protocol = existing.app_protocol.clone();
                if port.protocol.is_none() {
                    port.protocol = existing.protocol.clone();
                }
                if port.target_port.is_none() {
                    port.target_port = existing.target_port.clone();
                }
            }
        }
    }

    ServiceSpec {
        type_: desired.type_,
        selector: desired.selector,
        ports,
        ..current.clone()
    }
}
