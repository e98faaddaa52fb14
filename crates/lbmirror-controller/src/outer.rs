//! Outer reconciler: MirroredService -> destination Service
//!
//! Materializes a LoadBalancer Service for every MirroredService in the
//! destination namespace and copies the address the destination cluster
//! assigned to it back onto the mirror's status.

use std::sync::Arc;

use k8s_openapi::api::core::v1::{Service, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tracing::{debug, info, instrument, warn};

use lbmirror_common::crd::{MirroredService, MirroredServiceStatus};
use lbmirror_common::naming::is_skipped;
use lbmirror_common::{Error, ObjectKey, MANAGED_BY_LABEL, MANAGED_BY_VALUE, MIRROR_ANNOTATION};

use crate::client::DestinationClusterClient;
use crate::transform::{desired_target_spec, is_load_balancer, load_balancer_ip, merge_target_spec};

/// Shared state for outer reconcile passes
pub struct OuterContext {
    /// Cluster that holds both the mirrors and the materialized Services
    pub destination: Arc<dyn DestinationClusterClient>,
    /// Namespace the materialized Services are written to
    pub target_namespace: String,
}

impl OuterContext {
    /// Create a new outer context
    pub fn new(
        destination: Arc<dyn DestinationClusterClient>,
        target_namespace: impl Into<String>,
    ) -> Self {
        Self {
            destination,
            target_namespace: target_namespace.into(),
        }
    }
}

/// What an outer reconcile pass did
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OuterOutcome {
    /// Key is on the skip list; nothing was read or written
    Skipped,
    /// A Service of another type holds the target name; left alone
    ForeignService,
    /// The mirror is gone and the target Service was deleted
    TargetDeleted,
    /// A new target Service was created
    TargetCreated,
    /// The mirror status and/or the target spec was written
    Synced {
        /// Address copied onto the mirror status
        status_updated: bool,
        /// Target Service spec replaced
        spec_updated: bool,
    },
    /// Everything already matched
    Unchanged,
}

/// Reconcile one MirroredService key.
///
/// The status write (target address onto the mirror) and the spec write
/// (mirror onto the target) do not depend on each other. Both are attempted;
/// if either fails the first error is returned so the key is retried.
#[instrument(skip(key, ctx), fields(key = %key))]
pub async fn reconcile(key: ObjectKey, ctx: Arc<OuterContext>) -> Result<OuterOutcome, Error> {
    if is_skipped(&key) {
        return Ok(OuterOutcome::Skipped);
    }

    let target_key = ObjectKey::new(&ctx.target_namespace, &key.name);
    let target = ctx.destination.get_service(&target_key).await?;

    if let Some(svc) = target.as_ref().filter(|svc| !is_load_balancer(svc)) {
        warn!(
            service = %target_key,
            type_ = svc.spec.as_ref().and_then(|s| s.type_.as_deref()).unwrap_or_default(),
            "target name is held by a service that is not a load balancer, leaving it alone"
        );
        return Ok(OuterOutcome::ForeignService);
    }

    let Some(mirror) = ctx.destination.get_mirror(&key).await? else {
        if target.is_none() {
            return Ok(OuterOutcome::Unchanged);
        }
        if !ctx.destination.delete_service(&target_key).await? {
            return Ok(OuterOutcome::Unchanged);
        }
        info!(service = %target_key, "deleted target service");
        return Ok(OuterOutcome::TargetDeleted);
    };

    let desired = desired_target_spec(&mirror.spec);

    let Some(target) = target else {
        let service = build_target(&target_key, &key, desired);
        ctx.destination.create_service(&service).await?;
        info!(service = %target_key, "created target service");
        return Ok(OuterOutcome::TargetCreated);
    };

    let current = target.spec.clone().unwrap_or_default();
    let merged = merge_target_spec(desired, &current);
    let should_update = merged != current;

    let status_result = sync_mirror_status(&ctx, &key, &mirror, &target).await;
    let spec_result = if should_update {
        debug!(
            service = %target_key,
            old = %serde_json::to_string(&current).unwrap_or_default(),
            new = %serde_json::to_string(&merged).unwrap_or_default(),
            "target spec differs"
        );
        update_target(&ctx, target, merged).await.map(|()| true)
    } else {
        Ok(false)
    };

    let status_updated = status_result?;
    let spec_updated = spec_result?;
    if status_updated || spec_updated {
        Ok(OuterOutcome::Synced {
            status_updated,
            spec_updated,
        })
    } else {
        Ok(OuterOutcome::Unchanged)
    }
}

async fn sync_mirror_status(
    ctx: &OuterContext,
    key: &ObjectKey,
    mirror: &MirroredService,
    target: &Service,
) -> Result<bool, Error> {
    let assigned = load_balancer_ip(target);
    if mirror.load_balancer_ip() == assigned {
        return Ok(false);
    }

    let status = MirroredServiceStatus {
        load_balancer_ip: assigned,
    };
    match ctx.destination.update_mirror_status(key, &status).await {
        Ok(()) => {
            info!(
                old_ip = %mirror.load_balancer_ip(),
                new_ip = %status.load_balancer_ip,
                "updated mirror address"
            );
            Ok(true)
        }
        Err(e) => {
            warn!(error = %e, "failed to update mirror status");
            Err(e)
        }
    }
}

async fn update_target(ctx: &OuterContext, target: Service, spec: ServiceSpec) -> Result<(), Error> {
    let mut updated = target;
    updated.spec = Some(spec);
    ctx.destination.update_service(&updated).await?;
    info!("updated target service");
    Ok(())
}

fn build_target(target_key: &ObjectKey, mirror_key: &ObjectKey, spec: ServiceSpec) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(target_key.name.clone()),
            namespace: Some(target_key.namespace.clone()),
            labels: Some(
                [(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string())].into(),
            ),
            annotations: Some([(MIRROR_ANNOTATION.to_string(), mirror_key.to_string())].into()),
            ..Default::default()
        },
        spec: Some(spec),
        status: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockDestinationClusterClient;
    use crate::transform::load_balancer_status;
    use k8s_openapi::api::core::v1::ServicePort;
    use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
    use kube::ResourceExt;
    use lbmirror_common::crd::{MirroredServicePort, MirroredServiceSpec};
    use lbmirror_common::NODE_SELECTOR_LABEL;
    use std::sync::Mutex;

    const TARGET_NS: &str = "vms";
    const NAME: &str = "default-web-0123456789abcdef";

    fn key() -> ObjectKey {
        ObjectKey::new(TARGET_NS, NAME)
    }

    fn mirror(nodes: &[&str], ip: &str) -> MirroredService {
        let mut mirror = MirroredService::new(
            NAME,
            MirroredServiceSpec {
                node_names: nodes.iter().map(|n| n.to_string()).collect(),
                ports: vec![MirroredServicePort {
                    name: Some("http".to_string()),
                    protocol: Some("TCP".to_string()),
                    port: 80,
                    node_port: Some(31080),
                }],
            },
        );
        mirror.metadata.namespace = Some(TARGET_NS.to_string());
        mirror.status = Some(MirroredServiceStatus {
            load_balancer_ip: ip.to_string(),
        });
        mirror
    }

    /// A target Service as the destination cluster returns it after creation:
    /// cluster IP and node port allocated, defaults filled in
    fn allocated_target(node: &str, ip: Option<&str>) -> Service {
        let mut spec = desired_target_spec(&mirror(&[node], "").spec);
        spec.cluster_ip = Some("10.96.0.7".to_string());
        spec.cluster_ips = Some(vec!["10.96.0.7".to_string()]);
        spec.session_affinity = Some("None".to_string());
        spec.external_traffic_policy = Some("Cluster".to_string());
        if let Some(ports) = spec.ports.as_mut() {
            ports[0].node_port = Some(30555);
        }

        let mut svc = build_target(&key(), &key(), spec);
        svc.metadata.resource_version = Some("7".to_string());
        svc.status = ip.map(load_balancer_status);
        svc
    }

    fn context(destination: MockDestinationClusterClient) -> Arc<OuterContext> {
        Arc::new(OuterContext::new(Arc::new(destination), TARGET_NS))
    }

    fn api_error(code: u16) -> Error {
        Error::from(kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "injected".to_string(),
            reason: String::new(),
            code,
        }))
    }

    // =========================================================================
    // Skip list and foreign services
    // =========================================================================

    #[tokio::test]
    async fn control_plane_keys_are_never_touched() {
        let ctx = context(MockDestinationClusterClient::new());
        let outcome = reconcile(ObjectKey::new("kube-system", "kube-scheduler"), ctx)
            .await
            .unwrap();
        assert_eq!(outcome, OuterOutcome::Skipped);
    }

    #[tokio::test]
    async fn non_load_balancer_target_is_left_alone() {
        let mut destination = MockDestinationClusterClient::new();
        destination.expect_get_service().returning(|_| {
            Ok(Some(Service {
                spec: Some(ServiceSpec {
                    type_: Some("ClusterIP".to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            }))
        });
        destination.expect_get_mirror().never();
        destination.expect_delete_service().never();
        destination.expect_update_service().never();

        let outcome = reconcile(key(), context(destination)).await.unwrap();
        assert_eq!(outcome, OuterOutcome::ForeignService);
    }

    // =========================================================================
    // Deletion
    // =========================================================================

    #[tokio::test]
    async fn missing_mirror_deletes_the_target() {
        let mut destination = MockDestinationClusterClient::new();
        destination
            .expect_get_service()
            .returning(|_| Ok(Some(allocated_target("vm-0", None))));
        destination.expect_get_mirror().returning(|_| Ok(None));
        destination
            .expect_delete_service()
            .withf(|k| *k == key())
            .times(1)
            .returning(|_| Ok(true));

        let outcome = reconcile(key(), context(destination)).await.unwrap();
        assert_eq!(outcome, OuterOutcome::TargetDeleted);
    }

    #[tokio::test]
    async fn target_deleted_concurrently_reports_unchanged() {
        let mut destination = MockDestinationClusterClient::new();
        destination
            .expect_get_service()
            .returning(|_| Ok(Some(allocated_target("vm-0", None))));
        destination.expect_get_mirror().returning(|_| Ok(None));
        destination
            .expect_delete_service()
            .times(1)
            .returning(|_| Ok(false));

        let outcome = reconcile(key(), context(destination)).await.unwrap();
        assert_eq!(outcome, OuterOutcome::Unchanged);
    }

    #[tokio::test]
    async fn nothing_to_delete_is_a_no_op() {
        let mut destination = MockDestinationClusterClient::new();
        destination.expect_get_service().returning(|_| Ok(None));
        destination.expect_get_mirror().returning(|_| Ok(None));
        destination.expect_delete_service().never();

        let outcome = reconcile(key(), context(destination)).await.unwrap();
        assert_eq!(outcome, OuterOutcome::Unchanged);
    }

    // =========================================================================
    // Creation
    // =========================================================================

    #[tokio::test]
    async fn new_mirror_gets_a_target_selecting_only_the_first_node() {
        let mut destination = MockDestinationClusterClient::new();
        destination.expect_get_service().returning(|_| Ok(None));
        destination
            .expect_get_mirror()
            .returning(|_| Ok(Some(mirror(&["node-a", "node-b"], ""))));

        let created = Arc::new(Mutex::new(None));
        let created_clone = created.clone();
        destination
            .expect_create_service()
            .times(1)
            .returning(move |svc| {
                *created_clone.lock().unwrap() = Some(svc.clone());
                Ok(svc.clone())
            });

        let outcome = reconcile(key(), context(destination)).await.unwrap();
        assert_eq!(outcome, OuterOutcome::TargetCreated);

        let svc = created.lock().unwrap().take().expect("service created");
        assert_eq!(svc.name_any(), NAME);
        assert_eq!(svc.namespace().as_deref(), Some(TARGET_NS));
        assert_eq!(
            svc.annotations().get(MIRROR_ANNOTATION),
            Some(&key().to_string())
        );

        let spec = svc.spec.expect("spec");
        assert_eq!(spec.type_.as_deref(), Some("LoadBalancer"));
        let selector = spec.selector.expect("selector");
        assert_eq!(
            selector.get(NODE_SELECTOR_LABEL).map(String::as_str),
            Some("node-a")
        );
        assert!(!selector.values().any(|v| v == "node-b"));
        let ports: Vec<ServicePort> = spec.ports.expect("ports");
        assert_eq!(ports[0].target_port, Some(IntOrString::Int(31080)));
    }

    // =========================================================================
    // Update and merge
    // =========================================================================

    #[tokio::test]
    async fn update_preserves_cluster_ip() {
        let mut destination = MockDestinationClusterClient::new();
        destination
            .expect_get_service()
            .returning(|_| Ok(Some(allocated_target("vm-0", None))));
        destination
            .expect_get_mirror()
            .returning(|_| Ok(Some(mirror(&["vm-1"], ""))));
        destination.expect_update_mirror_status().never();

        let written = Arc::new(Mutex::new(None));
        let written_clone = written.clone();
        destination
            .expect_update_service()
            .times(1)
            .returning(move |svc| {
                *written_clone.lock().unwrap() = Some(svc.clone());
                Ok(svc.clone())
            });

        let outcome = reconcile(key(), context(destination)).await.unwrap();
        assert_eq!(
            outcome,
            OuterOutcome::Synced {
                status_updated: false,
                spec_updated: true
            }
        );

        let svc = written.lock().unwrap().take().expect("service updated");
        assert_eq!(svc.metadata.resource_version.as_deref(), Some("7"));
        let spec = svc.spec.expect("spec");
        assert_eq!(spec.cluster_ip.as_deref(), Some("10.96.0.7"));
        assert_eq!(spec.session_affinity.as_deref(), Some("None"));
        assert_eq!(spec.external_traffic_policy.as_deref(), Some("Cluster"));
        assert_eq!(spec.ports.expect("ports")[0].node_port, Some(30555));
        assert_eq!(
            spec.selector
                .expect("selector")
                .get(NODE_SELECTOR_LABEL)
                .map(String::as_str),
            Some("vm-1")
        );
    }

    #[tokio::test]
    async fn allocated_fields_alone_do_not_trigger_an_update() {
        let mut destination = MockDestinationClusterClient::new();
        destination
            .expect_get_service()
            .returning(|_| Ok(Some(allocated_target("vm-0", Some("203.0.113.5")))));
        destination
            .expect_get_mirror()
            .returning(|_| Ok(Some(mirror(&["vm-0"], "203.0.113.5"))));
        destination.expect_update_service().never();
        destination.expect_update_mirror_status().never();

        let outcome = reconcile(key(), context(destination)).await.unwrap();
        assert_eq!(outcome, OuterOutcome::Unchanged);
    }

    // =========================================================================
    // Address feedback
    // =========================================================================

    #[tokio::test]
    async fn assigned_address_is_copied_to_mirror_status() {
        let mut destination = MockDestinationClusterClient::new();
        destination
            .expect_get_service()
            .returning(|_| Ok(Some(allocated_target("vm-0", Some("203.0.113.5")))));
        destination
            .expect_get_mirror()
            .returning(|_| Ok(Some(mirror(&["vm-0"], ""))));
        destination
            .expect_update_mirror_status()
            .withf(|k, status| *k == key() && status.load_balancer_ip == "203.0.113.5")
            .times(1)
            .returning(|_, _| Ok(()));
        destination.expect_update_service().never();

        let outcome = reconcile(key(), context(destination)).await.unwrap();
        assert_eq!(
            outcome,
            OuterOutcome::Synced {
                status_updated: true,
                spec_updated: false
            }
        );
    }

    #[tokio::test]
    async fn failed_status_write_does_not_skip_the_spec_write() {
        let mut destination = MockDestinationClusterClient::new();
        destination
            .expect_get_service()
            .returning(|_| Ok(Some(allocated_target("vm-0", Some("203.0.113.5")))));
        destination
            .expect_get_mirror()
            .returning(|_| Ok(Some(mirror(&["vm-1"], ""))));
        destination
            .expect_update_mirror_status()
            .times(1)
            .returning(|_, _| Err(api_error(503)));
        destination
            .expect_update_service()
            .times(1)
            .returning(|svc| Ok(svc.clone()));

        let err = reconcile(key(), context(destination)).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn failed_spec_write_still_records_the_address() {
        let mut destination = MockDestinationClusterClient::new();
        destination
            .expect_get_service()
            .returning(|_| Ok(Some(allocated_target("vm-0", Some("203.0.113.5")))));
        destination
            .expect_get_mirror()
            .returning(|_| Ok(Some(mirror(&["vm-1"], ""))));
        destination
            .expect_update_mirror_status()
            .times(1)
            .returning(|_, _| Ok(()));
        destination
            .expect_update_service()
            .times(1)
            .returning(|_| Err(api_error(409)));

        let err = reconcile(key(), context(destination)).await.unwrap_err();
        assert!(matches!(err, Error::Kube { .. }));
    }
}
