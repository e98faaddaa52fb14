//! Inner reconciler: source cluster Service -> MirroredService
//!
//! Keeps one MirroredService in the destination namespace for every
//! LoadBalancer Service of the source cluster that has Endpoints, and copies
//! the address the destination cluster assigned back onto the source
//! Service's status.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Service;
use kube::ResourceExt;
use tracing::{debug, info, instrument, warn};

use lbmirror_common::crd::{MirroredService, MirroredServiceSpec};
use lbmirror_common::naming::{is_skipped, mirror_name};
use lbmirror_common::{
    Error, ObjectKey, MANAGED_BY_LABEL, MANAGED_BY_VALUE, SOURCE_CLUSTER_ANNOTATION,
    SOURCE_NAMESPACE_ANNOTATION, SOURCE_NAME_ANNOTATION,
};

use crate::client::{DestinationClusterClient, SourceClusterClient};
use crate::transform::{desired_mirror_spec, is_load_balancer, load_balancer_ip, load_balancer_status};

/// Shared state for inner reconcile passes
pub struct InnerContext {
    /// Cluster that owns the original Services
    pub source: Arc<dyn SourceClusterClient>,
    /// Cluster that holds the MirroredService objects
    pub destination: Arc<dyn DestinationClusterClient>,
    /// Namespace in the destination cluster where mirrors are written
    pub target_namespace: String,
    /// Name recorded on mirrors to identify the source cluster
    pub cluster_name: String,
}

impl InnerContext {
    /// Create a new inner context
    pub fn new(
        source: Arc<dyn SourceClusterClient>,
        destination: Arc<dyn DestinationClusterClient>,
        target_namespace: impl Into<String>,
        cluster_name: impl Into<String>,
    ) -> Self {
        Self {
            source,
            destination,
            target_namespace: target_namespace.into(),
            cluster_name: cluster_name.into(),
        }
    }

    /// Key of the mirror for a source Service
    pub fn mirror_key(&self, source: &ObjectKey) -> ObjectKey {
        ObjectKey::new(
            &self.target_namespace,
            mirror_name(&source.namespace, &source.name),
        )
    }
}

/// What an inner reconcile pass did
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InnerOutcome {
    /// Key is on the skip list; nothing was read or written
    Skipped,
    /// Source is gone or not mirrored and the mirror was deleted
    MirrorDeleted,
    /// A new mirror was created
    MirrorCreated,
    /// The mirror spec was brought up to date
    MirrorUpdated,
    /// The mirror's address was copied onto the source Service status
    SourceStatusUpdated,
    /// A mirror with this name was written for another source cluster and
    /// was left alone
    ForeignMirror,
    /// Everything already matched
    Unchanged,
}

/// Reconcile one source Service key.
///
/// At most one write happens per pass: either to the mirror in the destination
/// cluster or to the source Service status. A status change that coincides
/// with a spec change is picked up by the pass the spec write triggers.
#[instrument(skip(key, ctx), fields(key = %key))]
pub async fn reconcile(key: ObjectKey, ctx: Arc<InnerContext>) -> Result<InnerOutcome, Error> {
    if is_skipped(&key) {
        return Ok(InnerOutcome::Skipped);
    }

    let mirror_key = ctx.mirror_key(&key);

    let Some(endpoints) = ctx.source.get_endpoints(&key).await? else {
        debug!("endpoints not found");
        return delete_mirror(&ctx, &mirror_key).await;
    };

    let service = match ctx.source.get_service(&key).await? {
        Some(svc) if is_load_balancer(&svc) => svc,
        Some(_) => {
            debug!("service is not a load balancer");
            return delete_mirror(&ctx, &mirror_key).await;
        }
        None => {
            debug!("service not found");
            return delete_mirror(&ctx, &mirror_key).await;
        }
    };

    let desired = desired_mirror_spec(&service, &endpoints);

    let Some(existing) = ctx.destination.get_mirror(&mirror_key).await? else {
        let mirror = build_mirror(&key, &mirror_key, &ctx.cluster_name, desired);
        ctx.destination.create_mirror(&mirror).await?;
        info!(mirror = %mirror_key, "created mirror");
        return Ok(InnerOutcome::MirrorCreated);
    };

    if let Some(owner) = foreign_owner(&existing, &ctx.cluster_name) {
        warn!(mirror = %mirror_key, owner, "mirror belongs to another source cluster, leaving it alone");
        return Ok(InnerOutcome::ForeignMirror);
    }

    if existing.spec != desired {
        debug!(
            mirror = %mirror_key,
            old = %serde_json::to_string(&existing.spec).unwrap_or_default(),
            new = %serde_json::to_string(&desired).unwrap_or_default(),
            "mirror spec differs"
        );
        let mut updated = existing;
        updated.spec = desired;
        ctx.destination.update_mirror(&updated).await?;
        info!(mirror = %mirror_key, "updated mirror");
        return Ok(InnerOutcome::MirrorUpdated);
    }

    sync_source_status(&ctx, &key, &service, &existing).await
}

async fn sync_source_status(
    ctx: &InnerContext,
    key: &ObjectKey,
    service: &Service,
    mirror: &MirroredService,
) -> Result<InnerOutcome, Error> {
    let assigned = mirror.load_balancer_ip();
    let current = load_balancer_ip(service);
    if assigned == current {
        return Ok(InnerOutcome::Unchanged);
    }

    ctx.source
        .update_service_status(key, &load_balancer_status(assigned))
        .await?;
    info!(old_ip = %current, new_ip = %assigned, "updated source service address");
    Ok(InnerOutcome::SourceStatusUpdated)
}

/// Source cluster recorded on `mirror`, when it is not `cluster_name`.
/// Mirrors without the annotation count as ours.
fn foreign_owner<'a>(mirror: &'a MirroredService, cluster_name: &str) -> Option<&'a str> {
    mirror
        .annotations()
        .get(SOURCE_CLUSTER_ANNOTATION)
        .map(String::as_str)
        .filter(|owner| *owner != cluster_name)
}

async fn delete_mirror(ctx: &InnerContext, mirror_key: &ObjectKey) -> Result<InnerOutcome, Error> {
    let Some(existing) = ctx.destination.get_mirror(mirror_key).await? else {
        return Ok(InnerOutcome::Unchanged);
    };
    if let Some(owner) = foreign_owner(&existing, &ctx.cluster_name) {
        debug!(mirror = %mirror_key, owner, "not deleting mirror of another source cluster");
        return Ok(InnerOutcome::ForeignMirror);
    }
    if !ctx.destination.delete_mirror(mirror_key).await? {
        return Ok(InnerOutcome::Unchanged);
    }
    info!(mirror = %mirror_key, "deleted mirror");
    Ok(InnerOutcome::MirrorDeleted)
}

fn build_mirror(
    source: &ObjectKey,
    mirror_key: &ObjectKey,
    cluster_name: &str,
    spec: MirroredServiceSpec,
) -> MirroredService {
    let mut mirror = MirroredService::new(&mirror_key.name, spec);
    mirror.metadata.namespace = Some(mirror_key.namespace.clone());
    mirror
        .labels_mut()
        .insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string());
    mirror.annotations_mut().extend(BTreeMap::from([
        (
            SOURCE_NAMESPACE_ANNOTATION.to_string(),
            source.namespace.clone(),
        ),
        (SOURCE_NAME_ANNOTATION.to_string(), source.name.clone()),
        (SOURCE_CLUSTER_ANNOTATION.to_string(), cluster_name.to_string()),
    ]));
    mirror
}
