//! Controller runner - wires watches to the work queue for each loop
//!
//! kube-runtime's `Controller` does not reconcile objects that are gone,
//! but both loops treat deletion as a trigger. So each loop merges plain
//! watcher streams into keys and feeds them to the keyed work queue.

use std::fmt::Debug;
use std::future::ready;
use std::sync::Arc;

use futures::stream::{self, BoxStream};
use futures::{Stream, StreamExt};
use k8s_openapi::api::core::v1::{Endpoints, Service};
use kube::runtime::watcher::{self, Config as WatcherConfig, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tracing::{info, warn};

use lbmirror_common::crd::MirroredService;
use lbmirror_common::kube_utils::{ClusterConnection, WATCH_TIMEOUT_SECS};
use lbmirror_common::naming::source_key;
use lbmirror_common::{ObjectKey, MANAGED_BY_LABEL, MANAGED_BY_VALUE, SOURCE_CLUSTER_ANNOTATION};
use lbmirror_controller::{
    inner, outer, InnerContext, KubeDestinationClient, KubeSourceClient, OuterContext,
};

use crate::queue::{run_queue, QueueConfig};

fn watcher_config() -> WatcherConfig {
    WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS)
}

fn managed_watcher_config() -> WatcherConfig {
    watcher_config().labels(&format!("{MANAGED_BY_LABEL}={MANAGED_BY_VALUE}"))
}

/// The object an event is about, for every event that can change desired state
pub fn event_object<K>(event: Event<K>) -> Option<K> {
    match event {
        Event::Apply(obj) | Event::Delete(obj) | Event::InitApply(obj) => Some(obj),
        Event::Init | Event::InitDone => None,
    }
}

/// Every object added, changed or deleted, as seen by a restarting watch
pub fn object_events<K>(
    api: Api<K>,
    config: WatcherConfig,
    kind: &'static str,
) -> impl Stream<Item = K> + Send
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
{
    watcher::watcher(api, config)
        .default_backoff()
        .filter_map(move |event| {
            ready(match event {
                Ok(event) => event_object(event),
                Err(e) => {
                    warn!(kind, error = %e, "watch error");
                    None
                }
            })
        })
}

/// Key of the source Service a mirror event should trigger, if the mirror
/// was written for `cluster_name`
pub fn inner_key_for_mirror(mirror: &MirroredService, cluster_name: &str) -> Option<ObjectKey> {
    let owner = mirror.annotations().get(SOURCE_CLUSTER_ANNOTATION)?;
    if owner != cluster_name {
        return None;
    }
    source_key(mirror)
}

fn keys<K, S>(objects: S) -> BoxStream<'static, ObjectKey>
where
    K: ResourceExt,
    S: Stream<Item = K> + Send + 'static,
{
    objects
        .filter_map(|obj| ready(ObjectKey::from_resource(&obj)))
        .boxed()
}

/// Run the inner loop until `shutdown` completes
pub async fn run_inner(
    source: ClusterConnection,
    destination: ClusterConnection,
    cluster_name: String,
    config: QueueConfig,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) {
    let target_namespace = destination.namespace.clone();
    info!(
        cluster = %cluster_name,
        namespace = %target_namespace,
        "starting inner controller"
    );

    let ctx = Arc::new(InnerContext::new(
        Arc::new(KubeSourceClient::new(source.client.clone())),
        Arc::new(KubeDestinationClient::new(destination.client.clone())),
        target_namespace.clone(),
        cluster_name.clone(),
    ));

    let endpoints = object_events(
        Api::<Endpoints>::all(source.client.clone()),
        watcher_config(),
        "Endpoints",
    );
    let services = object_events(
        Api::<Service>::all(source.client),
        watcher_config(),
        "Service",
    );
    let mirrors = object_events(
        Api::<MirroredService>::namespaced(destination.client, &target_namespace),
        managed_watcher_config(),
        "MirroredService",
    )
    .filter_map(move |mirror| ready(inner_key_for_mirror(&mirror, &cluster_name)))
    .boxed();

    let triggers =
        stream::select_all([keys(endpoints), keys(services), mirrors]).take_until(shutdown);

    run_queue("inner", triggers, config, move |key| {
        inner::reconcile(key, ctx.clone())
    })
    .await;
}

/// Run the outer loop until `shutdown` completes
pub async fn run_outer(
    destination: ClusterConnection,
    config: QueueConfig,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) {
    let namespace = destination.namespace.clone();
    info!(namespace = %namespace, "starting outer controller");

    let ctx = Arc::new(OuterContext::new(
        Arc::new(KubeDestinationClient::new(destination.client.clone())),
        namespace.clone(),
    ));

    let mirrors = object_events(
        Api::<MirroredService>::namespaced(destination.client.clone(), &namespace),
        watcher_config(),
        "MirroredService",
    );
    // only Services this loop created; anything else in the namespace is not ours
    let services = object_events(
        Api::<Service>::namespaced(destination.client, &namespace),
        managed_watcher_config(),
        "Service",
    );

    let triggers = stream::select_all([keys(mirrors), keys(services)]).take_until(shutdown);

    run_queue("outer", triggers, config, move |key| {
        outer::reconcile(key, ctx.clone())
    })
    .await;
}

/// Wait for SIGINT or SIGTERM
pub async fn shutdown_signal() {
    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
}
