//! Shared Kubernetes utilities using kube-rs

use std::time::Duration;

use kube::api::{Api, Patch, PatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tracing::debug;

use crate::{Error, FIELD_MANAGER};

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Watcher timeout (seconds) - must be less than the client read timeout so
/// the API server closes idle watches before the client gives up on them
pub const WATCH_TIMEOUT_SECS: u32 = 25;

/// A client together with the namespace its configuration points at
#[derive(Clone)]
pub struct ClusterConnection {
    /// Client for the cluster
    pub client: Client,
    /// Namespace from the service account or kubeconfig context
    pub namespace: String,
}

impl std::fmt::Debug for ClusterConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterConnection")
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

/// Apply default timeouts to a config and build a client from it
pub fn connect(cluster: &str, mut config: Config) -> Result<ClusterConnection, Error> {
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);
    let namespace = config.default_namespace.clone();
    let server = config.cluster_url.to_string();
    let client = Client::try_from(config)
        .map_err(|e| Error::config(cluster, format!("failed to create client: {}", e)))?;
    debug!(cluster, server = %server, namespace = %namespace, "created client");
    Ok(ClusterConnection { client, namespace })
}

/// Connect using the in-cluster service account
pub fn connect_in_cluster(cluster: &str) -> Result<ClusterConnection, Error> {
    let config = Config::incluster().map_err(|e| {
        Error::config(cluster, format!("failed to load in-cluster config: {}", e))
    })?;
    connect(cluster, config)
}

/// Connect using a named context of the default kubeconfig
pub async fn connect_context(context: &str) -> Result<ClusterConnection, Error> {
    let options = KubeConfigOptions {
        context: Some(context.to_string()),
        ..Default::default()
    };
    let config = Config::from_kubeconfig(&options)
        .await
        .map_err(|e| Error::config(context, format!("failed to load kubeconfig: {}", e)))?;
    connect(context, config)
}

/// Connect using an in-memory kubeconfig
pub async fn connect_kubeconfig(
    cluster: &str,
    kubeconfig: Kubeconfig,
) -> Result<ClusterConnection, Error> {
    let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| Error::config(cluster, format!("failed to load kubeconfig: {}", e)))?;
    connect(cluster, config)
}

/// Get a namespaced object, mapping 404 to `None`
pub async fn get_opt<T>(client: &Client, namespace: &str, name: &str) -> Result<Option<T>, Error>
where
    T: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>
        + Clone
        + serde::de::DeserializeOwned
        + std::fmt::Debug,
    <T as kube::Resource>::DynamicType: Default,
{
    let api: Api<T> = Api::namespaced(client.clone(), namespace);
    Ok(api.get_opt(name).await?)
}

/// Patch the status sub-resource of a namespaced Kubernetes resource.
///
/// Serializes `status` into `{ "status": <status> }` and applies it via
/// merge-patch.
pub async fn patch_resource_status<T>(
    client: &Client,
    name: &str,
    namespace: &str,
    status: &impl serde::Serialize,
) -> Result<(), Error>
where
    T: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>
        + Clone
        + serde::de::DeserializeOwned
        + std::fmt::Debug,
    <T as kube::Resource>::DynamicType: Default,
{
    let api: Api<T> = Api::namespaced(client.clone(), namespace);
    let patch = serde_json::json!({ "status": status });
    api.patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

/// Delete a namespaced object, treating 404 as success.
///
/// Returns whether an object was actually deleted.
pub async fn delete_if_exists<T>(client: &Client, namespace: &str, name: &str) -> Result<bool, Error>
where
    T: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>
        + Clone
        + serde::de::DeserializeOwned
        + std::fmt::Debug,
    <T as kube::Resource>::DynamicType: Default,
{
    let api: Api<T> = Api::namespaced(client.clone(), namespace);
    match api.delete(name, &Default::default()).await {
        Ok(_) => Ok(true),
        Err(e) if crate::error::is_not_found(&e) => Ok(false),
        Err(e) => Err(e.into()),
    }
}
