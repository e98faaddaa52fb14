//! `publish-config`: hand a kubeconfig to the destination cluster
//!
//! The kubeconfig is stored as Secret `config` under key `admin.conf` in the
//! destination namespace, where workloads that need to reach the source
//! cluster can mount it. Any previous Secret is deleted first.

use std::collections::BTreeMap;
use std::path::Path;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::api::{Api, PostParams};
use kube::config::Kubeconfig;
use kube::Client;
use tracing::info;

use lbmirror_common::kube_utils::delete_if_exists;
use lbmirror_common::{Error, FIELD_MANAGER, MANAGED_BY_LABEL, MANAGED_BY_VALUE};

/// Name of the published Secret
pub const CONFIG_SECRET_NAME: &str = "config";
/// Key of the kubeconfig inside the Secret
pub const CONFIG_SECRET_KEY: &str = "admin.conf";

/// Read a kubeconfig file, rejecting files that do not parse as one
pub async fn read_kubeconfig(path: &Path) -> Result<Vec<u8>, Error> {
    let contents = tokio::fs::read(path).await.map_err(|e| {
        Error::config(
            path.display().to_string(),
            format!("failed to read kubeconfig: {}", e),
        )
    })?;

    let text = std::str::from_utf8(&contents).map_err(|e| {
        Error::serialization_for_kind("Kubeconfig", format!("{}: {}", path.display(), e))
    })?;
    Kubeconfig::from_yaml(text).map_err(|e| {
        Error::serialization_for_kind("Kubeconfig", format!("{}: {}", path.display(), e))
    })?;

    Ok(contents)
}

/// The Secret carrying a kubeconfig
pub fn build_config_secret(namespace: &str, kubeconfig: Vec<u8>) -> Secret {
    let mut secret = Secret {
        data: Some(BTreeMap::from([(
            CONFIG_SECRET_KEY.to_string(),
            ByteString(kubeconfig),
        )])),
        ..Default::default()
    };
    secret.metadata.name = Some(CONFIG_SECRET_NAME.to_string());
    secret.metadata.namespace = Some(namespace.to_string());
    secret.metadata.labels = Some(BTreeMap::from([(
        MANAGED_BY_LABEL.to_string(),
        MANAGED_BY_VALUE.to_string(),
    )]));
    secret
}

/// Replace the config Secret in `namespace` with the kubeconfig at `path`
pub async fn publish_config(client: &Client, namespace: &str, path: &Path) -> Result<(), Error> {
    let kubeconfig = read_kubeconfig(path).await?;

    if delete_if_exists::<Secret>(client, namespace, CONFIG_SECRET_NAME).await? {
        info!(namespace, secret = CONFIG_SECRET_NAME, "deleted previous config secret");
    }

    let api: Api<Secret> = Api::namespaced(client.clone(), namespace);
    let params = PostParams {
        field_manager: Some(FIELD_MANAGER.to_string()),
        ..Default::default()
    };
    api.create(&params, &build_config_secret(namespace, kubeconfig))
        .await?;

    info!(namespace, secret = CONFIG_SECRET_NAME, path = %path.display(), "published config");
    Ok(())
}
