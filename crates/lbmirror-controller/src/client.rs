//! Cluster client seams
//!
//! The reconcilers never hold a `kube::Client` directly. They talk to each
//! cluster through one of the traits below so that tests can swap in mocks or
//! an in-memory fake.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Endpoints, Service, ServiceStatus};
use kube::api::{Api, PostParams};
use kube::{Client, ResourceExt};

#[cfg(test)]
use mockall::automock;

use lbmirror_common::crd::{MirroredService, MirroredServiceStatus};
use lbmirror_common::kube_utils::{delete_if_exists, get_opt, patch_resource_status};
use lbmirror_common::{Error, ObjectKey, FIELD_MANAGER};

/// Operations against the cluster that owns the original Services
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SourceClusterClient: Send + Sync {
    /// Get the Endpoints object for a key, `None` if it does not exist
    async fn get_endpoints(&self, key: &ObjectKey) -> Result<Option<Endpoints>, Error>;

    /// Get the Service for a key, `None` if it does not exist
    async fn get_service(&self, key: &ObjectKey) -> Result<Option<Service>, Error>;

    /// Replace the load balancer part of a Service's status
    async fn update_service_status(
        &self,
        key: &ObjectKey,
        status: &ServiceStatus,
    ) -> Result<(), Error>;
}

/// Operations against the cluster that holds mirrors and materialized Services
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DestinationClusterClient: Send + Sync {
    /// Get a MirroredService, `None` if it does not exist
    async fn get_mirror(&self, key: &ObjectKey) -> Result<Option<MirroredService>, Error>;

    /// Create a MirroredService
    async fn create_mirror(&self, mirror: &MirroredService) -> Result<MirroredService, Error>;

    /// Replace a MirroredService. The object must carry the resourceVersion it was read at.
    async fn update_mirror(&self, mirror: &MirroredService) -> Result<MirroredService, Error>;

    /// Write the status subresource of a MirroredService
    async fn update_mirror_status(
        &self,
        key: &ObjectKey,
        status: &MirroredServiceStatus,
    ) -> Result<(), Error>;

    /// Delete a MirroredService. Returns whether anything was deleted.
    async fn delete_mirror(&self, key: &ObjectKey) -> Result<bool, Error>;

    /// Get a Service, `None` if it does not exist
    async fn get_service(&self, key: &ObjectKey) -> Result<Option<Service>, Error>;

    /// Create a Service
    async fn create_service(&self, service: &Service) -> Result<Service, Error>;

    /// Replace a Service. The object must carry the resourceVersion it was read at.
    async fn update_service(&self, service: &Service) -> Result<Service, Error>;

    /// Delete a Service. Returns whether anything was deleted.
    async fn delete_service(&self, key: &ObjectKey) -> Result<bool, Error>;
}

fn post_params() -> PostParams {
    PostParams {
        field_manager: Some(FIELD_MANAGER.to_string()),
        ..Default::default()
    }
}

fn namespace_of<K: ResourceExt>(obj: &K, kind: &str) -> Result<String, Error> {
    obj.namespace().ok_or_else(|| {
        Error::internal_with_context(
            "client",
            format!("{} {} has no namespace", kind, obj.name_any()),
        )
    })
}

/// Source cluster client backed by kube-rs
pub struct KubeSourceClient {
    client: Client,
}

impl KubeSourceClient {
    /// Wrap a kube client for the source cluster
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SourceClusterClient for KubeSourceClient {
    async fn get_endpoints(&self, key: &ObjectKey) -> Result<Option<Endpoints>, Error> {
        get_opt(&self.client, &key.namespace, &key.name).await
    }

    async fn get_service(&self, key: &ObjectKey) -> Result<Option<Service>, Error> {
        get_opt(&self.client, &key.namespace, &key.name).await
    }

    async fn update_service_status(
        &self,
        key: &ObjectKey,
        status: &ServiceStatus,
    ) -> Result<(), Error> {
        patch_resource_status::<Service>(&self.client, &key.name, &key.namespace, status).await
    }
}

/// Destination cluster client backed by kube-rs
pub struct KubeDestinationClient {
    client: Client,
}

impl KubeDestinationClient {
    /// Wrap a kube client for the destination cluster
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn mirrors(&self, namespace: &str) -> Api<MirroredService> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn services(&self, namespace: &str) -> Api<Service> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl DestinationClusterClient for KubeDestinationClient {
    async fn get_mirror(&self, key: &ObjectKey) -> Result<Option<MirroredService>, Error> {
        get_opt(&self.client, &key.namespace, &key.name).await
    }

    async fn create_mirror(&self, mirror: &MirroredService) -> Result<MirroredService, Error> {
        let namespace = namespace_of(mirror, "MirroredService")?;
        Ok(self.mirrors(&namespace).create(&post_params(), mirror).await?)
    }

    async fn update_mirror(&self, mirror: &MirroredService) -> Result<MirroredService, Error> {
        let namespace = namespace_of(mirror, "MirroredService")?;
        Ok(self
            .mirrors(&namespace)
            .replace(&mirror.name_any(), &post_params(), mirror)
            .await?)
    }

    async fn update_mirror_status(
        &self,
        key: &ObjectKey,
        status: &MirroredServiceStatus,
    ) -> Result<(), Error> {
        patch_resource_status::<MirroredService>(&self.client, &key.name, &key.namespace, status)
            .await
    }

    async fn delete_mirror(&self, key: &ObjectKey) -> Result<bool, Error> {
        delete_if_exists::<MirroredService>(&self.client, &key.namespace, &key.name).await
    }

    async fn get_service(&self, key: &ObjectKey) -> Result<Option<Service>, Error> {
        get_opt(&self.client, &key.namespace, &key.name).await
    }

    async fn create_service(&self, service: &Service) -> Result<Service, Error> {
        let namespace = namespace_of(service, "Service")?;
        Ok(self.services(&namespace).create(&post_params(), service).await?)
    }

    async fn update_service(&self, service: &Service) -> Result<Service, Error> {
        let namespace = namespace_of(service, "Service")?;
        Ok(self
            .services(&namespace)
            .replace(&service.name_any(), &post_params(), service)
            .await?)
    }

    async fn delete_service(&self, key: &ObjectKey) -> Result<bool, Error> {
        delete_if_exists::<Service>(&self.client, &key.namespace, &key.name).await
    }
}
