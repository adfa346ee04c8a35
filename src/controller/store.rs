//! Cluster object store
//!
//! Both reconcilers read and write the cluster through [`ObjectStore`], a narrow
//! get/create/update contract over the kinds they touch. NotFound is returned as
//! `Ok(None)` from getters; write conflicts are classified by
//! [`Error::from_write`].

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Pod, Service};
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;

#[cfg(test)]
use mockall::automock;

use crate::crd::{WasmApp, WasmAppStatus};
use crate::{Error, FIELD_MANAGER};

/// Trait abstracting the Kubernetes API operations used by the controllers
///
/// This trait allows mocking the cluster in tests while using the real client
/// in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch a WasmApp, `None` if it does not exist
    async fn get_wasm_app(&self, namespace: &str, name: &str) -> Result<Option<WasmApp>, Error>;

    /// Fetch a Pod, `None` if it does not exist
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, Error>;

    /// Fetch a Deployment, `None` if it does not exist
    async fn get_deployment(&self, namespace: &str, name: &str)
        -> Result<Option<Deployment>, Error>;

    /// Fetch a Service, `None` if it does not exist
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>, Error>;

    /// Fetch an Ingress, `None` if it does not exist
    async fn get_ingress(&self, namespace: &str, name: &str) -> Result<Option<Ingress>, Error>;

    /// Create a Deployment
    async fn create_deployment(&self, deployment: &Deployment) -> Result<(), Error>;

    /// Replace a Deployment (optimistic concurrency on resourceVersion)
    async fn update_deployment(&self, deployment: &Deployment) -> Result<(), Error>;

    /// Create a Service
    async fn create_service(&self, service: &Service) -> Result<(), Error>;

    /// Replace a Service (optimistic concurrency on resourceVersion)
    async fn update_service(&self, service: &Service) -> Result<(), Error>;

    /// Create an Ingress
    async fn create_ingress(&self, ingress: &Ingress) -> Result<(), Error>;

    /// Replace an Ingress (optimistic concurrency on resourceVersion)
    async fn update_ingress(&self, ingress: &Ingress) -> Result<(), Error>;

    /// Merge-patch the status subresource of a WasmApp
    ///
    /// Fields left unset in `status` are not touched.
    async fn patch_wasm_app_status(
        &self,
        namespace: &str,
        name: &str,
        status: &WasmAppStatus,
    ) -> Result<(), Error>;
}

/// Real object store backed by the Kubernetes API
pub struct KubeObjectStore {
    client: Client,
}

impl KubeObjectStore {
    /// Create a new KubeObjectStore wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn get<K>(&self, namespace: &str, name: &str) -> Result<Option<K>, Error>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + DeserializeOwned
            + std::fmt::Debug,
        <K as Resource>::DynamicType: Default,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create<K>(&self, object: &K) -> Result<(), Error>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + DeserializeOwned
            + Serialize
            + std::fmt::Debug,
        <K as Resource>::DynamicType: Default,
    {
        let (api, kind, name) = self.api_for(object)?;
        api.create(&PostParams::default(), object)
            .await
            .map_err(|e| Error::from_write(&kind, &name, e))?;
        Ok(())
    }

    async fn replace<K>(&self, object: &K) -> Result<(), Error>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + DeserializeOwned
            + Serialize
            + std::fmt::Debug,
        <K as Resource>::DynamicType: Default,
    {
        let (api, kind, name) = self.api_for(object)?;
        api.replace(&name, &PostParams::default(), object)
            .await
            .map_err(|e| Error::from_write(&kind, &name, e))?;
        Ok(())
    }

    fn api_for<K>(&self, object: &K) -> Result<(Api<K>, String, String), Error>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        let kind = K::kind(&Default::default()).to_string();
        let name = object.name_any();
        let namespace = object
            .namespace()
            .ok_or_else(|| Error::validation(format!("{} {} has no namespace", kind, name)))?;
        Ok((Api::namespaced(self.client.clone(), &namespace), kind, name))
    }
}

#[async_trait]
impl ObjectStore for KubeObjectStore {
    async fn get_wasm_app(&self, namespace: &str, name: &str) -> Result<Option<WasmApp>, Error> {
        self.get(namespace, name).await
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, Error> {
        self.get(namespace, name).await
    }

    async fn get_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Deployment>, Error> {
        self.get(namespace, name).await
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>, Error> {
        self.get(namespace, name).await
    }

    async fn get_ingress(&self, namespace: &str, name: &str) -> Result<Option<Ingress>, Error> {
        self.get(namespace, name).await
    }

    async fn create_deployment(&self, deployment: &Deployment) -> Result<(), Error> {
        self.create(deployment).await
    }

    async fn update_deployment(&self, deployment: &Deployment) -> Result<(), Error> {
        self.replace(deployment).await
    }

    async fn create_service(&self, service: &Service) -> Result<(), Error> {
        self.create(service).await
    }

    async fn update_service(&self, service: &Service) -> Result<(), Error> {
        self.replace(service).await
    }

    async fn create_ingress(&self, ingress: &Ingress) -> Result<(), Error> {
        self.create(ingress).await
    }

    async fn update_ingress(&self, ingress: &Ingress) -> Result<(), Error> {
        self.replace(ingress).await
    }

    async fn patch_wasm_app_status(
        &self,
        namespace: &str,
        name: &str,
        status: &WasmAppStatus,
    ) -> Result<(), Error> {
        let api: Api<WasmApp> = Api::namespaced(self.client.clone(), namespace);

        let status_patch = serde_json::json!({
            "status": status
        });

        api.patch_status(
            name,
            &status_patch_params(),
            &Patch::Merge(&status_patch),
        )
        .await?;

        Ok(())
    }
}

/// Parameters for JSON merge patches of the status subresource
fn status_patch_params() -> PatchParams {
    PatchParams {
        field_manager: Some(FIELD_MANAGER.to_string()),
        ..PatchParams::default()
    }
}
