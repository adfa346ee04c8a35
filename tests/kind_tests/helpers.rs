//! Shared fixtures for the cluster integration tests

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::{Client, CustomResourceExt};

use kube_spin::controller::{Context, NoopEventPublisher};
use kube_spin::crd::{WasmApp, WasmAppSpec};
use kube_spin::registry::PortRegistry;
use kube_spin::template::ManifestTemplates;
use kube_spin::{Error, FIELD_MANAGER};

/// Namespace all integration tests run in
pub const TEST_NAMESPACE: &str = "kube-spin-it";

/// Connect to the current kube context and make sure the CRD and test
/// namespace exist
pub async fn ensure_test_cluster() -> Result<Client, String> {
    let client = Client::try_default()
        .await
        .map_err(|e| format!("no usable kubeconfig: {e}"))?;

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let crd = WasmApp::crd();
    let name = crd.metadata.name.clone().unwrap_or_default();
    crds.patch(
        &name,
        &PatchParams::apply(FIELD_MANAGER).force(),
        &Patch::Apply(&crd),
    )
    .await
    .map_err(|e| format!("failed to install CRD: {e}"))?;
    // Give the API server a moment to serve the new kind
    tokio::time::sleep(Duration::from_secs(2)).await;

    let namespaces: Api<Namespace> = Api::all(client.clone());
    if namespaces
        .get_opt(TEST_NAMESPACE)
        .await
        .map_err(|e| e.to_string())?
        .is_none()
    {
        let ns = Namespace {
            metadata: kube::api::ObjectMeta {
                name: Some(TEST_NAMESPACE.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        namespaces
            .create(&PostParams::default(), &ns)
            .await
            .map_err(|e| format!("failed to create namespace: {e}"))?;
    }

    Ok(client)
}

/// Registry answering from a fixed table
pub struct StaticRegistry(pub HashMap<String, String>);

#[async_trait]
impl PortRegistry for StaticRegistry {
    async fn lookup(&self, container_id: &str) -> Result<Option<String>, Error> {
        Ok(self.0.get(container_id).cloned())
    }
}

/// Controller context against the live cluster with built-in templates
pub fn live_context(client: Client) -> Context {
    Context::builder(
        client,
        Arc::new(ManifestTemplates::embedded().expect("embedded templates")),
        Arc::new(StaticRegistry(HashMap::new())),
    )
    .events(Arc::new(NoopEventPublisher))
    .build()
}

/// A WasmApp in the test namespace
pub fn sample_wasm_app(name: &str, spec: WasmAppSpec) -> WasmApp {
    let mut app = WasmApp::new(name, spec);
    app.metadata.namespace = Some(TEST_NAMESPACE.to_string());
    app
}

/// Spec running the hello-world Spin image
pub fn hello_spec() -> WasmAppSpec {
    WasmAppSpec {
        oci_image: "ghcr.io/deislabs/containerd-wasm-shims/examples/spin-rust-hello".to_string(),
        oci_image_tag: "v0.10.0".to_string(),
        ..Default::default()
    }
}

/// Delete a WasmApp, ignoring NotFound
pub async fn cleanup_wasm_app(client: &Client, name: &str) {
    let api: Api<WasmApp> = Api::namespaced(client.clone(), TEST_NAMESPACE);
    let _ = api.delete(name, &DeleteParams::default()).await;
}
