//! Integration tests for WasmApp CRD operations
//!
//! These tests tell the story of how users manage WasmApp resources through
//! the Kubernetes API.

use kube::api::{Api, Patch, PatchParams, PostParams};

use kube_spin::crd::{WasmApp, WasmAppSpec};

use super::helpers::{
    cleanup_wasm_app, ensure_test_cluster, hello_spec, sample_wasm_app, TEST_NAMESPACE,
};

/// Story: a developer creates a WasmApp with only an image
///
/// Expected behavior:
/// - The resource is accepted with every optional field absent
/// - Reading it back yields the same spec
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_developer_creates_minimal_wasm_app() {
    let client = ensure_test_cluster()
        .await
        .expect("failed to setup cluster");
    let api: Api<WasmApp> = Api::namespaced(client.clone(), TEST_NAMESPACE);
    let name = "it-crd-minimal";
    cleanup_wasm_app(&client, name).await;

    let created = api
        .create(&PostParams::default(), &sample_wasm_app(name, hello_spec()))
        .await
        .expect("failed to create WasmApp");
    assert_eq!(created.metadata.name.as_deref(), Some(name));

    let fetched = api.get(name).await.expect("failed to get WasmApp");
    assert_eq!(fetched.spec, hello_spec());
    assert!(!fetched.spec.ingress_enabled());
    assert_eq!(fetched.spec.replicas, None);

    cleanup_wasm_app(&client, name).await;
}

/// Story: a developer scales a WasmApp and turns on ingress with a merge patch
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_developer_patches_wasm_app() {
    let client = ensure_test_cluster()
        .await
        .expect("failed to setup cluster");
    let api: Api<WasmApp> = Api::namespaced(client.clone(), TEST_NAMESPACE);
    let name = "it-crd-patch";
    cleanup_wasm_app(&client, name).await;
    api.create(&PostParams::default(), &sample_wasm_app(name, hello_spec()))
        .await
        .expect("failed to create WasmApp");

    let patch = serde_json::json!({
        "spec": { "replicas": 3, "ingressEnabled": true, "ingressHost": "hello.acme.io" }
    });
    let patched = api
        .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
        .expect("failed to patch WasmApp");

    assert_eq!(
        patched.spec,
        WasmAppSpec {
            replicas: Some(3),
            ingress_enabled: Some(true),
            ingress_host: Some("hello.acme.io".to_string()),
            ..hello_spec()
        }
    );

    cleanup_wasm_app(&client, name).await;
}

/// Story: a manifest without the image tag is rejected by the API server
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_missing_image_tag_is_rejected_by_schema() {
    let client = ensure_test_cluster()
        .await
        .expect("failed to setup cluster");
    let api: Api<kube::api::DynamicObject> = Api::namespaced_with(
        client,
        TEST_NAMESPACE,
        &kube::discovery::ApiResource::erase::<WasmApp>(&()),
    );

    let object: kube::api::DynamicObject = serde_json::from_value(serde_json::json!({
        "apiVersion": "operator.kube-spin.mrezhi.net/v1alpha1",
        "kind": "WasmApp",
        "metadata": { "name": "it-crd-invalid", "namespace": TEST_NAMESPACE },
        "spec": { "ociImage": "repo/img" }
    }))
    .expect("valid dynamic object");

    let result = api.create(&PostParams::default(), &object).await;
    assert!(result.is_err(), "ociImageTag is required by the schema");
}
