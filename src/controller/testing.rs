//! In-memory cluster fixture for controller tests
//!
//! [`FakeCluster`] keeps typed objects in maps and hands out a
//! [`MockObjectStore`] whose expectations read and write those maps, so tests
//! assert on the resulting objects instead of on mock call parameters. Writes
//! follow API server rules: creates of existing objects fail with
//! `AlreadyExists`, updates carrying a stale resourceVersion fail with
//! `Conflict`. One-shot faults can be injected per verb and kind.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ContainerStatus, ObjectReference, Pod, PodStatus, Service};
use k8s_openapi::api::core::v1::{ContainerState, ContainerStateRunning};
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::core::ErrorResponse;
use kube::runtime::events::EventType;

use super::events::EventPublisher;
use super::MockObjectStore;
use crate::crd::{WasmApp, WasmAppSpec, WasmAppStatus};
use crate::registry::MockPortRegistry;
use crate::{Error, IDENTIFIER_ANNOTATION, WASM_ANNOTATION};

type Key = (String, String);

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

fn object_key(meta: &ObjectMeta) -> Key {
    key(
        meta.namespace.as_deref().unwrap_or_default(),
        meta.name.as_deref().unwrap_or_default(),
    )
}

/// Write verbs that can be faulted
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Verb {
    Create,
    Update,
    Get,
}

/// Failure to inject on the next matching call
#[derive(Clone, Copy, Debug)]
pub enum Fault {
    /// 409 with reason Conflict
    Conflict,
    /// 409 with reason AlreadyExists, as when another writer created the
    /// object after it was read
    AlreadyExists,
    /// 500 from the API server
    Unavailable,
}

impl Fault {
    fn into_error(self, kind: &str, name: &str) -> Error {
        let (code, reason) = match self {
            Self::Conflict => (409, "Conflict"),
            Self::AlreadyExists => (409, "AlreadyExists"),
            Self::Unavailable => (500, "InternalError"),
        };
        Error::from_write(
            kind,
            name,
            kube::Error::Api(ErrorResponse {
                status: "Failure".to_string(),
                message: format!("injected {reason}"),
                reason: reason.to_string(),
                code,
            }),
        )
    }
}

#[derive(Default)]
struct ClusterState {
    wasm_apps: BTreeMap<Key, WasmApp>,
    pods: BTreeMap<Key, Pod>,
    deployments: BTreeMap<Key, Deployment>,
    services: BTreeMap<Key, Service>,
    ingresses: BTreeMap<Key, Ingress>,
    faults: HashMap<(Verb, &'static str), Fault>,
    writes: Vec<String>,
    status_patches: usize,
    next_version: u64,
}

impl ClusterState {
    fn take_fault(&mut self, verb: Verb, kind: &'static str, name: &str) -> Result<(), Error> {
        match self.faults.remove(&(verb, kind)) {
            Some(fault) => Err(fault.into_error(kind, name)),
            None => Ok(()),
        }
    }

    fn bump(&mut self, meta: &mut ObjectMeta) {
        self.next_version += 1;
        meta.resource_version = Some(self.next_version.to_string());
    }
}

/// Shared handle to an in-memory cluster
#[derive(Clone, Default)]
pub struct FakeCluster {
    state: Arc<Mutex<ClusterState>>,
}

macro_rules! typed_store {
    (
        $field:ident,
        $ty:ty,
        $kind:literal,
        $get:ident,
        $create:ident,
        $update:ident,
        $insert:ident,
        $read:ident
    ) => {
        impl FakeCluster {
            /// Seed an object, assigning it a resourceVersion
            pub fn $insert(&self, mut object: $ty) {
                let mut state = self.state.lock().unwrap();
                state.bump(&mut object.metadata);
                state.$field.insert(object_key(&object.metadata), object);
            }

            /// Current copy of an object
            pub fn $read(&self, namespace: &str, name: &str) -> Option<$ty> {
                self.state.lock().unwrap().$field.get(&key(namespace, name)).cloned()
            }

            fn $get(&self, namespace: &str, name: &str) -> Result<Option<$ty>, Error> {
                let mut state = self.state.lock().unwrap();
                state.take_fault(Verb::Get, $kind, name)?;
                Ok(state.$field.get(&key(namespace, name)).cloned())
            }

            fn $create(&self, object: &$ty) -> Result<(), Error> {
                let mut state = self.state.lock().unwrap();
                let name = object.metadata.name.clone().unwrap_or_default();
                state.take_fault(Verb::Create, $kind, &name)?;
                let k = object_key(&object.metadata);
                if state.$field.contains_key(&k) {
                    return Err(Error::AlreadyExists {
                        kind: $kind.to_string(),
                        name,
                    });
                }
                let mut object = object.clone();
                state.bump(&mut object.metadata);
                state.$field.insert(k, object);
                state.writes.push(format!("create {} {}", $kind, name));
                Ok(())
            }

            fn $update(&self, object: &$ty) -> Result<(), Error> {
                let mut state = self.state.lock().unwrap();
                let name = object.metadata.name.clone().unwrap_or_default();
                state.take_fault(Verb::Update, $kind, &name)?;
                let k = object_key(&object.metadata);
                let stored_version = state
                    .$field
                    .get(&k)
                    .and_then(|o| o.metadata.resource_version.clone());
                if stored_version.is_none() || stored_version != object.metadata.resource_version {
                    return Err(Fault::Conflict.into_error($kind, &name));
                }
                let mut object = object.clone();
                state.bump(&mut object.metadata);
                state.$field.insert(k, object);
                state.writes.push(format!("update {} {}", $kind, name));
                Ok(())
            }
        }
    };
}

typed_store!(
    deployments,
    Deployment,
    "Deployment",
    get_deployment,
    create_deployment,
    update_deployment,
    insert_deployment,
    deployment
);
typed_store!(
    services,
    Service,
    "Service",
    get_service,
    create_service,
    update_service,
    insert_service,
    service
);
typed_store!(
    ingresses,
    Ingress,
    "Ingress",
    get_ingress,
    create_ingress,
    update_ingress,
    insert_ingress,
    ingress
);

impl FakeCluster {
    /// Empty cluster
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a WasmApp
    pub fn insert_wasm_app(&self, app: WasmApp) {
        let mut state = self.state.lock().unwrap();
        state.wasm_apps.insert(object_key(&app.metadata), app);
    }

    /// Current copy of a WasmApp
    pub fn wasm_app(&self, namespace: &str, name: &str) -> Option<WasmApp> {
        self.state.lock().unwrap().wasm_apps.get(&key(namespace, name)).cloned()
    }

    /// Seed a Pod
    pub fn insert_pod(&self, pod: Pod) {
        let mut state = self.state.lock().unwrap();
        state.pods.insert(object_key(&pod.metadata), pod);
    }

    /// Fail the next `verb` on `kind` with `fault`
    pub fn inject(&self, verb: Verb, kind: &'static str, fault: Fault) {
        self.state.lock().unwrap().faults.insert((verb, kind), fault);
    }

    /// Successful managed-object writes, in order (`"create Service demo"`)
    pub fn writes(&self) -> Vec<String> {
        self.state.lock().unwrap().writes.clone()
    }

    /// Number of status patches applied to WasmApps
    pub fn status_patches(&self) -> usize {
        self.state.lock().unwrap().status_patches
    }

    /// Forget recorded writes and status patches
    pub fn clear_writes(&self) {
        let mut state = self.state.lock().unwrap();
        state.writes.clear();
        state.status_patches = 0;
    }

    fn patch_status(&self, namespace: &str, name: &str, patch: &WasmAppStatus) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        state.take_fault(Verb::Update, "WasmAppStatus", name)?;
        let Some(app) = state.wasm_apps.get_mut(&key(namespace, name)) else {
            return Err(Error::Kube(kube::Error::Api(ErrorResponse {
                status: "Failure".to_string(),
                message: format!("wasmapps {name} not found"),
                reason: "NotFound".to_string(),
                code: 404,
            })));
        };
        // JSON merge patch: only fields present in the patch are replaced
        let status = app.status.get_or_insert_with(WasmAppStatus::default);
        if patch.observed_generation.is_some() {
            status.observed_generation = patch.observed_generation;
        }
        if !patch.conditions.is_empty() {
            status.conditions = patch.conditions.clone();
        }
        if patch.bound_port.is_some() {
            status.bound_port = patch.bound_port;
        }
        state.status_patches += 1;
        Ok(())
    }

    /// Build a mock object store backed by this cluster
    pub fn store(&self) -> MockObjectStore {
        let mut mock = MockObjectStore::new();

        let c = self.clone();
        mock.expect_get_wasm_app().returning(move |ns, name| {
            let mut state = c.state.lock().unwrap();
            state.take_fault(Verb::Get, "WasmApp", name)?;
            Ok(state.wasm_apps.get(&key(ns, name)).cloned())
        });
        let c = self.clone();
        mock.expect_get_pod().returning(move |ns, name| {
            let mut state = c.state.lock().unwrap();
            state.take_fault(Verb::Get, "Pod", name)?;
            Ok(state.pods.get(&key(ns, name)).cloned())
        });

        let c = self.clone();
        mock.expect_get_deployment().returning(move |ns, name| c.get_deployment(ns, name));
        let c = self.clone();
        mock.expect_create_deployment().returning(move |d| c.create_deployment(d));
        let c = self.clone();
        mock.expect_update_deployment().returning(move |d| c.update_deployment(d));

        let c = self.clone();
        mock.expect_get_service().returning(move |ns, name| c.get_service(ns, name));
        let c = self.clone();
        mock.expect_create_service().returning(move |s| c.create_service(s));
        let c = self.clone();
        mock.expect_update_service().returning(move |s| c.update_service(s));

        let c = self.clone();
        mock.expect_get_ingress().returning(move |ns, name| c.get_ingress(ns, name));
        let c = self.clone();
        mock.expect_create_ingress().returning(move |i| c.create_ingress(i));
        let c = self.clone();
        mock.expect_update_ingress().returning(move |i| c.update_ingress(i));

        let c = self.clone();
        mock.expect_patch_wasm_app_status()
            .returning(move |ns, name, status| c.patch_status(ns, name, status));

        mock
    }
}

/// Registry double answering from a fixed table
pub fn registry_with(entries: &[(&str, &str)]) -> MockPortRegistry {
    let table: HashMap<String, String> = entries
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    let mut mock = MockPortRegistry::new();
    mock.expect_lookup()
        .returning(move |id| Ok(table.get(id).cloned()));
    mock
}

/// Event recorded by [`RecordingEventPublisher`]
#[derive(Clone, Debug)]
pub struct RecordedEvent {
    pub object: String,
    pub warning: bool,
    pub reason: String,
    pub note: Option<String>,
}

/// Event publisher that keeps every event in memory
#[derive(Clone, Default)]
pub struct RecordingEventPublisher {
    events: Arc<Mutex<Vec<RecordedEvent>>>,
}

impl RecordingEventPublisher {
    /// Reasons of all published events, in order
    pub fn reasons(&self) -> Vec<String> {
        self.events.lock().unwrap().iter().map(|e| e.reason.clone()).collect()
    }

    /// All published events, in order
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventPublisher for RecordingEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        _action: &str,
        note: Option<String>,
    ) {
        self.events.lock().unwrap().push(RecordedEvent {
            object: format!(
                "{}/{}",
                resource_ref.kind.as_deref().unwrap_or_default(),
                resource_ref.name.as_deref().unwrap_or_default()
            ),
            warning: matches!(type_, EventType::Warning),
            reason: reason.to_string(),
            note,
        });
    }
}

/// A WasmApp with a uid and generation, as the API server would return it
pub fn wasm_app(namespace: &str, name: &str, spec: WasmAppSpec) -> WasmApp {
    let mut app = WasmApp::new(name, spec);
    app.metadata.namespace = Some(namespace.to_string());
    app.metadata.uid = Some(format!("uid-{name}"));
    app.metadata.generation = Some(1);
    app
}

/// Spec with only the image set
pub fn image_spec(image: &str, tag: &str) -> WasmAppSpec {
    WasmAppSpec {
        oci_image: image.to_string(),
        oci_image_tag: tag.to_string(),
        ..Default::default()
    }
}

/// A workload pod carrying the correlation annotations
///
/// `container_id` is `None` for a pod whose container has not started.
pub fn workload_pod(
    namespace: &str,
    name: &str,
    identifier: Option<&str>,
    container_id: Option<&str>,
) -> Pod {
    let mut annotations = BTreeMap::from([(WASM_ANNOTATION.to_string(), "true".to_string())]);
    if let Some(identifier) = identifier {
        annotations.insert(IDENTIFIER_ANNOTATION.to_string(), identifier.to_string());
    }

    let container_statuses = container_id.map(|id| {
        vec![ContainerStatus {
            name: "app".to_string(),
            container_id: Some(id.to_string()),
            ready: true,
            state: Some(ContainerState {
                running: Some(ContainerStateRunning::default()),
                ..Default::default()
            }),
            ..Default::default()
        }]
    });

    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            uid: Some(format!("uid-{name}")),
            annotations: Some(annotations),
            ..Default::default()
        },
        spec: None,
        status: Some(PodStatus {
            phase: Some("Running".to_string()),
            container_statuses,
            ..Default::default()
        }),
    }
}
