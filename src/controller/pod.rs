//! Pod controller
//!
//! Binds the port a running wasm instance registered to the Service and Ingress
//! of its WasmApp. Pods are matched by annotation, never by label selector: the
//! [`WASM_ANNOTATION`] marks a workload pod and the [`IDENTIFIER_ANNOTATION`]
//! names the WasmApp, whose managed objects share that name.

use std::sync::Arc;

use k8s_openapi::api::core::v1::{Pod, ServicePort};
use k8s_openapi::api::networking::v1::{Ingress, ServiceBackendPort};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use super::events::{actions, reasons};
use super::Context;
use crate::crd::WasmAppStatus;
use crate::registry::{parse_port, strip_runtime_prefix};
use crate::{Error, IDENTIFIER_ANNOTATION, WASM_ANNOTATION};

/// Name of the single port on a bound Service
pub const SERVICE_PORT_NAME: &str = "web";

/// Reconcile a Pod
///
/// Pods without the workload marker are dropped here without touching the API.
#[instrument(skip(pod, ctx), fields(pod = %pod.name_any(), namespace = ?pod.namespace()))]
pub async fn reconcile(pod: Arc<Pod>, ctx: Arc<Context>) -> Result<Action, Error> {
    if !has_marker(&pod) {
        return Ok(Action::await_change());
    }
    let namespace = pod
        .namespace()
        .ok_or_else(|| Error::validation("Pod has no namespace"))?;
    bind_pod_port(&namespace, &pod.name_any(), &ctx).await
}

/// Bind the registered port of `namespace/name` to its WasmApp's Service and Ingress
pub async fn bind_pod_port(namespace: &str, name: &str, ctx: &Context) -> Result<Action, Error> {
    let Some(pod) = ctx.store.get_pod(namespace, name).await? else {
        info!("pod deleted, nothing to bind");
        return Ok(Action::await_change());
    };

    if !has_marker(&pod) {
        return Ok(Action::await_change());
    }

    let Some(raw_id) = running_container_id(&pod) else {
        debug!("first container not running yet");
        return Ok(Action::await_change());
    };
    let container_id = strip_runtime_prefix(raw_id);

    let Some(value) = ctx.registry.lookup(container_id).await? else {
        debug!(container_id, "no port registered yet");
        return Ok(ctx
            .settings
            .port_recheck
            .map(Action::requeue)
            .unwrap_or_else(Action::await_change));
    };

    let identifier = pod
        .annotations()
        .get(IDENTIFIER_ANNOTATION)
        .cloned()
        .ok_or_else(|| Error::MissingAnnotation {
            pod: name.to_string(),
            annotation: IDENTIFIER_ANNOTATION.to_string(),
        })?;

    let mut service = ctx
        .store
        .get_service(namespace, &identifier)
        .await?
        .ok_or_else(|| Error::missing_object("Service", namespace, &identifier))?;
    let ingress = ctx.store.get_ingress(namespace, &identifier).await?;

    let port = parse_port(&value, container_id)?;

    let mut changed = false;

    let desired = service_port(port);
    let spec = service.spec.get_or_insert_with(Default::default);
    if !carries_port(spec.ports.as_deref(), &desired) {
        spec.ports = Some(vec![desired]);
        ctx.store.update_service(&service).await?;
        changed = true;
    }

    if let Some(mut ingress) = ingress {
        if set_backend_port(&mut ingress, port) {
            ctx.store.update_ingress(&ingress).await?;
            changed = true;
        }
    }

    if changed {
        info!(port, wasm_app = %identifier, "bound instance port");
        record_bound_port(namespace, &identifier, port, ctx).await;
        ctx.events
            .publish(
                &pod.object_ref(&()),
                EventType::Normal,
                reasons::PORT_BOUND,
                actions::BIND_PORT,
                Some(format!("bound port {port} to {identifier}")),
            )
            .await;
    } else {
        debug!(port, "port already bound");
    }

    Ok(Action::await_change())
}

/// Error policy for the Pod controller
pub fn error_policy(pod: Arc<Pod>, error: &Error, ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        pod = %pod.name_any(),
        namespace = ?pod.namespace(),
        "port binding failed"
    );
    Action::requeue(ctx.settings.error_requeue)
}

fn has_marker(pod: &Pod) -> bool {
    pod.annotations().contains_key(WASM_ANNOTATION)
}

/// Container ID of the first container, once it is running
fn running_container_id(pod: &Pod) -> Option<&str> {
    let status = pod.status.as_ref()?.container_statuses.as_ref()?.first()?;
    status.state.as_ref()?.running.as_ref()?;
    status.container_id.as_deref()
}

/// The single Service port for an instance listening on `port`
pub fn service_port(port: i32) -> ServicePort {
    ServicePort {
        name: Some(SERVICE_PORT_NAME.to_string()),
        protocol: Some("TCP".to_string()),
        app_protocol: Some("http".to_string()),
        port,
        target_port: Some(IntOrString::Int(port)),
        ..Default::default()
    }
}

/// True when `ports` is exactly `desired`, ignoring server-assigned fields
fn carries_port(ports: Option<&[ServicePort]>, desired: &ServicePort) -> bool {
    match ports {
        Some([only]) => {
            only.name == desired.name
                && only.port == desired.port
                && only.protocol == desired.protocol
                && only.app_protocol == desired.app_protocol
                && only.target_port == desired.target_port
        }
        _ => false,
    }
}

/// Point the first HTTP path's service backend at `port`
///
/// Returns whether the Ingress changed. An Ingress without that shape is left
/// alone.
fn set_backend_port(ingress: &mut Ingress, port: i32) -> bool {
    let name = ingress.name_any();
    let Some(backend) = ingress
        .spec
        .as_mut()
        .and_then(|spec| spec.rules.as_mut())
        .and_then(|rules| rules.first_mut())
        .and_then(|rule| rule.http.as_mut())
        .and_then(|http| http.paths.first_mut())
        .and_then(|path| path.backend.service.as_mut())
    else {
        warn!(ingress = %name, "ingress has no HTTP service backend, not patching");
        return false;
    };

    let desired = ServiceBackendPort {
        number: Some(port),
        name: None,
    };
    if backend.port.as_ref() == Some(&desired) {
        return false;
    }
    backend.port = Some(desired);
    true
}

async fn record_bound_port(namespace: &str, wasm_app: &str, port: i32, ctx: &Context) {
    let status = WasmAppStatus {
        bound_port: Some(port),
        ..Default::default()
    };
    if let Err(e) = ctx
        .store
        .patch_wasm_app_status(namespace, wasm_app, &status)
        .await
    {
        warn!(error = %e, wasm_app, "failed to record bound port");
    }
}
