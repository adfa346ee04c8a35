//! WasmApp controller
//!
//! Derives the managed Deployment, Service and (when enabled) Ingress of a
//! WasmApp from its spec. Each managed object has the WasmApp's namespace and
//! name and carries a controller owner reference to it, so deleting the WasmApp
//! cascades through the garbage collector.
//!
//! Service ports and the Ingress backend port are deliberately left alone here:
//! they belong to the [`pod`](super::pod) controller, which fills them in once
//! an instance is running.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{LocalObjectReference, Service};
use k8s_openapi::api::networking::v1::{Ingress, IngressTLS};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use super::events::{actions, reasons};
use super::Context;
use crate::crd::{Condition, ConditionStatus, WasmApp, WasmAppStatus, CONDITION_READY};
use crate::{Error, APP_LABEL, IDENTIFIER_ANNOTATION, WASM_ANNOTATION};

/// Requeue delay after a write conflict was swallowed
pub const CONFLICT_REQUEUE: Duration = Duration::from_secs(5);

/// How a managed object is persisted
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum WriteOp {
    Create,
    Update,
    Unchanged,
}

/// A specialized managed object and the write it needs
struct Planned<K> {
    object: K,
    op: WriteOp,
}

#[derive(Default)]
struct SyncOutcome {
    written: usize,
    conflicts: usize,
}

/// Reconcile a WasmApp resource
///
/// The object delivered by the watcher is only used for its identity; the
/// current version is re-read from the store.
#[instrument(skip(app, ctx), fields(wasm_app = %app.name_any(), namespace = ?app.namespace()))]
pub async fn reconcile(app: Arc<WasmApp>, ctx: Arc<Context>) -> Result<Action, Error> {
    let namespace = app
        .namespace()
        .ok_or_else(|| Error::validation("WasmApp has no namespace"))?;
    sync_wasm_app(&namespace, &app.name_any(), &ctx).await
}

/// Bring the managed objects of `namespace/name` in line with its WasmApp
pub async fn sync_wasm_app(namespace: &str, name: &str, ctx: &Context) -> Result<Action, Error> {
    let Some(app) = ctx.store.get_wasm_app(namespace, name).await? else {
        debug!("WasmApp no longer exists, nothing to do");
        return Ok(Action::await_change());
    };

    if let Err(e) = app.spec.validate() {
        warn!(error = %e, "WasmApp spec is invalid");
        let message = e.to_string();
        publish(ctx, &app, EventType::Warning, reasons::INVALID_SPEC, &message).await;
        let condition = Condition::new(
            CONDITION_READY,
            ConditionStatus::False,
            reasons::INVALID_SPEC,
            message,
        );
        record_status(&app, ctx, condition, true).await?;
        // Retrying cannot fix a bad spec
        return Ok(Action::await_change());
    }

    match apply_managed_objects(&app, ctx).await {
        Ok(outcome) if outcome.conflicts > 0 => {
            info!(
                conflicts = outcome.conflicts,
                written = outcome.written,
                "managed objects were modified concurrently, requeueing"
            );
            Ok(Action::requeue(CONFLICT_REQUEUE))
        }
        Ok(outcome) => {
            let condition = Condition::new(
                CONDITION_READY,
                ConditionStatus::True,
                reasons::SYNCED,
                "managed objects match the spec",
            );
            if record_status(&app, ctx, condition, true).await? {
                info!(written = outcome.written, "WasmApp synced");
                publish(
                    ctx,
                    &app,
                    EventType::Normal,
                    reasons::SYNCED,
                    "managed objects match the spec",
                )
                .await;
            } else {
                debug!(written = outcome.written, "WasmApp already in sync");
            }
            Ok(Action::await_change())
        }
        Err(e) => {
            let message = e.to_string();
            publish(ctx, &app, EventType::Warning, reasons::SYNC_FAILED, &message).await;
            let condition = Condition::new(
                CONDITION_READY,
                ConditionStatus::False,
                reasons::SYNC_FAILED,
                message,
            );
            if let Err(status_err) = record_status(&app, ctx, condition, false).await {
                warn!(error = %status_err, "failed to record SyncFailed condition");
            }
            Err(e)
        }
    }
}

/// Error policy for the WasmApp controller
pub fn error_policy(app: Arc<WasmApp>, error: &Error, ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        wasm_app = %app.name_any(),
        namespace = ?app.namespace(),
        "reconciliation failed"
    );
    Action::requeue(ctx.settings.error_requeue)
}

async fn apply_managed_objects(app: &WasmApp, ctx: &Context) -> Result<SyncOutcome, Error> {
    let namespace = app.namespace().unwrap_or_default();
    let name = app.name_any();
    let owner = app
        .controller_owner_ref(&())
        .ok_or_else(|| Error::validation(format!("WasmApp {name} has no uid")))?;

    // Fetch everything before writing anything
    let existing_service = ctx.store.get_service(&namespace, &name).await?;
    let existing_ingress = if app.spec.ingress_enabled() {
        Some(ctx.store.get_ingress(&namespace, &name).await?)
    } else {
        None
    };
    let existing_deployment = ctx.store.get_deployment(&namespace, &name).await?;

    let service = plan(existing_service, || ctx.templates.service(), &owner, |s| {
        prepare_service(s, app);
        Ok(())
    })?;
    let ingress = existing_ingress
        .map(|existing| {
            plan(existing, || ctx.templates.ingress(), &owner, |i| {
                prepare_ingress(i, app, &ctx.settings.default_ingress_domain)
            })
        })
        .transpose()?;
    let deployment = plan(existing_deployment, || ctx.templates.deployment(), &owner, |d| {
        prepare_deployment(d, app)
    })?;

    let mut outcome = SyncOutcome::default();

    let result = match service.op {
        WriteOp::Create => ctx.store.create_service(&service.object).await,
        WriteOp::Update => ctx.store.update_service(&service.object).await,
        WriteOp::Unchanged => Ok(()),
    };
    settle("Service", service.op, result, &mut outcome)?;

    if let Some(ingress) = ingress {
        let result = match ingress.op {
            WriteOp::Create => ctx.store.create_ingress(&ingress.object).await,
            WriteOp::Update => ctx.store.update_ingress(&ingress.object).await,
            WriteOp::Unchanged => Ok(()),
        };
        settle("Ingress", ingress.op, result, &mut outcome)?;
    }

    let result = match deployment.op {
        WriteOp::Create => ctx.store.create_deployment(&deployment.object).await,
        WriteOp::Update => ctx.store.update_deployment(&deployment.object).await,
        WriteOp::Unchanged => Ok(()),
    };
    settle("Deployment", deployment.op, result, &mut outcome)?;

    Ok(outcome)
}

/// Specialize the existing object, or a fresh template copy when absent
fn plan<K>(
    existing: Option<K>,
    template: impl FnOnce() -> K,
    owner: &OwnerReference,
    specialize: impl FnOnce(&mut K) -> Result<(), Error>,
) -> Result<Planned<K>, Error>
where
    K: Resource + Clone + PartialEq,
{
    let (mut object, op) = match &existing {
        Some(current) => (current.clone(), WriteOp::Update),
        None => (template(), WriteOp::Create),
    };
    specialize(&mut object)?;
    stamp_owner(object.meta_mut(), owner);

    let op = match existing {
        Some(current) if current == object => WriteOp::Unchanged,
        _ => op,
    };
    Ok(Planned { object, op })
}

/// Fold a write result into the outcome
///
/// Conflicts are counted and swallowed: the object keeps the other writer's
/// version until the next pass. Any other error aborts the sync.
fn settle(
    kind: &str,
    op: WriteOp,
    result: Result<(), Error>,
    outcome: &mut SyncOutcome,
) -> Result<(), Error> {
    match result {
        Ok(()) => {
            if op != WriteOp::Unchanged {
                debug!(kind, ?op, "wrote managed object");
                outcome.written += 1;
            }
            Ok(())
        }
        Err(e) if e.is_conflict() => {
            warn!(kind, error = %e, "conflict writing managed object, skipping");
            outcome.conflicts += 1;
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Set or replace this WasmApp's owner reference
pub fn stamp_owner(meta: &mut ObjectMeta, owner: &OwnerReference) {
    let refs = meta.owner_references.get_or_insert_with(Vec::new);
    match refs.iter_mut().find(|r| r.uid == owner.uid) {
        Some(existing) => *existing = owner.clone(),
        None => refs.push(owner.clone()),
    }
}

fn identity(meta: &mut ObjectMeta, app: &WasmApp) {
    meta.name = Some(app.name_any());
    meta.namespace = app.namespace();
}

fn app_labels(app: &WasmApp) -> BTreeMap<String, String> {
    BTreeMap::from([(APP_LABEL.to_string(), app.name_any())])
}

/// Overlay the WasmApp spec onto a Deployment
pub fn prepare_deployment(deployment: &mut Deployment, app: &WasmApp) -> Result<(), Error> {
    let name = app.name_any();
    identity(&mut deployment.metadata, app);

    let spec = deployment.spec.get_or_insert_with(Default::default);
    if let Some(replicas) = app.spec.replicas {
        spec.replicas = Some(replicas);
    }
    spec.selector.match_labels = Some(app_labels(app));

    let pod_meta = spec.template.metadata.get_or_insert_with(Default::default);
    pod_meta.labels = Some(app_labels(app));
    let annotations = pod_meta.annotations.get_or_insert_with(BTreeMap::new);
    annotations.insert(WASM_ANNOTATION.to_string(), "true".to_string());
    annotations.insert(IDENTIFIER_ANNOTATION.to_string(), name.clone());

    let pod_spec = spec
        .template
        .spec
        .as_mut()
        .ok_or_else(|| Error::validation(format!("Deployment {name} has no pod spec")))?;

    if let Some(runtime_class) = app.spec.runtime_class() {
        pod_spec.runtime_class_name = Some(runtime_class.to_string());
    }

    if let Some(secret) = app.spec.image_pull_secret() {
        let reference = LocalObjectReference {
            name: secret.to_string(),
        };
        let secrets = pod_spec.image_pull_secrets.get_or_insert_with(Vec::new);
        match secrets.first_mut() {
            Some(first) => *first = reference,
            None => secrets.push(reference),
        }
    }

    let container = pod_spec
        .containers
        .first_mut()
        .ok_or_else(|| Error::validation(format!("Deployment {name} has no containers")))?;
    container.name = name;
    container.image = Some(app.spec.image_reference());

    Ok(())
}

/// Overlay the WasmApp identity onto a Service
///
/// Ports are owned by the pod controller and left untouched.
pub fn prepare_service(service: &mut Service, app: &WasmApp) {
    identity(&mut service.metadata, app);
    let spec = service.spec.get_or_insert_with(Default::default);
    spec.selector = Some(app_labels(app));
}

/// Overlay the WasmApp ingress settings onto an Ingress
pub fn prepare_ingress(
    ingress: &mut Ingress,
    app: &WasmApp,
    default_domain: &str,
) -> Result<(), Error> {
    let name = app.name_any();
    let host = app.spec.ingress_host(&name, default_domain);
    identity(&mut ingress.metadata, app);

    let spec = ingress.spec.get_or_insert_with(Default::default);
    spec.ingress_class_name = Some(app.spec.ingress_class().to_string());

    let rule = spec
        .rules
        .as_mut()
        .and_then(|rules| rules.first_mut())
        .ok_or_else(|| Error::validation(format!("Ingress {name} has no rules")))?;
    rule.host = Some(host.clone());
    let backend = rule
        .http
        .as_mut()
        .and_then(|http| http.paths.first_mut())
        .and_then(|path| path.backend.service.as_mut())
        .ok_or_else(|| {
            Error::validation(format!("Ingress {name} has no HTTP path with a service backend"))
        })?;
    backend.name = name.clone();

    if app.spec.ingress_tls_enabled() {
        let tls = spec.tls.get_or_insert_with(Vec::new);
        match tls.first_mut() {
            Some(entry) => {
                let hosts = entry.hosts.get_or_insert_with(Vec::new);
                match hosts.first_mut() {
                    Some(first) => *first = host,
                    None => hosts.push(host),
                }
            }
            None => tls.push(IngressTLS {
                hosts: Some(vec![host]),
                secret_name: Some(format!("{name}-tls")),
            }),
        }
    } else {
        spec.tls = None;
    }

    Ok(())
}

/// Merge `condition` into the status and patch it if anything changed
///
/// Only the fields this controller owns are sent, so a concurrent `boundPort`
/// written by the pod controller survives. Returns whether a patch was sent.
async fn record_status(
    app: &WasmApp,
    ctx: &Context,
    condition: Condition,
    observed: bool,
) -> Result<bool, Error> {
    let current = app.status.clone().unwrap_or_default();
    let mut next = current.clone();
    next.set_condition(condition);
    if observed {
        next.observed_generation = app.metadata.generation;
    }
    if next == current {
        return Ok(false);
    }

    let patch = WasmAppStatus {
        observed_generation: next.observed_generation,
        conditions: next.conditions,
        bound_port: None,
    };
    ctx.store
        .patch_wasm_app_status(&app.namespace().unwrap_or_default(), &app.name_any(), &patch)
        .await?;
    Ok(true)
}

async fn publish(ctx: &Context, app: &WasmApp, type_: EventType, reason: &str, note: &str) {
    ctx.events
        .publish(
            &app.object_ref(&()),
            type_,
            reason,
            actions::SYNC,
            Some(note.to_string()),
        )
        .await;
}
