//! Controllers for kube-spin
//!
//! Two independent reconcilers share one [`Context`]:
//!
//! - [`wasm_app`] derives a Deployment, a Service and an optional Ingress from
//!   each WasmApp and keeps them in sync with its spec.
//! - [`pod`] watches workload pods and, once an instance is running, patches the
//!   port it bound into the Service and Ingress of its WasmApp.
//!
//! Managed objects are correlated with their WasmApp by identity: every managed
//! object has the same namespace and name as the WasmApp that owns it. Pods are
//! correlated by the annotation pair the Deployment's pod template carries.

use std::sync::Arc;
use std::time::Duration;

use kube::Client;

pub mod events;
pub mod pod;
mod store;
#[cfg(test)]
pub(crate) mod testing;
pub mod wasm_app;

pub use events::{EventPublisher, KubeEventPublisher, NoopEventPublisher};
pub use store::{KubeObjectStore, ObjectStore};

#[cfg(test)]
pub use store::MockObjectStore;

use crate::registry::PortRegistry;
use crate::template::TemplateProvider;
use crate::DEFAULT_INGRESS_DOMAIN;

/// Name reported as the source of Kubernetes Events
pub const CONTROLLER_NAME: &str = "kube-spin-controller";

/// Default requeue interval after a failed reconcile
pub const DEFAULT_ERROR_REQUEUE: Duration = Duration::from_secs(30);

/// Tunables shared by both controllers
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControllerSettings {
    /// Domain used to synthesize `<name>.<domain>` when a WasmApp sets no ingress host
    pub default_ingress_domain: String,
    /// Requeue interval for a running pod whose port is not registered yet
    ///
    /// `None` leaves re-triggering to later pod events.
    pub port_recheck: Option<Duration>,
    /// Requeue interval after a failed reconcile
    pub error_requeue: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            default_ingress_domain: DEFAULT_INGRESS_DOMAIN.to_string(),
            port_recheck: None,
            error_requeue: DEFAULT_ERROR_REQUEUE,
        }
    }
}

/// Controller context containing shared state and clients
///
/// The context is shared across all reconciliation calls of both controllers.
///
/// Use [`ContextBuilder`] to construct instances:
///
/// ```ignore
/// let ctx = Context::builder(client, templates, registry)
///     .settings(settings)
///     .build();
/// ```
pub struct Context {
    /// Cluster object store (trait object for testability)
    pub store: Arc<dyn ObjectStore>,
    /// Base manifests for managed objects
    pub templates: Arc<dyn TemplateProvider>,
    /// Container ID to port lookup
    pub registry: Arc<dyn PortRegistry>,
    /// Kubernetes Event publisher
    pub events: Arc<dyn EventPublisher>,
    /// Controller tunables
    pub settings: ControllerSettings,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(
        client: Client,
        templates: Arc<dyn TemplateProvider>,
        registry: Arc<dyn PortRegistry>,
    ) -> ContextBuilder {
        ContextBuilder::new(client, templates, registry)
    }

    /// Create a context for testing with custom doubles
    ///
    /// Events are dropped and settings are the defaults; both fields are public
    /// and can be replaced before the context is shared.
    #[cfg(test)]
    pub fn for_testing(
        store: Arc<dyn ObjectStore>,
        templates: Arc<dyn TemplateProvider>,
        registry: Arc<dyn PortRegistry>,
    ) -> Self {
        Self {
            store,
            templates,
            registry,
            events: Arc::new(NoopEventPublisher),
            settings: ControllerSettings::default(),
        }
    }
}

/// Builder for constructing [`Context`] instances
pub struct ContextBuilder {
    client: Client,
    templates: Arc<dyn TemplateProvider>,
    registry: Arc<dyn PortRegistry>,
    events: Option<Arc<dyn EventPublisher>>,
    settings: ControllerSettings,
}

impl ContextBuilder {
    fn new(
        client: Client,
        templates: Arc<dyn TemplateProvider>,
        registry: Arc<dyn PortRegistry>,
    ) -> Self {
        Self {
            client,
            templates,
            registry,
            events: None,
            settings: ControllerSettings::default(),
        }
    }

    /// Set the controller tunables
    pub fn settings(mut self, settings: ControllerSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Override the event publisher
    pub fn events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        Context {
            store: Arc::new(KubeObjectStore::new(self.client.clone())),
            events: self
                .events
                .unwrap_or_else(|| Arc::new(KubeEventPublisher::new(self.client, CONTROLLER_NAME))),
            templates: self.templates,
            registry: self.registry,
            settings: self.settings,
        }
    }
}
