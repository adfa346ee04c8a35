//! WasmApp Custom Resource Definition
//!
//! A WasmApp describes one WebAssembly workload: the OCI image to run, how many
//! replicas, and how it should be exposed. The controller derives a Deployment,
//! a Service and (optionally) an Ingress from it and never writes the spec.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, ConditionStatus};
use crate::{DEFAULT_INGRESS_CLASS, Error};

/// Condition type summarizing whether managed objects match the spec
pub const CONDITION_READY: &str = "Ready";

/// Specification for a WasmApp
///
/// Only `ociImage` and `ociImageTag` are required. Every other field is optional
/// and an absent value keeps the base template's setting or reads as "off".
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "operator.kube-spin.mrezhi.net",
    version = "v1alpha1",
    kind = "WasmApp",
    plural = "wasmapps",
    shortname = "wa",
    status = "WasmAppStatus",
    namespaced,
    printcolumn = r#"{"name":"Image","type":"string","jsonPath":".spec.ociImage"}"#,
    printcolumn = r#"{"name":"Tag","type":"string","jsonPath":".spec.ociImageTag"}"#,
    printcolumn = r#"{"name":"Replicas","type":"integer","jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"Port","type":"integer","jsonPath":".status.boundPort"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct WasmAppSpec {
    /// Desired replica count; the template's count is kept when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// OCI image repository holding the wasm module
    pub oci_image: String,

    /// OCI image tag
    pub oci_image_tag: String,

    /// Whether the workload may make outbound HTTP requests
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outbound_http: Option<bool>,

    /// Name of the image pull secret for private registries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_secret: Option<String>,

    /// RuntimeClass selecting the wasm shim on the node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_class: Option<String>,

    /// Create an Ingress for the workload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress_enabled: Option<bool>,

    /// Ingress class name (defaults to `nginx`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress_class: Option<String>,

    /// Ingress host (defaults to `<name>.<default domain>`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress_host: Option<String>,

    /// Terminate TLS on the Ingress for the ingress host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress_tls_enabled: Option<bool>,
}

/// Treat `Some("")` the same as an unset field
fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

impl WasmAppSpec {
    /// Full image reference `<ociImage>:<ociImageTag>`
    pub fn image_reference(&self) -> String {
        format!("{}:{}", self.oci_image, self.oci_image_tag)
    }

    /// Validate the spec
    pub fn validate(&self) -> Result<(), Error> {
        if self.oci_image.trim().is_empty() {
            return Err(Error::validation("spec.ociImage must not be empty"));
        }
        if self.oci_image_tag.trim().is_empty() {
            return Err(Error::validation("spec.ociImageTag must not be empty"));
        }
        if let Some(replicas) = self.replicas {
            if replicas < 0 {
                return Err(Error::validation(format!(
                    "spec.replicas must not be negative, got {replicas}"
                )));
            }
        }
        Ok(())
    }

    /// Whether an Ingress is managed for this app (absent reads as false)
    pub fn ingress_enabled(&self) -> bool {
        self.ingress_enabled.unwrap_or(false)
    }

    /// Whether the Ingress terminates TLS (absent reads as false)
    pub fn ingress_tls_enabled(&self) -> bool {
        self.ingress_tls_enabled.unwrap_or(false)
    }

    /// Whether outbound HTTP is requested (absent reads as false)
    pub fn outbound_http(&self) -> bool {
        self.outbound_http.unwrap_or(false)
    }

    /// Configured pull secret, if any
    pub fn image_pull_secret(&self) -> Option<&str> {
        non_empty(&self.image_pull_secret)
    }

    /// Configured runtime class, if any
    pub fn runtime_class(&self) -> Option<&str> {
        non_empty(&self.runtime_class)
    }

    /// Ingress class, falling back to [`DEFAULT_INGRESS_CLASS`]
    pub fn ingress_class(&self) -> &str {
        non_empty(&self.ingress_class).unwrap_or(DEFAULT_INGRESS_CLASS)
    }

    /// Ingress host, synthesized from the resource name when unset
    pub fn ingress_host(&self, name: &str, default_domain: &str) -> String {
        match non_empty(&self.ingress_host) {
            Some(host) => host.to_string(),
            None => format!("{name}.{default_domain}"),
        }
    }
}

/// Observed state of a WasmApp
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WasmAppStatus {
    /// Generation of the spec last processed by the controller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Conditions representing the resource state
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Port most recently bound to the Service from a running instance
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bound_port: Option<i32>,
}

impl WasmAppStatus {
    /// Add a condition and return self for chaining
    pub fn condition(mut self, condition: Condition) -> Self {
        self.set_condition(condition);
        self
    }

    /// Insert or replace a condition by type
    ///
    /// When the condition's state is unchanged the previous transition time is
    /// kept, so re-reconciling an unchanged resource yields an identical status.
    pub fn set_condition(&mut self, mut condition: Condition) {
        if let Some(existing) = self.conditions.iter().find(|c| c.type_ == condition.type_) {
            if existing.same_state(&condition) {
                condition.last_transition_time = existing.last_transition_time;
            }
        }
        self.conditions.retain(|c| c.type_ != condition.type_);
        self.conditions.push(condition);
    }

    /// Look up a condition by type
    pub fn get_condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    /// True when the Ready condition is True
    pub fn is_ready(&self) -> bool {
        self.get_condition(CONDITION_READY)
            .map(|c| c.status == ConditionStatus::True)
            .unwrap_or(false)
    }
}
