//! kube-spin - Kubernetes operator for WebAssembly applications
//!
//! kube-spin turns a `WasmApp` custom resource into a Deployment, a Service and an
//! optional Ingress, and wires the Service to the port the wasm runtime picked for
//! the workload once its container is running.
//!
//! # Architecture
//!
//! Two independent reconcilers share one cluster object store:
//! - The WasmApp controller converges managed objects toward the resource spec
//! - The Pod controller resolves a running container's port from the port registry
//!   and patches the managed Service and Ingress with it
//!
//! Pods are correlated with their `WasmApp` through the annotation pair
//! [`WASM_ANNOTATION`] / [`IDENTIFIER_ANNOTATION`] and identity equality of names,
//! never through label selectors.
//!
//! # Modules
//!
//! - [`crd`] - The `WasmApp` custom resource and status types
//! - [`controller`] - Reconciliation logic for WasmApps and Pods
//! - [`template`] - Base manifests the managed objects are specialized from
//! - [`registry`] - Port registry client (container ID to port)
//! - [`retry`] - Startup retry helper
//! - [`error`] - Error types for the operator

#![deny(missing_docs)]

pub mod controller;
pub mod crd;
pub mod error;
pub mod registry;
pub mod retry;
pub mod template;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Correlation contract
// =============================================================================
// These annotation keys are written on the pod template of every managed
// Deployment and read back from pods by the Pod controller. Runtime agents and
// existing workloads depend on the exact strings.

/// Presence-only marker: the pod belongs to a managed wasm workload
pub const WASM_ANNOTATION: &str = "kube-spin.mrezhi.net/wasm";

/// Name of the `WasmApp` that owns the pod
pub const IDENTIFIER_ANNOTATION: &str = "kube-spin.mrezhi.net/identifier";

/// Label used for pod selection by the managed Deployment and Service
pub const APP_LABEL: &str = "app";

/// Field manager used for server-side apply and status patches
pub const FIELD_MANAGER: &str = "kube-spin-controller";

/// Default ingress class when the resource does not name one
pub const DEFAULT_INGRESS_CLASS: &str = "nginx";

/// Default domain used to synthesize an ingress host from the resource name
pub const DEFAULT_INGRESS_DOMAIN: &str = "example.local";
