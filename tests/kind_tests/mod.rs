//! Integration tests for the kube-spin operator
//!
//! These tests require a Kubernetes cluster (kind) and tell the story of how
//! developers run wasm applications with kube-spin.
//!
//! # Test Organization
//!
//! - `crd_operations`: creating, patching and validating WasmApp resources
//!   through the Kubernetes API
//! - `wasm_app_sync`: the controllers converging managed objects against a live
//!   API server
//!
//! # Running These Tests
//!
//! ```bash
//! cargo test --test kind -- --ignored
//! ```

mod crd_operations;
mod helpers;
