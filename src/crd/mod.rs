//! Custom Resource Definitions for kube-spin
//!
//! This module contains the WasmApp CRD and the status types it uses.

mod types;
mod wasm_app;

pub use types::{Condition, ConditionStatus};
pub use wasm_app::{WasmApp, WasmAppSpec, WasmAppStatus, CONDITION_READY};
