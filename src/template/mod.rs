//! Base manifests for managed objects
//!
//! Every managed Deployment, Service and Ingress starts life as a copy of a base
//! manifest which the WasmApp controller then specializes. The manifests are
//! compiled into the binary and can be replaced at startup with a directory of
//! operator-supplied files.
//!
//! Templates are startup-time assets: a missing or malformed template is reported
//! once as a [`Error::Template`] and the process refuses to start.

use std::path::Path;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::Ingress;
use serde::de::DeserializeOwned;
use tracing::info;

use crate::{Error, Result};

const DEPLOYMENT_TEMPLATE: &str = include_str!("../../templates/deployment.yaml");
const SERVICE_TEMPLATE: &str = include_str!("../../templates/service.yaml");
const INGRESS_TEMPLATE: &str = include_str!("../../templates/ingress.yaml");

/// Kinds of managed objects that have a base template
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TemplateKind {
    /// apps/v1 Deployment
    Deployment,
    /// v1 Service
    Service,
    /// networking.k8s.io/v1 Ingress
    Ingress,
}

impl TemplateKind {
    /// File name of the template inside a template directory
    pub fn file_name(&self) -> &'static str {
        match self {
            Self::Deployment => "deployment.yaml",
            Self::Service => "service.yaml",
            Self::Ingress => "ingress.yaml",
        }
    }
}

impl std::fmt::Display for TemplateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Deployment => write!(f, "Deployment"),
            Self::Service => write!(f, "Service"),
            Self::Ingress => write!(f, "Ingress"),
        }
    }
}

/// Source of base objects for the managed kinds
///
/// Each call returns a fresh copy that the caller is free to mutate.
pub trait TemplateProvider: Send + Sync {
    /// Base Deployment
    fn deployment(&self) -> Deployment;

    /// Base Service
    fn service(&self) -> Service;

    /// Base Ingress
    fn ingress(&self) -> Ingress;
}

/// Templates decoded from YAML manifests
#[derive(Clone, Debug)]
pub struct ManifestTemplates {
    deployment: Deployment,
    service: Service,
    ingress: Ingress,
}

impl ManifestTemplates {
    /// Templates compiled into the binary
    pub fn embedded() -> Result<Self> {
        Self::from_sources(DEPLOYMENT_TEMPLATE, SERVICE_TEMPLATE, INGRESS_TEMPLATE)
    }

    /// Load `deployment.yaml`, `service.yaml` and `ingress.yaml` from a directory
    pub fn from_dir(dir: &Path) -> Result<Self> {
        let read = |kind: TemplateKind| {
            let path = dir.join(kind.file_name());
            std::fs::read_to_string(&path).map_err(|e| {
                Error::template(format!("failed to read {} template {:?}: {}", kind, path, e))
            })
        };

        let templates = Self::from_sources(
            &read(TemplateKind::Deployment)?,
            &read(TemplateKind::Service)?,
            &read(TemplateKind::Ingress)?,
        )?;
        info!(dir = %dir.display(), "loaded manifest templates from directory");
        Ok(templates)
    }

    /// Decode and validate templates from raw YAML
    pub fn from_sources(deployment: &str, service: &str, ingress: &str) -> Result<Self> {
        let templates = Self {
            deployment: decode(TemplateKind::Deployment, deployment)?,
            service: decode(TemplateKind::Service, service)?,
            ingress: decode(TemplateKind::Ingress, ingress)?,
        };
        templates.validate()?;
        Ok(templates)
    }

    /// Check the shape the WasmApp controller relies on
    fn validate(&self) -> Result<()> {
        let has_container = self
            .deployment
            .spec
            .as_ref()
            .and_then(|s| s.template.spec.as_ref())
            .map(|s| !s.containers.is_empty())
            .unwrap_or(false);
        if !has_container {
            return Err(Error::template(
                "Deployment template must define a pod spec with at least one container",
            ));
        }

        let has_service_backend = self
            .ingress
            .spec
            .as_ref()
            .and_then(|s| s.rules.as_ref())
            .and_then(|rules| rules.first())
            .and_then(|rule| rule.http.as_ref())
            .and_then(|http| http.paths.first())
            .map(|path| path.backend.service.is_some())
            .unwrap_or(false);
        if !has_service_backend {
            return Err(Error::template(
                "Ingress template must define a rule with an HTTP path backed by a service",
            ));
        }

        Ok(())
    }
}

impl TemplateProvider for ManifestTemplates {
    fn deployment(&self) -> Deployment {
        self.deployment.clone()
    }

    fn service(&self) -> Service {
        self.service.clone()
    }

    fn ingress(&self) -> Ingress {
        self.ingress.clone()
    }
}

fn decode<T: DeserializeOwned>(kind: TemplateKind, source: &str) -> Result<T> {
    serde_yaml::from_str(source)
        .map_err(|e| Error::template(format!("malformed {} template: {}", kind, e)))
}
