//! Error types for the kube-spin operator

use thiserror::Error;

/// Main error type for kube-spin operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Optimistic-concurrency conflict on a write (stale resourceVersion)
    #[error("conflict writing {kind} {name}: {message}")]
    Conflict {
        /// Kind of the object being written
        kind: String,
        /// Name of the object being written
        name: String,
        /// Message returned by the API server
        message: String,
    },

    /// Create of an object that already exists
    #[error("{kind} {name} already exists")]
    AlreadyExists {
        /// Kind of the object being created
        kind: String,
        /// Name of the object being created
        name: String,
    },

    /// Validation error for a WasmApp spec or a managed object's shape
    #[error("validation error: {0}")]
    Validation(String),

    /// Base manifest template is missing or malformed
    #[error("template error: {0}")]
    Template(String),

    /// Port registry is unreachable or returned an unexpected reply
    #[error("port registry error: {0}")]
    Registry(String),

    /// Port read from the registry is not a valid TCP port
    #[error("invalid port {value:?} for container {container_id}")]
    InvalidPort {
        /// Raw value stored in the registry
        value: String,
        /// Container ID the port was looked up for
        container_id: String,
    },

    /// A required pod annotation is absent
    #[error("pod {pod} is missing annotation {annotation}")]
    MissingAnnotation {
        /// Name of the pod
        pod: String,
        /// Annotation key that was expected
        annotation: String,
    },

    /// A managed object that must exist was not found
    #[error("managed {kind} {namespace}/{name} not found")]
    MissingManagedObject {
        /// Kind of the missing object
        kind: String,
        /// Namespace of the missing object
        namespace: String,
        /// Name of the missing object
        name: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a template error with the given message
    pub fn template(msg: impl Into<String>) -> Self {
        Self::Template(msg.into())
    }

    /// Create a registry error with the given message
    pub fn registry(msg: impl Into<String>) -> Self {
        Self::Registry(msg.into())
    }

    /// Create a missing managed object error
    pub fn missing_object(
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self::MissingManagedObject {
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Translate a write error from the API server, classifying 409 responses
    ///
    /// The API server answers both stale updates and duplicate creates with 409;
    /// the `reason` field tells them apart.
    pub fn from_write(kind: &str, name: &str, err: kube::Error) -> Self {
        match err {
            kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => {
                Self::AlreadyExists {
                    kind: kind.to_string(),
                    name: name.to_string(),
                }
            }
            kube::Error::Api(ae) if ae.code == 409 => Self::Conflict {
                kind: kind.to_string(),
                name: name.to_string(),
                message: ae.message,
            },
            other => Self::Kube(other),
        }
    }

    /// True for optimistic-concurrency conflicts
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}
