//! Port registry client
//!
//! A runtime agent on each node publishes the port a wasm workload bound to,
//! keyed by the container ID. The Pod controller reads it back here.
//!
//! A missing entry is the normal state before the workload has bound a port and
//! is reported as `Ok(None)`. An unreachable registry is a retryable
//! [`Error::Registry`].

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::{debug, instrument};

#[cfg(test)]
use mockall::automock;

use crate::Error;

/// Default bound on a single registry lookup
pub const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_secs(2);

/// Lookup of container ID to port
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PortRegistry: Send + Sync {
    /// Look up the raw port value stored for a container
    ///
    /// # Arguments
    ///
    /// * `container_id` - Container ID with the runtime prefix already stripped
    ///
    /// # Returns
    ///
    /// `Ok(None)` when no entry exists yet, the stored value otherwise.
    async fn lookup(&self, container_id: &str) -> Result<Option<String>, Error>;
}

/// Port registry backed by a Redis key-value store
///
/// Uses a [`ConnectionManager`], which reconnects transparently after network
/// failures. Cloning is cheap and shares the connection.
#[derive(Clone)]
pub struct RedisPortRegistry {
    connection: ConnectionManager,
    timeout: Duration,
}

impl RedisPortRegistry {
    /// Connect to the registry at `url` (e.g. `redis://:secret@10.0.0.5:6379/0`)
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self, Error> {
        let client = redis::Client::open(url)
            .map_err(|e| Error::registry(format!("invalid registry url: {}", e)))?;
        let connection = tokio::time::timeout(timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| Error::registry(format!("connect timed out after {:?}", timeout)))?
            .map_err(|e| Error::registry(format!("failed to connect: {}", e)))?;
        Ok(Self {
            connection,
            timeout,
        })
    }
}

#[async_trait]
impl PortRegistry for RedisPortRegistry {
    #[instrument(skip(self))]
    async fn lookup(&self, container_id: &str) -> Result<Option<String>, Error> {
        let mut connection = self.connection.clone();
        let value: Option<String> =
            tokio::time::timeout(self.timeout, connection.get(container_id))
                .await
                .map_err(|_| {
                    Error::registry(format!("lookup timed out after {:?}", self.timeout))
                })?
                .map_err(|e| Error::registry(format!("lookup failed: {}", e)))?;

        debug!(found = value.is_some(), "port registry lookup");
        Ok(value)
    }
}

/// Strip the container runtime scheme from a container ID
///
/// Kubelet reports IDs as `<runtime>://<id>` (`containerd://`, `cri-o://`,
/// `docker://`); the registry is keyed by the bare ID.
pub fn strip_runtime_prefix(container_id: &str) -> &str {
    match container_id.split_once("://") {
        Some((_, id)) => id,
        None => container_id,
    }
}

/// Parse a registry value into a TCP port number
///
/// Only decimal integers in `1..=65535` are accepted.
pub fn parse_port(value: &str, container_id: &str) -> Result<i32, Error> {
    let invalid = || Error::InvalidPort {
        value: value.to_string(),
        container_id: container_id.to_string(),
    };
    let port: i32 = value.parse().map_err(|_| invalid())?;
    if (1..=65535).contains(&port) {
        Ok(port)
    } else {
        Err(invalid())
    }
}
