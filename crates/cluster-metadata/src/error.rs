//! Controller-specific error types.
//!
//! One enum covers startup configuration problems, cache sync barriers,
//! collaborator failures surfaced to queries and serialization faults.

use thiserror::Error;
use kube::Error as KubeError;

/// Errors that can occur while orchestrating controllers or serving metadata.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Two catalog entries share a name
    #[error("Controller registered twice: {0}")]
    DuplicateController(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Required caches did not report synced before the deadline or shutdown
    #[error("Caches failed to sync: {}", caches.join(", "))]
    SyncTimeout {
        /// Names of the caches still unsynced, sorted
        caches: Vec<String>,
    },

    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),

    /// An upstream collaborator (cache, metrics backend) is unavailable
    #[error("Collaborator unavailable: {0}")]
    Collaborator(String),

    /// Queried key has no cached metadata
    #[error("Not found: {0}")]
    NotFound(String),

    /// JSON encoding error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Metrics registry error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
