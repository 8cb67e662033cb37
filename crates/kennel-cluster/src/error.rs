//! Cluster client error types.

use thiserror::Error;

/// Result type alias for cluster operations.
pub type ClusterResult<T> = Result<T, ClusterError>;

/// Errors reported by a cluster client.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// The control-plane API could not be reached or failed transiently.
    #[error("cluster API unavailable: {0}")]
    Unavailable(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("instance {instance} reports no {resource} resource")]
    MissingResource { instance: String, resource: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}
