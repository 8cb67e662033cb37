//! Scheduler error types.

use thiserror::Error;

use kennel_state::TaskId;

/// Errors that can occur during scheduling operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    /// A submission was missing or had a malformed field.
    #[error("invalid task request: {0}")]
    Validation(String),

    #[error("state store error: {0}")]
    State(#[from] kennel_state::StateError),

    #[error("cluster error: {0}")]
    Cluster(#[from] kennel_cluster::ClusterError),

    #[error("queue error: {0}")]
    Queue(#[from] kennel_queue::QueueError),

    #[error("provisioning error: {0}")]
    Provision(#[from] anyhow::Error),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
