//! Domain types for the Kennel state store.
//!
//! These types represent the cached state of submitted tasks and cluster
//! instances. All types are serializable to/from JSON for storage in redb
//! tables. Timestamps are Unix epoch milliseconds.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a submitted task.
pub type TaskId = Uuid;

/// Identifier of the compute resource backing a cluster instance.
pub type InstanceId = String;

/// Set of task ids that have not reached a terminal state.
pub const ACTIVE_TASKS: &str = "activeTasks";

/// Set of instance ids launched but not yet joined to the cluster.
pub const PENDING_INSTANCES: &str = "pendingInstances";

/// Scalar holding the epoch-ms timestamp of the last launch batch.
pub const LAUNCH_TIMEOUT: &str = "launchTimeout";

/// Authoritative status of a container instance that accepts work.
pub const INSTANCE_ACTIVE: &str = "ACTIVE";

/// Authoritative status of an instance that no longer belongs to the cluster.
pub const INSTANCE_INACTIVE: &str = "INACTIVE";

/// Local status of an instance the autoscaler has retired.
pub const INSTANCE_DEREGISTERED: &str = "DEREGISTERED";

// ── Task ──────────────────────────────────────────────────────────

/// Everything the cluster needs to start a task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LaunchSpec {
    /// Cluster the task runs in.
    pub cluster: String,
    /// Task definition reference (`family:revision`).
    pub task_definition: String,
    /// Container whose command and environment are overridden.
    pub container_name: String,
    /// Command tokens.
    pub command: Vec<String>,
    /// Environment overrides.
    pub environment: BTreeMap<String, String>,
    /// Tag identifying who started the task.
    pub started_by: String,
}

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskStatus {
    Queued,
    Deferred,
    WaitingForCluster,
    Running,
    Stopped,
    Error,
}

impl TaskStatus {
    /// Whether no further transitions are possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Stopped | TaskStatus::Error)
    }

    /// Whether the task has been handed to the cluster (or finished).
    pub fn is_dispatched(self) -> bool {
        matches!(
            self,
            TaskStatus::Running | TaskStatus::Stopped | TaskStatus::Error
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Deferred => "deferred",
            TaskStatus::WaitingForCluster => "waitingForCluster",
            TaskStatus::Running => "running",
            TaskStatus::Stopped => "stopped",
            TaskStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// Cached state of a submitted task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskRecord {
    pub task_id: TaskId,
    pub launch_spec: LaunchSpec,
    pub status: TaskStatus,
    /// Cluster task arn, assigned once dispatched.
    pub arn: Option<String>,
    /// Requested start time; tasks far enough in the future are deferred.
    pub requested_launch_time: Option<u64>,
    /// Container-instance arn the task was placed on.
    pub running_on_instance: Option<String>,
    /// Last authoritative status string reported by the cluster.
    pub last_status: Option<String>,
    pub created_at: Option<u64>,
    pub started_at: Option<u64>,
    pub stopped_at: Option<u64>,
    pub stopped_reason: Option<String>,
    /// Failure cause when the cluster rejected the task.
    pub message: Option<String>,
    /// When the task was accepted.
    pub submitted_at: u64,
}

impl TaskRecord {
    /// A freshly submitted task.
    pub fn new(
        task_id: TaskId,
        launch_spec: LaunchSpec,
        status: TaskStatus,
        requested_launch_time: Option<u64>,
        submitted_at: u64,
    ) -> Self {
        Self {
            task_id,
            launch_spec,
            status,
            arn: None,
            requested_launch_time,
            running_on_instance: None,
            last_status: None,
            created_at: None,
            started_at: None,
            stopped_at: None,
            stopped_reason: None,
            message: None,
            submitted_at,
        }
    }
}

// ── Instance ──────────────────────────────────────────────────────

/// Cached state of a cluster instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct InstanceRecord {
    pub instance_id: InstanceId,
    /// Container-instance arn, assigned once the instance joins.
    pub arn: Option<String>,
    pub created_at: u64,
    /// Mirrored authoritative status; `None` while pending.
    pub status: Option<String>,
    pub running_tasks_count: u32,
    pub pending_tasks_count: u32,
    /// Start of the current idle episode. Only set while both counts are zero.
    pub idle_since: Option<u64>,
    /// Task this instance was launched for.
    pub earmark: Option<String>,
    pub registered_cpu: Option<i64>,
    pub registered_memory: Option<i64>,
    pub remaining_cpu: Option<i64>,
    pub remaining_memory: Option<i64>,
}

impl InstanceRecord {
    /// A just-launched instance that has not joined the cluster.
    pub fn pending(instance_id: &str, created_at: u64, earmark: Option<String>) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            created_at,
            earmark,
            ..Self::default()
        }
    }

    /// Joined and accepting work.
    pub fn is_active(&self) -> bool {
        self.arn.is_some() && self.status.as_deref() == Some(INSTANCE_ACTIVE)
    }

    /// No running or pending tasks.
    pub fn is_passive(&self) -> bool {
        self.running_tasks_count == 0 && self.pending_tasks_count == 0
    }
}

/// Current Unix epoch in milliseconds.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_status_serializes_camel_case() {
        let json = serde_json::to_string(&TaskStatus::WaitingForCluster).unwrap();
        assert_eq!(json, "\"waitingForCluster\"");
        assert_eq!(TaskStatus::WaitingForCluster.to_string(), "waitingForCluster");
    }

    #[test]
    fn terminal_and_dispatched_states() {
        assert!(TaskStatus::Stopped.is_terminal());
        assert!(TaskStatus::Error.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(TaskStatus::Running.is_dispatched());
        assert!(!TaskStatus::Queued.is_dispatched());
    }

    #[test]
    fn pending_instance_is_not_active() {
        let rec = InstanceRecord::pending("i-1", 10, Some("t".to_string()));
        assert!(!rec.is_active());
        assert!(rec.is_passive());
        assert_eq!(rec.earmark.as_deref(), Some("t"));
    }
}
