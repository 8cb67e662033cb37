//! Descriptions returned by the cluster control plane.

use serde::{Deserialize, Serialize};

use crate::error::{ClusterError, ClusterResult};

/// Resource name for CPU units.
pub const CPU: &str = "CPU";

/// Resource name for memory (MiB).
pub const MEMORY: &str = "MEMORY";

/// Authoritative last status of a task that has finished.
pub const TASK_STOPPED: &str = "STOPPED";

/// Tag carrying the task id an instance was launched for.
pub const EARMARK_TAG: &str = "kennel:earmark";

/// A named integer resource on a container instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Resource {
    pub name: String,
    pub integer_value: i64,
}

impl Resource {
    pub fn new(name: &str, integer_value: i64) -> Self {
        Self {
            name: name.to_string(),
            integer_value,
        }
    }
}

/// Authoritative description of a container instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstanceDescription {
    pub container_instance_arn: String,
    /// Id of the compute resource backing the container instance.
    pub ec2_instance_id: String,
    /// ACTIVE, DRAINING, INACTIVE, ...
    pub status: String,
    pub running_tasks_count: u32,
    pub pending_tasks_count: u32,
    /// Total capacity.
    pub registered_resources: Vec<Resource>,
    /// Capacity not reserved by placed tasks.
    pub remaining_resources: Vec<Resource>,
}

impl InstanceDescription {
    /// Unreserved amount of a resource.
    pub fn remaining(&self, name: &str) -> ClusterResult<i64> {
        find_resource(&self.remaining_resources, name).ok_or_else(|| {
            ClusterError::MissingResource {
                instance: self.container_instance_arn.clone(),
                resource: name.to_string(),
            }
        })
    }

    /// Total registered amount of a resource, if reported.
    pub fn registered(&self, name: &str) -> Option<i64> {
        find_resource(&self.registered_resources, name)
    }
}

fn find_resource(resources: &[Resource], name: &str) -> Option<i64> {
    resources
        .iter()
        .find(|r| r.name == name)
        .map(|r| r.integer_value)
}

/// Authoritative description of a task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskDescription {
    pub task_arn: String,
    /// PROVISIONING, PENDING, RUNNING, STOPPED, ...
    pub last_status: String,
    pub container_instance_arn: Option<String>,
    pub created_at: Option<u64>,
    pub started_at: Option<u64>,
    pub stopped_at: Option<u64>,
    pub stopped_reason: Option<String>,
}

impl TaskDescription {
    pub fn is_stopped(&self) -> bool {
        self.last_status == TASK_STOPPED
    }
}

/// One container of a task definition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub cpu: i64,
    pub memory: i64,
}

/// A registered task definition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskDefinition {
    pub reference: String,
    pub containers: Vec<ContainerSpec>,
}

/// A task accepted by the cluster.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunResult {
    pub task_arn: String,
    pub container_instance_arn: String,
}

/// Why the cluster refused to place a task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Failure {
    pub arn: Option<String>,
    pub reason: String,
}

/// Result of a `run_task` call that reached the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Started(RunResult),
    /// Explicit placement failures (not a transport error).
    Rejected(Vec<Failure>),
}

/// Key/value tag attached to a compute instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

/// Value of the earmark tag, if present.
pub fn earmark_from_tags(tags: &[Tag]) -> Option<String> {
    tags.iter()
        .find(|t| t.key == EARMARK_TAG)
        .map(|t| t.value.clone())
}
