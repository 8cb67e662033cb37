//! Job kinds and priorities.

use std::fmt;

use serde::{Deserialize, Serialize};

use kennel_state::TaskId;

use crate::error::{QueueError, QueueResult};

/// A unit of work for the scheduler worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Job {
    /// Dispatch one task, forcing it out of `deferred`.
    #[serde(rename_all = "camelCase")]
    RunTask { task_id: TaskId },
    /// Run the autoscaler once.
    ClusterResize,
}

impl Job {
    /// Parse a wire payload, rejecting unknown kinds and malformed fields.
    pub fn from_json(payload: &str) -> QueueResult<Self> {
        serde_json::from_str(payload).map_err(|e| QueueError::Decode(e.to_string()))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Job::RunTask { .. } => "runTask",
            Job::ClusterResize => "clusterResize",
        }
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Job::RunTask { task_id } => write!(f, "runTask({task_id})"),
            Job::ClusterResize => f.write_str("clusterResize()"),
        }
    }
}

/// Ordering among due jobs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    Medium,
    High,
    Critical,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_task_payload_shape() {
        let id = TaskId::new_v4();
        let json = serde_json::to_string(&Job::RunTask { task_id: id }).unwrap();
        assert_eq!(json, format!("{{\"type\":\"runTask\",\"taskId\":\"{id}\"}}"));
        assert_eq!(Job::from_json(&json).unwrap(), Job::RunTask { task_id: id });
    }

    #[test]
    fn cluster_resize_has_no_fields() {
        let job = Job::from_json(r#"{"type":"clusterResize"}"#).unwrap();
        assert_eq!(job, Job::ClusterResize);
        assert_eq!(job.kind(), "clusterResize");
    }

    #[test]
    fn malformed_payloads_are_rejected() {
        assert!(Job::from_json(r#"{"type":"runTask"}"#).is_err());
        assert!(Job::from_json(r#"{"type":"runTask","taskId":"not-a-uuid"}"#).is_err());
        assert!(Job::from_json(r#"{"type":"purge"}"#).is_err());
    }

    #[test]
    fn priority_order() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::Normal > Priority::Low);
        assert_eq!(Priority::default(), Priority::Normal);
    }
}
