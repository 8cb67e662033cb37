//! Admission controller — can a task be placed right now?
//!
//! Required resources come from the last container of the task definition.
//! Instances are tried in listing order and the first one with enough
//! remaining CPU and memory whose earmark does not belong to another live
//! task wins.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, warn};

use kennel_cluster::*;
use kennel_state::*;

use crate::error::SchedulerResult;

/// CPU and memory a task needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Requirements {
    pub cpu: i64,
    pub memory: i64,
}

impl Requirements {
    /// Requirements of the last container in the definition.
    pub fn of(definition: &TaskDefinition) -> ClusterResult<Self> {
        let last = definition.containers.last().map(|c| Self {
            cpu: c.cpu,
            memory: c.memory,
        });
        last.ok_or_else(|| {
            ClusterError::InvalidResponse(format!(
                "task definition {} has no containers",
                definition.reference
            ))
        })
    }
}

/// Whether an instance earmark lets `task_id` use the instance.
pub fn earmark_allows(earmark: Option<&str>, task_id: &TaskId, active: &HashSet<String>) -> bool {
    match earmark {
        None => true,
        Some(mark) => mark == task_id.to_string() || !active.contains(mark),
    }
}

/// Decides whether a task fits on the cluster as it is now.
#[derive(Clone)]
pub struct AdmissionController {
    state: StateStore,
    cluster: Arc<dyn ClusterClient>,
}

impl AdmissionController {
    pub fn new(state: StateStore, cluster: Arc<dyn ClusterClient>) -> Self {
        Self { state, cluster }
    }

    /// True if some instance can take the task. Any error counts as no capacity.
    pub async fn can_run_now(&self, task_id: &TaskId, spec: &LaunchSpec) -> bool {
        match self.find_instance(task_id, spec).await {
            Ok(found) => found.is_some(),
            Err(e) => {
                warn!(%task_id, error = %e, "admission check failed, assuming no capacity");
                false
            }
        }
    }

    /// First instance that can take the task.
    pub async fn find_instance(
        &self,
        task_id: &TaskId,
        spec: &LaunchSpec,
    ) -> SchedulerResult<Option<InstanceDescription>> {
        let definition = self
            .cluster
            .describe_task_definition(&spec.task_definition)
            .await?;
        let required = Requirements::of(&definition)?;
        let descriptions = describe_all_instances(self.cluster.as_ref()).await?;
        let active: HashSet<String> = self
            .state
            .active_task_ids()?
            .iter()
            .map(ToString::to_string)
            .collect();

        for desc in descriptions {
            let cpu = desc.remaining(CPU)?;
            let memory = desc.remaining(MEMORY)?;
            if cpu < required.cpu || memory < required.memory {
                continue;
            }
            let earmark = self.earmark_of(&desc).await?;
            if earmark_allows(earmark.as_deref(), task_id, &active) {
                debug!(
                    %task_id,
                    instance = %desc.container_instance_arn,
                    cpu = required.cpu,
                    memory = required.memory,
                    "instance has room"
                );
                return Ok(Some(desc));
            }
            debug!(%task_id, instance = %desc.container_instance_arn, ?earmark, "instance reserved for another task");
        }
        Ok(None)
    }

    /// Earmark from the cached record, or from tags for unseen instances.
    async fn earmark_of(&self, desc: &InstanceDescription) -> SchedulerResult<Option<String>> {
        if let Some(record) = self.state.get_instance(&desc.ec2_instance_id)? {
            return Ok(record.earmark);
        }
        let tags = self.cluster.get_instance_tags(&desc.ec2_instance_id).await?;
        Ok(earmark_from_tags(&tags))
    }
}
