//! Task submission.
//!
//! Validates a request, records the task, and enqueues its dispatch job.
//! Tasks whose requested launch time is further out than the lead time
//! start `deferred`; their job is delayed until the lead time before the
//! requested start.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use kennel_queue::{Job, JobQueue};
use kennel_state::*;

use crate::error::{SchedulerError, SchedulerResult};

/// Value of `started_by` on every task Kennel launches.
pub const STARTED_BY: &str = "kennel";

/// A request to run a task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskRequest {
    /// Task definition reference (`family:revision`).
    #[serde(default)]
    pub task_definition: String,
    #[serde(default)]
    pub container_name: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    /// Epoch milliseconds.
    #[serde(default)]
    pub requested_launch_time: Option<u64>,
}

/// An accepted submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submission {
    pub task_id: TaskId,
    pub status: TaskStatus,
}

/// Accepts task requests.
#[derive(Clone)]
pub struct Submitter {
    state: StateStore,
    queue: JobQueue,
    cluster_name: String,
    lead_time: Duration,
}

impl Submitter {
    pub fn new(state: StateStore, queue: JobQueue, cluster_name: String, lead_time: Duration) -> Self {
        Self {
            state,
            queue,
            cluster_name,
            lead_time,
        }
    }

    pub async fn submit(&self, request: TaskRequest, now: u64) -> SchedulerResult<Submission> {
        let spec = self.launch_spec(&request)?;
        let lead = self.lead_time.as_millis() as u64;
        let (status, delay) = initial_schedule(request.requested_launch_time, now, lead);

        let task_id = TaskId::new_v4();
        let record = TaskRecord::new(task_id, spec, status, request.requested_launch_time, now);
        self.state.put_task(&record)?;
        self.state.register_active_task(&task_id)?;

        let job_id = self
            .queue
            .create(Job::RunTask { task_id })
            .delay(Duration::from_millis(delay))
            .remove_on_complete(true)
            .save()
            .await?;

        info!(
            %task_id,
            %status,
            job_id,
            delay_ms = delay,
            task_definition = %record.launch_spec.task_definition,
            "task accepted"
        );
        Ok(Submission { task_id, status })
    }

    /// Re-enqueue dispatch jobs for deferred tasks after a restart.
    ///
    /// The queue lives in memory, so delayed jobs do not survive the process.
    /// Queued and waiting tasks need no job: every tick revisits them.
    pub async fn requeue_deferred(&self, now: u64) -> SchedulerResult<usize> {
        let lead = self.lead_time.as_millis() as u64;
        let mut requeued = 0;
        for task in self.state.active_tasks()? {
            if task.status != TaskStatus::Deferred {
                continue;
            }
            let (_, delay) = initial_schedule(task.requested_launch_time, now, lead);
            self.queue
                .create(Job::RunTask { task_id: task.task_id })
                .delay(Duration::from_millis(delay))
                .save()
                .await?;
            debug!(task_id = %task.task_id, delay_ms = delay, "deferred task requeued");
            requeued += 1;
        }
        if requeued > 0 {
            info!(requeued, "deferred tasks requeued");
        }
        Ok(requeued)
    }

    fn launch_spec(&self, request: &TaskRequest) -> SchedulerResult<LaunchSpec> {
        let task_definition = required("task_definition", &request.task_definition)?;
        let container_name = required("container_name", &request.container_name)?;
        let command: Vec<String> = request
            .command
            .iter()
            .map(|token| strip_control(token))
            .filter(|token| !token.is_empty())
            .collect();
        if command.is_empty() {
            return Err(SchedulerError::Validation(
                "missing request parameter: command".to_string(),
            ));
        }
        let environment = request
            .environment
            .iter()
            .map(|(k, v)| (strip_control(k), strip_control(v)))
            .filter(|(k, _)| !k.is_empty())
            .collect();

        Ok(LaunchSpec {
            cluster: self.cluster_name.clone(),
            task_definition,
            container_name,
            command,
            environment,
            started_by: STARTED_BY.to_string(),
        })
    }
}

/// Initial status and dispatch delay (ms) for a requested launch time.
///
/// Deferred iff the requested time minus the lead time is still ahead.
/// The delay never goes below zero.
pub fn initial_schedule(requested: Option<u64>, now: u64, lead: u64) -> (TaskStatus, u64) {
    match requested {
        Some(at) if at.saturating_sub(lead) > now => {
            (TaskStatus::Deferred, at - lead - now)
        }
        _ => (TaskStatus::Queued, 0),
    }
}

fn required(name: &str, value: &str) -> SchedulerResult<String> {
    let cleaned = strip_control(value);
    if cleaned.trim().is_empty() {
        return Err(SchedulerError::Validation(format!(
            "missing request parameter: {name}"
        )));
    }
    Ok(cleaned)
}

fn strip_control(s: &str) -> String {
    s.chars().filter(|c| !c.is_control()).collect()
}
