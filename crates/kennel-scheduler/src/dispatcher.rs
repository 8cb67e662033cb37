//! Dispatcher — moves tasks through their lifecycle.
//!
//! ```text
//! queued ──► running ──► stopped | error
//!   │  ▲         ▲
//!   │  └ deferred│
//!   └──► waitingForCluster
//! ```
//!
//! Every entry point checks the stored status first, so a re-delivered
//! dispatch for a task that already left `queued` is a no-op.

use std::sync::Arc;

use tracing::{debug, info, warn};

use kennel_autoscale::Provisioner;
use kennel_cluster::*;
use kennel_state::*;

use crate::admission::AdmissionController;
use crate::error::{SchedulerError, SchedulerResult};

/// What a dispatch attempt did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The cluster accepted the task.
    Started,
    /// The cluster refused the task; it is now in `error`.
    Rejected,
    /// No capacity; an earmarked instance was requested.
    WaitingForCluster,
    /// Nothing to do for the task's current status.
    Skipped,
}

/// Per-task results of a dispatch pass.
#[derive(Debug, Default)]
pub struct DispatchReport {
    pub outcomes: Vec<(TaskId, DispatchOutcome)>,
    pub failures: Vec<(TaskId, String)>,
}

impl DispatchReport {
    pub fn count(&self, outcome: DispatchOutcome) -> usize {
        self.outcomes.iter().filter(|(_, o)| *o == outcome).count()
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    state: StateStore,
    cluster: Arc<dyn ClusterClient>,
    admission: AdmissionController,
    provisioner: Provisioner,
}

impl Dispatcher {
    pub fn new(
        state: StateStore,
        cluster: Arc<dyn ClusterClient>,
        admission: AdmissionController,
        provisioner: Provisioner,
    ) -> Self {
        Self {
            state,
            cluster,
            admission,
            provisioner,
        }
    }

    /// Try to start one task.
    ///
    /// `force` releases a deferred task and retries a task waiting for the
    /// cluster even when no instance is known to be joining.
    pub async fn run_task(
        &self,
        task_id: &TaskId,
        force: bool,
        now: u64,
    ) -> SchedulerResult<DispatchOutcome> {
        let mut task = self
            .state
            .get_task(task_id)?
            .ok_or(SchedulerError::TaskNotFound(*task_id))?;

        match task.status {
            status if status.is_dispatched() => {
                debug!(%task_id, %status, "task already dispatched");
                return Ok(DispatchOutcome::Skipped);
            }
            TaskStatus::Deferred if !force => {
                debug!(%task_id, "task still deferred");
                return Ok(DispatchOutcome::Skipped);
            }
            TaskStatus::Deferred => {
                task = self
                    .state
                    .update_task(task_id, |t| t.status = TaskStatus::Queued)?
                    .ok_or(SchedulerError::TaskNotFound(*task_id))?;
                info!(%task_id, "deferred task released");
            }
            TaskStatus::WaitingForCluster if !force && !self.cluster_changing()? => {
                debug!(%task_id, "no instance joined or joining, not retrying");
                return Ok(DispatchOutcome::Skipped);
            }
            _ => {}
        }

        if self.admission.can_run_now(task_id, &task.launch_spec).await {
            self.start(&task).await
        } else {
            let earmark = task_id.to_string();
            let instance_id = self.provisioner.launch(Some(&earmark), now).await?;
            self.state
                .update_task(task_id, |t| t.status = TaskStatus::WaitingForCluster)?;
            info!(%task_id, %instance_id, "no capacity, waiting for cluster");
            Ok(DispatchOutcome::WaitingForCluster)
        }
    }

    /// Visit every active queued or waiting task once, in order.
    pub async fn dispatch_pending(&self, now: u64) -> SchedulerResult<DispatchReport> {
        let mut report = DispatchReport::default();
        for task in self.state.active_tasks()? {
            if !matches!(
                task.status,
                TaskStatus::Queued | TaskStatus::WaitingForCluster
            ) {
                continue;
            }
            match self.run_task(&task.task_id, false, now).await {
                Ok(outcome) => report.outcomes.push((task.task_id, outcome)),
                Err(e) => {
                    warn!(task_id = %task.task_id, error = %e, "dispatch failed");
                    report.failures.push((task.task_id, e.to_string()));
                }
            }
        }
        Ok(report)
    }

    /// At least one instance is joined or on its way.
    fn cluster_changing(&self) -> SchedulerResult<bool> {
        if !self.state.pending_instances()?.is_empty() {
            return Ok(true);
        }
        Ok(self.state.list_instances()?.iter().any(InstanceRecord::is_active))
    }

    async fn start(&self, task: &TaskRecord) -> SchedulerResult<DispatchOutcome> {
        let task_id = task.task_id;
        match self.cluster.run_task(&task.launch_spec).await? {
            RunOutcome::Started(result) => {
                self.state.map_arn(&result.task_arn, &task_id.to_string())?;
                self.state.update_task(&task_id, |t| {
                    t.arn = Some(result.task_arn.clone());
                    t.running_on_instance = Some(result.container_instance_arn.clone());
                    t.status = TaskStatus::Running;
                    t.message = None;
                })?;
                self.claim_instance(&task_id, &result.container_instance_arn)?;
                info!(%task_id, task_arn = %result.task_arn, instance = %result.container_instance_arn, "task started");
                Ok(DispatchOutcome::Started)
            }
            RunOutcome::Rejected(failures) => {
                let message = failures
                    .iter()
                    .map(|f| match &f.arn {
                        Some(arn) => format!("{arn}: {}", f.reason),
                        None => f.reason.clone(),
                    })
                    .collect::<Vec<_>>()
                    .join("; ");
                self.state.update_task(&task_id, |t| {
                    t.status = TaskStatus::Error;
                    t.message = Some(message.clone());
                })?;
                self.state.deregister_active_task(&task_id)?;
                warn!(%task_id, %message, "cluster rejected task");
                Ok(DispatchOutcome::Rejected)
            }
        }
    }

    /// The serving instance is busy now and its reservation is used up.
    fn claim_instance(&self, task_id: &TaskId, instance_arn: &str) -> SchedulerResult<()> {
        let Some(instance_id) = self.state.id_for_arn(instance_arn)? else {
            debug!(%instance_arn, "serving instance not reconciled yet");
            return Ok(());
        };
        self.state.clear_idle_since(&instance_id)?;
        let mark = task_id.to_string();
        self.state.update_instance(&instance_id, |rec| {
            if rec.earmark.as_deref() == Some(mark.as_str()) {
                rec.earmark = None;
            }
        })?;
        Ok(())
    }
}
