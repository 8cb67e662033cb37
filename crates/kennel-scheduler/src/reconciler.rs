//! Reconciler — overwrites cached state with the cluster's descriptions.
//!
//! Each refresh fans out one merge per described item and collects the
//! per-item results, so a single bad record never blocks the rest.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, info, warn};

use kennel_cluster::*;
use kennel_state::*;

use crate::error::SchedulerResult;

/// Result of one refresh pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Items merged successfully.
    pub merged: usize,
    /// (item key, error) for every merge that failed.
    pub failures: Vec<(String, String)>,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    fn collect<E: std::fmt::Display>(keys: Vec<String>, results: Vec<Result<(), E>>) -> Self {
        let mut report = Self::default();
        for (key, result) in keys.into_iter().zip(results) {
            match result {
                Ok(()) => report.merged += 1,
                Err(e) => {
                    warn!(item = %key, error = %e, "merge failed");
                    report.failures.push((key, e.to_string()));
                }
            }
        }
        report
    }
}

/// Pulls instance and task descriptions from the cluster into the store.
#[derive(Clone)]
pub struct Reconciler {
    state: StateStore,
    cluster: Arc<dyn ClusterClient>,
}

impl Reconciler {
    pub fn new(state: StateStore, cluster: Arc<dyn ClusterClient>) -> Self {
        Self { state, cluster }
    }

    /// List and describe every container instance, then merge each one.
    ///
    /// A failed list or describe call fails the whole step.
    pub async fn refresh_instances(&self, now: u64) -> SchedulerResult<ReconcileReport> {
        let arns = self.cluster.list_instances().await?;
        let descriptions = self.cluster.describe_instances(&arns).await?;

        let keys = descriptions
            .iter()
            .map(|d| d.container_instance_arn.clone())
            .collect();
        let results = join_all(descriptions.iter().map(|d| self.merge_instance(d, now))).await;
        let report = ReconcileReport::collect(keys, results);

        let listed: HashSet<&str> = arns.iter().map(String::as_str).collect();
        self.mark_departed(&listed)?;

        debug!(merged = report.merged, failed = report.failures.len(), "instances refreshed");
        Ok(report)
    }

    /// Merge one authoritative instance description.
    pub async fn merge_instance(&self, desc: &InstanceDescription, now: u64) -> SchedulerResult<()> {
        let instance_id = desc.ec2_instance_id.as_str();
        self.state.map_arn(&desc.container_instance_arn, instance_id)?;

        let (record, created) = self.state.upsert_instance(instance_id, now, |rec| {
            rec.arn = Some(desc.container_instance_arn.clone());
            rec.status = Some(desc.status.clone());
            rec.running_tasks_count = desc.running_tasks_count;
            rec.pending_tasks_count = desc.pending_tasks_count;
            rec.registered_cpu = desc.registered(CPU);
            rec.registered_memory = desc.registered(MEMORY);
            rec.remaining_cpu = desc.remaining(CPU).ok();
            rec.remaining_memory = desc.remaining(MEMORY).ok();
        })?;

        if self.state.clear_pending_instance(instance_id)? {
            info!(%instance_id, arn = %desc.container_instance_arn, "instance joined cluster");
        }

        if record.is_passive() {
            if self.state.set_idle_since_if_absent(instance_id, now)? {
                debug!(%instance_id, since = now, "instance idle");
            }
        } else if self.state.clear_idle_since(instance_id)? {
            debug!(%instance_id, "instance busy");
        }

        if created && record.earmark.is_none() {
            self.backfill_earmark(instance_id).await;
        }
        Ok(())
    }

    /// Copy the earmark tag of an instance we did not launch ourselves.
    async fn backfill_earmark(&self, instance_id: &str) {
        let tags = match self.cluster.get_instance_tags(instance_id).await {
            Ok(tags) => tags,
            Err(e) => {
                warn!(%instance_id, error = %e, "could not read instance tags");
                return;
            }
        };
        if let Some(earmark) = earmark_from_tags(&tags) {
            let result = self.state.update_instance(instance_id, |rec| {
                rec.earmark = Some(earmark.clone());
            });
            match result {
                Ok(_) => debug!(%instance_id, %earmark, "earmark restored from tags"),
                Err(e) => warn!(%instance_id, error = %e, "could not store earmark"),
            }
        }
    }

    /// Mark joined instances the cluster no longer lists as inactive.
    fn mark_departed(&self, listed: &HashSet<&str>) -> SchedulerResult<()> {
        for rec in self.state.list_instances()? {
            let Some(arn) = rec.arn.as_deref() else { continue };
            let gone = matches!(
                rec.status.as_deref(),
                Some(INSTANCE_INACTIVE) | Some(INSTANCE_DEREGISTERED)
            );
            if gone || listed.contains(arn) {
                continue;
            }
            self.state.update_instance(&rec.instance_id, |r| {
                r.status = Some(INSTANCE_INACTIVE.to_string());
                r.idle_since = None;
            })?;
            info!(instance_id = %rec.instance_id, %arn, "instance left cluster");
        }
        Ok(())
    }

    /// Describe every dispatched active task and merge each description.
    pub async fn refresh_tasks(&self) -> SchedulerResult<ReconcileReport> {
        let active = self.state.active_tasks()?;
        let by_arn: HashMap<String, TaskId> = active
            .iter()
            .filter_map(|t| t.arn.clone().map(|arn| (arn, t.task_id)))
            .collect();
        let arns: Vec<String> = by_arn.keys().cloned().collect();
        let descriptions = self.cluster.describe_tasks(&arns).await?;

        let mut keys = Vec::with_capacity(descriptions.len());
        let mut merges = Vec::with_capacity(descriptions.len());
        for desc in &descriptions {
            let Some(task_id) = by_arn.get(&desc.task_arn) else {
                warn!(task_arn = %desc.task_arn, "description for unknown task");
                continue;
            };
            keys.push(task_id.to_string());
            merges.push(self.merge_task(*task_id, desc));
        }
        let report = ReconcileReport::collect(keys, join_all(merges).await);

        debug!(merged = report.merged, failed = report.failures.len(), "tasks refreshed");
        Ok(report)
    }

    /// Merge one authoritative task description.
    pub async fn merge_task(&self, task_id: TaskId, desc: &TaskDescription) -> SchedulerResult<()> {
        let stopped = desc.is_stopped();
        let updated = self.state.update_task(&task_id, |task| {
            task.last_status = Some(desc.last_status.clone());
            if desc.container_instance_arn.is_some() {
                task.running_on_instance = desc.container_instance_arn.clone();
            }
            task.created_at = desc.created_at;
            task.started_at = desc.started_at;
            task.stopped_at = desc.stopped_at;
            task.stopped_reason = desc.stopped_reason.clone();
            if stopped {
                task.status = TaskStatus::Stopped;
            }
        })?;
        if updated.is_none() {
            return Err(crate::error::SchedulerError::TaskNotFound(task_id));
        }

        if stopped && self.state.deregister_active_task(&task_id)? {
            info!(%task_id, reason = ?desc.stopped_reason, "task stopped");
        }
        Ok(())
    }
}
