//! The daemon's periodic tick and job handler.

use std::time::Duration;

use tracing::{debug, error, info, warn};

use kennel_autoscale::{Autoscaler, ResizeOutcome};
use kennel_queue::Job;
use kennel_state::{TaskId, epoch_millis};

use crate::dispatcher::{DispatchOutcome, Dispatcher};
use crate::error::SchedulerResult;
use crate::reconciler::Reconciler;

/// Summary of one tick. A `None` step failed and was logged.
#[derive(Debug, Default)]
pub struct TickReport {
    pub instances_merged: Option<usize>,
    pub tasks_merged: Option<usize>,
    pub dispatched: Option<usize>,
    pub resize: Option<ResizeOutcome>,
}

/// Runs reconcile → dispatch → autoscale on a fixed interval.
pub struct ControlLoop {
    reconciler: Reconciler,
    dispatcher: Dispatcher,
    autoscaler: Autoscaler,
}

impl ControlLoop {
    pub fn new(reconciler: Reconciler, dispatcher: Dispatcher, autoscaler: Autoscaler) -> Self {
        Self {
            reconciler,
            dispatcher,
            autoscaler,
        }
    }

    /// One pass. Each step runs even if an earlier one failed.
    pub async fn tick(&self, now: u64) -> TickReport {
        let mut report = TickReport::default();

        match self.reconciler.refresh_instances(now).await {
            Ok(r) => {
                if !r.is_clean() {
                    warn!(failed = r.failures.len(), "some instances were not merged");
                }
                report.instances_merged = Some(r.merged);
            }
            Err(e) => error!(error = %e, "instance refresh failed"),
        }
        match self.reconciler.refresh_tasks().await {
            Ok(r) => {
                if !r.is_clean() {
                    warn!(failed = r.failures.len(), "some tasks were not merged");
                }
                report.tasks_merged = Some(r.merged);
            }
            Err(e) => error!(error = %e, "task refresh failed"),
        }
        match self.dispatcher.dispatch_pending(now).await {
            Ok(r) => report.dispatched = Some(r.count(DispatchOutcome::Started)),
            Err(e) => error!(error = %e, "dispatch failed"),
        }
        match self.autoscaler.auto_resize(now).await {
            Ok(outcome) => report.resize = Some(outcome),
            Err(e) => error!(error = %e, "autoscale failed"),
        }

        debug!(?report, "tick complete");
        report
    }

    /// Tick once, then every `interval` until `shutdown` changes.
    pub async fn run(&self, interval: Duration, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "control loop started");
        self.tick(epoch_millis()).await;

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    self.tick(epoch_millis()).await;
                }
                _ = shutdown.changed() => {
                    info!("control loop shutting down");
                    break;
                }
            }
        }
    }

    /// Serve one queued job.
    pub async fn handle_job(&self, job: Job) -> SchedulerResult<()> {
        match job {
            Job::RunTask { task_id } => self.force_dispatch(&task_id).await,
            Job::ClusterResize => {
                self.autoscaler.auto_resize(epoch_millis()).await?;
                Ok(())
            }
        }
    }

    async fn force_dispatch(&self, task_id: &TaskId) -> SchedulerResult<()> {
        let outcome = self.dispatcher.run_task(task_id, true, epoch_millis()).await?;
        debug!(%task_id, ?outcome, "dispatch job handled");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use kennel_autoscale::{AutoscaleConfig, Provisioner};
    use kennel_cluster::{ClusterClient, ContainerSpec, SimulatedCluster, SimulationConfig};
    use kennel_state::StateStore;

    use crate::admission::AdmissionController;

    fn control_loop(state: &StateStore, cluster: Arc<SimulatedCluster>) -> ControlLoop {
        let client: Arc<dyn ClusterClient> = cluster;
        let provisioner = Provisioner::new(state.clone(), client.clone());
        let admission = AdmissionController::new(state.clone(), client.clone());
        ControlLoop::new(
            Reconciler::new(state.clone(), client.clone()),
            Dispatcher::new(state.clone(), client.clone(), admission, provisioner.clone()),
            Autoscaler::new(state.clone(), client, provisioner, AutoscaleConfig::default()),
        )
    }

    #[tokio::test]
    async fn tick_survives_cluster_outage() {
        let state = StateStore::open_in_memory().unwrap();
        let cluster = Arc::new(SimulatedCluster::new(SimulationConfig::default()));
        cluster.set_unavailable(true).await;
        let looper = control_loop(&state, cluster.clone());

        let report = looper.tick(1_000).await;

        assert!(report.instances_merged.is_none());
        assert_eq!(report.tasks_merged, Some(0));
        assert_eq!(report.dispatched, Some(0));
        // The launch itself fails and is logged; the pass completes.
        assert_eq!(report.resize.map(|r| r.launched.len()), Some(0));
        assert!(state.list_instances().unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_cluster_tick_fills_warm_pool() {
        let state = StateStore::open_in_memory().unwrap();
        let cluster = Arc::new(SimulatedCluster::new(SimulationConfig::default()));
        let looper = control_loop(&state, cluster.clone());

        let report = looper.tick(1_000).await;

        assert_eq!(report.resize.map(|r| r.launched.len()), Some(1));
        assert_eq!(cluster.call_counts().await.launch_instance, 1);
    }

    #[tokio::test]
    async fn run_task_job_forces_dispatch() {
        let state = StateStore::open_in_memory().unwrap();
        let cluster = Arc::new(SimulatedCluster::new(SimulationConfig::default()));
        cluster
            .register_task_definition(
                "worker:1",
                vec![ContainerSpec { name: "w".to_string(), cpu: 256, memory: 256 }],
            )
            .await;
        cluster.add_instance().await;
        let looper = control_loop(&state, cluster.clone());

        let task_id = TaskId::new_v4();
        let spec = kennel_state::LaunchSpec {
            cluster: "default".to_string(),
            task_definition: "worker:1".to_string(),
            container_name: "w".to_string(),
            command: vec!["run".to_string()],
            environment: Default::default(),
            started_by: "kennel".to_string(),
        };
        state
            .put_task(&kennel_state::TaskRecord::new(
                task_id,
                spec,
                kennel_state::TaskStatus::Deferred,
                None,
                0,
            ))
            .unwrap();
        state.register_active_task(&task_id).unwrap();

        looper.handle_job(Job::RunTask { task_id }).await.unwrap();

        let task = state.get_task(&task_id).unwrap().unwrap();
        assert_eq!(task.status, kennel_state::TaskStatus::Running);
    }

    #[tokio::test]
    async fn run_task_job_for_unknown_task_fails() {
        let state = StateStore::open_in_memory().unwrap();
        let cluster = Arc::new(SimulatedCluster::new(SimulationConfig::default()));
        let looper = control_loop(&state, cluster);

        assert!(looper
            .handle_job(Job::RunTask { task_id: TaskId::new_v4() })
            .await
            .is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn run_stops_on_shutdown() {
        let state = StateStore::open_in_memory().unwrap();
        let cluster = Arc::new(SimulatedCluster::new(SimulationConfig::default()));
        let looper = control_loop(&state, cluster);
        let (tx, rx) = tokio::sync::watch::channel(false);

        let handle = tokio::spawn(async move {
            looper.run(Duration::from_secs(30), rx).await;
        });
        tokio::time::sleep(Duration::from_secs(95)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
