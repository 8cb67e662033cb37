//! Autoscaler — warm-pool sizing.
//!
//! Counts the instances that have sat idle for longer than `idle_timeout`,
//! then launches or retires instances so that `warm_instances` of them stay
//! ready.
//! Launches go through the [`Provisioner`]; retirement deregisters the
//! container instance and terminates the compute resource behind it.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{debug, info, warn};

use kennel_cluster::ClusterClient;
use kennel_state::*;

use crate::provisioner::Provisioner;

/// Warm-pool settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoscaleConfig {
    /// Idle instances to keep ready.
    pub warm_instances: usize,
    /// How long an instance must sit idle before it counts toward the pool.
    pub idle_timeout: Duration,
    /// Backoff between launch batches.
    pub launch_timeout: Duration,
}

impl Default for AutoscaleConfig {
    fn default() -> Self {
        Self {
            warm_instances: 1,
            idle_timeout: Duration::from_secs(10 * 60),
            launch_timeout: Duration::from_secs(5 * 60),
        }
    }
}

/// A sizing decision for the warm pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScaleDecision {
    /// Launch this many instances.
    Launch(usize),
    /// Retire up to this many idle instances.
    Evict(usize),
    /// Pool is short but a launch batch is still inside its backoff window.
    Backoff,
    #[default]
    NoChange,
}

/// What one `auto_resize` pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResizeOutcome {
    pub decision: ScaleDecision,
    pub launched: Vec<InstanceId>,
    pub terminated: Vec<InstanceId>,
}

/// The autoscaler keeps the warm pool at its target size.
pub struct Autoscaler {
    state: StateStore,
    cluster: Arc<dyn ClusterClient>,
    provisioner: Provisioner,
    config: AutoscaleConfig,
}

impl Autoscaler {
    pub fn new(
        state: StateStore,
        cluster: Arc<dyn ClusterClient>,
        provisioner: Provisioner,
        config: AutoscaleConfig,
    ) -> Self {
        Self {
            state,
            cluster,
            provisioner,
            config,
        }
    }

    pub fn config(&self) -> &AutoscaleConfig {
        &self.config
    }

    /// Decide how to resize given the idle count and the last launch marker.
    pub fn evaluate(&self, idle: usize, now: u64, last_launch: Option<u64>) -> ScaleDecision {
        let warm = self.config.warm_instances;
        if idle < warm {
            let backoff = millis(self.config.launch_timeout);
            match last_launch {
                Some(at) if now.saturating_sub(at) <= backoff => ScaleDecision::Backoff,
                _ => ScaleDecision::Launch(warm - idle),
            }
        } else if idle > warm {
            ScaleDecision::Evict(idle - warm)
        } else {
            ScaleDecision::NoChange
        }
    }

    /// Active instances idle for longer than `idle_timeout`, longest-idle first.
    pub fn idle_instances(&self, now: u64) -> StateResult<Vec<InstanceRecord>> {
        let idle_timeout = millis(self.config.idle_timeout);
        let mut idle: Vec<InstanceRecord> = self
            .state
            .list_instances()?
            .into_iter()
            .filter(|i| i.is_active())
            .filter(|i| {
                i.idle_since
                    .is_some_and(|since| now.saturating_sub(since) > idle_timeout)
            })
            .collect();
        idle.sort_by_key(|i| (i.idle_since, i.created_at));
        Ok(idle)
    }

    /// Run one sizing pass.
    pub async fn auto_resize(&self, now: u64) -> anyhow::Result<ResizeOutcome> {
        let idle = self.idle_instances(now)?;
        let last_launch = self.state.launch_timeout()?;
        let decision = self.evaluate(idle.len(), now, last_launch);
        let mut outcome = ResizeOutcome {
            decision,
            ..ResizeOutcome::default()
        };

        match decision {
            ScaleDecision::Launch(needed) => {
                info!(idle = idle.len(), needed, "warm pool short, launching instances");
                self.state.set_launch_timeout(now)?;
                for _ in 0..needed {
                    match self.provisioner.launch(None, now).await {
                        Ok(id) => outcome.launched.push(id),
                        Err(e) => warn!(error = %e, "warm instance launch failed"),
                    }
                }
            }
            ScaleDecision::Evict(surplus) => {
                for inst in idle.iter().take(surplus) {
                    match self.retire(inst).await {
                        Ok(()) => outcome.terminated.push(inst.instance_id.clone()),
                        Err(e) => warn!(
                            instance_id = %inst.instance_id,
                            error = %e,
                            "instance retirement failed"
                        ),
                    }
                }
                if outcome.terminated.len() < surplus {
                    debug!(
                        surplus,
                        terminated = outcome.terminated.len(),
                        "idle surplus not fully retired"
                    );
                }
            }
            ScaleDecision::Backoff => {
                debug!(idle = idle.len(), ?last_launch, "launch batch still in backoff window");
            }
            ScaleDecision::NoChange => {}
        }

        Ok(outcome)
    }

    async fn retire(&self, inst: &InstanceRecord) -> anyhow::Result<()> {
        if let Some(arn) = &inst.arn {
            self.cluster
                .deregister_instance(arn)
                .await
                .with_context(|| format!("deregistering {arn}"))?;
        }
        self.cluster
            .terminate_instance(&inst.instance_id)
            .await
            .with_context(|| format!("terminating {}", inst.instance_id))?;
        self.state.update_instance(&inst.instance_id, |rec| {
            rec.status = Some(INSTANCE_DEREGISTERED.to_string());
            rec.idle_since = None;
        })?;
        info!(instance_id = %inst.instance_id, idle_since = ?inst.idle_since, "idle instance retired");
        Ok(())
    }
}

fn millis(d: Duration) -> u64 {
    d.as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use kennel_cluster::{SimulatedCluster, SimulationConfig};

    const MIN: u64 = 60_000;

    struct Fixture {
        state: StateStore,
        cluster: Arc<SimulatedCluster>,
        scaler: Autoscaler,
    }

    fn fixture(warm_instances: usize) -> Fixture {
        let state = StateStore::open_in_memory().unwrap();
        let cluster = Arc::new(SimulatedCluster::new(SimulationConfig::default()));
        let provisioner = Provisioner::new(state.clone(), cluster.clone());
        let config = AutoscaleConfig {
            warm_instances,
            ..AutoscaleConfig::default()
        };
        let scaler = Autoscaler::new(state.clone(), cluster.clone(), provisioner, config);
        Fixture {
            state,
            cluster,
            scaler,
        }
    }

    /// Add a joined instance to the cluster and cache it as idle since `since`.
    async fn idle_instance(f: &Fixture, since: u64) -> InstanceId {
        let (id, arn) = f.cluster.add_instance().await;
        f.state
            .put_instance(&InstanceRecord {
                instance_id: id.clone(),
                arn: Some(arn),
                status: Some(INSTANCE_ACTIVE.to_string()),
                idle_since: Some(since),
                ..InstanceRecord::default()
            })
            .unwrap();
        id
    }

    #[test]
    fn evaluate_decisions() {
        let f = fixture(2);
        assert_eq!(f.scaler.evaluate(0, 10 * MIN, None), ScaleDecision::Launch(2));
        assert_eq!(f.scaler.evaluate(1, 10 * MIN, None), ScaleDecision::Launch(1));
        assert_eq!(f.scaler.evaluate(2, 10 * MIN, None), ScaleDecision::NoChange);
        assert_eq!(f.scaler.evaluate(5, 10 * MIN, None), ScaleDecision::Evict(3));
    }

    #[test]
    fn evaluate_respects_launch_backoff() {
        let f = fixture(1);
        let marker = Some(10 * MIN);
        assert_eq!(f.scaler.evaluate(0, 12 * MIN, marker), ScaleDecision::Backoff);
        assert_eq!(f.scaler.evaluate(0, 15 * MIN, marker), ScaleDecision::Backoff);
        assert_eq!(f.scaler.evaluate(0, 15 * MIN + 1, marker), ScaleDecision::Launch(1));
    }

    #[tokio::test]
    async fn empty_pool_launches_once_per_backoff_window() {
        let f = fixture(2);

        let first = f.scaler.auto_resize(0).await.unwrap();
        assert_eq!(first.decision, ScaleDecision::Launch(2));
        assert_eq!(first.launched.len(), 2);
        assert_eq!(f.state.launch_timeout().unwrap(), Some(0));
        assert_eq!(f.state.pending_instances().unwrap().len(), 2);

        let second = f.scaler.auto_resize(MIN).await.unwrap();
        assert_eq!(second.decision, ScaleDecision::Backoff);
        assert!(second.launched.is_empty());
        assert_eq!(f.cluster.call_counts().await.launch_instance, 2);

        let third = f.scaler.auto_resize(6 * MIN).await.unwrap();
        assert_eq!(third.launched.len(), 2);
        assert_eq!(f.state.launch_timeout().unwrap(), Some(6 * MIN));
    }

    #[tokio::test]
    async fn surplus_retires_oldest_idle_instance() {
        let f = fixture(1);
        let older = idle_instance(&f, 0).await;
        let newer = idle_instance(&f, MIN).await;

        let outcome = f.scaler.auto_resize(20 * MIN).await.unwrap();

        assert_eq!(outcome.decision, ScaleDecision::Evict(1));
        assert_eq!(outcome.terminated, vec![older.clone()]);
        assert!(f.cluster.is_terminated(&older).await);
        assert!(!f.cluster.is_terminated(&newer).await);

        let record = f.state.get_instance(&older).unwrap().unwrap();
        assert_eq!(record.status.as_deref(), Some(INSTANCE_DEREGISTERED));
        assert_eq!(record.idle_since, None);
        assert_eq!(f.scaler.idle_instances(20 * MIN).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn recently_idle_instances_do_not_count() {
        let f = fixture(1);
        let oldest = idle_instance(&f, 0).await;
        idle_instance(&f, 15 * MIN).await;
        idle_instance(&f, 16 * MIN).await;

        let idle = f.scaler.idle_instances(20 * MIN).unwrap();
        assert_eq!(idle.len(), 1);
        assert_eq!(idle[0].instance_id, oldest);

        let outcome = f.scaler.auto_resize(20 * MIN).await.unwrap();

        assert_eq!(outcome.decision, ScaleDecision::NoChange);
        assert!(outcome.terminated.is_empty());
        assert!(!f.cluster.is_terminated(&oldest).await);
        assert_eq!(f.cluster.call_counts().await.terminate_instance, 0);
    }

    #[tokio::test]
    async fn freshly_idle_instance_leaves_pool_short() {
        let f = fixture(1);
        idle_instance(&f, 19 * MIN).await;

        let outcome = f.scaler.auto_resize(20 * MIN).await.unwrap();

        assert_eq!(outcome.decision, ScaleDecision::Launch(1));
        assert_eq!(outcome.launched.len(), 1);
        assert_eq!(f.state.launch_timeout().unwrap(), Some(20 * MIN));
    }

    #[tokio::test]
    async fn pool_at_target_is_left_alone() {
        let f = fixture(1);
        idle_instance(&f, 0).await;

        let outcome = f.scaler.auto_resize(60 * MIN).await.unwrap();

        assert_eq!(outcome, ResizeOutcome::default());
        assert_eq!(f.cluster.call_counts().await.terminate_instance, 0);
    }

    #[tokio::test]
    async fn failed_retirement_does_not_stop_the_rest() {
        let f = fixture(0);
        f.state
            .put_instance(&InstanceRecord {
                instance_id: "i-missing".to_string(),
                arn: Some("arn:missing".to_string()),
                status: Some(INSTANCE_ACTIVE.to_string()),
                idle_since: Some(0),
                ..InstanceRecord::default()
            })
            .unwrap();
        let real = idle_instance(&f, MIN).await;

        let outcome = f.scaler.auto_resize(30 * MIN).await.unwrap();

        assert_eq!(outcome.terminated, vec![real]);
        let missing = f.state.get_instance("i-missing").unwrap().unwrap();
        assert_eq!(missing.status.as_deref(), Some(INSTANCE_ACTIVE));
    }

    #[tokio::test]
    async fn busy_and_pending_instances_are_not_idle() {
        let f = fixture(1);
        let (busy, arn) = f.cluster.add_instance().await;
        f.state
            .put_instance(&InstanceRecord {
                instance_id: busy,
                arn: Some(arn),
                status: Some(INSTANCE_ACTIVE.to_string()),
                running_tasks_count: 1,
                ..InstanceRecord::default()
            })
            .unwrap();
        f.state
            .register_pending_instance(&InstanceRecord::pending("i-pending", 0, None))
            .unwrap();

        assert!(f.scaler.idle_instances(60 * MIN).unwrap().is_empty());
    }
}
