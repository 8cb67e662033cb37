//! In-memory cluster used for standalone mode and tests.
//!
//! Instances have a fixed CPU/memory capacity. Running tasks reserve the sum
//! of their containers' resources on the instance they were placed on, and
//! release it when stopped. Placement is first-fit over joined instances in
//! launch order.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info};

use kennel_state::{LaunchSpec, epoch_millis};

use crate::client::ClusterClient;
use crate::error::{ClusterError, ClusterResult};
use crate::types::*;

/// Capacity and behaviour of a simulated cluster.
#[derive(Debug, Clone)]
pub struct SimulationConfig {
    /// CPU units registered by every instance.
    pub instance_cpu: i64,
    /// Memory (MiB) registered by every instance.
    pub instance_memory: i64,
    /// Launched instances join the cluster immediately.
    pub auto_join: bool,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            instance_cpu: 1024,
            instance_memory: 2048,
            auto_join: false,
        }
    }
}

/// Number of calls made per mutating or describe operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub describe_instances: u32,
    pub describe_tasks: u32,
    pub run_task: u32,
    pub launch_instance: u32,
    pub deregister_instance: u32,
    pub terminate_instance: u32,
}

#[derive(Debug)]
struct SimInstance {
    arn: Option<String>,
    status: String,
    tags: Vec<Tag>,
    terminated: bool,
}

#[derive(Debug)]
struct SimTask {
    instance_arn: String,
    last_status: String,
    cpu: i64,
    memory: i64,
    created_at: u64,
    started_at: Option<u64>,
    stopped_at: Option<u64>,
    stopped_reason: Option<String>,
}

#[derive(Debug, Default)]
struct Inner {
    next_instance: u64,
    next_task: u64,
    /// Instance id → instance, in launch order.
    instances: BTreeMap<String, SimInstance>,
    /// Task arn → task.
    tasks: BTreeMap<String, SimTask>,
    definitions: HashMap<String, TaskDefinition>,
    /// Earmark → instance id, for idempotent launches.
    launch_tokens: HashMap<String, String>,
    unavailable: bool,
    reject_next: Option<String>,
    calls: CallCounts,
}

impl Inner {
    fn check_available(&self) -> ClusterResult<()> {
        if self.unavailable {
            Err(ClusterError::Unavailable("simulated outage".to_string()))
        } else {
            Ok(())
        }
    }

    fn join(&mut self, instance_id: &str) -> Option<String> {
        let seq = self.next_instance;
        let inst = self.instances.get_mut(instance_id)?;
        if inst.terminated {
            return None;
        }
        if inst.arn.is_none() {
            self.next_instance += 1;
            let arn = format!("arn:kennel:sim:container-instance/{seq}");
            info!(%instance_id, %arn, "simulated instance joined cluster");
            inst.arn = Some(arn);
            inst.status = "ACTIVE".to_string();
        }
        inst.arn.clone()
    }

    /// (cpu, memory, running count) reserved on a container instance.
    fn reserved(&self, instance_arn: &str) -> (i64, i64, u32) {
        self.tasks
            .values()
            .filter(|t| t.instance_arn == instance_arn && t.last_status != TASK_STOPPED)
            .fold((0, 0, 0), |(cpu, mem, n), t| (cpu + t.cpu, mem + t.memory, n + 1))
    }

    fn describe(&self, config: &SimulationConfig, instance_id: &str, inst: &SimInstance) -> Option<InstanceDescription> {
        let arn = inst.arn.clone()?;
        let (cpu, memory, running) = self.reserved(&arn);
        Some(InstanceDescription {
            container_instance_arn: arn,
            ec2_instance_id: instance_id.to_string(),
            status: inst.status.clone(),
            running_tasks_count: running,
            pending_tasks_count: 0,
            registered_resources: vec![
                Resource::new(CPU, config.instance_cpu),
                Resource::new(MEMORY, config.instance_memory),
            ],
            remaining_resources: vec![
                Resource::new(CPU, config.instance_cpu - cpu),
                Resource::new(MEMORY, config.instance_memory - memory),
            ],
        })
    }
}

/// A cluster that lives entirely in memory.
pub struct SimulatedCluster {
    config: SimulationConfig,
    inner: Mutex<Inner>,
}

impl SimulatedCluster {
    pub fn new(config: SimulationConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Register a task definition that `run_task` can place.
    pub async fn register_task_definition(&self, reference: &str, containers: Vec<ContainerSpec>) {
        let mut inner = self.inner.lock().await;
        inner.definitions.insert(
            reference.to_string(),
            TaskDefinition {
                reference: reference.to_string(),
                containers,
            },
        );
    }

    /// Add an instance that has already joined. Returns (instance id, arn).
    pub async fn add_instance(&self) -> (String, String) {
        let mut inner = self.inner.lock().await;
        let instance_id = insert_instance(&mut inner, Vec::new());
        let arn = inner.join(&instance_id).unwrap_or_default();
        (instance_id, arn)
    }

    /// Let a launched instance join. Returns its arn.
    pub async fn join_instance(&self, instance_id: &str) -> Option<String> {
        self.inner.lock().await.join(instance_id)
    }

    /// Let every launched instance join.
    pub async fn join_pending(&self) -> Vec<String> {
        let mut inner = self.inner.lock().await;
        let pending: Vec<String> = inner
            .instances
            .iter()
            .filter(|(_, i)| i.arn.is_none() && !i.terminated)
            .map(|(id, _)| id.clone())
            .collect();
        pending.iter().filter_map(|id| inner.join(id)).collect()
    }

    /// Finish a task, releasing its reservation.
    pub async fn stop_task(&self, task_arn: &str, reason: &str) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.tasks.get_mut(task_arn) {
            Some(task) if task.last_status != TASK_STOPPED => {
                task.last_status = TASK_STOPPED.to_string();
                task.stopped_at = Some(epoch_millis());
                task.stopped_reason = Some(reason.to_string());
                debug!(%task_arn, %reason, "simulated task stopped");
                true
            }
            _ => false,
        }
    }

    /// Make every API call fail with `ClusterError::Unavailable`.
    pub async fn set_unavailable(&self, unavailable: bool) {
        self.inner.lock().await.unavailable = unavailable;
    }

    /// Reject the next `run_task` with an explicit failure.
    pub async fn reject_next_run(&self, reason: &str) {
        self.inner.lock().await.reject_next = Some(reason.to_string());
    }

    pub async fn call_counts(&self) -> CallCounts {
        self.inner.lock().await.calls
    }

    /// Ids of all launched instances, terminated ones included.
    pub async fn instance_ids(&self) -> Vec<String> {
        self.inner.lock().await.instances.keys().cloned().collect()
    }

    pub async fn is_terminated(&self, instance_id: &str) -> bool {
        self.inner
            .lock()
            .await
            .instances
            .get(instance_id)
            .is_some_and(|i| i.terminated)
    }
}

fn insert_instance(inner: &mut Inner, tags: Vec<Tag>) -> String {
    let instance_id = format!("i-{:08x}", inner.instances.len() + 1);
    inner.instances.insert(
        instance_id.clone(),
        SimInstance {
            arn: None,
            status: "PENDING".to_string(),
            tags,
            terminated: false,
        },
    );
    instance_id
}

#[async_trait]
impl ClusterClient for SimulatedCluster {
    async fn list_instances(&self) -> ClusterResult<Vec<String>> {
        let inner = self.inner.lock().await;
        inner.check_available()?;
        Ok(inner
            .instances
            .values()
            .filter(|i| !i.terminated && i.status != "INACTIVE")
            .filter_map(|i| i.arn.clone())
            .collect())
    }

    async fn describe_instances(&self, arns: &[String]) -> ClusterResult<Vec<InstanceDescription>> {
        if arns.is_empty() {
            return Ok(Vec::new());
        }
        let mut inner = self.inner.lock().await;
        inner.check_available()?;
        inner.calls.describe_instances += 1;
        let mut out = Vec::new();
        for arn in arns {
            let found = inner
                .instances
                .iter()
                .find(|(_, i)| i.arn.as_deref() == Some(arn.as_str()));
            if let Some((id, inst)) = found
                && let Some(desc) = inner.describe(&self.config, id, inst)
            {
                out.push(desc);
            }
        }
        Ok(out)
    }

    async fn describe_tasks(&self, arns: &[String]) -> ClusterResult<Vec<TaskDescription>> {
        if arns.is_empty() {
            return Ok(Vec::new());
        }
        let mut inner = self.inner.lock().await;
        inner.check_available()?;
        inner.calls.describe_tasks += 1;
        Ok(arns
            .iter()
            .filter_map(|arn| {
                inner.tasks.get(arn).map(|t| TaskDescription {
                    task_arn: arn.clone(),
                    last_status: t.last_status.clone(),
                    container_instance_arn: Some(t.instance_arn.clone()),
                    created_at: Some(t.created_at),
                    started_at: t.started_at,
                    stopped_at: t.stopped_at,
                    stopped_reason: t.stopped_reason.clone(),
                })
            })
            .collect())
    }

    async fn describe_task_definition(&self, reference: &str) -> ClusterResult<TaskDefinition> {
        let inner = self.inner.lock().await;
        inner.check_available()?;
        inner
            .definitions
            .get(reference)
            .cloned()
            .ok_or_else(|| ClusterError::NotFound(format!("task definition {reference}")))
    }

    async fn run_task(&self, spec: &LaunchSpec) -> ClusterResult<RunOutcome> {
        let mut inner = self.inner.lock().await;
        inner.check_available()?;
        inner.calls.run_task += 1;

        if let Some(reason) = inner.reject_next.take() {
            return Ok(RunOutcome::Rejected(vec![Failure { arn: None, reason }]));
        }

        let definition = inner
            .definitions
            .get(&spec.task_definition)
            .cloned()
            .ok_or_else(|| ClusterError::NotFound(format!("task definition {}", spec.task_definition)))?;
        let cpu: i64 = definition.containers.iter().map(|c| c.cpu).sum();
        let memory: i64 = definition.containers.iter().map(|c| c.memory).sum();

        let mut placed = None;
        let mut short_of = "RESOURCE:CPU";
        for inst in inner.instances.values() {
            let Some(arn) = inst.arn.as_deref() else { continue };
            if inst.terminated || inst.status != "ACTIVE" {
                continue;
            }
            let (used_cpu, used_mem, _) = inner.reserved(arn);
            if self.config.instance_cpu - used_cpu < cpu {
                short_of = "RESOURCE:CPU";
            } else if self.config.instance_memory - used_mem < memory {
                short_of = "RESOURCE:MEMORY";
            } else {
                placed = Some(arn.to_string());
                break;
            }
        }

        let Some(instance_arn) = placed else {
            return Ok(RunOutcome::Rejected(vec![Failure {
                arn: None,
                reason: short_of.to_string(),
            }]));
        };

        let seq = inner.next_task;
        inner.next_task += 1;
        let task_arn = format!("arn:kennel:sim:task/{seq}");
        let now = epoch_millis();
        inner.tasks.insert(
            task_arn.clone(),
            SimTask {
                instance_arn: instance_arn.clone(),
                last_status: "RUNNING".to_string(),
                cpu,
                memory,
                created_at: now,
                started_at: Some(now),
                stopped_at: None,
                stopped_reason: None,
            },
        );
        debug!(%task_arn, %instance_arn, "simulated task started");
        Ok(RunOutcome::Started(RunResult {
            task_arn,
            container_instance_arn: instance_arn,
        }))
    }

    async fn deregister_instance(&self, arn: &str) -> ClusterResult<()> {
        let mut inner = self.inner.lock().await;
        inner.check_available()?;
        inner.calls.deregister_instance += 1;
        let inst = inner
            .instances
            .values_mut()
            .find(|i| i.arn.as_deref() == Some(arn))
            .ok_or_else(|| ClusterError::NotFound(format!("container instance {arn}")))?;
        inst.status = "INACTIVE".to_string();
        Ok(())
    }

    async fn launch_instance(&self, earmark: Option<&str>) -> ClusterResult<String> {
        let mut inner = self.inner.lock().await;
        inner.check_available()?;
        if let Some(token) = earmark
            && let Some(existing) = inner.launch_tokens.get(token)
        {
            return Ok(existing.clone());
        }
        inner.calls.launch_instance += 1;

        let tags = earmark
            .map(|e| {
                vec![Tag {
                    key: EARMARK_TAG.to_string(),
                    value: e.to_string(),
                }]
            })
            .unwrap_or_default();
        let instance_id = insert_instance(&mut inner, tags);
        if let Some(token) = earmark {
            inner
                .launch_tokens
                .insert(token.to_string(), instance_id.clone());
        }
        if self.config.auto_join {
            inner.join(&instance_id);
        }
        info!(%instance_id, ?earmark, "simulated instance launched");
        Ok(instance_id)
    }

    async fn terminate_instance(&self, instance_id: &str) -> ClusterResult<()> {
        let mut inner = self.inner.lock().await;
        inner.check_available()?;
        inner.calls.terminate_instance += 1;
        let inst = inner
            .instances
            .get_mut(instance_id)
            .ok_or_else(|| ClusterError::NotFound(format!("instance {instance_id}")))?;
        inst.terminated = true;
        inst.status = "INACTIVE".to_string();
        Ok(())
    }

    async fn get_instance_tags(&self, instance_id: &str) -> ClusterResult<Vec<Tag>> {
        let inner = self.inner.lock().await;
        inner.check_available()?;
        inner
            .instances
            .get(instance_id)
            .map(|i| i.tags.clone())
            .ok_or_else(|| ClusterError::NotFound(format!("instance {instance_id}")))
    }
}
