//! End-to-end task lifecycle against a simulated cluster.

use std::sync::Arc;
use std::time::Duration;

use kennel_autoscale::{AutoscaleConfig, Autoscaler, Provisioner};
use kennel_cluster::{ClusterClient, ContainerSpec, SimulatedCluster, SimulationConfig};
use kennel_queue::JobQueue;
use kennel_scheduler::*;
use kennel_state::*;

const MIN: u64 = 60_000;

struct Harness {
    state: StateStore,
    cluster: Arc<SimulatedCluster>,
    queue: JobQueue,
    submitter: Submitter,
    control: Arc<ControlLoop>,
}

async fn harness(warm_instances: usize) -> Harness {
    let state = StateStore::open_in_memory().unwrap();
    let cluster = Arc::new(SimulatedCluster::new(SimulationConfig::default()));
    cluster
        .register_task_definition(
            "worker:1",
            vec![ContainerSpec {
                name: "w".to_string(),
                cpu: 512,
                memory: 1024,
            }],
        )
        .await;

    let client: Arc<dyn ClusterClient> = cluster.clone();
    let provisioner = Provisioner::new(state.clone(), client.clone());
    let admission = AdmissionController::new(state.clone(), client.clone());
    let autoscale = AutoscaleConfig {
        warm_instances,
        ..AutoscaleConfig::default()
    };
    let control = ControlLoop::new(
        Reconciler::new(state.clone(), client.clone()),
        Dispatcher::new(state.clone(), client.clone(), admission, provisioner.clone()),
        Autoscaler::new(state.clone(), client, provisioner, autoscale),
    );

    let queue = JobQueue::new();
    let submitter = Submitter::new(
        state.clone(),
        queue.clone(),
        "default".to_string(),
        Duration::from_secs(3 * 60),
    );

    Harness {
        state,
        cluster,
        queue,
        submitter,
        control: Arc::new(control),
    }
}

fn worker_request() -> TaskRequest {
    TaskRequest {
        task_definition: "worker:1".to_string(),
        container_name: "w".to_string(),
        command: vec!["run".to_string()],
        ..TaskRequest::default()
    }
}

fn task(h: &Harness, id: &TaskId) -> TaskRecord {
    h.state.get_task(id).unwrap().unwrap()
}

fn only_instance(h: &Harness) -> InstanceRecord {
    let mut all = h.state.list_instances().unwrap();
    assert_eq!(all.len(), 1);
    all.remove(0)
}

#[tokio::test]
async fn task_waits_for_earmarked_instance_then_runs_and_stops() {
    let h = harness(0).await;

    // Submitted with no launch time: queued.
    let submission = h.submitter.submit(worker_request(), 0).await.unwrap();
    assert_eq!(submission.status, TaskStatus::Queued);
    let task_id = submission.task_id;

    // Empty cluster: one instance launched for this task.
    h.control.tick(MIN).await;
    assert_eq!(task(&h, &task_id).status, TaskStatus::WaitingForCluster);
    assert_eq!(h.cluster.call_counts().await.launch_instance, 1);
    let launched = only_instance(&h);
    assert_eq!(launched.earmark, Some(task_id.to_string()));
    assert_eq!(h.state.pending_instances().unwrap(), vec![launched.instance_id.clone()]);

    // Instance joins: the task lands on it.
    h.cluster.join_pending().await;
    h.control.tick(2 * MIN).await;
    let running = task(&h, &task_id);
    assert_eq!(running.status, TaskStatus::Running);
    let task_arn = running.arn.clone().unwrap();
    let instance = only_instance(&h);
    assert_eq!(instance.idle_since, None);
    assert_eq!(instance.earmark, None);
    assert!(h.state.pending_instances().unwrap().is_empty());

    // Task stops: it leaves the active set and the instance goes idle.
    assert!(h.cluster.stop_task(&task_arn, "Essential container in task exited").await);
    h.control.tick(3 * MIN).await;
    let stopped = task(&h, &task_id);
    assert_eq!(stopped.status, TaskStatus::Stopped);
    assert_eq!(stopped.last_status.as_deref(), Some("STOPPED"));
    assert!(!h.state.is_active_task(&task_id.to_string()).unwrap());
    assert_eq!(only_instance(&h).idle_since, Some(3 * MIN));

    // Further ticks change nothing.
    h.control.tick(4 * MIN).await;
    assert_eq!(task(&h, &task_id).status, TaskStatus::Stopped);
    assert_eq!(only_instance(&h).idle_since, Some(3 * MIN));
    assert_eq!(h.cluster.call_counts().await.run_task, 1);
}

#[tokio::test]
async fn surplus_idle_instance_is_retired() {
    let h = harness(1).await;
    let (older, _) = h.cluster.add_instance().await;
    h.control.tick(0).await;
    let (newer, _) = h.cluster.add_instance().await;
    h.control.tick(MIN).await;

    let report = h.control.tick(30 * MIN).await;

    let resize = report.resize.unwrap();
    assert_eq!(resize.terminated, vec![older.clone()]);
    assert!(h.cluster.is_terminated(&older).await);
    assert!(!h.cluster.is_terminated(&newer).await);
    let idle: Vec<_> = h
        .state
        .list_instances()
        .unwrap()
        .into_iter()
        .filter(|i| i.is_active() && i.idle_since.is_some())
        .collect();
    assert_eq!(idle.len(), 1);
    assert_eq!(idle[0].instance_id, newer);
}

#[tokio::test]
async fn resize_never_goes_below_warm_target() {
    for warm in 0..=4 {
        let h = harness(warm).await;
        for _ in 0..4 {
            h.cluster.add_instance().await;
        }
        h.control.tick(0).await;

        h.control.tick(60 * MIN).await;
        h.control.tick(61 * MIN).await;

        let idle = h
            .state
            .list_instances()
            .unwrap()
            .into_iter()
            .filter(|i| i.is_active() && i.idle_since.is_some())
            .count();
        assert_eq!(idle, warm, "warm = {warm}");
    }
}

#[tokio::test]
async fn repeated_resizes_launch_one_batch() {
    let h = harness(3).await;

    h.control.tick(0).await;
    h.control.tick(MIN).await;
    h.control.tick(2 * MIN).await;

    assert_eq!(h.cluster.call_counts().await.launch_instance, 3);
}

#[tokio::test]
async fn rejected_task_is_not_retried() {
    let h = harness(0).await;
    h.cluster.add_instance().await;
    h.cluster.reject_next_run("RESOURCE:PORTS").await;

    let task_id = h.submitter.submit(worker_request(), 0).await.unwrap().task_id;
    h.control.tick(MIN).await;
    h.control.tick(2 * MIN).await;

    let failed = task(&h, &task_id);
    assert_eq!(failed.status, TaskStatus::Error);
    assert_eq!(failed.message.as_deref(), Some("RESOURCE:PORTS"));
    assert_eq!(failed.arn, None);
    assert_eq!(failed.running_on_instance, None);
    assert!(!h.state.is_active_task(&task_id.to_string()).unwrap());
    assert_eq!(h.cluster.call_counts().await.run_task, 1);
}

#[tokio::test(start_paused = true)]
async fn deferred_task_is_released_by_its_delayed_job() {
    let h = harness(0).await;
    h.cluster.add_instance().await;

    let mut request = worker_request();
    request.requested_launch_time = Some(10 * MIN);
    let submission = h.submitter.submit(request, 0).await.unwrap();
    assert_eq!(submission.status, TaskStatus::Deferred);
    let task_id = submission.task_id;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let queue = h.queue.clone();
    let control = h.control.clone();
    let worker = tokio::spawn(async move {
        queue
            .process(
                move |job| {
                    let control = control.clone();
                    async move { control.handle_job(job).await.map_err(anyhow::Error::from) }
                },
                shutdown_rx,
            )
            .await;
    });

    // Ticks before the delay elapses leave it alone.
    h.control.tick(MIN).await;
    tokio::time::sleep(Duration::from_secs(6 * 60)).await;
    assert_eq!(task(&h, &task_id).status, TaskStatus::Deferred);
    assert_eq!(h.cluster.call_counts().await.run_task, 0);

    // Seven minutes after submission the job fires and forces dispatch.
    tokio::time::sleep(Duration::from_secs(2 * 60)).await;
    assert_eq!(task(&h, &task_id).status, TaskStatus::Running);

    shutdown_tx.send(true).unwrap();
    worker.await.unwrap();
}
