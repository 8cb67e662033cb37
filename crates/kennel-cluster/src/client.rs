//! The cluster client contract.

use async_trait::async_trait;

use kennel_state::LaunchSpec;

use crate::error::ClusterResult;
use crate::types::*;

/// Control-plane operations Kennel depends on.
///
/// Implementations must return an empty result without contacting the
/// control plane when `describe_instances` or `describe_tasks` receive an
/// empty slice. `launch_instance` treats the earmark as an idempotency
/// token: launching twice with the same earmark yields the same instance.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Arns of all container instances registered with the cluster.
    async fn list_instances(&self) -> ClusterResult<Vec<String>>;

    async fn describe_instances(&self, arns: &[String]) -> ClusterResult<Vec<InstanceDescription>>;

    async fn describe_tasks(&self, arns: &[String]) -> ClusterResult<Vec<TaskDescription>>;

    async fn describe_task_definition(&self, reference: &str) -> ClusterResult<TaskDefinition>;

    /// Ask the cluster to place one task.
    async fn run_task(&self, spec: &LaunchSpec) -> ClusterResult<RunOutcome>;

    /// Remove a container instance from the cluster.
    async fn deregister_instance(&self, arn: &str) -> ClusterResult<()>;

    /// Start a new compute instance that will join the cluster.
    ///
    /// Returns the instance id.
    async fn launch_instance(&self, earmark: Option<&str>) -> ClusterResult<String>;

    async fn terminate_instance(&self, instance_id: &str) -> ClusterResult<()>;

    async fn get_instance_tags(&self, instance_id: &str) -> ClusterResult<Vec<Tag>>;
}

/// List then describe every container instance.
pub async fn describe_all_instances(
    client: &dyn ClusterClient,
) -> ClusterResult<Vec<InstanceDescription>> {
    let arns = client.list_instances().await?;
    client.describe_instances(&arns).await
}
