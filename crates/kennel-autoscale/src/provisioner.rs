//! Instance launch primitive.

use std::sync::Arc;

use anyhow::Context;
use tracing::{debug, info};

use kennel_cluster::ClusterClient;
use kennel_state::{InstanceId, InstanceRecord, StateStore};

/// Launches compute instances and records them as pending.
#[derive(Clone)]
pub struct Provisioner {
    state: StateStore,
    cluster: Arc<dyn ClusterClient>,
}

impl Provisioner {
    pub fn new(state: StateStore, cluster: Arc<dyn ClusterClient>) -> Self {
        Self { state, cluster }
    }

    /// Launch one instance, optionally earmarked for a task.
    ///
    /// A pending instance already carrying the same earmark is reused, so
    /// repeated requests for one task yield one instance.
    pub async fn launch(&self, earmark: Option<&str>, now: u64) -> anyhow::Result<InstanceId> {
        if let Some(mark) = earmark
            && let Some(existing) = self.pending_for(mark)?
        {
            debug!(instance_id = %existing, earmark = %mark, "reusing pending instance");
            return Ok(existing);
        }

        let instance_id = self
            .cluster
            .launch_instance(earmark)
            .await
            .with_context(|| format!("launching instance (earmark {earmark:?})"))?;

        // The cluster may hand back an instance we already track.
        if self.state.get_instance(&instance_id)?.is_none() {
            let record = InstanceRecord::pending(&instance_id, now, earmark.map(str::to_string));
            self.state.register_pending_instance(&record)?;
        }

        info!(%instance_id, ?earmark, "instance launched");
        Ok(instance_id)
    }

    fn pending_for(&self, earmark: &str) -> anyhow::Result<Option<InstanceId>> {
        for instance_id in self.state.pending_instances()? {
            let Some(record) = self.state.get_instance(&instance_id)? else {
                continue;
            };
            if record.earmark.as_deref() == Some(earmark) {
                return Ok(Some(instance_id));
            }
        }
        Ok(None)
    }
}
