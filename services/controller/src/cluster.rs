//! Orchestrator interface and the read-only cluster state view.
//!
//! The view is a thin layer over the orchestrator and node pool clients:
//! - Every call goes to the backend (no caching)
//! - Every call carries the configured call timeout
//! - Two calls made moments apart may disagree; callers must tolerate that

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tidepool_events::DrainState;
use tidepool_id::NodeId;
use tracing::debug;

use crate::error::{bounded, ApiResult, ControllerResult};
use crate::model::{
    last_activity, Node, PoolDescription, RunTaskOutput, RunTaskRequest, StoppedTask,
};
use crate::pool::NodePoolClient;

/// Container orchestrator operations used by the controller.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Place a task on the cluster.
    async fn run_task(&self, request: RunTaskRequest) -> ApiResult<RunTaskOutput>;

    /// List every registered node.
    async fn list_nodes(&self) -> ApiResult<Vec<Node>>;

    /// List tasks that have stopped on a node.
    async fn list_stopped_tasks(&self, node_id: &NodeId) -> ApiResult<Vec<StoppedTask>>;

    /// Change a node's drain state.
    async fn set_drain_state(&self, node_id: &NodeId, state: DrainState) -> ApiResult<()>;
}

/// Read-only queries against the orchestrator and node pool.
#[derive(Clone)]
pub struct ClusterStateView {
    cluster: Arc<dyn ClusterApi>,
    pool: Arc<dyn NodePoolClient>,
    call_timeout: Duration,
}

impl ClusterStateView {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        pool: Arc<dyn NodePoolClient>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            cluster,
            pool,
            call_timeout,
        }
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// All registered nodes.
    pub async fn list_nodes(&self) -> ControllerResult<Vec<Node>> {
        bounded("list_nodes", self.call_timeout, self.cluster.list_nodes()).await
    }

    /// Number of registered nodes.
    pub async fn registered_node_count(&self) -> ControllerResult<u32> {
        let nodes = self.list_nodes().await?;
        Ok(u32::try_from(nodes.len()).unwrap_or(u32::MAX))
    }

    /// Most recent activity on a node: registration or latest task stop.
    pub async fn last_activity(&self, node: &Node) -> ControllerResult<DateTime<Utc>> {
        let stopped = bounded(
            "list_stopped_tasks",
            self.call_timeout,
            self.cluster.list_stopped_tasks(&node.node_id),
        )
        .await?;

        let activity = last_activity(node, &stopped);
        debug!(
            node_id = %node.node_id,
            stopped_tasks = stopped.len(),
            last_activity = %activity,
            "Read node activity"
        );
        Ok(activity)
    }

    /// Current desired capacity of the node pool.
    pub async fn describe_desired_capacity(&self) -> ControllerResult<u32> {
        Ok(self.describe_pool().await?.desired_capacity)
    }

    /// Full node pool description, including member instances.
    pub async fn describe_pool(&self) -> ControllerResult<PoolDescription> {
        bounded("describe_pool", self.call_timeout, self.pool.describe_pool()).await
    }
}
