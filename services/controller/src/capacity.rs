//! Capacity controller: one extra node per shortfall episode.
//!
//! The check (desired vs registered) and the increment are separate calls
//! against an eventually consistent store. Two controllers racing through the
//! check can both increment; the reaper reclaims any surplus once it idles.

use std::sync::Arc;

use tidepool_events::{
    event_types, AlreadyScalingPayload, Component, ScaleDecision, ScaleRequestedPayload,
};
use tidepool_reconcile::{decide_scale_up, ScaleUpPlan};
use tracing::{info, instrument, warn};

use crate::cluster::ClusterStateView;
use crate::error::{bounded, ControllerError, ControllerResult};
use crate::model::TaskRequest;
use crate::outcome::{emit, Correlation};
use crate::pool::NodePoolClient;

/// Decides whether a placement failure warrants another node.
#[derive(Clone)]
pub struct CapacityController {
    view: ClusterStateView,
    pool: Arc<dyn NodePoolClient>,
}

impl CapacityController {
    pub fn new(view: ClusterStateView, pool: Arc<dyn NodePoolClient>) -> Self {
        Self { view, pool }
    }

    /// Request one more node unless a previous request is still outstanding.
    ///
    /// Returns `AlreadyScaling` without touching the pool while desired
    /// capacity exceeds the registered node count. Otherwise raises desired
    /// capacity by exactly one, bypassing the pool's cool-down.
    #[instrument(skip(self, task), fields(job_name = %task.job_name))]
    pub async fn request_scale_up(&self, task: &TaskRequest) -> ControllerResult<ScaleDecision> {
        let pool = self.view.describe_pool().await?;
        let registered = self.view.registered_node_count().await?;

        match decide_scale_up(pool.desired_capacity, registered, pool.max_size) {
            ScaleUpPlan::AlreadyScaling => {
                info!(
                    desired_capacity = pool.desired_capacity,
                    registered_nodes = registered,
                    "Scale-up already outstanding"
                );
                emit(
                    event_types::CAPACITY_ALREADY_SCALING,
                    Component::CapacityController,
                    Correlation::default(),
                    AlreadyScalingPayload {
                        desired_capacity: pool.desired_capacity,
                        registered_nodes: registered,
                    },
                );
                Ok(ScaleDecision::AlreadyScaling)
            }
            ScaleUpPlan::AtMaxSize { max_size } => {
                warn!(
                    desired_capacity = pool.desired_capacity,
                    max_size, "Node pool at maximum size; not scaling"
                );
                Err(ControllerError::AtMaxCapacity { max_size })
            }
            ScaleUpPlan::Increment { from, to } => {
                bounded(
                    "set_desired_capacity",
                    self.view.call_timeout(),
                    self.pool.set_desired_capacity(to, false),
                )
                .await?;

                info!(
                    previous = from,
                    requested = to,
                    registered_nodes = registered,
                    "Requested one more node"
                );
                emit(
                    event_types::CAPACITY_SCALE_REQUESTED,
                    Component::CapacityController,
                    Correlation::default(),
                    ScaleRequestedPayload {
                        previous: from,
                        requested: to,
                        registered_nodes: registered,
                    },
                );
                Ok(ScaleDecision::ScaleRequested {
                    previous: from,
                    requested: to,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use futures_util::future::join_all;

    use crate::sim::SimulatedCluster;

    fn task() -> TaskRequest {
        TaskRequest::from_message_body(r#"{"jobName":"etl","taskDefinitionRef":"etl:3"}"#).unwrap()
    }

    fn controller(sim: &Arc<SimulatedCluster>) -> CapacityController {
        let view = ClusterStateView::new(sim.clone(), sim.clone(), Duration::from_secs(5));
        CapacityController::new(view, sim.clone())
    }

    #[tokio::test]
    async fn test_empty_pool_requests_first_node() {
        let sim = Arc::new(SimulatedCluster::new("batch"));

        let decision = controller(&sim).request_scale_up(&task()).await.unwrap();

        assert_eq!(
            decision,
            ScaleDecision::ScaleRequested {
                previous: 0,
                requested: 1
            }
        );
        assert_eq!(sim.desired_capacity().await, 1);
        assert_eq!(sim.cooldown_bypasses().await, 1);
    }

    #[tokio::test]
    async fn test_outstanding_request_is_not_repeated() {
        let sim = Arc::new(SimulatedCluster::new("batch"));
        let controller = controller(&sim);

        controller.request_scale_up(&task()).await.unwrap();
        let second = controller.request_scale_up(&task()).await.unwrap();

        assert_eq!(second, ScaleDecision::AlreadyScaling);
        assert_eq!(sim.desired_capacity().await, 1);
    }

    #[tokio::test]
    async fn test_concurrent_requests_while_scaling_change_nothing() {
        let sim = Arc::new(SimulatedCluster::new("batch"));
        sim.add_registered_node(4096).await;
        sim.set_desired_capacity(3, false).await.unwrap();
        let controller = controller(&sim);
        let task = task();

        let decisions = join_all((0..16).map(|_| controller.request_scale_up(&task))).await;

        for decision in decisions {
            assert_eq!(decision.unwrap(), ScaleDecision::AlreadyScaling);
        }
        assert_eq!(sim.desired_capacity().await, 3);
    }

    #[tokio::test]
    async fn test_registered_node_settles_the_episode() {
        let sim = Arc::new(SimulatedCluster::new("batch"));
        let controller = controller(&sim);

        controller.request_scale_up(&task()).await.unwrap();
        sim.register_pending_instances(4096).await;

        let decision = controller.request_scale_up(&task()).await.unwrap();
        assert_eq!(
            decision,
            ScaleDecision::ScaleRequested {
                previous: 1,
                requested: 2
            }
        );
    }

    #[tokio::test]
    async fn test_max_size_refuses_increment() {
        let sim = Arc::new(SimulatedCluster::new("batch").with_max_size(1));
        sim.add_registered_node(4096).await;

        let err = controller(&sim).request_scale_up(&task()).await.unwrap_err();

        assert!(matches!(err, ControllerError::AtMaxCapacity { max_size: 1 }));
        assert_eq!(sim.desired_capacity().await, 1);
    }
}
