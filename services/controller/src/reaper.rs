//! Node reaper: the scale-down path.
//!
//! Each sweep observes every registered node and every pool member, plans
//! with [`plan_sweep`], then carries the plan out. Mutation failures are
//! logged and left for the next sweep to retry.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::Serialize;
use tidepool_events::{
    event_types, Component, DrainState, InstanceReclaimedPayload, NodeAction, NodeDrainedPayload,
    NodeTerminatedPayload, SweepCompletedPayload,
};
use tidepool_id::{ControllerId, InstanceId, NodeId, SweepId};
use tidepool_reconcile::{
    plan_sweep, DrainNode, NodeObservation, ReclaimInstance, SweepPolicy, TerminateNode,
};
use tracing::{debug, info, instrument, warn};

use crate::cluster::{ClusterApi, ClusterStateView};
use crate::error::{bounded, ControllerResult};
use crate::lease::{SweepLease, SWEEP_LEASE_NAME};
use crate::model::Node;
use crate::outcome::{emit, Correlation};
use crate::pool::NodePoolClient;

/// A pool mutation that failed during a sweep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MutationFailure {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    pub instance_id: InstanceId,
    pub action: NodeAction,
    pub error: String,
}

/// What one sweep observed and did.
#[derive(Debug, Clone, Serialize)]
pub struct SweepReport {
    pub sweep_id: SweepId,
    pub started_at: DateTime<Utc>,
    /// Another holder had the sweep lease; nothing was observed.
    pub lease_held_elsewhere: bool,
    pub nodes_observed: u32,
    /// Idle candidates whose activity could not be read.
    pub skipped: Vec<NodeId>,
    pub drained: Vec<DrainNode>,
    pub terminated: Vec<TerminateNode>,
    pub reclaimed: Vec<ReclaimInstance>,
    pub failures: Vec<MutationFailure>,
}

impl SweepReport {
    fn new(sweep_id: SweepId, started_at: DateTime<Utc>) -> Self {
        Self {
            sweep_id,
            started_at,
            lease_held_elsewhere: false,
            nodes_observed: 0,
            skipped: Vec::new(),
            drained: Vec::new(),
            terminated: Vec::new(),
            reclaimed: Vec::new(),
            failures: Vec::new(),
        }
    }

    fn summary(&self) -> SweepCompletedPayload {
        let count = |n: usize| u32::try_from(n).unwrap_or(u32::MAX);
        SweepCompletedPayload {
            nodes_observed: self.nodes_observed,
            nodes_skipped: count(self.skipped.len()),
            nodes_drained: count(self.drained.len()),
            nodes_terminated: count(self.terminated.len()),
            instances_reclaimed: count(self.reclaimed.len()),
            mutations_failed: count(self.failures.len()),
        }
    }

    /// Returns true if the sweep changed anything or failed to.
    pub fn has_activity(&self) -> bool {
        !(self.drained.is_empty()
            && self.terminated.is_empty()
            && self.reclaimed.is_empty()
            && self.failures.is_empty())
    }
}

/// Sweep lease settings.
#[derive(Clone)]
pub struct LeaseSettings {
    pub lease: Arc<dyn SweepLease>,
    /// Lease lifetime; a sweep that outlives it may overlap the next holder.
    pub ttl: Duration,
}

/// Drains idle and stale nodes, terminates drained empty nodes, and reclaims
/// instances that never registered.
pub struct NodeReaper {
    cluster: Arc<dyn ClusterApi>,
    pool: Arc<dyn NodePoolClient>,
    view: ClusterStateView,
    policy: SweepPolicy,
    lease: Option<LeaseSettings>,
    holder: ControllerId,
}

impl NodeReaper {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        pool: Arc<dyn NodePoolClient>,
        view: ClusterStateView,
        policy: SweepPolicy,
    ) -> Self {
        Self {
            cluster,
            pool,
            view,
            policy,
            lease: None,
            holder: ControllerId::new(),
        }
    }

    /// Hold a lease around every sweep.
    pub fn with_lease(mut self, lease: LeaseSettings) -> Self {
        self.lease = Some(lease);
        self
    }

    /// Identity this reaper holds the sweep lease under.
    pub fn holder(&self) -> ControllerId {
        self.holder
    }

    /// Run one sweep now.
    pub async fn sweep(&self) -> ControllerResult<SweepReport> {
        self.sweep_at(Utc::now()).await
    }

    /// Run one sweep, judging idleness and registration age against `now`.
    ///
    /// Failing to list nodes or describe the pool fails the sweep; every
    /// other failure is confined to the node or instance concerned.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> ControllerResult<SweepReport> {
        let sweep_id = SweepId::new();
        let holder = self.holder.to_string();

        // An unreachable lease store must not stop scale-down; the sweep is
        // safe without the lease, only not exclusive.
        let held = match &self.lease {
            Some(settings) => {
                let acquired = bounded(
                    "acquire_sweep_lease",
                    self.view.call_timeout(),
                    settings.lease.try_acquire(SWEEP_LEASE_NAME, &holder, settings.ttl),
                )
                .await;

                match acquired {
                    Ok(true) => Some(settings),
                    Ok(false) => {
                        info!(sweep_id = %sweep_id, "Sweep lease held elsewhere; skipping sweep");
                        let mut report = SweepReport::new(sweep_id, now);
                        report.lease_held_elsewhere = true;
                        return Ok(report);
                    }
                    Err(e) => {
                        warn!(
                            sweep_id = %sweep_id,
                            error = %e,
                            "Sweep lease unavailable; sweeping without it"
                        );
                        None
                    }
                }
            }
            None => None,
        };

        let result = self.run_sweep(sweep_id, now).await;

        if let Some(settings) = held {
            if let Err(e) = bounded(
                "release_sweep_lease",
                self.view.call_timeout(),
                settings.lease.release(SWEEP_LEASE_NAME, &holder),
            )
            .await
            {
                warn!(sweep_id = %sweep_id, error = %e, "Failed to release sweep lease");
            }
        }

        result
    }

    #[instrument(skip(self, sweep_id, now), fields(sweep_id = %sweep_id))]
    async fn run_sweep(
        &self,
        sweep_id: SweepId,
        now: DateTime<Utc>,
    ) -> ControllerResult<SweepReport> {
        let nodes = self.view.list_nodes().await?;
        let pool = self.view.describe_pool().await?;
        let policy = self
            .policy
            .clone()
            .with_expected_launch_config(pool.launch_config_version.clone());

        let observations = join_all(nodes.iter().map(|node| self.observe(node, &policy))).await;
        let plan = plan_sweep(&observations, &pool.instances, &policy, now);

        debug!(
            nodes = observations.len(),
            pool_members = pool.instances.len(),
            terminate = plan.terminate.len(),
            drain = plan.drain.len(),
            reclaim = plan.reclaim.len(),
            "Planned sweep"
        );

        let mut report = SweepReport::new(sweep_id, now);
        report.nodes_observed = u32::try_from(observations.len()).unwrap_or(u32::MAX);
        report.skipped = plan.skipped;
        let correlation = Correlation::sweep(sweep_id);

        // Terminations first: they act on DRAINING observed before this sweep.
        for target in plan.terminate {
            match self.terminate(&target.instance_id).await {
                Ok(()) => {
                    info!(
                        node_id = %target.node_id,
                        instance_id = %target.instance_id,
                        "Terminated drained node"
                    );
                    emit(
                        event_types::NODE_TERMINATED,
                        Component::Reaper,
                        correlation,
                        NodeTerminatedPayload {
                            node_id: target.node_id.clone(),
                            instance_id: target.instance_id.clone(),
                        },
                    );
                    report.terminated.push(target);
                }
                Err(e) => {
                    warn!(
                        node_id = %target.node_id,
                        instance_id = %target.instance_id,
                        error = %e,
                        "Failed to terminate drained node"
                    );
                    report.failures.push(MutationFailure {
                        node_id: Some(target.node_id),
                        instance_id: target.instance_id,
                        action: NodeAction::Terminated,
                        error: e.to_string(),
                    });
                }
            }
        }

        for target in plan.drain {
            let drained = bounded(
                "set_drain_state",
                self.view.call_timeout(),
                self.cluster.set_drain_state(&target.node_id, DrainState::Draining),
            )
            .await;

            match drained {
                Ok(()) => {
                    info!(
                        node_id = %target.node_id,
                        reason = %target.reason,
                        running_tasks = target.running_tasks,
                        "Drained node"
                    );
                    emit(
                        event_types::NODE_DRAINED,
                        Component::Reaper,
                        correlation,
                        NodeDrainedPayload {
                            node_id: target.node_id.clone(),
                            instance_id: target.instance_id.clone(),
                            reason: target.reason,
                            running_tasks: target.running_tasks,
                        },
                    );
                    report.drained.push(target);
                }
                Err(e) => {
                    warn!(node_id = %target.node_id, error = %e, "Failed to drain node");
                    report.failures.push(MutationFailure {
                        node_id: Some(target.node_id),
                        instance_id: target.instance_id,
                        action: NodeAction::Drained {
                            reason: target.reason,
                        },
                        error: e.to_string(),
                    });
                }
            }
        }

        for orphan in plan.reclaim {
            match self.terminate(&orphan.instance_id).await {
                Ok(()) => {
                    info!(
                        instance_id = %orphan.instance_id,
                        launched_at = %orphan.launched_at,
                        "Reclaimed instance that never registered"
                    );
                    emit(
                        event_types::INSTANCE_RECLAIMED,
                        Component::Reaper,
                        correlation,
                        InstanceReclaimedPayload {
                            instance_id: orphan.instance_id.clone(),
                            launched_at: orphan.launched_at,
                        },
                    );
                    report.reclaimed.push(orphan);
                }
                Err(e) => {
                    warn!(
                        instance_id = %orphan.instance_id,
                        error = %e,
                        "Failed to reclaim instance"
                    );
                    report.failures.push(MutationFailure {
                        node_id: None,
                        instance_id: orphan.instance_id,
                        action: NodeAction::OrphanReclaimed,
                        error: e.to_string(),
                    });
                }
            }
        }

        let summary = report.summary();
        info!(
            nodes_observed = summary.nodes_observed,
            nodes_skipped = summary.nodes_skipped,
            nodes_drained = summary.nodes_drained,
            nodes_terminated = summary.nodes_terminated,
            instances_reclaimed = summary.instances_reclaimed,
            mutations_failed = summary.mutations_failed,
            "Sweep complete"
        );
        emit(
            event_types::SWEEP_COMPLETED,
            Component::Reaper,
            correlation,
            summary,
        );

        Ok(report)
    }

    /// Build the observation for one node.
    ///
    /// Activity is read only for idle candidates. A failed or timed-out read
    /// leaves it unknown, which skips the node for this sweep.
    async fn observe(&self, node: &Node, policy: &SweepPolicy) -> NodeObservation {
        let mut observation = NodeObservation {
            node_id: node.node_id.clone(),
            instance_id: node.instance_id.clone(),
            drain_state: node.drain_state,
            running_tasks: node.running_tasks,
            launch_config_version: node.launch_config_version.clone(),
            last_activity: None,
        };

        if observation.needs_activity(policy) {
            match self.view.last_activity(node).await {
                Ok(ts) => observation.last_activity = Some(ts),
                Err(e) => {
                    warn!(
                        node_id = %node.node_id,
                        error = %e,
                        "Skipping node; activity unavailable"
                    )
                }
            }
        }

        observation
    }

    /// Terminate an instance and decrement desired capacity with it.
    async fn terminate(&self, instance_id: &InstanceId) -> ControllerResult<()> {
        bounded(
            "terminate_instance",
            self.view.call_timeout(),
            self.pool.terminate_instance(instance_id, true),
        )
        .await
    }
}
