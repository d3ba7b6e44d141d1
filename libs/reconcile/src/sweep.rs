//! Sweep planning for the node reaper.

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tidepool_events::{DrainReason, DrainState};
use tidepool_id::{InstanceId, NodeId};

use crate::ReconcileError;

/// What the reaper saw for one registered node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeObservation {
    pub node_id: NodeId,
    /// Pool member backing this node.
    pub instance_id: InstanceId,
    pub drain_state: DrainState,
    pub running_tasks: u32,
    pub launch_config_version: Option<String>,
    /// Most recent activity, or `None` if it was not (or could not be) read.
    pub last_activity: Option<DateTime<Utc>>,
}

impl NodeObservation {
    /// Whether this node was launched from an outdated launch configuration.
    ///
    /// Nodes that do not report a version are never considered stale.
    pub fn is_stale(&self, policy: &SweepPolicy) -> bool {
        match (&self.launch_config_version, &policy.expected_launch_config) {
            (Some(actual), Some(expected)) => actual != expected,
            _ => false,
        }
    }

    /// Whether the idle check needs this node's last activity.
    ///
    /// Only ACTIVE, empty, current-config nodes are idle candidates; callers
    /// use this to avoid per-node activity queries for everything else.
    pub fn needs_activity(&self, policy: &SweepPolicy) -> bool {
        self.drain_state == DrainState::Active && self.running_tasks == 0 && !self.is_stale(policy)
    }
}

/// Lifecycle of a pool member as reported by the node pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceLifecycle {
    Pending,
    InService,
    Terminating,
    Terminated,
}

impl InstanceLifecycle {
    /// Returns true if the instance is already leaving the pool.
    pub fn is_leaving(&self) -> bool {
        matches!(self, Self::Terminating | Self::Terminated)
    }
}

/// A compute instance in the node pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolMember {
    pub instance_id: InstanceId,
    pub launched_at: DateTime<Utc>,
    pub lifecycle: InstanceLifecycle,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub launch_config_version: Option<String>,
}

/// Sweep thresholds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepPolicy {
    idle_timeout: chrono::Duration,
    registration_timeout: chrono::Duration,
    pub expected_launch_config: Option<String>,
}

impl SweepPolicy {
    /// Create a policy from wall-clock timeouts.
    pub fn new(
        idle_timeout: Duration,
        registration_timeout: Duration,
        expected_launch_config: Option<String>,
    ) -> Result<Self, ReconcileError> {
        let convert = |name: &str, d: Duration| {
            chrono::Duration::from_std(d)
                .map_err(|e| ReconcileError::InvalidPolicy(format!("{name}: {e}")))
        };

        Ok(Self {
            idle_timeout: convert("idle_timeout", idle_timeout)?,
            registration_timeout: convert("registration_timeout", registration_timeout)?,
            expected_launch_config,
        })
    }

    /// Same thresholds, different expected launch configuration.
    pub fn with_expected_launch_config(mut self, expected: Option<String>) -> Self {
        self.expected_launch_config = expected;
        self
    }

    pub fn idle_timeout(&self) -> chrono::Duration {
        self.idle_timeout
    }

    pub fn registration_timeout(&self) -> chrono::Duration {
        self.registration_timeout
    }
}

/// A DRAINING, empty node to terminate (with a desired-capacity decrement).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TerminateNode {
    pub node_id: NodeId,
    pub instance_id: InstanceId,
}

/// A node to move to DRAINING.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DrainNode {
    pub node_id: NodeId,
    pub instance_id: InstanceId,
    pub reason: DrainReason,
    pub running_tasks: u32,
}

/// A pool member that never became a usable node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReclaimInstance {
    pub instance_id: InstanceId,
    pub launched_at: DateTime<Utc>,
}

/// Everything one sweep should do.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepPlan {
    pub terminate: Vec<TerminateNode>,
    pub drain: Vec<DrainNode>,
    pub reclaim: Vec<ReclaimInstance>,
    /// Idle candidates whose activity could not be read this sweep.
    pub skipped: Vec<NodeId>,
    /// Instances backing a registered node.
    pub known_good: BTreeSet<InstanceId>,
}

impl SweepPlan {
    /// Returns true if the plan performs no mutation.
    pub fn is_empty(&self) -> bool {
        self.terminate.is_empty() && self.drain.is_empty() && self.reclaim.is_empty()
    }
}

/// Plan one reaper sweep.
///
/// Per node, first match wins:
/// 1. DRAINING with no running tasks: terminate. The DRAINING state was set by
///    an earlier sweep, so this is the second, confirming observation.
/// 2. Launched from a stale configuration: drain, even with tasks running.
///    Already-DRAINING nodes are left alone.
/// 3. ACTIVE, empty, and idle past the timeout: drain.
///
/// Then every pool member not backing a registered node, not already leaving,
/// and older than the registration timeout is reclaimed.
pub fn plan_sweep(
    nodes: &[NodeObservation],
    pool: &[PoolMember],
    policy: &SweepPolicy,
    now: DateTime<Utc>,
) -> SweepPlan {
    let mut plan = SweepPlan::default();

    for node in nodes {
        plan.known_good.insert(node.instance_id.clone());

        if node.drain_state == DrainState::Draining {
            if node.running_tasks == 0 {
                plan.terminate.push(TerminateNode {
                    node_id: node.node_id.clone(),
                    instance_id: node.instance_id.clone(),
                });
            }
            continue;
        }

        if node.is_stale(policy) {
            plan.drain.push(DrainNode {
                node_id: node.node_id.clone(),
                instance_id: node.instance_id.clone(),
                reason: DrainReason::StaleLaunchConfig,
                running_tasks: node.running_tasks,
            });
            continue;
        }

        if node.running_tasks > 0 {
            continue;
        }

        match node.last_activity {
            Some(last_activity) if now - last_activity > policy.idle_timeout => {
                plan.drain.push(DrainNode {
                    node_id: node.node_id.clone(),
                    instance_id: node.instance_id.clone(),
                    reason: DrainReason::Idle,
                    running_tasks: 0,
                });
            }
            Some(_) => {}
            None => plan.skipped.push(node.node_id.clone()),
        }
    }

    for member in pool {
        if plan.known_good.contains(&member.instance_id) || member.lifecycle.is_leaving() {
            continue;
        }
        if now - member.launched_at > policy.registration_timeout {
            plan.reclaim.push(ReclaimInstance {
                instance_id: member.instance_id.clone(),
                launched_at: member.launched_at,
            });
        }
    }

    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn policy() -> SweepPolicy {
        SweepPolicy::new(
            Duration::from_secs(600),
            Duration::from_secs(600),
            Some("lt-7".to_string()),
        )
        .unwrap()
    }

    fn node(
        n: u32,
        state: DrainState,
        running: u32,
        idle_secs: i64,
        now: DateTime<Utc>,
    ) -> NodeObservation {
        NodeObservation {
            node_id: NodeId::parse(&format!("node-{n}")).unwrap(),
            instance_id: InstanceId::parse(&format!("i-{n}")).unwrap(),
            drain_state: state,
            running_tasks: running,
            launch_config_version: Some("lt-7".to_string()),
            last_activity: Some(now - chrono::Duration::seconds(idle_secs)),
        }
    }

    fn member(
        n: u32,
        age_secs: i64,
        lifecycle: InstanceLifecycle,
        now: DateTime<Utc>,
    ) -> PoolMember {
        PoolMember {
            instance_id: InstanceId::parse(&format!("i-{n}")).unwrap(),
            launched_at: now - chrono::Duration::seconds(age_secs),
            lifecycle,
            launch_config_version: Some("lt-7".to_string()),
        }
    }

    #[test]
    fn test_idle_node_is_drained_not_terminated() {
        let now = Utc::now();
        let nodes = vec![node(1, DrainState::Active, 0, 601, now)];

        let plan = plan_sweep(&nodes, &[], &policy(), now);

        assert_eq!(plan.drain.len(), 1);
        assert_eq!(plan.drain[0].reason, DrainReason::Idle);
        assert!(plan.terminate.is_empty());
    }

    #[test]
    fn test_idle_timeout_is_strict() {
        let now = Utc::now();
        let nodes = vec![node(1, DrainState::Active, 0, 600, now)];

        let plan = plan_sweep(&nodes, &[], &policy(), now);
        assert!(plan.is_empty());
    }

    #[test]
    fn test_busy_node_is_never_idle() {
        let now = Utc::now();
        let nodes = vec![node(1, DrainState::Active, 2, 86_400, now)];

        let plan = plan_sweep(&nodes, &[], &policy(), now);
        assert!(plan.is_empty());
    }

    #[test]
    fn test_draining_empty_node_is_terminated() {
        let now = Utc::now();
        let nodes = vec![node(1, DrainState::Draining, 0, 5, now)];

        let plan = plan_sweep(&nodes, &[], &policy(), now);

        assert_eq!(plan.terminate.len(), 1);
        assert!(plan.drain.is_empty());
    }

    #[test]
    fn test_draining_busy_node_waits() {
        let now = Utc::now();
        let mut stale = node(1, DrainState::Draining, 3, 5, now);
        stale.launch_config_version = Some("lt-6".to_string());

        let plan = plan_sweep(&[stale], &[], &policy(), now);
        assert!(plan.is_empty());
    }

    #[test]
    fn test_stale_node_drained_despite_tasks() {
        let now = Utc::now();
        let mut stale = node(1, DrainState::Active, 3, 5, now);
        stale.launch_config_version = Some("lt-6".to_string());

        let plan = plan_sweep(&[stale], &[], &policy(), now);

        assert_eq!(plan.drain.len(), 1);
        assert_eq!(plan.drain[0].reason, DrainReason::StaleLaunchConfig);
        assert_eq!(plan.drain[0].running_tasks, 3);
    }

    #[test]
    fn test_unknown_launch_config_is_not_stale() {
        let now = Utc::now();
        let mut unknown = node(1, DrainState::Active, 1, 5, now);
        unknown.launch_config_version = None;

        assert!(!unknown.is_stale(&policy()));
        assert!(plan_sweep(&[unknown], &[], &policy(), now).is_empty());
    }

    #[test]
    fn test_missing_activity_skips_idle_candidate() {
        let now = Utc::now();
        let mut n = node(1, DrainState::Active, 0, 0, now);
        n.last_activity = None;

        let plan = plan_sweep(
            &[n.clone()],
            &[member(1, 7200, InstanceLifecycle::InService, now)],
            &policy(),
            now,
        );

        assert_eq!(plan.skipped, vec![n.node_id]);
        assert!(plan.is_empty(), "skipped node's instance must stay known-good");
    }

    #[test]
    fn test_needs_activity_only_for_idle_candidates() {
        let now = Utc::now();
        let p = policy();
        assert!(node(1, DrainState::Active, 0, 0, now).needs_activity(&p));
        assert!(!node(1, DrainState::Active, 1, 0, now).needs_activity(&p));
        assert!(!node(1, DrainState::Draining, 0, 0, now).needs_activity(&p));
    }

    #[test]
    fn test_orphan_reclaimed_after_registration_timeout() {
        let now = Utc::now();
        let nodes = vec![node(1, DrainState::Active, 1, 0, now)];
        let pool = vec![
            member(1, 7200, InstanceLifecycle::InService, now),
            member(2, 601, InstanceLifecycle::InService, now),
            member(3, 120, InstanceLifecycle::Pending, now),
            member(4, 7200, InstanceLifecycle::Terminating, now),
        ];

        let plan = plan_sweep(&nodes, &pool, &policy(), now);

        let reclaimed: Vec<_> = plan.reclaim.iter().map(|r| r.instance_id.as_str()).collect();
        assert_eq!(reclaimed, vec!["i-2"]);
    }

    fn arb_state() -> impl Strategy<Value = DrainState> {
        prop_oneof![Just(DrainState::Active), Just(DrainState::Draining)]
    }

    proptest! {
        #[test]
        fn plan_never_terminates_busy_or_active_nodes(
            specs in proptest::collection::vec(
                (arb_state(), 0u32..4, 0i64..2000, any::<bool>(), any::<bool>()),
                0..24,
            )
        ) {
            let now = Utc::now();
            let nodes: Vec<_> = specs
                .iter()
                .enumerate()
                .map(|(i, (state, running, idle, stale, known))| {
                    let mut n = node(i as u32, *state, *running, *idle, now);
                    if *stale {
                        n.launch_config_version = Some("lt-old".to_string());
                    }
                    if !*known {
                        n.last_activity = None;
                    }
                    n
                })
                .collect();

            let plan = plan_sweep(&nodes, &[], &policy(), now);

            for t in &plan.terminate {
                let observed = nodes.iter().find(|n| n.node_id == t.node_id).unwrap();
                prop_assert_eq!(observed.running_tasks, 0);
                prop_assert_eq!(observed.drain_state, DrainState::Draining);
                prop_assert!(plan.drain.iter().all(|d| d.node_id != t.node_id));
            }
            for d in &plan.drain {
                let observed = nodes.iter().find(|n| n.node_id == d.node_id).unwrap();
                prop_assert_eq!(observed.drain_state, DrainState::Active);
            }
        }
    }
}
