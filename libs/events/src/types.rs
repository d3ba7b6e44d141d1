//! Outcome and payload type definitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tidepool_id::{InstanceId, NodeId, TaskId};

// =============================================================================
// Event Type Constants
// =============================================================================

/// All event type names as constants.
pub mod event_types {
    // Task
    pub const TASK_STARTED: &str = "task.started";
    pub const TASK_RETRYING: &str = "task.retrying";
    pub const TASK_DEAD_LETTERED: &str = "task.dead_lettered";
    pub const TASK_REDRIVEN: &str = "task.redriven";

    // Capacity
    pub const CAPACITY_SCALE_REQUESTED: &str = "capacity.scale_requested";
    pub const CAPACITY_ALREADY_SCALING: &str = "capacity.already_scaling";

    // Node
    pub const NODE_DRAINED: &str = "node.drained";
    pub const NODE_TERMINATED: &str = "node.terminated";
    pub const INSTANCE_RECLAIMED: &str = "instance.reclaimed";

    // Sweep
    pub const SWEEP_COMPLETED: &str = "sweep.completed";
}

// =============================================================================
// Shared enums
// =============================================================================

/// Drain state of a registered node, as reported by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DrainState {
    /// Accepting new placements.
    #[default]
    Active,
    /// No new placements; running tasks continue to completion.
    Draining,
}

impl std::fmt::Display for DrainState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DrainState::Active => write!(f, "ACTIVE"),
            DrainState::Draining => write!(f, "DRAINING"),
        }
    }
}

/// Why a dispatch attempt is being retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryReason {
    /// The cluster had no room for the task; a scale-up was requested.
    CapacityShortfall,
    /// Any other placement failure.
    PlacementFailed,
}

impl std::fmt::Display for RetryReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetryReason::CapacityShortfall => write!(f, "capacity_shortfall"),
            RetryReason::PlacementFailed => write!(f, "placement_failed"),
        }
    }
}

/// Per-task outcome exposed to operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskOutcome {
    /// The task was placed and the message acknowledged.
    Started {
        task_id: TaskId,
        #[serde(skip_serializing_if = "Option::is_none")]
        node_id: Option<NodeId>,
    },
    /// The message was left unacknowledged for redelivery.
    Retrying { reason: RetryReason, detail: String },
    /// The message exhausted its receive budget and was moved aside.
    DeadLettered,
}

impl TaskOutcome {
    /// Operator-facing status label.
    pub fn status(&self) -> &'static str {
        match self {
            TaskOutcome::Started { .. } => "STARTED",
            TaskOutcome::Retrying { .. } => "RETRYING",
            TaskOutcome::DeadLettered => "DEAD_LETTERED",
        }
    }

    /// Returns true if the message should be acknowledged.
    pub fn is_started(&self) -> bool {
        matches!(self, TaskOutcome::Started { .. })
    }

    /// Returns true if the outcome was caused by a capacity shortfall.
    pub fn is_capacity_shortfall(&self) -> bool {
        matches!(
            self,
            TaskOutcome::Retrying {
                reason: RetryReason::CapacityShortfall,
                ..
            }
        )
    }
}

/// Result of a scale-up request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScaleDecision {
    /// Desired capacity already exceeds registered nodes; nothing was changed.
    AlreadyScaling,
    /// Desired capacity was raised by one.
    ScaleRequested { previous: u32, requested: u32 },
}

/// Why a node was moved to DRAINING.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrainReason {
    /// No running tasks for longer than the idle timeout.
    Idle,
    /// The node was launched from an outdated launch configuration.
    StaleLaunchConfig,
}

impl std::fmt::Display for DrainReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DrainReason::Idle => write!(f, "idle"),
            DrainReason::StaleLaunchConfig => write!(f, "stale_launch_config"),
        }
    }
}

/// An action the reaper took against a node or pool member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum NodeAction {
    Drained { reason: DrainReason },
    Terminated,
    OrphanReclaimed,
}

// =============================================================================
// Payloads
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStartedPayload {
    pub task_id: TaskId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    pub started_by: String,
    pub receive_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRetryingPayload {
    pub reason: RetryReason,
    pub detail: String,
    pub receive_count: u32,
    pub max_receive_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDeadLetteredPayload {
    pub receive_count: u32,
    pub max_receive_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScaleRequestedPayload {
    pub previous: u32,
    pub requested: u32,
    pub registered_nodes: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlreadyScalingPayload {
    pub desired_capacity: u32,
    pub registered_nodes: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDrainedPayload {
    pub node_id: NodeId,
    pub instance_id: InstanceId,
    pub reason: DrainReason,
    pub running_tasks: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeTerminatedPayload {
    pub node_id: NodeId,
    pub instance_id: InstanceId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceReclaimedPayload {
    pub instance_id: InstanceId,
    pub launched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SweepCompletedPayload {
    pub nodes_observed: u32,
    pub nodes_skipped: u32,
    pub nodes_drained: u32,
    pub nodes_terminated: u32,
    pub instances_reclaimed: u32,
    pub mutations_failed: u32,
}
