//! Wire and domain types shared by the controller components.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tidepool_events::DrainState;
use tidepool_id::{InstanceId, NodeId, TaskDefinitionRef, TaskId};
use tidepool_reconcile::PoolMember;

use crate::error::{ControllerError, ControllerResult};

/// Maximum length of the placement annotation derived from a job name.
pub const STARTED_BY_MAX_CHARS: usize = 35;

/// A request to run one task, as carried by a queue message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRequest {
    pub job_name: String,
    pub task_definition_ref: TaskDefinitionRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_overrides: Option<ContainerOverrides>,
}

impl TaskRequest {
    /// Parse a queue message body.
    pub fn from_message_body(body: &str) -> ControllerResult<Self> {
        serde_json::from_str(body).map_err(|e| ControllerError::InvalidMessage(e.to_string()))
    }

    /// Placement annotation: the job name cut to 35 characters.
    pub fn started_by(&self) -> String {
        self.job_name.chars().take(STARTED_BY_MAX_CHARS).collect()
    }

    /// Memory the task asks for, if overridden.
    pub fn memory_mib(&self) -> Option<u32> {
        self.container_overrides.as_ref().and_then(|o| o.memory)
    }
}

/// Per-container overrides applied at task start.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerOverrides {
    /// Target container; empty targets the task definition's only container.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub environment: Vec<EnvVar>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

/// A cluster-registered worker as reported by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub node_id: NodeId,
    /// Pool member backing this node.
    pub instance_id: InstanceId,
    pub registered_at: DateTime<Utc>,
    pub running_tasks: u32,
    #[serde(default)]
    pub drain_state: DrainState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub launch_config_version: Option<String>,
    pub remaining_memory_mib: u32,
    pub remaining_cpu_units: u32,
    /// Stop time of the most recent task, when the orchestrator reports it inline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_task_stopped_at: Option<DateTime<Utc>>,
}

/// A task that has stopped on a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoppedTask {
    pub task_id: TaskId,
    pub stopped_at: DateTime<Utc>,
}

/// Placement strategy requested from the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PlacementStrategy {
    /// Fill the node with the least remaining memory first.
    #[default]
    BinpackMemory,
}

/// Arguments for a single run-task call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunTaskRequest {
    pub cluster: String,
    pub task_definition: TaskDefinitionRef,
    pub started_by: String,
    #[serde(default)]
    pub placement: PlacementStrategy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overrides: Option<ContainerOverrides>,
}

impl RunTaskRequest {
    /// Build the run-task call for a queued request.
    pub fn for_task(cluster: impl Into<String>, task: &TaskRequest) -> Self {
        Self {
            cluster: cluster.into(),
            task_definition: task.task_definition_ref.clone(),
            started_by: task.started_by(),
            placement: PlacementStrategy::BinpackMemory,
            overrides: task.container_overrides.clone(),
        }
    }
}

/// A task the orchestrator accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartedTask {
    pub task_id: TaskId,
    pub node_id: NodeId,
}

/// Why the orchestrator could not place a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementFailure {
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
}

/// Result of a run-task call.
///
/// A non-empty `failures` list means the cluster had no node that fit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunTaskOutput {
    #[serde(default)]
    pub tasks: Vec<StartedTask>,
    #[serde(default)]
    pub failures: Vec<PlacementFailure>,
}

impl RunTaskOutput {
    /// Failure reasons joined for logging.
    pub fn failure_summary(&self) -> String {
        self.failures
            .iter()
            .map(|f| f.reason.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// The node pool as reported by the pool manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolDescription {
    pub desired_capacity: u32,
    pub min_size: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_size: Option<u32>,
    /// Launch configuration new instances are created from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub launch_config_version: Option<String>,
    #[serde(default)]
    pub instances: Vec<PoolMember>,
}

/// Most recent activity on a node.
///
/// The registration time, or the latest task stop time if later.
pub fn last_activity(node: &Node, stopped: &[StoppedTask]) -> DateTime<Utc> {
    stopped
        .iter()
        .map(|t| t.stopped_at)
        .chain(node.last_task_stopped_at)
        .fold(node.registered_at, |latest, ts| latest.max(ts))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(registered_at: DateTime<Utc>) -> Node {
        Node {
            node_id: NodeId::parse("node-1").unwrap(),
            instance_id: InstanceId::parse("i-1").unwrap(),
            registered_at,
            running_tasks: 0,
            drain_state: DrainState::Active,
            launch_config_version: None,
            remaining_memory_mib: 4096,
            remaining_cpu_units: 2048,
            last_task_stopped_at: None,
        }
    }

    #[test]
    fn test_parse_full_message() {
        let body = r#"{
            "jobName": "nightly-report",
            "taskDefinitionRef": "report-builder:12",
            "containerOverrides": {
                "name": "main",
                "command": ["--date", "2026-10-16"],
                "environment": [{"name": "REGION", "value": "eu-west-1"}],
                "memory": 2048
            }
        }"#;

        let task = TaskRequest::from_message_body(body).unwrap();
        assert_eq!(task.job_name, "nightly-report");
        assert_eq!(task.task_definition_ref.as_str(), "report-builder:12");
        assert_eq!(task.memory_mib(), Some(2048));
        assert_eq!(task.container_overrides.unwrap().environment[0].value, "eu-west-1");
    }

    #[test]
    fn test_overrides_without_container_name() {
        let body = r#"{
            "jobName": "a",
            "taskDefinitionRef": "b",
            "containerOverrides": {"memory": 2048}
        }"#;

        let task = TaskRequest::from_message_body(body).unwrap();
        assert_eq!(task.memory_mib(), Some(2048));
        let overrides = task.container_overrides.unwrap();
        assert!(overrides.name.is_empty());
        assert!(!serde_json::to_string(&overrides).unwrap().contains("name"));
    }

    #[test]
    fn test_parse_minimal_message() {
        let task =
            TaskRequest::from_message_body(r#"{"jobName":"a","taskDefinitionRef":"b"}"#).unwrap();
        assert!(task.container_overrides.is_none());
        assert_eq!(task.memory_mib(), None);
    }

    #[test]
    fn test_parse_rejects_missing_definition() {
        let err = TaskRequest::from_message_body(r#"{"jobName":"a"}"#).unwrap_err();
        assert!(matches!(err, ControllerError::InvalidMessage(_)));
        assert!(TaskRequest::from_message_body("not json").is_err());
    }

    #[test]
    fn test_started_by_truncates_to_35_chars() {
        let task = TaskRequest {
            job_name: "a-very-long-job-name-that-exceeds-the-annotation-limit".to_string(),
            task_definition_ref: TaskDefinitionRef::parse("td").unwrap(),
            container_overrides: None,
        };
        assert_eq!(task.started_by(), "a-very-long-job-name-that-exceeds-t");
        assert_eq!(task.started_by().chars().count(), 35);
    }

    #[test]
    fn test_started_by_counts_characters_not_bytes() {
        let task = TaskRequest {
            job_name: "é".repeat(40),
            task_definition_ref: TaskDefinitionRef::parse("td").unwrap(),
            container_overrides: None,
        };
        assert_eq!(task.started_by(), "é".repeat(35));
    }

    #[test]
    fn test_run_task_request_uses_binpack() {
        let task = TaskRequest::from_message_body(r#"{"jobName":"j","taskDefinitionRef":"td:1"}"#)
            .unwrap();
        let req = RunTaskRequest::for_task("batch", &task);
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["placement"], "binpack_memory");
        assert_eq!(json["started_by"], "j");
    }

    #[test]
    fn test_last_activity_defaults_to_registration() {
        let registered = Utc::now() - chrono::Duration::hours(2);
        assert_eq!(last_activity(&node(registered), &[]), registered);
    }

    #[test]
    fn test_last_activity_uses_latest_stop() {
        let registered = Utc::now() - chrono::Duration::hours(2);
        let recent = registered + chrono::Duration::minutes(90);
        let stopped = vec![
            StoppedTask {
                task_id: TaskId::parse("t-1").unwrap(),
                stopped_at: registered + chrono::Duration::minutes(5),
            },
            StoppedTask {
                task_id: TaskId::parse("t-2").unwrap(),
                stopped_at: recent,
            },
        ];
        assert_eq!(last_activity(&node(registered), &stopped), recent);
    }

    #[test]
    fn test_last_activity_ignores_stops_before_registration() {
        let registered = Utc::now();
        let stopped = vec![StoppedTask {
            task_id: TaskId::parse("t-1").unwrap(),
            stopped_at: registered - chrono::Duration::days(1),
        }];
        assert_eq!(last_activity(&node(registered), &stopped), registered);
    }
}
