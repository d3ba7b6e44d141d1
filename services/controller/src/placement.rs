//! Binpack-by-memory placement.
//!
//! Tasks are concentrated onto the fewest nodes: the candidate with the least
//! remaining memory that still fits wins. Lightly used nodes stay empty and
//! become idle candidates for the reaper.

use tidepool_events::DrainState;

use crate::model::Node;

/// Resources a task needs from a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceRequest {
    pub memory_mib: u32,
    pub cpu_units: u32,
}

impl ResourceRequest {
    /// Default reservation when a task does not override its memory.
    pub const DEFAULT: Self = Self {
        memory_mib: 512,
        cpu_units: 256,
    };

    pub fn with_memory(memory_mib: Option<u32>) -> Self {
        Self {
            memory_mib: memory_mib.unwrap_or(Self::DEFAULT.memory_mib),
            ..Self::DEFAULT
        }
    }
}

impl Default for ResourceRequest {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Whether a node can take a new task.
pub fn fits(node: &Node, request: ResourceRequest) -> bool {
    node.drain_state == DrainState::Active
        && node.remaining_memory_mib >= request.memory_mib
        && node.remaining_cpu_units >= request.cpu_units
}

/// Rank eligible nodes, best binpack candidate first.
///
/// Ordered by ascending remaining memory, ties broken by node id.
pub fn rank_binpack_memory(nodes: &[Node], request: ResourceRequest) -> Vec<&Node> {
    let mut candidates: Vec<&Node> = nodes.iter().filter(|n| fits(n, request)).collect();
    candidates.sort_by(|a, b| {
        a.remaining_memory_mib
            .cmp(&b.remaining_memory_mib)
            .then_with(|| a.node_id.cmp(&b.node_id))
    });
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tidepool_id::{InstanceId, NodeId};

    fn node(id: &str, memory: u32, state: DrainState) -> Node {
        Node {
            node_id: NodeId::parse(id).unwrap(),
            instance_id: InstanceId::parse(&format!("i-{id}")).unwrap(),
            registered_at: Utc::now(),
            running_tasks: 0,
            drain_state: state,
            launch_config_version: None,
            remaining_memory_mib: memory,
            remaining_cpu_units: 2048,
            last_task_stopped_at: None,
        }
    }

    #[test]
    fn test_fullest_node_wins() {
        let nodes = vec![
            node("a", 8192, DrainState::Active),
            node("b", 1024, DrainState::Active),
            node("c", 4096, DrainState::Active),
        ];

        let ranked: Vec<_> = rank_binpack_memory(&nodes, ResourceRequest::DEFAULT)
            .iter()
            .map(|n| n.node_id.as_str())
            .collect();
        assert_eq!(ranked, vec!["b", "c", "a"]);
    }

    #[test]
    fn test_nodes_too_small_or_draining_are_excluded() {
        let nodes = vec![
            node("a", 256, DrainState::Active),
            node("b", 1024, DrainState::Draining),
            node("c", 2048, DrainState::Active),
        ];

        let ranked = rank_binpack_memory(&nodes, ResourceRequest::with_memory(Some(1024)));
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].node_id.as_str(), "c");
    }

    #[test]
    fn test_ties_break_by_node_id() {
        let nodes = vec![
            node("z", 2048, DrainState::Active),
            node("m", 2048, DrainState::Active),
        ];

        let ranked = rank_binpack_memory(&nodes, ResourceRequest::DEFAULT);
        assert_eq!(ranked[0].node_id.as_str(), "m");
    }

    #[test]
    fn test_cpu_must_fit_too() {
        let mut busy = node("a", 8192, DrainState::Active);
        busy.remaining_cpu_units = 128;

        assert!(!fits(&busy, ResourceRequest::DEFAULT));
    }
}
