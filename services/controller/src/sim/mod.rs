//! Simulated backend: an in-memory cluster, node pool and task queue.
//!
//! Used by the tests and by the `simulated` backend of the binary.

mod cluster;
mod queue;

pub use cluster::{SimulatedCluster, SimulationSettings, StartedRecord};
pub use queue::{InMemoryTaskQueue, QueueSettings};
