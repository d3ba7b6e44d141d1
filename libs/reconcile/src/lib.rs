//! Scale-up and sweep decision primitives.
//!
//! This library holds the decision half of the capacity controller. It never
//! talks to the orchestrator or the node pool; callers gather observations,
//! ask for a decision, and carry it out. Key concepts:
//!
//! - **Shortfall episode**: one or more placement failures that a single
//!   extra node would resolve. Desired capacity grows by one per episode.
//! - **Sweep**: one pass of the reaper over every registered node and every
//!   pool member.
//! - **Two-observation rule**: a node is terminated only when a sweep sees it
//!   DRAINING with zero running tasks. Since the DRAINING transition is itself
//!   made by a sweep, termination always lands on a later sweep.
//!
//! # Invariants
//!
//! - Decisions are deterministic given the same inputs
//! - A node with running tasks is never planned for termination
//! - A node is never planned for both drain and termination in one sweep
//! - Pool members backing a registered node are never reclaimed

mod scale;
mod sweep;

use std::time::Duration;

use sha2::{Digest, Sha256};
use thiserror::Error;

pub use scale::{decide_scale_up, ScaleUpPlan};
pub use sweep::{
    plan_sweep, DrainNode, InstanceLifecycle, NodeObservation, PoolMember, ReclaimInstance,
    SweepPlan, SweepPolicy, TerminateNode,
};

/// Reconciliation errors.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// A policy duration does not fit the timestamp arithmetic.
    #[error("invalid policy: {0}")]
    InvalidPolicy(String),
}

/// A launch-configuration fingerprint for deterministic comparison.
///
/// Pools that describe their launch configuration structurally (template,
/// image, instance type) rather than with a version string are compared by
/// this fingerprint instead.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LaunchConfigFingerprint(String);

impl LaunchConfigFingerprint {
    /// Compute a fingerprint from canonical JSON.
    pub fn from_json(json: &serde_json::Value) -> Self {
        let canonical = canonical_json(json);
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        let result = hasher.finalize();
        Self(format!("lc:{}", hex::encode(&result[..12])))
    }

    /// Get the fingerprint string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for LaunchConfigFingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<LaunchConfigFingerprint> for String {
    fn from(fp: LaunchConfigFingerprint) -> Self {
        fp.0
    }
}

/// Produce canonical JSON (sorted keys, no extra whitespace).
fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut pairs: Vec<_> = map.iter().collect();
            pairs.sort_by_key(|(k, _)| *k);
            let inner: Vec<String> = pairs
                .iter()
                .map(|(k, v)| format!("{}:{}", json_string(k), canonical_json(v)))
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        serde_json::Value::Array(arr) => {
            let inner: Vec<String> = arr.iter().map(canonical_json).collect();
            format!("[{}]", inner.join(","))
        }
        serde_json::Value::String(s) => json_string(s),
        other => other.to_string(),
    }
}

fn json_string(s: &str) -> String {
    serde_json::Value::String(s.to_string()).to_string()
}

/// Default interval between reaper sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(3 * 60);

/// Default idle period after which an empty node is drained.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Default window for a launched instance to register with the cluster.
pub const DEFAULT_REGISTRATION_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Default wall-clock budget for one sweep.
pub const DEFAULT_SWEEP_BUDGET: Duration = Duration::from_secs(2 * 60);
