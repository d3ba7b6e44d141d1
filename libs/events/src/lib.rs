//! # tidepool-events
//!
//! Outcome records emitted by the capacity controller for operators.
//!
//! ## Design Principles
//!
//! - Every record describes something that already happened (a task started,
//!   a node was drained), never an intention
//! - Records carry only identifiers and counters, never task payloads
//! - Records are versioned for schema evolution
//!
//! ## Event Types
//!
//! - Task events (`task.*`): dispatch outcomes and dead-lettering
//! - Capacity events (`capacity.*`): scale-up decisions
//! - Node events (`node.*`, `instance.*`): drain, terminate and reclaim actions
//! - Sweep events (`sweep.*`): per-sweep summaries

mod envelope;
mod error;
mod types;

pub use envelope::*;
pub use error::EventError;
pub use types::*;
