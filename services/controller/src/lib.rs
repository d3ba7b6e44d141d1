//! tidepool capacity controller.
//!
//! This crate primarily ships the `tidepool` binary, but exposes its
//! components as a library so they can be driven against the simulated
//! backend in integration tests.
//!
//! - [`dispatcher::TaskDispatcher`] places queued task requests and asks for
//!   capacity when placement fails for lack of it.
//! - [`capacity::CapacityController`] grows the node pool by one node per
//!   shortfall episode.
//! - [`reaper::NodeReaper`] drains idle and stale nodes, terminates drained
//!   empty nodes, and reclaims instances that never registered.

pub mod capacity;
pub mod cluster;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod gateway;
pub mod lease;
pub mod model;
mod outcome;
pub mod placement;
pub mod pool;
pub mod queue;
pub mod reaper;
pub mod sim;
pub mod workers;

pub use error::{ApiError, ApiResult, ControllerError, ControllerResult};
pub use outcome::OUTCOME_TARGET;
