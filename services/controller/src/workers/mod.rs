//! Background workers.
//!
//! Each worker runs until its shutdown channel flips to `true`, finishing
//! the iteration in progress first.

mod dispatch;
mod reaper;

pub use dispatch::{DispatchStats, DispatchWorker, DispatchWorkerConfig};
pub use reaper::{ReaperWorker, ReaperWorkerConfig};
