//! # tidepool-id
//!
//! Typed identifiers for the tidepool capacity controller.
//!
//! Two families of ids live here:
//!
//! - **Minted ids** are generated by the controller itself and use a prefixed
//!   ULID format: `{prefix}_{ulid}` (for example `swp_01HV4Z2WQXKJNM8GPQY6VBKC3D`).
//!   They are sortable by creation time, which keeps sweep reports ordered
//!   in logs.
//! - **External ids** are minted by the orchestrator, the node pool or the
//!   queue (node ARNs, instance ids, task ids, message ids, receipt
//!   handles). The controller never interprets them; it only requires them
//!   to be non-empty and free of surrounding whitespace.
//!
//! Both families are distinct types so a `NodeId` can never be passed where
//! an `InstanceId` is expected.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;

#[doc(hidden)]
pub use serde as __serde;
