//! Error types for collaborator calls and controller components.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tidepool_reconcile::ReconcileError;

/// Result type for collaborator (orchestrator, node pool, queue) calls.
pub type ApiResult<T> = Result<T, ApiError>;

/// Result type for controller operations.
pub type ControllerResult<T> = Result<T, ControllerError>;

/// Errors returned by collaborator APIs.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// The orchestrator reported that no node can fit the task.
    #[error("no capacity: {0}")]
    NoCapacity(String),

    /// The target resource does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The remote side did not answer in time.
    #[error("timed out: {0}")]
    Timeout(String),

    /// The remote side asked us to slow down.
    #[error("throttled: {0}")]
    Throttled(String),

    /// The request was understood and refused.
    #[error("rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// Connection-level failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// The response body could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),
}

impl ApiError {
    /// Returns true if this error reports a capacity shortfall.
    pub fn is_no_capacity(&self) -> bool {
        matches!(self, ApiError::NoCapacity(_))
    }
}

/// Errors raised by controller components.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// A collaborator call failed.
    #[error("{operation} failed: {source}")]
    Api {
        operation: &'static str,
        #[source]
        source: ApiError,
    },

    /// A collaborator call exceeded its call timeout.
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// A queue message body is not a valid task request.
    #[error("invalid task message: {0}")]
    InvalidMessage(String),

    /// The node pool is already at its maximum size.
    #[error("node pool is at its maximum size of {max_size}")]
    AtMaxCapacity { max_size: u32 },

    /// Sweep policy could not be built.
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
}

impl ControllerError {
    /// Returns true if a collaborator explicitly reported no capacity.
    pub fn is_no_capacity(&self) -> bool {
        matches!(self, ControllerError::Api { source, .. } if source.is_no_capacity())
    }
}

/// Run a collaborator call under a call timeout.
pub(crate) async fn bounded<T, F>(
    operation: &'static str,
    limit: Duration,
    call: F,
) -> ControllerResult<T>
where
    F: Future<Output = ApiResult<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(source)) => Err(ControllerError::Api { operation, source }),
        Err(_) => Err(ControllerError::Timeout {
            operation,
            after: limit,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bounded_maps_api_error() {
        let result: ControllerResult<()> = bounded("run_task", Duration::from_secs(1), async {
            Err(ApiError::NoCapacity("RESOURCE:MEMORY".to_string()))
        })
        .await;

        let err = result.unwrap_err();
        assert!(err.is_no_capacity());
        assert_eq!(err.to_string(), "run_task failed: no capacity: RESOURCE:MEMORY");
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_times_out() {
        let result: ControllerResult<()> = bounded("list_nodes", Duration::from_secs(2), async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        })
        .await;

        assert!(matches!(
            result,
            Err(ControllerError::Timeout { operation: "list_nodes", .. })
        ));
    }
}
