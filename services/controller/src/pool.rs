//! Node pool interface.

use async_trait::async_trait;
use tidepool_id::InstanceId;

use crate::error::ApiResult;
use crate::model::PoolDescription;

/// Elastic compute pool operations used by the controller.
#[async_trait]
pub trait NodePoolClient: Send + Sync {
    /// Desired capacity, size bounds, launch configuration and members.
    async fn describe_pool(&self) -> ApiResult<PoolDescription>;

    /// Set desired capacity.
    ///
    /// With `honor_cooldown` false the pool manager applies the change
    /// immediately instead of waiting out its cool-down.
    async fn set_desired_capacity(&self, desired: u32, honor_cooldown: bool) -> ApiResult<()>;

    /// Terminate one instance, optionally decrementing desired capacity.
    ///
    /// Terminating an instance that is already gone succeeds.
    async fn terminate_instance(
        &self,
        instance_id: &InstanceId,
        decrement_desired: bool,
    ) -> ApiResult<()>;
}
