//! Short-lived mutual-exclusion lease around a reaper sweep.
//!
//! Two overlapping sweeps would both see the same DRAINING, empty node and
//! both terminate it with a capacity decrement. The lease makes a second
//! sweep back off while the first holds it. Leases expire on their own so a
//! crashed holder never blocks sweeping for longer than the ttl.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::ApiResult;

/// Lease name used by the node reaper.
pub const SWEEP_LEASE_NAME: &str = "node-reaper";

/// A named, expiring lease.
#[async_trait]
pub trait SweepLease: Send + Sync {
    /// Take the lease for `holder` unless someone else holds an unexpired one.
    ///
    /// Re-acquiring a lease the holder already owns extends it.
    async fn try_acquire(&self, name: &str, holder: &str, ttl: Duration) -> ApiResult<bool>;

    /// Release the lease if `holder` owns it.
    async fn release(&self, name: &str, holder: &str) -> ApiResult<()>;
}

#[derive(Debug)]
struct Held {
    holder: String,
    expires_at: Instant,
}

/// Process-local lease table.
#[derive(Debug, Default)]
pub struct InMemoryLease {
    leases: Mutex<HashMap<String, Held>>,
}

impl InMemoryLease {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current holder of a lease, if unexpired.
    pub async fn holder(&self, name: &str) -> Option<String> {
        let leases = self.leases.lock().await;
        leases
            .get(name)
            .filter(|held| held.expires_at > Instant::now())
            .map(|held| held.holder.clone())
    }
}

#[async_trait]
impl SweepLease for InMemoryLease {
    async fn try_acquire(&self, name: &str, holder: &str, ttl: Duration) -> ApiResult<bool> {
        let mut leases = self.leases.lock().await;
        let now = Instant::now();

        if let Some(held) = leases.get(name) {
            if held.expires_at > now && held.holder != holder {
                return Ok(false);
            }
        }

        leases.insert(
            name.to_string(),
            Held {
                holder: holder.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn release(&self, name: &str, holder: &str) -> ApiResult<()> {
        let mut leases = self.leases.lock().await;
        if leases.get(name).is_some_and(|held| held.holder == holder) {
            leases.remove(name);
        }
        Ok(())
    }
}
