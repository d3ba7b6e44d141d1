//! Reaper background worker.
//!
//! Runs a node reaper sweep on a fixed interval, each within a wall-clock
//! budget.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, instrument, warn};

use crate::reaper::{NodeReaper, SweepReport};

/// Reaper worker configuration.
#[derive(Debug, Clone, Copy)]
pub struct ReaperWorkerConfig {
    /// Time between sweeps.
    pub interval: Duration,
    /// Wall-clock budget for one sweep.
    pub budget: Duration,
}

impl Default for ReaperWorkerConfig {
    fn default() -> Self {
        Self {
            interval: tidepool_reconcile::DEFAULT_SWEEP_INTERVAL,
            budget: tidepool_reconcile::DEFAULT_SWEEP_BUDGET,
        }
    }
}

/// Reaper worker that runs the scale-down path.
pub struct ReaperWorker {
    reaper: Arc<NodeReaper>,
    config: ReaperWorkerConfig,
}

impl ReaperWorker {
    pub fn new(reaper: Arc<NodeReaper>, config: ReaperWorkerConfig) -> Self {
        Self { reaper, config }
    }

    /// Run the reaper worker until shutdown is signaled.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            budget_secs = self.config.budget.as_secs(),
            "Starting reaper worker"
        );

        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.run_sweep().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Reaper worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Run a single budgeted sweep.
    pub async fn run_sweep(&self) -> Option<SweepReport> {
        match tokio::time::timeout(self.config.budget, self.reaper.sweep()).await {
            Ok(Ok(report)) => {
                if report.has_activity() {
                    info!(
                        sweep_id = %report.sweep_id,
                        drained = report.drained.len(),
                        terminated = report.terminated.len(),
                        reclaimed = report.reclaimed.len(),
                        failures = report.failures.len(),
                        "Reaper sweep changed the cluster"
                    );
                }
                Some(report)
            }
            Ok(Err(e)) => {
                error!(error = %e, "Reaper sweep failed");
                None
            }
            Err(_) => {
                warn!(
                    budget_secs = self.config.budget.as_secs(),
                    "Reaper sweep exceeded its budget; next sweep will resume"
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tidepool_reconcile::SweepPolicy;

    use crate::cluster::ClusterStateView;
    use crate::sim::SimulatedCluster;

    fn worker(sim: &Arc<SimulatedCluster>, interval: Duration) -> ReaperWorker {
        let view = ClusterStateView::new(sim.clone(), sim.clone(), Duration::from_secs(5));
        let policy =
            SweepPolicy::new(Duration::from_secs(600), Duration::from_secs(600), None).unwrap();
        let reaper = NodeReaper::new(sim.clone(), sim.clone(), view, policy);
        ReaperWorker::new(
            Arc::new(reaper),
            ReaperWorkerConfig {
                interval,
                budget: Duration::from_secs(30),
            },
        )
    }

    #[tokio::test]
    async fn test_single_sweep_reports() {
        let sim = Arc::new(SimulatedCluster::new("batch"));
        sim.add_registered_node(4096).await;

        let report = worker(&sim, Duration::from_secs(180)).run_sweep().await.unwrap();
        assert_eq!(report.nodes_observed, 1);
    }

    #[tokio::test]
    async fn test_failed_sweep_is_not_fatal() {
        let sim = Arc::new(SimulatedCluster::new("batch"));
        sim.fail_list_nodes(true).await;

        assert!(worker(&sim, Duration::from_secs(180)).run_sweep().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_sweeps_until_shutdown() {
        let sim = Arc::new(SimulatedCluster::new("batch"));
        let worker = Arc::new(worker(&sim, Duration::from_secs(180)));
        let (tx, rx) = watch::channel(false);

        let handle = {
            let worker = worker.clone();
            tokio::spawn(async move { worker.run(rx).await })
        };
        tokio::time::sleep(Duration::from_secs(400)).await;
        tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
