//! Dispatch worker: long-polls the task queue and dispatches deliveries.

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{self, StreamExt};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, instrument, warn};

use crate::dispatcher::TaskDispatcher;
use crate::error::{bounded, ControllerResult};
use crate::queue::{Delivery, TaskQueue};

/// Dispatch worker configuration.
#[derive(Debug, Clone, Copy)]
pub struct DispatchWorkerConfig {
    /// Deliveries dispatched at once.
    pub concurrency: usize,
    /// Messages requested per receive.
    pub receive_batch: usize,
    /// Long-poll wait per receive.
    pub receive_wait: Duration,
    /// Pause after a failed receive.
    pub error_backoff: Duration,
}

impl Default for DispatchWorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            receive_batch: 10,
            receive_wait: Duration::from_secs(20),
            error_backoff: Duration::from_secs(1),
        }
    }
}

/// Counters for one batch of deliveries.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchStats {
    pub received: usize,
    pub started: usize,
    pub capacity_shortfalls: usize,
    pub other_failures: usize,
}

/// Dispatch worker that runs the scale-up path.
pub struct DispatchWorker {
    dispatcher: TaskDispatcher,
    queue: Arc<dyn TaskQueue>,
    config: DispatchWorkerConfig,
    call_timeout: Duration,
}

impl DispatchWorker {
    pub fn new(
        dispatcher: TaskDispatcher,
        queue: Arc<dyn TaskQueue>,
        config: DispatchWorkerConfig,
        call_timeout: Duration,
    ) -> Self {
        Self {
            dispatcher,
            queue,
            config,
            call_timeout,
        }
    }

    /// Run the dispatch worker until shutdown is signaled.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            concurrency = self.config.concurrency,
            receive_batch = self.config.receive_batch,
            "Starting dispatch worker"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            // Only the long poll is abandoned on shutdown; dispatches run to completion.
            let received = tokio::select! {
                received = self.receive() => received,
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            };

            match received {
                Ok(deliveries) => {
                    let stats = self.process(deliveries).await;
                    if stats.received > 0 {
                        info!(
                            received = stats.received,
                            started = stats.started,
                            capacity_shortfalls = stats.capacity_shortfalls,
                            other_failures = stats.other_failures,
                            "Dispatched batch"
                        );
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Failed to receive from task queue");
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.error_backoff) => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        }

        info!("Dispatch worker shutting down");
    }

    /// Receive one batch and dispatch it.
    pub async fn run_once(&self) -> ControllerResult<DispatchStats> {
        let deliveries = self.receive().await?;
        Ok(self.process(deliveries).await)
    }

    async fn receive(&self) -> ControllerResult<Vec<Delivery>> {
        bounded(
            "receive",
            self.config.receive_wait + self.call_timeout,
            self.queue
                .receive(self.config.receive_batch, self.config.receive_wait),
        )
        .await
    }

    async fn process(&self, deliveries: Vec<Delivery>) -> DispatchStats {
        let stats = Mutex::new(DispatchStats {
            received: deliveries.len(),
            ..DispatchStats::default()
        });

        stream::iter(deliveries)
            .for_each_concurrent(self.config.concurrency.max(1), |delivery| {
                let stats = &stats;
                async move {
                    let outcome = self
                        .dispatcher
                        .handle_delivery(self.queue.as_ref(), &delivery)
                        .await;
                    debug!(
                        message_id = %delivery.message_id,
                        status = outcome.status(),
                        "Delivery handled"
                    );

                    let mut stats = stats.lock().await;
                    if outcome.is_started() {
                        stats.started += 1;
                    } else if outcome.is_capacity_shortfall() {
                        stats.capacity_shortfalls += 1;
                    } else {
                        stats.other_failures += 1;
                    }
                }
            })
            .await;

        stats.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::capacity::CapacityController;
    use crate::cluster::ClusterStateView;
    use crate::sim::{InMemoryTaskQueue, QueueSettings, SimulatedCluster};

    fn worker(sim: &Arc<SimulatedCluster>, queue: &Arc<InMemoryTaskQueue>) -> DispatchWorker {
        worker_with_wait(sim, queue, Duration::ZERO)
    }

    fn worker_with_wait(
        sim: &Arc<SimulatedCluster>,
        queue: &Arc<InMemoryTaskQueue>,
        receive_wait: Duration,
    ) -> DispatchWorker {
        let timeout = Duration::from_secs(5);
        let view = ClusterStateView::new(sim.clone(), sim.clone(), timeout);
        let capacity = CapacityController::new(view, sim.clone());
        let dispatcher = TaskDispatcher::new(sim.clone(), capacity, "batch", timeout);
        DispatchWorker::new(
            dispatcher,
            queue.clone(),
            DispatchWorkerConfig {
                receive_wait,
                ..DispatchWorkerConfig::default()
            },
            timeout,
        )
    }

    fn body(n: usize) -> String {
        format!(r#"{{"jobName":"job-{n}","taskDefinitionRef":"td:1"}}"#)
    }

    #[tokio::test]
    async fn test_batch_dispatch_counts_outcomes() {
        let sim = Arc::new(SimulatedCluster::new("batch"));
        sim.add_registered_node(1024).await;
        let queue = Arc::new(InMemoryTaskQueue::new(QueueSettings::default()));
        for n in 0..3 {
            queue.send(body(n)).await.unwrap();
        }
        queue.send("garbage".to_string()).await.unwrap();

        let stats = worker(&sim, &queue).run_once().await.unwrap();

        assert_eq!(stats.received, 4);
        assert_eq!(stats.started, 2);
        assert_eq!(stats.capacity_shortfalls, 1);
        assert_eq!(stats.other_failures, 1);
        assert_eq!(queue.depth().await, 2);
    }

    #[tokio::test]
    async fn test_concurrent_shortfalls_request_one_node() {
        let sim = Arc::new(SimulatedCluster::new("batch"));
        let queue = Arc::new(InMemoryTaskQueue::new(QueueSettings::default()));
        for n in 0..8 {
            queue.send(body(n)).await.unwrap();
        }

        let stats = worker(&sim, &queue).run_once().await.unwrap();

        assert_eq!(stats.capacity_shortfalls, 8);
        assert_eq!(sim.desired_capacity().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_shutdown() {
        let sim = Arc::new(SimulatedCluster::new("batch"));
        let queue = Arc::new(InMemoryTaskQueue::new(QueueSettings::default()));
        let worker = Arc::new(worker_with_wait(&sim, &queue, Duration::from_secs(20)));
        let (tx, rx) = watch::channel(false);

        let handle = {
            let worker = worker.clone();
            tokio::spawn(async move { worker.run(rx).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
