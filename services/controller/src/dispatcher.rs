//! Task dispatcher: the scale-up path.
//!
//! Each attempt either starts the task or leaves the message for the queue to
//! redeliver. The queue's visibility timeout is the retry backoff and its
//! dead-letter store is the circuit breaker; the dispatcher keeps no state of
//! its own between attempts.

use std::sync::Arc;
use std::time::Duration;

use tidepool_events::{
    event_types, Component, RetryReason, TaskOutcome, TaskRetryingPayload, TaskStartedPayload,
};
use tracing::{error, info, instrument, warn};

use crate::capacity::CapacityController;
use crate::cluster::ClusterApi;
use crate::error::{bounded, ControllerError};
use crate::model::{RunTaskRequest, TaskRequest};
use crate::outcome::{emit, Correlation};
use crate::queue::{Delivery, TaskQueue};

/// Places queued tasks on the cluster.
#[derive(Clone)]
pub struct TaskDispatcher {
    cluster: Arc<dyn ClusterApi>,
    capacity: CapacityController,
    cluster_name: String,
    call_timeout: Duration,
}

impl TaskDispatcher {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        capacity: CapacityController,
        cluster_name: impl Into<String>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            cluster,
            capacity,
            cluster_name: cluster_name.into(),
            call_timeout,
        }
    }

    /// Attempt to place one task.
    ///
    /// A capacity shortfall (an explicit no-capacity error, or a non-empty
    /// placement failure list) triggers a scale-up request. Every failure
    /// comes back as `Retrying`; acknowledging is the caller's job.
    pub async fn dispatch(&self, task: &TaskRequest) -> TaskOutcome {
        let request = RunTaskRequest::for_task(self.cluster_name.clone(), task);

        match bounded("run_task", self.call_timeout, self.cluster.run_task(request)).await {
            Ok(output) => {
                if let Some(started) = output.tasks.first() {
                    return TaskOutcome::Started {
                        task_id: started.task_id.clone(),
                        node_id: Some(started.node_id.clone()),
                    };
                }
                if !output.failures.is_empty() {
                    return self.capacity_shortfall(task, output.failure_summary()).await;
                }
                warn!("Orchestrator returned neither tasks nor failures");
                TaskOutcome::Retrying {
                    reason: RetryReason::PlacementFailed,
                    detail: "empty run-task response".to_string(),
                }
            }
            Err(e) if e.is_no_capacity() => self.capacity_shortfall(task, e.to_string()).await,
            Err(e) => {
                warn!(error = %e, "Task placement failed");
                TaskOutcome::Retrying {
                    reason: RetryReason::PlacementFailed,
                    detail: e.to_string(),
                }
            }
        }
    }

    async fn capacity_shortfall(&self, task: &TaskRequest, detail: String) -> TaskOutcome {
        info!(detail = %detail, "Cluster lacks capacity for task");

        match self.capacity.request_scale_up(task).await {
            Ok(decision) => info!(?decision, "Capacity decision"),
            Err(ControllerError::AtMaxCapacity { max_size }) => {
                warn!(max_size, "Cannot grow node pool; task waits for free capacity")
            }
            Err(e) => warn!(error = %e, "Scale-up request failed"),
        }

        TaskOutcome::Retrying {
            reason: RetryReason::CapacityShortfall,
            detail,
        }
    }

    /// Dispatch one queue delivery and acknowledge it if the task started.
    ///
    /// Anything else leaves the message in flight; it becomes visible again
    /// after the visibility timeout.
    #[instrument(
        skip(self, queue, delivery),
        fields(message_id = %delivery.message_id, receive_count = delivery.receive_count)
    )]
    pub async fn handle_delivery(&self, queue: &dyn TaskQueue, delivery: &Delivery) -> TaskOutcome {
        let max_receive_count = queue.max_receive_count();
        let correlation = Correlation::message(&delivery.message_id);

        let task = match TaskRequest::from_message_body(&delivery.body) {
            Ok(task) => task,
            Err(e) => {
                let outcome = TaskOutcome::Retrying {
                    reason: RetryReason::PlacementFailed,
                    detail: e.to_string(),
                };
                self.report_retry(delivery, max_receive_count, &outcome, correlation);
                return outcome;
            }
        };

        let outcome = self.dispatch(&task).await;

        match &outcome {
            TaskOutcome::Started { task_id, node_id } => {
                info!(task_id = %task_id, job_name = %task.job_name, "Task started");
                emit(
                    event_types::TASK_STARTED,
                    Component::Dispatcher,
                    correlation,
                    TaskStartedPayload {
                        task_id: task_id.clone(),
                        node_id: node_id.clone(),
                        started_by: task.started_by(),
                        receive_count: delivery.receive_count,
                    },
                );

                // An ack failure means a duplicate start on redelivery, which tasks tolerate.
                if let Err(e) =
                    bounded("ack", self.call_timeout, queue.ack(&delivery.receipt)).await
                {
                    warn!(error = %e, "Failed to acknowledge started task");
                }
            }
            TaskOutcome::Retrying { .. } => {
                self.report_retry(delivery, max_receive_count, &outcome, correlation)
            }
            TaskOutcome::DeadLettered => {}
        }

        outcome
    }

    fn report_retry(
        &self,
        delivery: &Delivery,
        max_receive_count: u32,
        outcome: &TaskOutcome,
        correlation: Correlation<'_>,
    ) {
        let TaskOutcome::Retrying { reason, detail } = outcome else {
            return;
        };

        if delivery.receive_count >= max_receive_count {
            error!(
                reason = %reason,
                detail = %detail,
                max_receive_count,
                "Final attempt failed; message will be dead-lettered"
            );
        } else if *reason == RetryReason::PlacementFailed {
            warn!(reason = %reason, detail = %detail, "Task will be retried");
        } else {
            info!(reason = %reason, detail = %detail, "Task will be retried");
        }

        emit(
            event_types::TASK_RETRYING,
            Component::Dispatcher,
            correlation,
            TaskRetryingPayload {
                reason: *reason,
                detail: detail.clone(),
                receive_count: delivery.receive_count,
                max_receive_count,
            },
        );
    }
}
