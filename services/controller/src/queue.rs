//! Task queue interface.
//!
//! The queue delivers at least once. A delivery that is not acknowledged
//! becomes visible again after the visibility timeout; once its receive count
//! exceeds the configured maximum the queue moves it to a dead-letter store.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tidepool_events::TaskOutcome;
use tidepool_id::{MessageId, ReceiptHandle};

use crate::error::ApiResult;

/// One received message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub message_id: MessageId,
    /// Handle for acknowledging this particular receive.
    pub receipt: ReceiptHandle,
    pub body: String,
    /// How many times the message has been received, this receive included.
    pub receive_count: u32,
}

/// At-least-once task queue.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Receive up to `max` messages, waiting up to `wait` for the first one.
    async fn receive(&self, max: usize, wait: Duration) -> ApiResult<Vec<Delivery>>;

    /// Acknowledge (delete) a received message.
    async fn ack(&self, receipt: &ReceiptHandle) -> ApiResult<()>;

    /// Enqueue a new message.
    async fn send(&self, body: String) -> ApiResult<MessageId>;

    /// Maximum receive count before dead-lettering.
    fn max_receive_count(&self) -> u32;
}

/// A message that exhausted its receive budget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub message_id: MessageId,
    pub body: String,
    /// Receives the message got before it was moved.
    pub receive_count: u32,
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn outcome(&self) -> TaskOutcome {
        TaskOutcome::DeadLettered
    }
}

/// Operator access to the dead-letter store.
///
/// Nothing leaves the store on its own except through retention; a redrive is
/// always an explicit request.
#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    async fn list_dead_letters(&self) -> ApiResult<Vec<DeadLetter>>;

    /// Move a dead letter back to the main queue with a fresh receive count.
    async fn redrive_dead_letter(&self, message_id: &MessageId) -> ApiResult<()>;
}
