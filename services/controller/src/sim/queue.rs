//! In-memory task queue with a dead-letter store.
//!
//! Mirrors the redrive behaviour of a hosted queue:
//! - a received message is invisible until its visibility timeout elapses
//! - every receive increments the receive count and issues a fresh receipt
//! - a receive that would push the count past the maximum moves the message
//!   to the dead-letter store instead of delivering it
//!
//! Dead letters stay until retention prunes them or an operator redrives them.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tidepool_events::{event_types, Component, TaskDeadLetteredPayload};
use tidepool_id::{MessageId, ReceiptHandle};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::error::{ApiError, ApiResult};
use crate::outcome::{emit, Correlation};
use crate::queue::{DeadLetter, DeadLetterStore, Delivery, TaskQueue};

/// Queue redrive settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSettings {
    pub visibility_timeout: Duration,
    pub max_receive_count: u32,
    pub dead_letter_retention: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(60),
            max_receive_count: 20,
            dead_letter_retention: Duration::from_secs(14 * 24 * 60 * 60),
        }
    }
}

#[derive(Debug)]
struct Message {
    id: MessageId,
    body: String,
    receive_count: u32,
    visible_at: Instant,
    receipt: Option<ReceiptHandle>,
}

#[derive(Debug)]
struct StoredDeadLetter {
    letter: DeadLetter,
    moved_at: Instant,
}

#[derive(Debug, Default)]
struct QueueState {
    messages: VecDeque<Message>,
    dead_letters: Vec<StoredDeadLetter>,
}

/// Process-local [`TaskQueue`].
#[derive(Debug)]
pub struct InMemoryTaskQueue {
    settings: QueueSettings,
    state: Mutex<QueueState>,
    arrivals: Notify,
}

impl InMemoryTaskQueue {
    pub fn new(settings: QueueSettings) -> Self {
        Self {
            settings,
            state: Mutex::new(QueueState::default()),
            arrivals: Notify::new(),
        }
    }

    pub fn settings(&self) -> QueueSettings {
        self.settings
    }

    /// Messages in the queue, visible or in flight.
    pub async fn depth(&self) -> usize {
        self.state.lock().await.messages.len()
    }

    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state
            .lock()
            .await
            .dead_letters
            .iter()
            .map(|stored| stored.letter.clone())
            .collect()
    }

    /// Drop dead letters older than the retention period.
    pub async fn prune_dead_letters(&self) -> usize {
        let mut state = self.state.lock().await;
        let retention = self.settings.dead_letter_retention;
        let before = state.dead_letters.len();
        state
            .dead_letters
            .retain(|stored| stored.moved_at.elapsed() <= retention);

        let pruned = before - state.dead_letters.len();
        if pruned > 0 {
            info!(pruned, "Pruned expired dead letters");
        }
        pruned
    }

    /// Move a dead letter back to the main queue with a fresh receive count.
    pub async fn redrive(&self, message_id: &MessageId) -> ApiResult<()> {
        let mut state = self.state.lock().await;
        let position = state
            .dead_letters
            .iter()
            .position(|stored| &stored.letter.message_id == message_id)
            .ok_or_else(|| ApiError::NotFound(format!("dead letter {message_id}")))?;

        let dead = state.dead_letters.remove(position).letter;
        let previous_receive_count = dead.receive_count;
        state.messages.push_back(Message {
            id: dead.message_id,
            body: dead.body,
            receive_count: 0,
            visible_at: Instant::now(),
            receipt: None,
        });
        drop(state);

        info!(message_id = %message_id, "Redrove dead letter");
        emit(
            event_types::TASK_REDRIVEN,
            Component::Queue,
            Correlation::message(message_id),
            serde_json::json!({ "previous_receive_count": previous_receive_count }),
        );
        self.arrivals.notify_waiters();
        Ok(())
    }

    /// Take up to `max` visible messages, dead-lettering exhausted ones.
    async fn take_visible(&self, max: usize) -> (Vec<Delivery>, Option<Instant>) {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let mut deliveries = Vec::new();
        let mut exhausted = Vec::new();
        let mut next_visible: Option<Instant> = None;

        for (index, message) in state.messages.iter_mut().enumerate() {
            if message.visible_at > now {
                let at = message.visible_at;
                next_visible = Some(next_visible.map_or(at, |t: Instant| t.min(at)));
                continue;
            }
            if deliveries.len() >= max {
                break;
            }

            message.receive_count += 1;
            if message.receive_count > self.settings.max_receive_count {
                exhausted.push(index);
                continue;
            }

            let receipt = ReceiptHandle::generate("rcpt");
            message.visible_at = now + self.settings.visibility_timeout;
            message.receipt = Some(receipt.clone());
            deliveries.push(Delivery {
                message_id: message.id.clone(),
                receipt,
                body: message.body.clone(),
                receive_count: message.receive_count,
            });
        }

        for index in exhausted.into_iter().rev() {
            let Some(message) = state.messages.remove(index) else {
                continue;
            };
            let receive_count = message.receive_count - 1;
            error!(
                message_id = %message.id,
                receive_count,
                max_receive_count = self.settings.max_receive_count,
                "Message exhausted its receive budget; moved to dead-letter store"
            );
            emit(
                event_types::TASK_DEAD_LETTERED,
                Component::Queue,
                Correlation::message(&message.id),
                TaskDeadLetteredPayload {
                    receive_count,
                    max_receive_count: self.settings.max_receive_count,
                },
            );
            state.dead_letters.push(StoredDeadLetter {
                letter: DeadLetter {
                    message_id: message.id,
                    body: message.body,
                    receive_count,
                    dead_lettered_at: Utc::now(),
                },
                moved_at: now,
            });
        }

        (deliveries, next_visible)
    }
}

#[async_trait]
impl TaskQueue for InMemoryTaskQueue {
    async fn receive(&self, max: usize, wait: Duration) -> ApiResult<Vec<Delivery>> {
        let deadline = Instant::now() + wait;

        loop {
            let notified = self.arrivals.notified();
            let (deliveries, next_visible) = self.take_visible(max).await;
            if !deliveries.is_empty() || Instant::now() >= deadline {
                return Ok(deliveries);
            }

            let wake_at = next_visible.map_or(deadline, |t| t.min(deadline));
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn ack(&self, receipt: &ReceiptHandle) -> ApiResult<()> {
        let mut state = self.state.lock().await;
        let position = state
            .messages
            .iter()
            .position(|m| m.receipt.as_ref() == Some(receipt))
            .ok_or_else(|| ApiError::NotFound(format!("receipt {receipt} is not current")))?;

        if let Some(message) = state.messages.remove(position) {
            debug!(message_id = %message.id, "Acknowledged message");
        }
        Ok(())
    }

    async fn send(&self, body: String) -> ApiResult<MessageId> {
        let id = MessageId::generate("msg");
        self.state.lock().await.messages.push_back(Message {
            id: id.clone(),
            body,
            receive_count: 0,
            visible_at: Instant::now(),
            receipt: None,
        });
        self.arrivals.notify_waiters();
        Ok(id)
    }

    fn max_receive_count(&self) -> u32 {
        self.settings.max_receive_count
    }
}

#[async_trait]
impl DeadLetterStore for InMemoryTaskQueue {
    async fn list_dead_letters(&self) -> ApiResult<Vec<DeadLetter>> {
        Ok(self.dead_letters().await)
    }

    async fn redrive_dead_letter(&self, message_id: &MessageId) -> ApiResult<()> {
        self.redrive(message_id).await
    }
}
