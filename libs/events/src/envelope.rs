//! Outcome event envelope - the common wrapper for all outcome records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tidepool_id::{MessageId, SweepId};

use crate::EventError;

/// The controller component that produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    #[default]
    Dispatcher,
    CapacityController,
    Reaper,
    Queue,
}

impl std::fmt::Display for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Component::Dispatcher => "dispatcher",
            Component::CapacityController => "capacity_controller",
            Component::Reaper => "reaper",
            Component::Queue => "queue",
        };
        write!(f, "{}", s)
    }
}

/// The outcome envelope - common metadata for all outcome records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutcomeEvent<P> {
    /// When the outcome was observed.
    pub occurred_at: DateTime<Utc>,

    /// The event type (e.g., "task.started", "node.drained").
    pub event_type: String,

    /// Schema version for this event type.
    pub event_version: i32,

    /// Component that produced the event.
    pub component: Component,

    /// Queue message the outcome belongs to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<MessageId>,

    /// Reaper sweep the outcome belongs to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sweep_id: Option<SweepId>,

    /// Event-specific payload.
    pub payload: P,
}

impl<P: Serialize> OutcomeEvent<P> {
    /// Creates a new outcome event builder.
    pub fn builder() -> OutcomeEventBuilder<P> {
        OutcomeEventBuilder::new()
    }

    /// Encode the event as a single JSON line.
    pub fn to_json_line(&self) -> Result<String, EventError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Builder for constructing outcome events.
#[derive(Debug)]
pub struct OutcomeEventBuilder<P> {
    occurred_at: Option<DateTime<Utc>>,
    event_type: Option<String>,
    event_version: i32,
    component: Component,
    message_id: Option<MessageId>,
    sweep_id: Option<SweepId>,
    payload: Option<P>,
}

impl<P> OutcomeEventBuilder<P> {
    pub fn new() -> Self {
        Self {
            occurred_at: None,
            event_type: None,
            event_version: 1,
            component: Component::default(),
            message_id: None,
            sweep_id: None,
            payload: None,
        }
    }

    pub fn occurred_at(mut self, ts: DateTime<Utc>) -> Self {
        self.occurred_at = Some(ts);
        self
    }

    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    pub fn event_version(mut self, version: i32) -> Self {
        self.event_version = version;
        self
    }

    pub fn component(mut self, component: Component) -> Self {
        self.component = component;
        self
    }

    pub fn message_id(mut self, id: MessageId) -> Self {
        self.message_id = Some(id);
        self
    }

    pub fn sweep_id(mut self, id: SweepId) -> Self {
        self.sweep_id = Some(id);
        self
    }

    pub fn payload(mut self, payload: P) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Builds the outcome event.
    pub fn build(self) -> Result<OutcomeEvent<P>, EventError> {
        Ok(OutcomeEvent {
            occurred_at: self.occurred_at.unwrap_or_else(Utc::now),
            event_type: self.event_type.ok_or(EventError::MissingField("event_type"))?,
            event_version: self.event_version,
            component: self.component,
            message_id: self.message_id,
            sweep_id: self.sweep_id,
            payload: self.payload.ok_or(EventError::MissingField("payload"))?,
        })
    }
}

impl<P> Default for OutcomeEventBuilder<P> {
    fn default() -> Self {
        Self::new()
    }
}
