//! Operator-visible outcome records.
//!
//! Outcomes go to the structured log stream under the `tidepool::outcome`
//! target, one JSON envelope per record.

use serde::Serialize;
use tidepool_events::{Component, OutcomeEvent};
use tidepool_id::{MessageId, SweepId};
use tracing::{info, warn};

/// Log target carrying outcome records.
pub const OUTCOME_TARGET: &str = "tidepool::outcome";

/// Correlation for an outcome record.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Correlation<'a> {
    pub message_id: Option<&'a MessageId>,
    pub sweep_id: Option<SweepId>,
}

impl<'a> Correlation<'a> {
    pub fn message(message_id: &'a MessageId) -> Self {
        Self {
            message_id: Some(message_id),
            sweep_id: None,
        }
    }

    pub fn sweep(sweep_id: SweepId) -> Self {
        Self {
            message_id: None,
            sweep_id: Some(sweep_id),
        }
    }
}

/// Emit one outcome record.
pub(crate) fn emit<P: Serialize>(
    event_type: &'static str,
    component: Component,
    correlation: Correlation<'_>,
    payload: P,
) {
    let mut builder = OutcomeEvent::builder()
        .event_type(event_type)
        .component(component)
        .payload(payload);
    if let Some(message_id) = correlation.message_id {
        builder = builder.message_id(message_id.clone());
    }
    if let Some(sweep_id) = correlation.sweep_id {
        builder = builder.sweep_id(sweep_id);
    }

    match builder.build().and_then(|event| event.to_json_line()) {
        Ok(line) => info!(target: OUTCOME_TARGET, event_type, outcome = %line),
        Err(e) => warn!(event_type, error = %e, "Failed to encode outcome record"),
    }
}
