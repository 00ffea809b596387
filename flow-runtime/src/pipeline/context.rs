use crate::config::FlowConfig;
use crate::pipeline::handlers::Rejection;
use chrono::{DateTime, Utc};
use flow_core::{Checkpoint, FlowId, OutboundRecord};
use std::sync::Arc;

/// Everything a handler sees while processing one event of payload type `T`.
///
/// Created per event and dropped once the dispatcher has committed or
/// discarded its effects. Records pushed here are published only after the
/// checkpoint commit succeeds.
#[derive(Debug)]
pub struct FlowEventContext<T> {
    pub flow_id: FlowId,
    pub payload: T,
    /// Working copy; `None` until a start event creates it.
    pub checkpoint: Option<Checkpoint>,
    pub output_records: Vec<OutboundRecord>,
    pub config: Arc<FlowConfig>,
    pub now: DateTime<Utc>,
}

impl<T> FlowEventContext<T> {
    pub fn new(
        flow_id: FlowId,
        payload: T,
        checkpoint: Option<Checkpoint>,
        config: Arc<FlowConfig>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            flow_id,
            payload,
            checkpoint,
            output_records: Vec::new(),
            config,
            now,
        }
    }

    /// # Errors
    ///
    /// Rejects the event if the flow has no checkpoint.
    pub fn checkpoint_mut(&mut self) -> Result<&mut Checkpoint, Rejection> {
        self.checkpoint
            .as_mut()
            .ok_or_else(|| Rejection::new("flow has no checkpoint"))
    }

    pub fn emit(&mut self, record: OutboundRecord) {
        self.output_records.push(record);
    }

    pub fn into_parts(self) -> (Option<Checkpoint>, Vec<OutboundRecord>) {
        (self.checkpoint, self.output_records)
    }
}
