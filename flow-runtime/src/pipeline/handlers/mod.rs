//! One handler per inbound event kind.
//!
//! Handlers are pure with respect to the outside world: they inspect and
//! mutate the working checkpoint in a [`FlowEventContext`], may queue
//! outbound records, and decide whether the fiber should run. They never
//! publish anything themselves.

mod confirmation;
mod failure;
mod session;
mod start;
mod wakeup;

pub use confirmation::{ConfirmationEvent, ConfirmationHandler};
pub use failure::{FailureEvent, FailureHandler};
pub use session::SessionEventHandler;
pub use start::StartFlowHandler;
pub use wakeup::{WakeupEvent, WakeupHandler};

use crate::pipeline::context::FlowEventContext;
use bytes::Bytes;
use flow_core::{Resumed, WaitingFor};

/// What the dispatcher should do with the fiber after pre-processing.
#[derive(Debug, Clone, PartialEq)]
pub enum RunDecision {
    /// Create the fiber and start it with `args`.
    Start { args: Bytes },
    /// Restore the fiber and resume it.
    Resume(Resumed),
    /// Commit the checkpoint changes without running the fiber.
    Skip,
}

/// The event does not apply to the flow in its current state.
///
/// Rejected events are discarded without any state change.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct Rejection(String);

impl Rejection {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }

    pub fn reason(&self) -> &str {
        &self.0
    }
}

pub trait FlowEventHandler<T> {
    /// Used in log lines and rejection messages.
    fn name(&self) -> &'static str;

    /// Whether this handler may be applied to a flow in `waiting_for`;
    /// `None` means the flow has no checkpoint yet.
    fn accepts(&self, waiting_for: Option<&WaitingFor>) -> bool;

    /// Apply the event to the working checkpoint.
    ///
    /// # Errors
    ///
    /// Returns a [`Rejection`] if the event is stale, duplicated or addressed
    /// to something the flow does not have.
    fn pre_process(&self, ctx: &mut FlowEventContext<T>) -> Result<RunDecision, Rejection>;
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::config::FlowConfig;
    use crate::pipeline::context::FlowEventContext;
    use chrono::{DateTime, Utc};
    use flow_core::{Checkpoint, CheckpointStatus, FlowId, HoldingIdentity, WaitingFor};
    use std::sync::Arc;

    pub fn suspended(waiting_for: WaitingFor) -> Checkpoint {
        let mut cp = Checkpoint::new(
            FlowId::new(),
            HoldingIdentity::new("O=Alice", "g1"),
            "test-flow",
            Utc::now(),
        );
        cp.add_session("s1".into(), HoldingIdentity::new("O=Bob", "g1"));
        cp.serialized_continuation = Some(b"continuation".to_vec());
        cp.set_status(CheckpointStatus::Running).unwrap();
        cp.set_status(CheckpointStatus::Suspended).unwrap();
        cp.waiting_for = waiting_for;
        cp.version = 1;
        cp
    }

    pub fn context<T>(payload: T, checkpoint: Option<Checkpoint>, now: DateTime<Utc>) -> FlowEventContext<T> {
        let flow_id = checkpoint.as_ref().map_or_else(FlowId::new, |cp| cp.flow_id);
        FlowEventContext::new(flow_id, payload, checkpoint, Arc::new(FlowConfig::default()), now)
    }
}
