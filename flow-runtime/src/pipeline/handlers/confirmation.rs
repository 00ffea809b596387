use super::{FlowEventHandler, Rejection, RunDecision};
use crate::pipeline::context::FlowEventContext;
use flow_core::{Resumed, WaitingFor};

/// `count` external confirmations arrived for the flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfirmationEvent {
    pub count: u32,
}

pub struct ConfirmationHandler;

impl FlowEventHandler<ConfirmationEvent> for ConfirmationHandler {
    fn name(&self) -> &'static str {
        "confirmation"
    }

    fn accepts(&self, waiting_for: Option<&WaitingFor>) -> bool {
        matches!(waiting_for, Some(WaitingFor::Confirmations { .. }))
    }

    fn pre_process(
        &self,
        ctx: &mut FlowEventContext<ConfirmationEvent>,
    ) -> Result<RunDecision, Rejection> {
        let count = ctx.payload.count;
        if count == 0 {
            return Err(Rejection::new("empty confirmation"));
        }
        let checkpoint = ctx.checkpoint_mut()?;
        let WaitingFor::Confirmations { required, received } = &mut checkpoint.waiting_for else {
            return Err(Rejection::new("flow is not waiting for confirmations"));
        };
        *received = received.saturating_add(count);
        if *received >= *required {
            Ok(RunDecision::Resume(Resumed::Confirmed {
                confirmations: *received,
            }))
        } else {
            Ok(RunDecision::Skip)
        }
    }
}
