use super::{FlowEventHandler, Rejection, RunDecision};
use crate::pipeline::context::FlowEventContext;
use crate::pipeline::outcome::fail_checkpoint;
use flow_core::{WaitingFor, checkpoint::WaitingKind};

/// An external party asked for the flow to be failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureEvent {
    pub reason: String,
}

/// Fails a live flow without running it.
pub struct FailureHandler;

impl FlowEventHandler<FailureEvent> for FailureHandler {
    fn name(&self) -> &'static str {
        "failure"
    }

    fn accepts(&self, waiting_for: Option<&WaitingFor>) -> bool {
        waiting_for.is_some_and(|w| w.kind() != WaitingKind::Nothing)
    }

    fn pre_process(&self, ctx: &mut FlowEventContext<FailureEvent>) -> Result<RunDecision, Rejection> {
        let FlowEventContext {
            payload,
            checkpoint,
            output_records,
            config,
            now,
            ..
        } = ctx;
        let checkpoint = checkpoint
            .as_mut()
            .ok_or_else(|| Rejection::new("flow has no checkpoint"))?;
        fail_checkpoint(checkpoint, output_records, &payload.reason, config, *now)
            .map_err(|err| Rejection::new(err.to_string()))?;
        Ok(RunDecision::Skip)
    }
}
