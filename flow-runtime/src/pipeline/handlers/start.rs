use super::{FlowEventHandler, Rejection, RunDecision};
use crate::pipeline::context::FlowEventContext;
use flow_core::events::StartFlowRequest;
use flow_core::{Checkpoint, WaitingFor};

/// Creates the checkpoint of a new flow and starts it.
pub struct StartFlowHandler;

impl FlowEventHandler<StartFlowRequest> for StartFlowHandler {
    fn name(&self) -> &'static str {
        "start flow"
    }

    fn accepts(&self, waiting_for: Option<&WaitingFor>) -> bool {
        waiting_for.is_none()
    }

    fn pre_process(
        &self,
        ctx: &mut FlowEventContext<StartFlowRequest>,
    ) -> Result<RunDecision, Rejection> {
        if ctx.checkpoint.is_some() {
            return Err(Rejection::new("flow already started"));
        }
        let request = &ctx.payload;
        if request.flow_name.is_empty() {
            return Err(Rejection::new("start request names no flow"));
        }

        let mut checkpoint = Checkpoint::new(
            ctx.flow_id,
            request.owner.clone(),
            request.flow_name.clone(),
            ctx.now,
        );
        checkpoint.start_args = Some(request.args.to_vec());
        if let Some(initiator) = &request.initiated_by {
            checkpoint.add_session(initiator.session_id.clone(), initiator.counterparty.clone());
            checkpoint.initiated_by = Some(initiator.session_id.clone());
        }
        tracing::debug!(
            flow_id = %ctx.flow_id,
            flow = %request.flow_name,
            owner = %request.owner,
            "created checkpoint for new flow"
        );

        let args = request.args.clone();
        ctx.checkpoint = Some(checkpoint);
        Ok(RunDecision::Start { args })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::handlers::test_support::{context, suspended};
    use bytes::Bytes;
    use chrono::Utc;
    use flow_core::events::InitiatingSession;
    use flow_core::{CheckpointStatus, HoldingIdentity, SessionId};

    fn request(initiated_by: Option<InitiatingSession>) -> StartFlowRequest {
        StartFlowRequest {
            flow_name: "pong".into(),
            owner: HoldingIdentity::new("O=Bob", "g1"),
            args: Bytes::from_static(b"null"),
            initiated_by,
        }
    }

    #[test]
    fn test_only_accepts_missing_checkpoint() {
        let handler = StartFlowHandler;
        assert!(handler.accepts(None));
        assert!(!handler.accepts(Some(&WaitingFor::Start)));
        assert!(!handler.accepts(Some(&WaitingFor::Nothing)));
    }

    #[test]
    fn test_creates_checkpoint_and_starts() {
        let mut ctx = context(request(None), None, Utc::now());
        let decision = StartFlowHandler.pre_process(&mut ctx).unwrap();
        assert_eq!(
            decision,
            RunDecision::Start {
                args: Bytes::from_static(b"null")
            }
        );
        let cp = ctx.checkpoint.unwrap();
        assert_eq!(cp.status, CheckpointStatus::Created);
        assert_eq!(cp.waiting_for, WaitingFor::Start);
        assert_eq!(cp.version, 0);
        assert_eq!(cp.start_args.as_deref(), Some(&b"null"[..]));
        assert!(ctx.output_records.is_empty());
    }

    #[test]
    fn test_responder_gets_initiating_session() {
        let initiator = InitiatingSession {
            session_id: "s9".into(),
            counterparty: HoldingIdentity::new("O=Alice", "g1"),
        };
        let mut ctx = context(request(Some(initiator)), None, Utc::now());
        StartFlowHandler.pre_process(&mut ctx).unwrap();
        let cp = ctx.checkpoint.unwrap();
        assert_eq!(cp.initiated_by, Some("s9".into()));
        assert!(cp.sessions[&SessionId::from("s9")].is_open());
    }

    #[test]
    fn test_existing_flow_rejected() {
        let existing = suspended(WaitingFor::Nothing);
        let mut ctx = context(request(None), Some(existing), Utc::now());
        assert!(StartFlowHandler.pre_process(&mut ctx).is_err());
    }
}
