use super::{FlowEventHandler, Rejection, RunDecision};
use crate::pipeline::context::FlowEventContext;
use flow_core::events::SessionEvent;
use flow_core::{OutboundRecord, WaitingFor};

/// Buffers an inbound session item and resumes the flow once everything it
/// waits on has arrived in order.
///
/// Items are accepted for any suspended flow, not only one currently waiting
/// on sessions, so that a reply racing ahead of a send's wake-up is kept.
pub struct SessionEventHandler;

impl FlowEventHandler<SessionEvent> for SessionEventHandler {
    fn name(&self) -> &'static str {
        "session message"
    }

    fn accepts(&self, waiting_for: Option<&WaitingFor>) -> bool {
        matches!(
            waiting_for,
            Some(
                WaitingFor::SessionData { .. }
                    | WaitingFor::Wakeup { .. }
                    | WaitingFor::Confirmations { .. }
            )
        )
    }

    fn pre_process(&self, ctx: &mut FlowEventContext<SessionEvent>) -> Result<RunDecision, Rejection> {
        let flow_id = ctx.flow_id;
        let FlowEventContext {
            payload,
            checkpoint,
            output_records,
            ..
        } = ctx;
        let checkpoint = checkpoint
            .as_mut()
            .ok_or_else(|| Rejection::new("flow has no checkpoint"))?;

        let session = checkpoint.sessions.get_mut(&payload.session_id).ok_or_else(|| {
            Rejection::new(format!("unknown session '{}'", payload.session_id))
        })?;
        if !session.is_open() {
            return Err(Rejection::new(format!(
                "session '{}' is no longer open",
                payload.session_id
            )));
        }
        if session.has_seen(payload.sequence_number) {
            return Err(Rejection::new(format!(
                "duplicate message {} on session '{}'",
                payload.sequence_number, payload.session_id
            )));
        }

        session
            .pending
            .insert(payload.sequence_number, payload.payload.clone());
        output_records.push(OutboundRecord::SessionAck {
            flow_id,
            session_id: payload.session_id.clone(),
            sequence_number: payload.sequence_number,
        });
        tracing::debug!(
            flow_id = %flow_id,
            session_id = %payload.session_id,
            sequence_number = payload.sequence_number,
            "buffered session message"
        );

        Ok(checkpoint
            .take_ready_messages()
            .map_or(RunDecision::Skip, RunDecision::Resume))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::handlers::test_support::{context, suspended};
    use bytes::Bytes;
    use chrono::Utc;
    use flow_core::checkpoint::SessionPayload;
    use flow_core::flow::{SessionFailure, SessionFailureReason};
    use flow_core::{Resumed, SessionId};

    fn waiting_on_s1() -> WaitingFor {
        WaitingFor::SessionData {
            sessions: vec!["s1".into()],
            deadline: None,
        }
    }

    fn data(session: &str, seq: u64, text: &'static str) -> SessionEvent {
        SessionEvent {
            session_id: session.into(),
            sequence_number: seq,
            payload: SessionPayload::Data {
                payload: Bytes::from_static(text.as_bytes()),
            },
        }
    }

    #[test]
    fn test_accepts_suspended_flows_only() {
        let handler = SessionEventHandler;
        assert!(handler.accepts(Some(&waiting_on_s1())));
        assert!(handler.accepts(Some(&WaitingFor::Wakeup { at: Utc::now() })));
        assert!(!handler.accepts(None));
        assert!(!handler.accepts(Some(&WaitingFor::Nothing)));
    }

    #[test]
    fn test_in_order_message_resumes() {
        let mut ctx = context(data("s1", 1, "hi"), Some(suspended(waiting_on_s1())), Utc::now());
        let decision = SessionEventHandler.pre_process(&mut ctx).unwrap();
        let RunDecision::Resume(Resumed::Messages(messages)) = decision else {
            panic!("expected resume, got {decision:?}");
        };
        assert_eq!(messages.raw(&"s1".into()).unwrap().as_ref(), b"hi");
        assert!(matches!(
            ctx.output_records.as_slice(),
            [OutboundRecord::SessionAck { sequence_number: 1, .. }]
        ));
    }

    #[test]
    fn test_gap_is_buffered() {
        let mut ctx = context(data("s1", 2, "later"), Some(suspended(waiting_on_s1())), Utc::now());
        let decision = SessionEventHandler.pre_process(&mut ctx).unwrap();
        assert_eq!(decision, RunDecision::Skip);
        let cp = ctx.checkpoint.unwrap();
        assert!(cp.sessions[&SessionId::from("s1")].pending.contains_key(&2));
    }

    #[test]
    fn test_unknown_session_rejected_without_change() {
        let cp = suspended(waiting_on_s1());
        let mut ctx = context(data("s2", 1, "who"), Some(cp.clone()), Utc::now());
        assert!(SessionEventHandler.pre_process(&mut ctx).is_err());
        assert_eq!(ctx.checkpoint.unwrap(), cp);
        assert!(ctx.output_records.is_empty());
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut cp = suspended(waiting_on_s1());
        cp.sessions.get_mut(&SessionId::from("s1")).unwrap().next_receive_seq = 2;
        let mut ctx = context(data("s1", 1, "again"), Some(cp), Utc::now());
        let err = SessionEventHandler.pre_process(&mut ctx).unwrap_err();
        assert!(err.reason().contains("duplicate"));
    }

    #[test]
    fn test_peer_close_fails_wait() {
        let event = SessionEvent {
            session_id: "s1".into(),
            sequence_number: 1,
            payload: SessionPayload::Close,
        };
        let mut ctx = context(event, Some(suspended(waiting_on_s1())), Utc::now());
        let decision = SessionEventHandler.pre_process(&mut ctx).unwrap();
        assert_eq!(
            decision,
            RunDecision::Resume(Resumed::SessionFailed(SessionFailure {
                session_id: "s1".into(),
                reason: SessionFailureReason::ClosedByPeer,
            }))
        );
    }

    #[test]
    fn test_message_during_sleep_is_kept() {
        let cp = suspended(WaitingFor::Wakeup { at: Utc::now() });
        let mut ctx = context(data("s1", 1, "early"), Some(cp), Utc::now());
        assert_eq!(SessionEventHandler.pre_process(&mut ctx).unwrap(), RunDecision::Skip);
        assert_eq!(ctx.output_records.len(), 1);
    }
}
