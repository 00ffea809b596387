//! The handle flow logic uses to talk to the engine while it runs.

use crate::checkpoint::Checkpoint;
use crate::codec::Encoder;
use crate::error::FlowError;
use crate::flow::{FlowIoRequest, OutboundMessage};
use crate::primitives::{FlowId, HoldingIdentity, SessionId};
use crate::serialization::JsonCodec;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashMap;

/// A session as seen by running flow logic.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionView {
    pub counterparty: HoldingIdentity,
    pub open: bool,
}

/// Session changes made by flow logic during one run.
///
/// Applied to the checkpoint only if the run ends in a suspension or
/// completion; a failed run leaves the checkpoint's sessions untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContextEffects {
    pub initiated: Vec<(SessionId, HoldingIdentity)>,
    pub closed: Vec<SessionId>,
}

impl ContextEffects {
    pub fn is_empty(&self) -> bool {
        self.initiated.is_empty() && self.closed.is_empty()
    }
}

/// Execution context passed to [`Flow::start`](crate::flow::Flow::start) and
/// [`Flow::resume`](crate::flow::Flow::resume).
///
/// The context never performs I/O. Its suspension primitives only validate
/// their arguments and build the [`FlowIoRequest`] the flow returns.
#[derive(Debug, Clone)]
pub struct FlowContext {
    flow_id: FlowId,
    owner: HoldingIdentity,
    now: DateTime<Utc>,
    initiator: Option<SessionId>,
    sessions: HashMap<SessionId, SessionView>,
    effects: ContextEffects,
}

impl FlowContext {
    pub fn new(flow_id: FlowId, owner: HoldingIdentity, now: DateTime<Utc>) -> Self {
        Self {
            flow_id,
            owner,
            now,
            initiator: None,
            sessions: HashMap::new(),
            effects: ContextEffects::default(),
        }
    }

    /// Build the view a flow gets of its own checkpoint.
    pub fn from_checkpoint(checkpoint: &Checkpoint, now: DateTime<Utc>) -> Self {
        let sessions = checkpoint
            .sessions
            .iter()
            .map(|(id, state)| {
                (
                    id.clone(),
                    SessionView {
                        counterparty: state.counterparty.clone(),
                        open: state.is_open(),
                    },
                )
            })
            .collect();
        Self {
            flow_id: checkpoint.flow_id,
            owner: checkpoint.owner.clone(),
            now,
            initiator: checkpoint.initiated_by.clone(),
            sessions,
            effects: ContextEffects::default(),
        }
    }

    #[must_use]
    pub fn with_session(mut self, session_id: SessionId, counterparty: HoldingIdentity) -> Self {
        self.sessions.insert(
            session_id,
            SessionView {
                counterparty,
                open: true,
            },
        );
        self
    }

    #[must_use]
    pub fn with_initiator(mut self, session_id: SessionId, counterparty: HoldingIdentity) -> Self {
        self.initiator = Some(session_id.clone());
        self.with_session(session_id, counterparty)
    }

    pub fn flow_id(&self) -> FlowId {
        self.flow_id
    }

    pub fn owner(&self) -> &HoldingIdentity {
        &self.owner
    }

    /// Processing time of the event that triggered this run.
    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    /// For a responder flow, the session of the flow that started it.
    pub fn initiator(&self) -> Option<&SessionId> {
        self.initiator.as_ref()
    }

    pub fn session(&self, session_id: &SessionId) -> Option<&SessionView> {
        self.sessions.get(session_id)
    }

    /// Open a new session to `counterparty`.
    ///
    /// Session ids are derived from the flow id and a counter, so replaying
    /// the same logic against the same checkpoint yields the same ids.
    pub fn initiate_session(&mut self, counterparty: HoldingIdentity) -> SessionId {
        let session_id = SessionId::new(format!("{}-{}", self.flow_id, self.sessions.len() + 1));
        self.sessions.insert(
            session_id.clone(),
            SessionView {
                counterparty: counterparty.clone(),
                open: true,
            },
        );
        self.effects
            .initiated
            .push((session_id.clone(), counterparty));
        session_id
    }

    /// Close a session. A close record is emitted when the flow next suspends or finishes.
    ///
    /// # Errors
    ///
    /// Fails if the session is unknown or no longer open.
    pub fn close_session(&mut self, session_id: &SessionId) -> Result<(), FlowError> {
        self.require_open(session_id)?;
        if let Some(view) = self.sessions.get_mut(session_id) {
            view.open = false;
        }
        self.effects.closed.push(session_id.clone());
        Ok(())
    }

    /// Send `payload` without waiting for a reply.
    ///
    /// # Errors
    ///
    /// Fails if the session is not open or the payload does not encode.
    pub fn send<T: Serialize>(
        &self,
        session_id: &SessionId,
        payload: &T,
    ) -> Result<FlowIoRequest, FlowError> {
        Ok(FlowIoRequest::Send {
            messages: vec![self.message(session_id, payload)?],
        })
    }

    /// Send `payload` and wait for the counterparty's reply.
    ///
    /// # Errors
    ///
    /// Fails if the session is not open or the payload does not encode.
    pub fn send_and_receive<T: Serialize>(
        &self,
        session_id: &SessionId,
        payload: &T,
    ) -> Result<FlowIoRequest, FlowError> {
        Ok(FlowIoRequest::SendAndReceive {
            messages: vec![self.message(session_id, payload)?],
            receive_from: vec![session_id.clone()],
        })
    }

    /// Wait for one message on each of `sessions`.
    ///
    /// # Errors
    ///
    /// Fails if `sessions` is empty or any of them is not open.
    pub fn receive<I>(&self, sessions: I) -> Result<FlowIoRequest, FlowError>
    where
        I: IntoIterator<Item = SessionId>,
    {
        let sessions: Vec<SessionId> = sessions.into_iter().collect();
        if sessions.is_empty() {
            return Err(FlowError::failed("receive needs at least one session"));
        }
        for session_id in &sessions {
            self.require_open(session_id)?;
        }
        Ok(FlowIoRequest::Receive { sessions })
    }

    pub fn sleep_until(&self, until: DateTime<Utc>) -> FlowIoRequest {
        FlowIoRequest::Sleep { until }
    }

    pub fn sleep(&self, duration: Duration) -> FlowIoRequest {
        self.sleep_until(self.now + duration)
    }

    pub fn wait_for_confirmations(&self, required: u32) -> FlowIoRequest {
        FlowIoRequest::WaitForConfirmations { required }
    }

    pub fn force_checkpoint(&self) -> FlowIoRequest {
        FlowIoRequest::ForceCheckpoint
    }

    /// Drain the session changes made so far.
    pub fn take_effects(&mut self) -> ContextEffects {
        std::mem::take(&mut self.effects)
    }

    fn require_open(&self, session_id: &SessionId) -> Result<(), FlowError> {
        match self.sessions.get(session_id) {
            None => Err(FlowError::UnknownSession(session_id.clone())),
            Some(view) if !view.open => Err(FlowError::SessionClosed(session_id.clone())),
            Some(_) => Ok(()),
        }
    }

    fn message<T: Serialize>(
        &self,
        session_id: &SessionId,
        payload: &T,
    ) -> Result<OutboundMessage, FlowError> {
        self.require_open(session_id)?;
        Ok(OutboundMessage {
            session_id: session_id.clone(),
            payload: JsonCodec.encode(payload)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> FlowContext {
        FlowContext::new(
            FlowId::new(),
            HoldingIdentity::new("O=Alice", "g1"),
            Utc::now(),
        )
    }

    #[test]
    fn test_initiated_session_ids_are_deterministic() {
        let mut first = ctx();
        let mut second = first.clone();
        let bob = HoldingIdentity::new("O=Bob", "g1");
        let a = first.initiate_session(bob.clone());
        assert_eq!(a, second.initiate_session(bob.clone()));
        assert_ne!(a, first.initiate_session(bob));
        assert_eq!(first.take_effects().initiated.len(), 2);
        assert!(first.take_effects().is_empty());
    }

    #[test]
    fn test_send_to_unknown_session() {
        let err = ctx().send(&"nope".into(), &1u8).unwrap_err();
        assert_eq!(err, FlowError::UnknownSession("nope".into()));
    }

    #[test]
    fn test_closed_session_rejects_io() {
        let mut ctx = ctx();
        let session = ctx.initiate_session(HoldingIdentity::new("O=Bob", "g1"));
        ctx.close_session(&session).unwrap();
        assert_eq!(
            ctx.send_and_receive(&session, &"hi").unwrap_err(),
            FlowError::SessionClosed(session.clone())
        );
        assert!(ctx.close_session(&session).is_err());
        assert_eq!(ctx.take_effects().closed, vec![session]);
    }

    #[test]
    fn test_send_and_receive_request() {
        let mut ctx = ctx();
        let session = ctx.initiate_session(HoldingIdentity::new("O=Bob", "g1"));
        let request = ctx.send_and_receive(&session, &"ping").unwrap();
        let FlowIoRequest::SendAndReceive {
            messages,
            receive_from,
        } = request
        else {
            panic!("unexpected request");
        };
        assert_eq!(receive_from, vec![session.clone()]);
        assert_eq!(messages[0].payload.as_ref(), b"\"ping\"");
    }

    #[test]
    fn test_receive_requires_sessions() {
        assert!(ctx().receive(Vec::new()).is_err());
    }
}
