//! The contract between flow logic and the engine.
//!
//! Flow logic is written in continuation-passing style. Instead of blocking on
//! a counterparty, a flow returns [`Step::Suspend`] with its own serializable
//! `State` and an [`FlowIoRequest`] describing what it waits for. When the
//! awaited event arrives the engine calls [`Flow::resume`] with that state and
//! a [`Resumed`] value. Everything a flow needs after a suspension must be in
//! `State`; nothing else survives a restart.
//!
//! ```rust,ignore
//! #[async_trait]
//! impl Flow for Ping {
//!     type Args = SessionTarget;
//!     type State = ();
//!     type Output = String;
//!
//!     async fn start(&self, ctx: &mut FlowContext, args: SessionTarget) -> Result<Step<(), String>, FlowError> {
//!         let session = ctx.initiate_session(args.counterparty);
//!         Ok(Step::Suspend((), ctx.send_and_receive(&session, &"ping")?))
//!     }
//!
//!     async fn resume(&self, _ctx: &mut FlowContext, _: (), resumed: Resumed) -> Result<Step<(), String>, FlowError> {
//!         let messages = resumed.into_messages()?;
//!         Ok(Step::Finish(messages.decode_single()?))
//!     }
//! }
//! ```

use crate::codec::Decoder;
use crate::context::FlowContext;
use crate::error::FlowError;
use crate::primitives::SessionId;
use crate::serialization::JsonCodec;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A unit of business logic run by the engine.
#[async_trait]
pub trait Flow: Send + Sync + 'static {
    type Args: Send + 'static;
    type State: Send + 'static;
    type Output: Send + 'static;

    /// Run the flow from the beginning.
    async fn start(
        &self,
        ctx: &mut FlowContext,
        args: Self::Args,
    ) -> Result<Step<Self::State, Self::Output>, FlowError>;

    /// Continue the flow after the event it suspended on has arrived.
    async fn resume(
        &self,
        ctx: &mut FlowContext,
        state: Self::State,
        resumed: Resumed,
    ) -> Result<Step<Self::State, Self::Output>, FlowError>;
}

/// What a flow does next.
#[derive(Debug)]
pub enum Step<S, O> {
    /// Park with `S` until the request is satisfied.
    Suspend(S, FlowIoRequest),
    /// Terminate successfully.
    Finish(O),
}

/// A message queued for a session as part of a suspension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub session_id: SessionId,
    pub payload: Bytes,
}

/// The external interaction a flow suspends on.
///
/// Requests are built through [`FlowContext`] so that session ids are
/// validated and payloads encoded consistently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlowIoRequest {
    /// Send without waiting for a reply. Resumes with [`Resumed::Wakeup`]
    /// once the sends are durable.
    Send { messages: Vec<OutboundMessage> },
    /// Send, then wait for one message from each of `receive_from`.
    SendAndReceive {
        messages: Vec<OutboundMessage>,
        receive_from: Vec<SessionId>,
    },
    /// Wait for one message from each session.
    Receive { sessions: Vec<SessionId> },
    /// Wait until the given instant.
    Sleep { until: DateTime<Utc> },
    /// Wait for `required` external confirmations.
    WaitForConfirmations { required: u32 },
    /// Persist the current state, then continue.
    ForceCheckpoint,
}

impl FlowIoRequest {
    /// The kind of resume value this request expects.
    pub fn expects(&self) -> SuspensionKind {
        match self {
            Self::SendAndReceive { .. } | Self::Receive { .. } => SuspensionKind::Messages,
            Self::Send { .. } | Self::Sleep { .. } | Self::ForceCheckpoint => SuspensionKind::Wakeup,
            Self::WaitForConfirmations { .. } => SuspensionKind::Confirmations,
        }
    }
}

/// Coarse classification of suspension points, recorded in the continuation
/// so a resume value can be checked before flow logic sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuspensionKind {
    Messages,
    Wakeup,
    Confirmations,
}

impl fmt::Display for SuspensionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Messages => "messages",
            Self::Wakeup => "wakeup",
            Self::Confirmations => "confirmations",
        };
        f.write_str(name)
    }
}

/// Why a session stopped delivering data to a waiting flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionFailureReason {
    ClosedByPeer,
    TimedOut,
}

impl fmt::Display for SessionFailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClosedByPeer => f.write_str("closed by peer"),
            Self::TimedOut => f.write_str("timed out"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionFailure {
    pub session_id: SessionId,
    pub reason: SessionFailureReason,
}

/// Messages delivered to a flow that was waiting on sessions, keyed by session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReceivedMessages(BTreeMap<SessionId, Bytes>);

impl ReceivedMessages {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, session_id: SessionId, payload: Bytes) {
        self.0.insert(session_id, payload);
    }

    pub fn raw(&self, session_id: &SessionId) -> Option<&Bytes> {
        self.0.get(session_id)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn sessions(&self) -> impl Iterator<Item = &SessionId> {
        self.0.keys()
    }

    /// Decode the message received on `session_id`.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::UnknownSession`] if nothing was received on that
    /// session and [`FlowError::Payload`] if the payload does not decode as `T`.
    pub fn decode<T: DeserializeOwned>(&self, session_id: &SessionId) -> Result<T, FlowError> {
        let payload = self
            .0
            .get(session_id)
            .ok_or_else(|| FlowError::UnknownSession(session_id.clone()))?;
        Ok(JsonCodec.decode(payload.clone())?)
    }

    /// Decode the only message in the set.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::Payload`] unless exactly one message was received
    /// and it decodes as `T`.
    pub fn decode_single<T: DeserializeOwned>(&self) -> Result<T, FlowError> {
        match self.0.keys().next() {
            Some(session_id) if self.0.len() == 1 => self.decode(session_id),
            _ => Err(FlowError::Payload(format!(
                "expected a single message, received {}",
                self.0.len()
            ))),
        }
    }
}

/// The value a suspended flow is resumed with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Resumed {
    /// One message from each awaited session.
    Messages(ReceivedMessages),
    /// A timer fired or a send completed.
    Wakeup,
    /// Enough confirmations were counted.
    Confirmed { confirmations: u32 },
    /// An awaited session closed or timed out instead of delivering data.
    SessionFailed(SessionFailure),
}

impl Resumed {
    /// The suspension kind this value can satisfy.
    pub fn kind(&self) -> SuspensionKind {
        match self {
            Self::Messages(_) | Self::SessionFailed(_) => SuspensionKind::Messages,
            Self::Wakeup => SuspensionKind::Wakeup,
            Self::Confirmed { .. } => SuspensionKind::Confirmations,
        }
    }

    /// Unwrap received messages, turning a session failure into an error.
    ///
    /// # Errors
    ///
    /// [`FlowError::SessionFailed`] for a failed session, and
    /// [`FlowError::ResumeMismatch`] for any non-message value.
    pub fn into_messages(self) -> Result<ReceivedMessages, FlowError> {
        match self {
            Self::Messages(messages) => Ok(messages),
            Self::SessionFailed(failure) => Err(FlowError::SessionFailed {
                session_id: failure.session_id,
                reason: failure.reason.to_string(),
            }),
            other => Err(FlowError::ResumeMismatch {
                expected: SuspensionKind::Messages.to_string(),
                found: other.kind().to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Encoder;

    #[test]
    fn test_request_expectations() {
        let receive = FlowIoRequest::Receive {
            sessions: vec!["s1".into()],
        };
        assert_eq!(receive.expects(), SuspensionKind::Messages);
        assert_eq!(FlowIoRequest::ForceCheckpoint.expects(), SuspensionKind::Wakeup);
        assert_eq!(
            FlowIoRequest::WaitForConfirmations { required: 3 }.expects(),
            SuspensionKind::Confirmations
        );
    }

    #[test]
    fn test_session_failure_satisfies_receive() {
        let resumed = Resumed::SessionFailed(SessionFailure {
            session_id: "s1".into(),
            reason: SessionFailureReason::TimedOut,
        });
        assert_eq!(resumed.kind(), SuspensionKind::Messages);
        let err = resumed.into_messages().unwrap_err();
        assert!(matches!(err, FlowError::SessionFailed { .. }));
    }

    #[test]
    fn test_into_messages_rejects_wakeup() {
        let err = Resumed::Wakeup.into_messages().unwrap_err();
        assert!(matches!(err, FlowError::ResumeMismatch { .. }));
    }

    #[test]
    fn test_decode_single_message() {
        let mut messages = ReceivedMessages::new();
        messages.insert("s1".into(), JsonCodec.encode(&"pong").unwrap());
        let value: String = messages.decode_single().unwrap();
        assert_eq!(value, "pong");

        messages.insert("s2".into(), JsonCodec.encode(&"other").unwrap());
        assert!(messages.decode_single::<String>().is_err());
        let second: String = messages.decode(&"s2".into()).unwrap();
        assert_eq!(second, "other");
    }

    #[test]
    fn test_resumed_serde_roundtrip() {
        let mut messages = ReceivedMessages::new();
        messages.insert("s1".into(), Bytes::from_static(b"\"hi\""));
        let resumed = Resumed::Messages(messages);
        let json = serde_json::to_string(&resumed).unwrap();
        let back: Resumed = serde_json::from_str(&json).unwrap();
        assert_eq!(back, resumed);
    }
}
