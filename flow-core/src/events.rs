//! Inbound events consumed by the pipeline and outbound records it produces.

use crate::checkpoint::{CheckpointStatus, SessionPayload};
use crate::primitives::{FlowId, HoldingIdentity, SessionId};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The session through which a responder flow was started.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitiatingSession {
    pub session_id: SessionId,
    pub counterparty: HoldingIdentity,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartFlowRequest {
    pub flow_name: String,
    pub owner: HoldingIdentity,
    /// Arguments encoded with the flow's registered codec.
    pub args: Bytes,
    pub initiated_by: Option<InitiatingSession>,
}

/// An inbound session item, sequenced per session by the sender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEvent {
    pub session_id: SessionId,
    pub sequence_number: u64,
    pub payload: SessionPayload,
}

/// The closed set of event kinds the pipeline understands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlowEventPayload {
    StartFlow(StartFlowRequest),
    Session(SessionEvent),
    Wakeup,
    Confirmation { count: u32 },
    Failure { reason: String },
}

impl FlowEventPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::StartFlow(_) => "start_flow",
            Self::Session(_) => "session",
            Self::Wakeup => "wakeup",
            Self::Confirmation { .. } => "confirmation",
            Self::Failure { .. } => "failure",
        }
    }
}

/// An event addressed to one flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowEvent {
    pub flow_id: FlowId,
    pub payload: FlowEventPayload,
}

impl FlowEvent {
    pub fn start(flow_id: FlowId, request: StartFlowRequest) -> Self {
        Self {
            flow_id,
            payload: FlowEventPayload::StartFlow(request),
        }
    }

    pub fn session_data(
        flow_id: FlowId,
        session_id: SessionId,
        sequence_number: u64,
        payload: Bytes,
    ) -> Self {
        Self {
            flow_id,
            payload: FlowEventPayload::Session(SessionEvent {
                session_id,
                sequence_number,
                payload: SessionPayload::Data { payload },
            }),
        }
    }

    pub fn session_close(flow_id: FlowId, session_id: SessionId, sequence_number: u64) -> Self {
        Self {
            flow_id,
            payload: FlowEventPayload::Session(SessionEvent {
                session_id,
                sequence_number,
                payload: SessionPayload::Close,
            }),
        }
    }

    pub fn wakeup(flow_id: FlowId) -> Self {
        Self {
            flow_id,
            payload: FlowEventPayload::Wakeup,
        }
    }

    pub fn confirmation(flow_id: FlowId, count: u32) -> Self {
        Self {
            flow_id,
            payload: FlowEventPayload::Confirmation { count },
        }
    }

    pub fn failure(flow_id: FlowId, reason: impl Into<String>) -> Self {
        Self {
            flow_id,
            payload: FlowEventPayload::Failure {
                reason: reason.into(),
            },
        }
    }
}

/// A record the pipeline hands to the transport after a successful commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundRecord {
    SessionData {
        flow_id: FlowId,
        session_id: SessionId,
        counterparty: HoldingIdentity,
        sequence_number: u64,
        payload: Bytes,
    },
    SessionClose {
        flow_id: FlowId,
        session_id: SessionId,
        counterparty: HoldingIdentity,
        sequence_number: u64,
    },
    /// Acknowledges receipt of an inbound session item.
    SessionAck {
        flow_id: FlowId,
        session_id: SessionId,
        sequence_number: u64,
    },
    SessionError {
        flow_id: FlowId,
        session_id: SessionId,
        counterparty: HoldingIdentity,
        reason: String,
    },
    /// Ask for a [`FlowEventPayload::Wakeup`] at or after `at`.
    ScheduleWakeup { flow_id: FlowId, at: DateTime<Utc> },
    FlowStatus {
        flow_id: FlowId,
        status: CheckpointStatus,
        detail: Option<String>,
    },
    /// The checkpoint of a terminated flow may be removed after `expires_at`.
    ScheduleCleanup {
        flow_id: FlowId,
        expires_at: DateTime<Utc>,
    },
}

impl OutboundRecord {
    pub fn flow_id(&self) -> FlowId {
        match self {
            Self::SessionData { flow_id, .. }
            | Self::SessionClose { flow_id, .. }
            | Self::SessionAck { flow_id, .. }
            | Self::SessionError { flow_id, .. }
            | Self::ScheduleWakeup { flow_id, .. }
            | Self::FlowStatus { flow_id, .. }
            | Self::ScheduleCleanup { flow_id, .. } => *flow_id,
        }
    }
}
