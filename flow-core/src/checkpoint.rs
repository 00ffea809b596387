//! The checkpoint: the durable snapshot of one flow.
//!
//! A checkpoint holds the serialized continuation of a suspended fiber plus
//! the bookkeeping the pipeline needs to decide when and how to resume it:
//! what the flow waits for, its sessions, retry state and an optimistic
//! concurrency version.

use crate::flow::{ReceivedMessages, Resumed, SessionFailure, SessionFailureReason};
use crate::primitives::{FlowId, HoldingIdentity, SessionId};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Lifecycle status of a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckpointStatus {
    Created,
    Running,
    Suspended,
    Completed,
    Failed,
    Retrying,
}

impl CheckpointStatus {
    /// Completed and failed flows are never touched again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether the pipeline may move a flow from `self` to `next`.
    pub fn can_transition_to(self, next: CheckpointStatus) -> bool {
        use CheckpointStatus::*;
        matches!(
            (self, next),
            (Created, Running)
                | (Created, Failed)
                | (Running, Suspended)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Retrying)
                | (Suspended, Running)
                | (Suspended, Failed)
                | (Retrying, Running)
                | (Retrying, Failed)
        )
    }
}

impl fmt::Display for CheckpointStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "CREATED",
            Self::Running => "RUNNING",
            Self::Suspended => "SUSPENDED",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Retrying => "RETRYING",
        };
        f.write_str(name)
    }
}

/// What a flow needs before it can run again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WaitingFor {
    /// A freshly created flow waiting to be started.
    Start,
    /// One message from every listed session, optionally bounded by a deadline.
    SessionData {
        sessions: Vec<SessionId>,
        deadline: Option<DateTime<Utc>>,
    },
    /// A wake-up at or after `at`. Used for sleeps, sends and retries.
    Wakeup { at: DateTime<Utc> },
    /// External confirmations.
    Confirmations { required: u32, received: u32 },
    /// Terminal; nothing will resume this flow.
    Nothing,
}

/// Discriminant of [`WaitingFor`], used to pick the handler that may resume a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WaitingKind {
    Start,
    SessionData,
    Wakeup,
    Confirmations,
    Nothing,
}

impl WaitingFor {
    pub fn kind(&self) -> WaitingKind {
        match self {
            Self::Start => WaitingKind::Start,
            Self::SessionData { .. } => WaitingKind::SessionData,
            Self::Wakeup { .. } => WaitingKind::Wakeup,
            Self::Confirmations { .. } => WaitingKind::Confirmations,
            Self::Nothing => WaitingKind::Nothing,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Open,
    /// Closed by this flow.
    Closed,
    /// The counterparty sent a close.
    ClosedByPeer,
    /// Torn down because this flow failed.
    Errored,
}

/// An inbound session item buffered until the flow consumes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionPayload {
    Data { payload: Bytes },
    Close,
}

/// Per-session bookkeeping inside a checkpoint.
///
/// Sequence numbers start at 1 in both directions. Inbound items are kept
/// in `pending` until every lower sequence number has been consumed, which
/// is what gives the flow in-order delivery under transport jitter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub counterparty: HoldingIdentity,
    pub status: SessionStatus,
    pub next_send_seq: u64,
    pub next_receive_seq: u64,
    #[serde(default)]
    pub pending: BTreeMap<u64, SessionPayload>,
}

impl SessionState {
    pub fn new(counterparty: HoldingIdentity) -> Self {
        Self {
            counterparty,
            status: SessionStatus::Open,
            next_send_seq: 1,
            next_receive_seq: 1,
            pending: BTreeMap::new(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.status == SessionStatus::Open
    }

    /// Reserve the next outbound sequence number.
    pub fn take_send_seq(&mut self) -> u64 {
        let seq = self.next_send_seq;
        self.next_send_seq += 1;
        seq
    }

    /// Whether an inbound item with `seq` was already consumed or buffered.
    pub fn has_seen(&self, seq: u64) -> bool {
        seq < self.next_receive_seq || self.pending.contains_key(&seq)
    }

    fn next_ready(&self) -> Option<&SessionPayload> {
        self.pending.get(&self.next_receive_seq)
    }

    fn consume_next(&mut self) -> Option<SessionPayload> {
        let item = self.pending.remove(&self.next_receive_seq)?;
        self.next_receive_seq += 1;
        if matches!(item, SessionPayload::Close) {
            self.status = SessionStatus::ClosedByPeer;
        }
        Some(item)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("flow {flow_id} cannot move from {from} to {to}")]
    InvalidTransition {
        flow_id: FlowId,
        from: CheckpointStatus,
        to: CheckpointStatus,
    },
    #[error("flow {flow_id} has no session '{session_id}'")]
    UnknownSession {
        flow_id: FlowId,
        session_id: SessionId,
    },
}

/// The durable state of one flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub flow_id: FlowId,
    pub owner: HoldingIdentity,
    pub flow_name: String,
    /// Written only by the execution context's fiber serializer.
    #[serde(with = "serde_bytes", default)]
    pub serialized_continuation: Option<Vec<u8>>,
    pub waiting_for: WaitingFor,
    pub sessions: HashMap<SessionId, SessionState>,
    pub status: CheckpointStatus,
    pub retry_count: u32,
    pub last_failure_reason: Option<String>,
    /// Optimistic concurrency counter; 0 means never persisted.
    pub version: u64,
    /// Encoded start arguments, replayed when a failed start is retried.
    #[serde(with = "serde_bytes", default)]
    pub start_args: Option<Vec<u8>>,
    /// Resume value replayed when a failed resume is retried.
    pub pending_resume: Option<Resumed>,
    /// Encoded output of a completed flow.
    #[serde(with = "serde_bytes", default)]
    pub result: Option<Vec<u8>>,
    /// Session that caused this flow to start, for responder flows.
    pub initiated_by: Option<SessionId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(
        flow_id: FlowId,
        owner: HoldingIdentity,
        flow_name: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            flow_id,
            owner,
            flow_name: flow_name.into(),
            serialized_continuation: None,
            waiting_for: WaitingFor::Start,
            sessions: HashMap::new(),
            status: CheckpointStatus::Created,
            retry_count: 0,
            last_failure_reason: None,
            version: 0,
            start_args: None,
            pending_resume: None,
            result: None,
            initiated_by: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Move to `next`, enforcing the flow state machine.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::InvalidTransition`] if the move is not allowed,
    /// which includes any move out of a terminal status.
    pub fn set_status(&mut self, next: CheckpointStatus) -> Result<(), CheckpointError> {
        if !self.status.can_transition_to(next) {
            return Err(CheckpointError::InvalidTransition {
                flow_id: self.flow_id,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    pub fn add_session(&mut self, session_id: SessionId, counterparty: HoldingIdentity) {
        self.sessions
            .entry(session_id)
            .or_insert_with(|| SessionState::new(counterparty));
    }

    pub fn session_mut(
        &mut self,
        session_id: &SessionId,
    ) -> Result<&mut SessionState, CheckpointError> {
        let flow_id = self.flow_id;
        self.sessions
            .get_mut(session_id)
            .ok_or_else(|| CheckpointError::UnknownSession {
                flow_id,
                session_id: session_id.clone(),
            })
    }

    /// Ids of sessions still open, in a stable order.
    pub fn open_sessions(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.is_open())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// If the flow waits on sessions and every one of them can deliver its
    /// next in-order item, consume those items and build the resume value.
    ///
    /// A close from a peer is delivered on its own as a session failure;
    /// data from the other awaited sessions stays buffered for the next wait.
    pub fn take_ready_messages(&mut self) -> Option<Resumed> {
        let WaitingFor::SessionData { sessions, .. } = &self.waiting_for else {
            return None;
        };
        let awaited = sessions.clone();

        for id in &awaited {
            let state = self.sessions.get(id)?;
            if !state.is_open() {
                return Some(Resumed::SessionFailed(SessionFailure {
                    session_id: id.clone(),
                    reason: SessionFailureReason::ClosedByPeer,
                }));
            }
            state.next_ready()?;
        }

        let closing = awaited.iter().find(|id| {
            self.sessions
                .get(*id)
                .is_some_and(|s| matches!(s.next_ready(), Some(SessionPayload::Close)))
        });
        if let Some(id) = closing.cloned() {
            if let Some(state) = self.sessions.get_mut(&id) {
                state.consume_next();
            }
            return Some(Resumed::SessionFailed(SessionFailure {
                session_id: id,
                reason: SessionFailureReason::ClosedByPeer,
            }));
        }

        let mut messages = ReceivedMessages::new();
        for id in awaited {
            if let Some(state) = self.sessions.get_mut(&id)
                && let Some(SessionPayload::Data { payload }) = state.consume_next()
            {
                messages.insert(id, payload);
            }
        }
        Some(Resumed::Messages(messages))
    }
}
