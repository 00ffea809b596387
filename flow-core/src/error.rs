//! Error types for flow-core.

use crate::primitives::{FlowId, SessionId};

/// An error raised by flow logic or by the primitives it calls.
///
/// These never escape a fiber: they are caught at the fiber boundary and
/// reported as a failed outcome. Only [`FlowError::Transient`] is retryable.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FlowError {
    /// The flow gave up for a business reason.
    #[error("flow failed: {0}")]
    Failed(String),
    /// A temporary problem; the flow may be retried after a backoff.
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("unknown session '{0}'")]
    UnknownSession(SessionId),
    #[error("session '{0}' is closed")]
    SessionClosed(SessionId),
    /// A session the flow was waiting on closed or timed out.
    #[error("session '{session_id}' failed: {reason}")]
    SessionFailed { session_id: SessionId, reason: String },
    /// The resume value does not fit the suspension point.
    #[error("resume value mismatch: expected {expected}, found {found}")]
    ResumeMismatch { expected: String, found: String },
    /// A value could not be encoded or decoded.
    #[error("payload error: {0}")]
    Payload(String),
    #[error("flow panicked: {0}")]
    Panicked(String),
    #[error("flow '{0}' is not registered")]
    UnknownFlow(String),
}

impl FlowError {
    pub fn failed(reason: impl std::fmt::Display) -> Self {
        Self::Failed(reason.to_string())
    }

    pub fn transient(reason: impl std::fmt::Display) -> Self {
        Self::Transient(reason.to_string())
    }

    /// Whether the flow may be retried after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<anyhow::Error> for FlowError {
    fn from(err: anyhow::Error) -> Self {
        Self::Payload(format!("{err:#}"))
    }
}

/// An engine-level failure around a fiber, as opposed to a failure of the flow itself.
///
/// The dispatcher treats these as fatal for the event: nothing is committed
/// and the flow stays at its last checkpoint.
#[derive(Debug, thiserror::Error)]
pub enum FiberError {
    #[error("flow '{0}' is not registered in this execution context")]
    UnknownFlow(String),
    #[error("continuation for flow {flow_id} could not be decoded: {reason}")]
    Decode { flow_id: FlowId, reason: String },
    #[error("continuation for flow {flow_id} could not be encoded: {reason}")]
    Encode { flow_id: FlowId, reason: String },
    #[error("checkpoint for flow {0} has no continuation to resume")]
    MissingContinuation(FlowId),
    #[error("fiber for flow {flow_id} cannot {action} while {state}")]
    InvalidState {
        flow_id: FlowId,
        action: &'static str,
        state: String,
    },
}
