//! The suspendable execution unit.
//!
//! A [`FlowFiber`] drives one flow through `start`/`resume` calls. Between
//! calls the fiber is either parked in memory or, once its continuation has
//! been persisted, rebuilt with [`FlowFiber::restore`]. Both paths resume the
//! flow identically: the continuation holds everything the live fiber holds.

use crate::context::FlowContext;
use crate::error::{FiberError, FlowError};
use crate::execution::ExecutionContext;
use crate::flow::{FlowIoRequest, Resumed, SuspensionKind};
use crate::primitives::FlowId;
use crate::registry::{ErasedFlow, RawStep};
use bytes::Bytes;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

/// Serialized form of a suspended fiber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FiberImage {
    pub flow_id: FlowId,
    pub flow_name: String,
    /// What the fiber was suspended on, checked against the resume value.
    pub suspended_on: SuspensionKind,
    /// The flow's own encoded state.
    #[serde(with = "serde_bytes")]
    pub state: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberState {
    Created,
    Running,
    Suspended,
    Completed,
    Failed,
}

impl fmt::Display for FiberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Suspended => "suspended",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Result of running a fiber up to its next suspension or termination.
#[derive(Debug, Clone, PartialEq)]
pub enum FiberOutcome {
    Suspended {
        request: FlowIoRequest,
        continuation: Vec<u8>,
    },
    Completed(Bytes),
    Failed(FlowError),
}

struct Parked {
    kind: SuspensionKind,
    state: Bytes,
}

pub struct FlowFiber {
    flow_id: FlowId,
    flow_name: String,
    logic: Arc<dyn ErasedFlow>,
    state: FiberState,
    parked: Option<Parked>,
}

impl FlowFiber {
    /// Allocate a fiber in [`FiberState::Created`]. Nothing runs yet.
    pub fn create(flow_id: FlowId, flow_name: impl Into<String>, logic: Arc<dyn ErasedFlow>) -> Self {
        Self {
            flow_id,
            flow_name: flow_name.into(),
            logic,
            state: FiberState::Created,
            parked: None,
        }
    }

    /// Create a fiber for a flow registered in `exec`.
    ///
    /// # Errors
    ///
    /// Returns [`FiberError::UnknownFlow`] if `flow_name` is not registered.
    pub fn for_flow(
        exec: &ExecutionContext,
        flow_id: FlowId,
        flow_name: &str,
    ) -> Result<Self, FiberError> {
        let logic = exec
            .registry()
            .get(flow_name)
            .ok_or_else(|| FiberError::UnknownFlow(flow_name.to_string()))?;
        Ok(Self::create(flow_id, flow_name, logic))
    }

    /// Rebuild a suspended fiber from its continuation.
    ///
    /// # Errors
    ///
    /// Fails if the continuation was not written by `exec`'s serializer,
    /// belongs to another flow, or names a flow `exec` cannot resolve.
    pub fn restore(
        exec: &ExecutionContext,
        flow_id: FlowId,
        continuation: &[u8],
    ) -> Result<Self, FiberError> {
        let image = exec
            .serializer()
            .deserialize(continuation)
            .map_err(|e| FiberError::Decode {
                flow_id,
                reason: format!("{e:#}"),
            })?;
        if image.flow_id != flow_id {
            return Err(FiberError::Decode {
                flow_id,
                reason: format!("continuation belongs to flow {}", image.flow_id),
            });
        }
        let logic = exec
            .registry()
            .get(&image.flow_name)
            .ok_or_else(|| FiberError::UnknownFlow(image.flow_name.clone()))?;
        Ok(Self {
            flow_id,
            flow_name: image.flow_name,
            logic,
            state: FiberState::Suspended,
            parked: Some(Parked {
                kind: image.suspended_on,
                state: Bytes::from(image.state),
            }),
        })
    }

    pub fn flow_id(&self) -> FlowId {
        self.flow_id
    }

    pub fn flow_name(&self) -> &str {
        &self.flow_name
    }

    pub fn state(&self) -> FiberState {
        self.state
    }

    /// Run the flow from the beginning.
    ///
    /// # Errors
    ///
    /// Returns a [`FiberError`] if the fiber was already started or its
    /// continuation cannot be written. Failures of the flow itself are
    /// reported as [`FiberOutcome::Failed`].
    pub async fn start(
        &mut self,
        exec: &ExecutionContext,
        ctx: &mut FlowContext,
        args: Bytes,
    ) -> Result<FiberOutcome, FiberError> {
        if self.state != FiberState::Created {
            return Err(self.invalid_state("start"));
        }
        tracing::debug!(flow_id = %self.flow_id, flow = %self.flow_name, "starting fiber");
        self.state = FiberState::Running;
        let logic = Arc::clone(&self.logic);
        let result = AssertUnwindSafe(logic.start(ctx, args))
            .catch_unwind()
            .await;
        self.settle(exec, result)
    }

    /// Continue a suspended flow with the value it was waiting for.
    ///
    /// A value of the wrong kind fails the flow without running any of its logic.
    ///
    /// # Errors
    ///
    /// Returns a [`FiberError`] if the fiber is not suspended or its state
    /// cannot be decoded or re-encoded.
    pub async fn resume(
        &mut self,
        exec: &ExecutionContext,
        ctx: &mut FlowContext,
        resumed: Resumed,
    ) -> Result<FiberOutcome, FiberError> {
        if self.state != FiberState::Suspended {
            return Err(self.invalid_state("resume"));
        }
        let Some(parked) = self.parked.take() else {
            return Err(FiberError::MissingContinuation(self.flow_id));
        };
        if resumed.kind() != parked.kind {
            self.state = FiberState::Failed;
            return Ok(FiberOutcome::Failed(FlowError::ResumeMismatch {
                expected: parked.kind.to_string(),
                found: resumed.kind().to_string(),
            }));
        }

        self.state = FiberState::Running;
        let logic = Arc::clone(&self.logic);
        let future = match logic.resume(ctx, parked.state, resumed) {
            Ok(future) => future,
            Err(e) => {
                self.state = FiberState::Failed;
                return Err(FiberError::Decode {
                    flow_id: self.flow_id,
                    reason: format!("{e:#}"),
                });
            }
        };
        let result = AssertUnwindSafe(future).catch_unwind().await;
        self.settle(exec, result)
    }

    fn settle(
        &mut self,
        exec: &ExecutionContext,
        result: Result<Result<RawStep, FlowError>, Box<dyn Any + Send>>,
    ) -> Result<FiberOutcome, FiberError> {
        let step = match result {
            Ok(Ok(step)) => step,
            Ok(Err(err)) => {
                tracing::debug!(flow_id = %self.flow_id, error = %err, "flow logic failed");
                self.state = FiberState::Failed;
                return Ok(FiberOutcome::Failed(err));
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::warn!(flow_id = %self.flow_id, panic = %message, "flow logic panicked");
                self.state = FiberState::Failed;
                return Ok(FiberOutcome::Failed(FlowError::Panicked(message)));
            }
        };

        match step {
            RawStep::Finish(output) => {
                self.state = FiberState::Completed;
                Ok(FiberOutcome::Completed(output))
            }
            RawStep::Suspend { state, request } => {
                let kind = request.expects();
                let image = FiberImage {
                    flow_id: self.flow_id,
                    flow_name: self.flow_name.clone(),
                    suspended_on: kind,
                    state: state.to_vec(),
                };
                let continuation = match exec.serializer().serialize(&image) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        self.state = FiberState::Failed;
                        return Err(FiberError::Encode {
                            flow_id: self.flow_id,
                            reason: format!("{e:#}"),
                        });
                    }
                };
                tracing::debug!(flow_id = %self.flow_id, suspended_on = %kind, "fiber suspended");
                self.parked = Some(Parked { kind, state });
                self.state = FiberState::Suspended;
                Ok(FiberOutcome::Suspended {
                    request,
                    continuation,
                })
            }
        }
    }

    fn invalid_state(&self, action: &'static str) -> FiberError {
        FiberError::InvalidState {
            flow_id: self.flow_id,
            action,
            state: self.state.to_string(),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
