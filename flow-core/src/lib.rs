//! Core model of the flow engine: flows, fibers, checkpoints and events.
//!
//! This crate has no runtime of its own. It defines what a flow is, how a
//! suspended flow is captured in a [`Checkpoint`](checkpoint::Checkpoint),
//! and the events and records that move between the pipeline and the
//! outside world. `flow-runtime` drives these types.

pub mod checkpoint;
pub mod codec;
pub mod context;
pub mod error;
pub mod events;
pub mod execution;
pub mod fiber;
pub mod flow;
pub mod primitives;
pub mod registry;
pub mod serialization;

pub use checkpoint::{Checkpoint, CheckpointStatus, WaitingFor};
pub use context::FlowContext;
pub use error::{FiberError, FlowError};
pub use events::{FlowEvent, FlowEventPayload, OutboundRecord};
pub use execution::ExecutionContext;
pub use fiber::{FiberOutcome, FiberState, FlowFiber};
pub use flow::{Flow, FlowIoRequest, Resumed, Step};
pub use primitives::{FlowId, HoldingIdentity, SessionId};
pub use registry::FlowRegistry;
