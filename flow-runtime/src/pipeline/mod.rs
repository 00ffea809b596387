//! The per-event processing pipeline.
//!
//! An event is matched to its handler, which updates a working copy of the
//! flow's checkpoint and decides whether the flow runs. If it does, the
//! fiber is started or restored and its outcome folded back into the
//! checkpoint. The result is committed with a version check and only then
//! are the event's outbound records published.

mod context;
mod dispatcher;
pub mod handlers;
mod outcome;

pub use context::FlowEventContext;
pub use dispatcher::{Dispatcher, ProcessingError, ProcessingOutcome};
pub use handlers::{FlowEventHandler, Rejection, RunDecision};
