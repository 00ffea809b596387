//! Event-driven runtime for durable flows.
//!
//! Events arrive through an [`EventWorker`] and are handed to the
//! [`Dispatcher`], which runs them single-flight per flow on a
//! [`Scheduler`]. Each event loads the flow's checkpoint, lets the matching
//! handler update it, runs the flow's fiber when the flow can make
//! progress, commits the checkpoint with a version check and then publishes
//! the outbound records the event produced. Fibers left suspended stay in a
//! [`FiberCache`] so the next event can skip decoding their continuation.

pub mod config;
pub mod fiber_cache;
pub mod pipeline;
pub mod publisher;
pub mod sandbox;
pub mod scheduler;
pub mod wakeup;
pub mod worker;

// Re-exports
pub use config::{ConfigHandle, ConfigSource, FlowConfig, RetryPolicy};
pub use fiber_cache::FiberCache;
pub use pipeline::{Dispatcher, ProcessingError, ProcessingOutcome};
pub use publisher::{InMemoryPublisher, PublishError, RecordPublisher};
pub use sandbox::{ExecutionContextProvider, SandboxError, StaticContextProvider};
pub use scheduler::{Scheduler, SchedulerError, TaskHandle};
pub use wakeup::WakeupScheduler;
pub use worker::EventWorker;

pub use flow_core;
pub use flow_persistence as persistence;
