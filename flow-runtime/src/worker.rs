//! Event worker: feeds a stream of flow events into the dispatcher.
//!
//! The worker is the consuming end of whatever transport delivers flow
//! events. It submits events in arrival order, so per-flow ordering is
//! whatever order the transport delivered them in, and never waits for one
//! flow before taking the next event: flows only wait on each other when
//! the scheduler pool is full.
//!
//! # Example
//!
//! ```rust,ignore
//! use flow_runtime::{ConfigHandle, Dispatcher, EventWorker, FlowConfig};
//!
//! let dispatcher = Arc::new(Dispatcher::new(store, provider, publisher, ConfigHandle::fixed(FlowConfig::default())));
//! let (events_tx, events_rx) = tokio::sync::mpsc::channel(1024);
//! let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
//! tokio::spawn(EventWorker::new(dispatcher).run(events_rx, stop_rx));
//! ```

use crate::pipeline::{Dispatcher, ProcessingOutcome};
use flow_core::FlowEvent;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

#[derive(Clone)]
pub struct EventWorker {
    dispatcher: Arc<Dispatcher>,
}

impl EventWorker {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Consume `events` until the channel closes or `shutdown` turns true,
    /// then drain the scheduler so every accepted event finishes.
    pub async fn run(self, mut events: mpsc::Receiver<FlowEvent>, mut shutdown: watch::Receiver<bool>) {
        tracing::info!("event worker started");
        loop {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!("event worker received shutdown signal");
                        break;
                    }
                }
                event = events.recv() => {
                    let Some(event) = event else {
                        tracing::info!("event channel closed");
                        break;
                    };
                    self.dispatch(event);
                }
            }
        }
        self.dispatcher.scheduler().shutdown().await;
        tracing::info!("event worker stopped");
    }

    fn dispatch(&self, event: FlowEvent) {
        let flow_id = event.flow_id;
        let kind = event.payload.kind();
        let handle = match self.dispatcher.submit(event) {
            Ok(handle) => handle,
            Err(e) => {
                tracing::warn!(flow_id = %flow_id, event = kind, error = %e, "event not accepted");
                return;
            }
        };
        tokio::spawn(async move {
            match handle.await {
                Ok(Ok(ProcessingOutcome::Committed { version, status, .. })) => {
                    tracing::debug!(flow_id = %flow_id, event = kind, version, %status, "event committed");
                }
                Ok(Ok(ProcessingOutcome::Discarded { reason, .. })) => {
                    tracing::debug!(flow_id = %flow_id, event = kind, reason = %reason, "event discarded");
                }
                Ok(Err(e)) if e.is_transient() => {
                    tracing::warn!(flow_id = %flow_id, event = kind, error = %e, "event failed transiently");
                }
                Ok(Err(e)) => {
                    tracing::error!(flow_id = %flow_id, event = kind, error = %e, "event failed");
                }
                Err(e) => {
                    tracing::warn!(flow_id = %flow_id, event = kind, error = %e, "event abandoned");
                }
            }
        });
    }
}
