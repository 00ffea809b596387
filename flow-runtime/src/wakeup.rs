//! Turns `ScheduleWakeup` records into wake-up events.
//!
//! [`WakeupScheduler`] sits in front of the real publisher. Every record is
//! forwarded unchanged; in addition each `ScheduleWakeup` arms a timer task
//! that pushes a [`FlowEvent::wakeup`] into the inbound event channel when it
//! is due. Timers are armed before the batch is forwarded, so a transport
//! failure never leaves a committed flow without its timer. Timers never block a worker, and a flow has at most one armed
//! timer: scheduling again replaces the previous one.

use crate::publisher::{PublishError, RecordPublisher};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flow_core::{FlowEvent, FlowId, OutboundRecord, WaitingFor};
use flow_persistence::{CheckpointStore, StoreError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

struct Timer {
    generation: u64,
    abort: AbortHandle,
}

#[derive(Default)]
struct Timers {
    armed: Mutex<HashMap<FlowId, Timer>>,
    generation: AtomicU64,
}

pub struct WakeupScheduler<P> {
    inner: P,
    events: mpsc::Sender<FlowEvent>,
    timers: Arc<Timers>,
}

impl<P> WakeupScheduler<P> {
    /// Wrap `inner`, delivering due wake-ups to `events`.
    pub fn new(inner: P, events: mpsc::Sender<FlowEvent>) -> Self {
        Self {
            inner,
            events,
            timers: Arc::new(Timers::default()),
        }
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }

    /// Arm the timer of `flow_id` for `at`, replacing any earlier timer.
    ///
    /// Must be called from within a tokio runtime.
    pub fn schedule(&self, flow_id: FlowId, at: DateTime<Utc>) {
        let delay = (at - Utc::now()).to_std().unwrap_or_default();
        let generation = self.timers.generation.fetch_add(1, Ordering::Relaxed);
        let timers = Arc::clone(&self.timers);
        let events = self.events.clone();

        let mut armed = self
            .timers
            .armed
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut armed = timers.armed.lock().unwrap_or_else(PoisonError::into_inner);
                if armed.get(&flow_id).is_some_and(|t| t.generation == generation) {
                    armed.remove(&flow_id);
                }
            }
            tracing::debug!(flow_id = %flow_id, "delivering wakeup");
            if events.send(FlowEvent::wakeup(flow_id)).await.is_err() {
                tracing::warn!(flow_id = %flow_id, "event channel closed; dropping wakeup");
            }
        });
        if let Some(previous) = armed.insert(
            flow_id,
            Timer {
                generation,
                abort: handle.abort_handle(),
            },
        ) {
            previous.abort.abort();
        }
        tracing::debug!(flow_id = %flow_id, at = %at, "armed wakeup timer");
    }

    /// Disarm the timer of `flow_id`, if any.
    pub fn cancel(&self, flow_id: FlowId) {
        let removed = self
            .timers
            .armed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&flow_id);
        if let Some(timer) = removed {
            timer.abort.abort();
        }
    }

    /// Number of armed timers.
    pub fn pending(&self) -> usize {
        self.timers
            .armed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Re-arm timers for every stored flow that waits on one.
    ///
    /// Timers live only in memory; call this on startup before consuming events.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the store cannot be scanned.
    pub async fn recover(&self, store: &dyn CheckpointStore) -> Result<usize, StoreError> {
        let mut armed = 0;
        for flow_id in store.list_flow_ids().await? {
            let Some(checkpoint) = store.load(flow_id).await? else {
                continue;
            };
            let at = match checkpoint.waiting_for {
                WaitingFor::Wakeup { at } => at,
                WaitingFor::SessionData {
                    deadline: Some(deadline),
                    ..
                } => deadline,
                _ => continue,
            };
            self.schedule(flow_id, at);
            armed += 1;
        }
        tracing::debug!(armed, "recovered wakeup timers");
        Ok(armed)
    }
}

#[async_trait]
impl<P> RecordPublisher for WakeupScheduler<P>
where
    P: RecordPublisher,
{
    async fn publish(&self, records: Vec<OutboundRecord>) -> Result<(), PublishError> {
        let mut wakeups = Vec::new();
        let mut finished = Vec::new();
        for record in &records {
            match record {
                OutboundRecord::ScheduleWakeup { flow_id, at } => wakeups.push((*flow_id, *at)),
                OutboundRecord::FlowStatus {
                    flow_id, status, ..
                } if status.is_terminal() => finished.push(*flow_id),
                _ => {}
            }
        }
        // The checkpoint is already durable; timers must not depend on the transport.
        for (flow_id, at) in wakeups {
            self.schedule(flow_id, at);
        }
        for flow_id in finished {
            self.cancel(flow_id);
        }
        self.inner.publish(records).await
    }
}
