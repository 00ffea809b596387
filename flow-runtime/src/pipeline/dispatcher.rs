//! Event dispatcher: load, pre-process, run, commit, publish.
//!
//! One event is handled at a time per flow; the [`Scheduler`] lane of the
//! flow serializes them. Everything an event produces is buffered until the
//! conditional checkpoint write succeeds, so a conflicting or failing event
//! leaves no trace outside the process.

use crate::config::{ConfigHandle, FlowConfig};
use crate::fiber_cache::FiberCache;
use crate::pipeline::context::FlowEventContext;
use crate::pipeline::handlers::{
    ConfirmationEvent, ConfirmationHandler, FailureEvent, FailureHandler, FlowEventHandler,
    Rejection, RunDecision, SessionEventHandler, StartFlowHandler, WakeupEvent, WakeupHandler,
};
use crate::pipeline::outcome::{Attempt, Next, apply_outcome};
use crate::publisher::{PublishError, RecordPublisher};
use crate::sandbox::{ExecutionContextProvider, SandboxError};
use crate::scheduler::{Scheduler, SchedulerError, TaskHandle};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use flow_core::checkpoint::CheckpointError;
use flow_core::{
    Checkpoint, CheckpointStatus, ExecutionContext, FiberError, FiberOutcome, FiberState,
    FlowContext, FlowError, FlowEvent, FlowEventPayload, FlowFiber, FlowId, OutboundRecord,
    Resumed,
};
use flow_persistence::{CheckpointStore, SaveResult, StoreError};
use std::sync::Arc;

type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Result of handling one event.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessingOutcome {
    /// The checkpoint was written and its records published.
    Committed {
        flow_id: FlowId,
        version: u64,
        status: CheckpointStatus,
    },
    /// The event did not apply; nothing changed.
    Discarded { flow_id: FlowId, reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessingError {
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Another writer committed first; nothing from this event was applied.
    #[error("checkpoint of flow {flow_id} changed underneath us (expected version {expected}, found {current:?})")]
    Conflict {
        flow_id: FlowId,
        expected: u64,
        current: Option<u64>,
    },
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
    #[error("engine failure: {0}")]
    FatalEngine(#[from] FiberError),
    /// The checkpoint is committed but its records were not handed over.
    #[error("flow {flow_id} committed but publishing failed: {source}")]
    Publish {
        flow_id: FlowId,
        #[source]
        source: PublishError,
    },
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

impl ProcessingError {
    /// Whether redelivering the same event may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Store(_) | Self::Conflict { .. } | Self::Scheduler(_) => true,
            Self::Sandbox(err) => err.is_transient(),
            Self::FatalEngine(_) | Self::Publish { .. } | Self::Checkpoint(_) => false,
        }
    }
}

enum Entry {
    Start(Bytes),
    Resume(Resumed),
}

/// A fiber left suspended by a run, with the context that ran it.
type Parked = (FlowFiber, Arc<ExecutionContext>);

struct Prepared {
    checkpoint: Option<Checkpoint>,
    records: Vec<OutboundRecord>,
    decision: RunDecision,
}

/// Drives flow events through the pipeline.
pub struct Dispatcher {
    store: Arc<dyn CheckpointStore>,
    provider: Arc<dyn ExecutionContextProvider>,
    publisher: Arc<dyn RecordPublisher>,
    scheduler: Scheduler,
    config: ConfigHandle,
    clock: Clock,
    fiber_cache: Arc<FiberCache>,
}

impl Dispatcher {
    /// Must be called inside a tokio runtime: the scheduler follows `config`
    /// from a background task.
    pub fn new<S, C, P>(store: S, provider: C, publisher: P, config: ConfigHandle) -> Self
    where
        S: CheckpointStore + 'static,
        C: ExecutionContextProvider + 'static,
        P: RecordPublisher + 'static,
    {
        Self {
            store: Arc::new(store),
            provider: Arc::new(provider),
            publisher: Arc::new(publisher),
            scheduler: Scheduler::with_config(&config),
            fiber_cache: Arc::new(FiberCache::from_config(&config.current())),
            config,
            clock: Arc::new(Utc::now),
        }
    }

    /// Share `cache` with other components, such as a provider that evicts
    /// fibers when an environment enters maintenance.
    #[must_use]
    pub fn with_fiber_cache(mut self, cache: Arc<FiberCache>) -> Self {
        self.fiber_cache = cache;
        self
    }

    /// Replace the wall clock used to stamp events.
    #[must_use]
    pub fn with_clock<F>(mut self, clock: F) -> Self
    where
        F: Fn() -> DateTime<Utc> + Send + Sync + 'static,
    {
        self.clock = Arc::new(clock);
        self
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn config(&self) -> &ConfigHandle {
        &self.config
    }

    pub fn fiber_cache(&self) -> &Arc<FiberCache> {
        &self.fiber_cache
    }

    /// Queue `event` on its flow's lane.
    ///
    /// Events are ordered per flow in the order `submit` is called.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::ShuttingDown`] once shutdown has begun.
    pub fn submit(
        self: &Arc<Self>,
        event: FlowEvent,
    ) -> Result<TaskHandle<Result<ProcessingOutcome, ProcessingError>>, SchedulerError> {
        let dispatcher = Arc::clone(self);
        self.scheduler
            .run_or_resume(event.flow_id, async move { dispatcher.handle_event(event).await })
    }

    /// Queue `event` and wait for it to be handled.
    ///
    /// # Errors
    ///
    /// See [`ProcessingError`].
    pub async fn process(self: &Arc<Self>, event: FlowEvent) -> Result<ProcessingOutcome, ProcessingError> {
        self.submit(event)?.await?
    }

    async fn handle_event(&self, event: FlowEvent) -> Result<ProcessingOutcome, ProcessingError> {
        let flow_id = event.flow_id;
        let now = (self.clock)();
        let config = self.config.current();
        tracing::debug!(flow_id = %flow_id, event = event.payload.kind(), "processing flow event");

        let loaded = self.store.load(flow_id).await?;
        let expected_version = loaded.as_ref().map_or(0, |cp| cp.version);
        if let Some(cp) = &loaded
            && cp.is_terminal()
        {
            tracing::warn!(flow_id = %flow_id, status = %cp.status, "discarding event for terminated flow");
            return Ok(discarded(flow_id, format!("flow already {}", cp.status)));
        }

        let Prepared {
            checkpoint,
            mut records,
            decision,
        } = match prepare(flow_id, event.payload, loaded, Arc::clone(&config), now) {
            Ok(prepared) => prepared,
            Err(rejection) => {
                tracing::warn!(flow_id = %flow_id, reason = %rejection, "discarding flow event");
                return Ok(discarded(flow_id, rejection.reason()));
            }
        };
        let Some(mut checkpoint) = checkpoint else {
            return Ok(discarded(flow_id, "flow has no checkpoint"));
        };

        let entry = match decision {
            RunDecision::Start { args } => Some(Entry::Start(args)),
            RunDecision::Resume(resumed) => Some(Entry::Resume(resumed)),
            RunDecision::Skip => None,
        };
        let ran = entry.is_some();
        let mut parked = None;
        if let Some(entry) = entry {
            match self.run(&mut checkpoint, &mut records, entry, &config, now).await {
                Ok(fiber) => parked = fiber,
                Err(err) => {
                    if matches!(err, ProcessingError::FatalEngine(_)) {
                        tracing::error!(flow_id = %flow_id, error = %err, "flow engine failure");
                    }
                    return Err(err);
                }
            }
        }

        checkpoint.updated_at = now;
        let version = match self.store.save(&checkpoint, expected_version).await? {
            SaveResult::Saved { version } => version,
            SaveResult::Conflict { current } => {
                tracing::debug!(flow_id = %flow_id, expected_version, ?current, "checkpoint write lost the race");
                return Err(ProcessingError::Conflict {
                    flow_id,
                    expected: expected_version,
                    current,
                });
            }
        };

        match parked {
            Some((fiber, exec)) => self.fiber_cache.put(version, checkpoint.owner.clone(), exec, fiber),
            None if ran || checkpoint.is_terminal() => self.fiber_cache.remove(flow_id),
            None => self.fiber_cache.advance(flow_id, expected_version, version),
        }

        if !records.is_empty() {
            let count = records.len();
            self.publisher
                .publish(records)
                .await
                .map_err(|source| ProcessingError::Publish { flow_id, source })?;
            tracing::debug!(flow_id = %flow_id, count, "published outbound records");
        }

        Ok(ProcessingOutcome::Committed {
            flow_id,
            version,
            status: checkpoint.status,
        })
    }

    /// Run the fiber until it suspends or terminates. Returns the fiber if
    /// it is left suspended.
    async fn run(
        &self,
        checkpoint: &mut Checkpoint,
        records: &mut Vec<OutboundRecord>,
        entry: Entry,
        config: &FlowConfig,
        now: DateTime<Utc>,
    ) -> Result<Option<Parked>, ProcessingError> {
        let flow_id = checkpoint.flow_id;
        self.provider.validate_not_in_maintenance(&checkpoint.owner)?;
        let exec = self.provider.acquire(&checkpoint.owner).await?;

        checkpoint.set_status(CheckpointStatus::Running)?;
        let mut ctx = FlowContext::from_checkpoint(checkpoint, now);
        let (mut fiber, mut outcome, mut attempt) = match entry {
            Entry::Start(args) => {
                let mut fiber = match FlowFiber::for_flow(&exec, flow_id, &checkpoint.flow_name) {
                    Ok(fiber) => fiber,
                    Err(FiberError::UnknownFlow(name)) => {
                        let outcome = FiberOutcome::Failed(FlowError::UnknownFlow(name));
                        let effects = ctx.take_effects();
                        apply_outcome(checkpoint, records, outcome, effects, Attempt::Start, config, now)?;
                        return Ok(None);
                    }
                    Err(err) => return Err(err.into()),
                };
                let outcome = fiber.start(&exec, &mut ctx, args).await?;
                (fiber, outcome, Attempt::Start)
            }
            Entry::Resume(resumed) => {
                let mut fiber = match self.fiber_cache.take(flow_id, checkpoint.version, &exec) {
                    Some(fiber) => {
                        tracing::debug!(flow_id = %flow_id, "resuming cached fiber");
                        fiber
                    }
                    None => {
                        let continuation = checkpoint
                            .serialized_continuation
                            .as_deref()
                            .ok_or(FiberError::MissingContinuation(flow_id))?;
                        FlowFiber::restore(&exec, flow_id, continuation)?
                    }
                };
                let outcome = fiber.resume(&exec, &mut ctx, resumed.clone()).await?;
                (fiber, outcome, Attempt::Resume(resumed))
            }
        };

        loop {
            let effects = ctx.take_effects();
            match apply_outcome(checkpoint, records, outcome, effects, attempt, config, now)? {
                Next::Done => {
                    return Ok((fiber.state() == FiberState::Suspended).then_some((fiber, exec)));
                }
                Next::Resume(resumed) => {
                    tracing::debug!(flow_id = %flow_id, "resuming flow in place");
                    checkpoint.set_status(CheckpointStatus::Running)?;
                    ctx = FlowContext::from_checkpoint(checkpoint, now);
                    outcome = fiber.resume(&exec, &mut ctx, resumed.clone()).await?;
                    attempt = Attempt::Resume(resumed);
                }
            }
        }
    }
}

fn discarded(flow_id: FlowId, reason: impl Into<String>) -> ProcessingOutcome {
    ProcessingOutcome::Discarded {
        flow_id,
        reason: reason.into(),
    }
}

fn prepare(
    flow_id: FlowId,
    payload: FlowEventPayload,
    checkpoint: Option<Checkpoint>,
    config: Arc<FlowConfig>,
    now: DateTime<Utc>,
) -> Result<Prepared, Rejection> {
    match payload {
        FlowEventPayload::StartFlow(request) => apply(
            &StartFlowHandler,
            FlowEventContext::new(flow_id, request, checkpoint, config, now),
        ),
        FlowEventPayload::Session(event) => apply(
            &SessionEventHandler,
            FlowEventContext::new(flow_id, event, checkpoint, config, now),
        ),
        FlowEventPayload::Wakeup => apply(
            &WakeupHandler,
            FlowEventContext::new(flow_id, WakeupEvent, checkpoint, config, now),
        ),
        FlowEventPayload::Confirmation { count } => apply(
            &ConfirmationHandler,
            FlowEventContext::new(flow_id, ConfirmationEvent { count }, checkpoint, config, now),
        ),
        FlowEventPayload::Failure { reason } => apply(
            &FailureHandler,
            FlowEventContext::new(flow_id, FailureEvent { reason }, checkpoint, config, now),
        ),
    }
}

fn apply<T, H>(handler: &H, mut ctx: FlowEventContext<T>) -> Result<Prepared, Rejection>
where
    H: FlowEventHandler<T>,
{
    let waiting_for = ctx.checkpoint.as_ref().map(|cp| &cp.waiting_for);
    if !handler.accepts(waiting_for) {
        return Err(Rejection::new(format!(
            "{} event does not apply while waiting for {:?}",
            handler.name(),
            waiting_for.map(|w| w.kind())
        )));
    }
    let decision = handler.pre_process(&mut ctx)?;
    let (checkpoint, records) = ctx.into_parts();
    Ok(Prepared {
        checkpoint,
        records,
        decision,
    })
}
