//! Folding a fiber outcome back into the checkpoint.

use crate::config::FlowConfig;
use chrono::{DateTime, Utc};
use flow_core::checkpoint::{CheckpointError, SessionStatus};
use flow_core::context::ContextEffects;
use flow_core::flow::OutboundMessage;
use flow_core::{
    Checkpoint, CheckpointStatus, FiberOutcome, FlowIoRequest, OutboundRecord, Resumed, WaitingFor,
};

/// How the fiber was entered, so a retry can enter it the same way.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Attempt {
    Start,
    Resume(Resumed),
}

/// What the dispatcher should do after an outcome was applied.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Next {
    /// The checkpoint is ready to commit.
    Done,
    /// What the flow waits on is already available; resume it in place.
    Resume(Resumed),
}

pub(crate) fn apply_outcome(
    checkpoint: &mut Checkpoint,
    records: &mut Vec<OutboundRecord>,
    outcome: FiberOutcome,
    effects: ContextEffects,
    attempt: Attempt,
    config: &FlowConfig,
    now: DateTime<Utc>,
) -> Result<Next, CheckpointError> {
    match outcome {
        FiberOutcome::Suspended {
            request,
            continuation,
        } => {
            apply_effects(checkpoint, records, effects)?;
            checkpoint.serialized_continuation = Some(continuation);
            checkpoint.retry_count = 0;
            checkpoint.last_failure_reason = None;
            checkpoint.pending_resume = None;
            suspend(checkpoint, records, request, config, now)
        }
        FiberOutcome::Completed(result) => {
            apply_effects(checkpoint, records, effects)?;
            for session_id in checkpoint.open_sessions() {
                close_session(checkpoint, records, &session_id)?;
            }
            checkpoint.set_status(CheckpointStatus::Completed)?;
            checkpoint.result = Some(result.to_vec());
            checkpoint.waiting_for = WaitingFor::Nothing;
            checkpoint.pending_resume = None;
            tracing::info!(flow_id = %checkpoint.flow_id, flow = %checkpoint.flow_name, "flow completed");
            records.push(OutboundRecord::FlowStatus {
                flow_id: checkpoint.flow_id,
                status: CheckpointStatus::Completed,
                detail: None,
            });
            records.push(OutboundRecord::ScheduleCleanup {
                flow_id: checkpoint.flow_id,
                expires_at: now + config.cleanup_delay(),
            });
            Ok(Next::Done)
        }
        FiberOutcome::Failed(error)
            if error.is_retryable() && checkpoint.retry_count < config.retry.max_retries =>
        {
            checkpoint.set_status(CheckpointStatus::Retrying)?;
            checkpoint.retry_count += 1;
            let at = now + config.retry.backoff(checkpoint.retry_count);
            tracing::warn!(
                flow_id = %checkpoint.flow_id,
                attempt = checkpoint.retry_count,
                %at,
                error = %error,
                "flow failed transiently, scheduling retry"
            );
            checkpoint.last_failure_reason = Some(error.to_string());
            checkpoint.pending_resume = match attempt {
                Attempt::Start => None,
                Attempt::Resume(resumed) => Some(resumed),
            };
            checkpoint.waiting_for = WaitingFor::Wakeup { at };
            records.push(OutboundRecord::ScheduleWakeup {
                flow_id: checkpoint.flow_id,
                at,
            });
            records.push(OutboundRecord::FlowStatus {
                flow_id: checkpoint.flow_id,
                status: CheckpointStatus::Retrying,
                detail: Some(error.to_string()),
            });
            Ok(Next::Done)
        }
        FiberOutcome::Failed(error) => {
            fail_checkpoint(checkpoint, records, &error.to_string(), config, now)?;
            Ok(Next::Done)
        }
    }
}

/// Move a live flow to `Failed`, erroring every session it still has open.
pub(crate) fn fail_checkpoint(
    checkpoint: &mut Checkpoint,
    records: &mut Vec<OutboundRecord>,
    reason: &str,
    config: &FlowConfig,
    now: DateTime<Utc>,
) -> Result<(), CheckpointError> {
    checkpoint.set_status(CheckpointStatus::Failed)?;
    let flow_id = checkpoint.flow_id;
    for session_id in checkpoint.open_sessions() {
        let session = checkpoint.session_mut(&session_id)?;
        session.status = SessionStatus::Errored;
        records.push(OutboundRecord::SessionError {
            flow_id,
            session_id,
            counterparty: session.counterparty.clone(),
            reason: reason.to_string(),
        });
    }
    checkpoint.waiting_for = WaitingFor::Nothing;
    checkpoint.pending_resume = None;
    checkpoint.last_failure_reason = Some(reason.to_string());
    tracing::info!(flow_id = %flow_id, flow = %checkpoint.flow_name, reason, "flow failed");
    records.push(OutboundRecord::FlowStatus {
        flow_id,
        status: CheckpointStatus::Failed,
        detail: Some(reason.to_string()),
    });
    records.push(OutboundRecord::ScheduleCleanup {
        flow_id,
        expires_at: now + config.cleanup_delay(),
    });
    Ok(())
}

fn suspend(
    checkpoint: &mut Checkpoint,
    records: &mut Vec<OutboundRecord>,
    request: FlowIoRequest,
    config: &FlowConfig,
    now: DateTime<Utc>,
) -> Result<Next, CheckpointError> {
    let deadline = config.suspension_timeout().map(|timeout| now + timeout);
    checkpoint.waiting_for = match request {
        FlowIoRequest::Send { messages } => {
            send_all(checkpoint, records, messages)?;
            WaitingFor::Wakeup { at: now }
        }
        FlowIoRequest::SendAndReceive {
            messages,
            receive_from,
        } => {
            send_all(checkpoint, records, messages)?;
            WaitingFor::SessionData {
                sessions: receive_from,
                deadline,
            }
        }
        FlowIoRequest::Receive { sessions } => WaitingFor::SessionData { sessions, deadline },
        FlowIoRequest::Sleep { until } => WaitingFor::Wakeup { at: until },
        FlowIoRequest::WaitForConfirmations { required } => WaitingFor::Confirmations {
            required,
            received: 0,
        },
        FlowIoRequest::ForceCheckpoint => WaitingFor::Wakeup { at: now },
    };

    let wake_at = match &checkpoint.waiting_for {
        WaitingFor::Wakeup { at } => Some(*at),
        WaitingFor::SessionData { deadline, .. } => *deadline,
        _ => None,
    };
    if let Some(at) = wake_at {
        records.push(OutboundRecord::ScheduleWakeup {
            flow_id: checkpoint.flow_id,
            at,
        });
    }
    checkpoint.set_status(CheckpointStatus::Suspended)?;
    tracing::debug!(
        flow_id = %checkpoint.flow_id,
        waiting_for = ?checkpoint.waiting_for.kind(),
        "flow suspended"
    );

    if let WaitingFor::Confirmations { required, received } = checkpoint.waiting_for
        && received >= required
    {
        return Ok(Next::Resume(Resumed::Confirmed {
            confirmations: received,
        }));
    }
    Ok(checkpoint
        .take_ready_messages()
        .map_or(Next::Done, Next::Resume))
}

fn send_all(
    checkpoint: &mut Checkpoint,
    records: &mut Vec<OutboundRecord>,
    messages: Vec<OutboundMessage>,
) -> Result<(), CheckpointError> {
    let flow_id = checkpoint.flow_id;
    for message in messages {
        let session = checkpoint.session_mut(&message.session_id)?;
        let sequence_number = session.take_send_seq();
        records.push(OutboundRecord::SessionData {
            flow_id,
            counterparty: session.counterparty.clone(),
            session_id: message.session_id,
            sequence_number,
            payload: message.payload,
        });
    }
    Ok(())
}

fn apply_effects(
    checkpoint: &mut Checkpoint,
    records: &mut Vec<OutboundRecord>,
    effects: ContextEffects,
) -> Result<(), CheckpointError> {
    for (session_id, counterparty) in effects.initiated {
        checkpoint.add_session(session_id, counterparty);
    }
    for session_id in effects.closed {
        close_session(checkpoint, records, &session_id)?;
    }
    Ok(())
}

fn close_session(
    checkpoint: &mut Checkpoint,
    records: &mut Vec<OutboundRecord>,
    session_id: &flow_core::SessionId,
) -> Result<(), CheckpointError> {
    let flow_id = checkpoint.flow_id;
    let session = checkpoint.session_mut(session_id)?;
    let sequence_number = session.take_send_seq();
    session.status = SessionStatus::Closed;
    records.push(OutboundRecord::SessionClose {
        flow_id,
        session_id: session_id.clone(),
        counterparty: session.counterparty.clone(),
        sequence_number,
    });
    Ok(())
}
