use super::{FlowEventHandler, Rejection, RunDecision};
use crate::pipeline::context::FlowEventContext;
use bytes::Bytes;
use flow_core::flow::{SessionFailure, SessionFailureReason};
use flow_core::{CheckpointStatus, OutboundRecord, Resumed, WaitingFor};

/// A timer fired for the flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WakeupEvent;

/// Resumes sleeping flows, re-runs flows waiting out a retry backoff and
/// times out session waits that passed their deadline.
///
/// A wake-up that arrives before the flow is due changes nothing but asks
/// for a fresh timer, so a clock skew between the timer and the dispatcher
/// never strands a flow.
pub struct WakeupHandler;

impl FlowEventHandler<WakeupEvent> for WakeupHandler {
    fn name(&self) -> &'static str {
        "wakeup"
    }

    fn accepts(&self, waiting_for: Option<&WaitingFor>) -> bool {
        matches!(
            waiting_for,
            Some(WaitingFor::Wakeup { .. } | WaitingFor::SessionData { deadline: Some(_), .. })
        )
    }

    fn pre_process(&self, ctx: &mut FlowEventContext<WakeupEvent>) -> Result<RunDecision, Rejection> {
        let now = ctx.now;
        let checkpoint = ctx.checkpoint_mut()?;
        let due = match &checkpoint.waiting_for {
            WaitingFor::Wakeup { at } => Some(*at),
            WaitingFor::SessionData { deadline, .. } => *deadline,
            _ => None,
        };
        if let Some(at) = due
            && now < at
        {
            // The timer that fired is gone; arm a new one for the real due time.
            let flow_id = checkpoint.flow_id;
            tracing::debug!(flow_id = %flow_id, at = %at, "wakeup arrived early, re-arming");
            ctx.emit(OutboundRecord::ScheduleWakeup { flow_id, at });
            return Ok(RunDecision::Skip);
        }

        match &checkpoint.waiting_for {
            WaitingFor::Wakeup { .. } => {
                if checkpoint.status != CheckpointStatus::Retrying {
                    return Ok(RunDecision::Resume(Resumed::Wakeup));
                }

                tracing::debug!(
                    flow_id = %checkpoint.flow_id,
                    attempt = checkpoint.retry_count,
                    "retrying flow after backoff"
                );
                if let Some(resumed) = checkpoint.pending_resume.take() {
                    Ok(RunDecision::Resume(resumed))
                } else if checkpoint.serialized_continuation.is_none() {
                    let args = checkpoint.start_args.clone().unwrap_or_default();
                    Ok(RunDecision::Start {
                        args: Bytes::from(args),
                    })
                } else {
                    Err(Rejection::new("retrying flow has nothing to resume with"))
                }
            }
            WaitingFor::SessionData {
                sessions,
                deadline: Some(_),
            } => {
                let late = sessions.iter().find(|id| {
                    checkpoint
                        .sessions
                        .get(*id)
                        .is_none_or(|s| !s.pending.contains_key(&s.next_receive_seq))
                });
                let session_id = late
                    .or_else(|| sessions.first())
                    .cloned()
                    .ok_or_else(|| Rejection::new("session wait names no sessions"))?;
                Ok(RunDecision::Resume(Resumed::SessionFailed(SessionFailure {
                    session_id,
                    reason: SessionFailureReason::TimedOut,
                })))
            }
            _ => Err(Rejection::new("flow is not waiting on a timer")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::handlers::test_support::{context, suspended};
    use chrono::{Duration, Utc};

    #[test]
    fn test_accepts_timed_waits() {
        let handler = WakeupHandler;
        let now = Utc::now();
        assert!(handler.accepts(Some(&WaitingFor::Wakeup { at: now })));
        assert!(handler.accepts(Some(&WaitingFor::SessionData {
            sessions: vec!["s1".into()],
            deadline: Some(now),
        })));
        assert!(!handler.accepts(Some(&WaitingFor::SessionData {
            sessions: vec!["s1".into()],
            deadline: None,
        })));
        assert!(!handler.accepts(None));
    }

    #[test]
    fn test_due_sleep_resumes() {
        let now = Utc::now();
        let cp = suspended(WaitingFor::Wakeup { at: now });
        let mut ctx = context(WakeupEvent, Some(cp), now + Duration::seconds(1));
        assert_eq!(
            WakeupHandler.pre_process(&mut ctx).unwrap(),
            RunDecision::Resume(Resumed::Wakeup)
        );
    }

    #[test]
    fn test_early_wakeup_rearms_timer() {
        let now = Utc::now();
        let at = now + Duration::minutes(5);
        let cp = suspended(WaitingFor::Wakeup { at });
        let flow_id = cp.flow_id;
        let mut ctx = context(WakeupEvent, Some(cp.clone()), now);
        assert_eq!(WakeupHandler.pre_process(&mut ctx).unwrap(), RunDecision::Skip);
        assert_eq!(
            ctx.output_records,
            vec![OutboundRecord::ScheduleWakeup { flow_id, at }]
        );
        assert_eq!(ctx.checkpoint.unwrap(), cp);
    }

    #[test]
    fn test_early_session_timeout_rearms_timer() {
        let now = Utc::now();
        let deadline = now + Duration::seconds(30);
        let cp = suspended(WaitingFor::SessionData {
            sessions: vec!["s1".into()],
            deadline: Some(deadline),
        });
        let flow_id = cp.flow_id;
        let mut ctx = context(WakeupEvent, Some(cp), now);
        assert_eq!(WakeupHandler.pre_process(&mut ctx).unwrap(), RunDecision::Skip);
        assert_eq!(
            ctx.output_records,
            vec![OutboundRecord::ScheduleWakeup { flow_id, at: deadline }]
        );
    }

    #[test]
    fn test_retry_replays_pending_resume() {
        let now = Utc::now();
        let mut cp = suspended(WaitingFor::Nothing);
        cp.set_status(CheckpointStatus::Running).unwrap();
        cp.set_status(CheckpointStatus::Retrying).unwrap();
        cp.waiting_for = WaitingFor::Wakeup { at: now };
        cp.pending_resume = Some(Resumed::Confirmed { confirmations: 2 });
        let mut ctx = context(WakeupEvent, Some(cp), now);
        assert_eq!(
            WakeupHandler.pre_process(&mut ctx).unwrap(),
            RunDecision::Resume(Resumed::Confirmed { confirmations: 2 })
        );
        assert!(ctx.checkpoint.unwrap().pending_resume.is_none());
    }

    #[test]
    fn test_retry_of_failed_start_restarts() {
        let now = Utc::now();
        let mut cp = suspended(WaitingFor::Nothing);
        cp.serialized_continuation = None;
        cp.start_args = Some(b"7".to_vec());
        cp.set_status(CheckpointStatus::Running).unwrap();
        cp.set_status(CheckpointStatus::Retrying).unwrap();
        cp.waiting_for = WaitingFor::Wakeup { at: now };
        let mut ctx = context(WakeupEvent, Some(cp), now);
        assert_eq!(
            WakeupHandler.pre_process(&mut ctx).unwrap(),
            RunDecision::Start {
                args: Bytes::from_static(b"7")
            }
        );
    }

    #[test]
    fn test_expired_session_wait_times_out() {
        let now = Utc::now();
        let cp = suspended(WaitingFor::SessionData {
            sessions: vec!["s1".into()],
            deadline: Some(now),
        });
        let mut ctx = context(WakeupEvent, Some(cp), now);
        assert_eq!(
            WakeupHandler.pre_process(&mut ctx).unwrap(),
            RunDecision::Resume(Resumed::SessionFailed(SessionFailure {
                session_id: "s1".into(),
                reason: SessionFailureReason::TimedOut,
            }))
        );
    }
}
