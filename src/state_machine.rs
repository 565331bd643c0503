//! Transition tables for the three status columns.  Every machine exposes the
//! same non-strict semantics: applying an event returns `Some(next)` when the
//! transition is defined for the current state and `None` otherwise, leaving
//! the caller to persist the change (or not) and report failure.

use crate::twilio_types::CallStatus;

pub struct Transition<S: 'static, E> {
    pub event: E,
    pub from: &'static [S],
    pub to: S,
}

fn attempt<S, E>(table: &[Transition<S, E>], current: S, event: E) -> Option<S>
where
    S: Copy + PartialEq,
    E: Copy + PartialEq,
{
    table
        .iter()
        .find(|t| t.event == event && t.from.contains(&current))
        .map(|t| t.to)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalloutStatus {
    Initialized,
    Running,
    Paused,
    Stopped,
}

impl CalloutStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CalloutStatus::Initialized => "initialized",
            CalloutStatus::Running => "running",
            CalloutStatus::Paused => "paused",
            CalloutStatus::Stopped => "stopped",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "initialized" => Some(CalloutStatus::Initialized),
            "running" => Some(CalloutStatus::Running),
            "paused" => Some(CalloutStatus::Paused),
            "stopped" => Some(CalloutStatus::Stopped),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalloutEvent {
    Start,
    Pause,
    Resume,
    Stop,
}

const CALLOUT_TRANSITIONS: &[Transition<CalloutStatus, CalloutEvent>] = &[
    Transition {
        event: CalloutEvent::Start,
        from: &[CalloutStatus::Initialized],
        to: CalloutStatus::Running,
    },
    Transition {
        event: CalloutEvent::Pause,
        from: &[CalloutStatus::Running],
        to: CalloutStatus::Paused,
    },
    Transition {
        event: CalloutEvent::Resume,
        from: &[CalloutStatus::Paused, CalloutStatus::Stopped],
        to: CalloutStatus::Running,
    },
    Transition {
        event: CalloutEvent::Stop,
        from: &[CalloutStatus::Running, CalloutStatus::Paused],
        to: CalloutStatus::Stopped,
    },
];

impl CalloutEvent {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "start" => Some(CalloutEvent::Start),
            "pause" => Some(CalloutEvent::Pause),
            "resume" => Some(CalloutEvent::Resume),
            "stop" => Some(CalloutEvent::Stop),
            _ => None,
        }
    }

    pub fn apply(self, current: CalloutStatus) -> Option<CalloutStatus> {
        attempt(CALLOUT_TRANSITIONS, current, self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOperationStatus {
    Preview,
    Queued,
    Running,
    Finished,
}

impl BatchOperationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BatchOperationStatus::Preview => "preview",
            BatchOperationStatus::Queued => "queued",
            BatchOperationStatus::Running => "running",
            BatchOperationStatus::Finished => "finished",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "preview" => Some(BatchOperationStatus::Preview),
            "queued" => Some(BatchOperationStatus::Queued),
            "running" => Some(BatchOperationStatus::Running),
            "finished" => Some(BatchOperationStatus::Finished),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOperationEvent {
    Queue,
    Start,
    Finish,
    Requeue,
}

const BATCH_OPERATION_TRANSITIONS: &[Transition<BatchOperationStatus, BatchOperationEvent>] = &[
    Transition {
        event: BatchOperationEvent::Queue,
        from: &[BatchOperationStatus::Preview],
        to: BatchOperationStatus::Queued,
    },
    Transition {
        event: BatchOperationEvent::Start,
        from: &[BatchOperationStatus::Queued],
        to: BatchOperationStatus::Running,
    },
    Transition {
        event: BatchOperationEvent::Finish,
        from: &[BatchOperationStatus::Running],
        to: BatchOperationStatus::Finished,
    },
    Transition {
        event: BatchOperationEvent::Requeue,
        from: &[BatchOperationStatus::Finished],
        to: BatchOperationStatus::Queued,
    },
];

impl BatchOperationEvent {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "queue" => Some(BatchOperationEvent::Queue),
            "start" => Some(BatchOperationEvent::Start),
            "finish" => Some(BatchOperationEvent::Finish),
            "requeue" => Some(BatchOperationEvent::Requeue),
            _ => None,
        }
    }

    pub fn apply(self, current: BatchOperationStatus) -> Option<BatchOperationStatus> {
        attempt(BATCH_OPERATION_TRANSITIONS, current, self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhoneCallStatus {
    Created,
    Queued,
    RemotelyQueued,
    InProgress,
    Completed,
    Busy,
    Failed,
    NotAnswered,
    Canceled,
    Errored,
}

impl PhoneCallStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PhoneCallStatus::Created => "created",
            PhoneCallStatus::Queued => "queued",
            PhoneCallStatus::RemotelyQueued => "remotely_queued",
            PhoneCallStatus::InProgress => "in_progress",
            PhoneCallStatus::Completed => "completed",
            PhoneCallStatus::Busy => "busy",
            PhoneCallStatus::Failed => "failed",
            PhoneCallStatus::NotAnswered => "not_answered",
            PhoneCallStatus::Canceled => "canceled",
            PhoneCallStatus::Errored => "errored",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "created" => Some(PhoneCallStatus::Created),
            "queued" => Some(PhoneCallStatus::Queued),
            "remotely_queued" => Some(PhoneCallStatus::RemotelyQueued),
            "in_progress" => Some(PhoneCallStatus::InProgress),
            "completed" => Some(PhoneCallStatus::Completed),
            "busy" => Some(PhoneCallStatus::Busy),
            "failed" => Some(PhoneCallStatus::Failed),
            "not_answered" => Some(PhoneCallStatus::NotAnswered),
            "canceled" => Some(PhoneCallStatus::Canceled),
            "errored" => Some(PhoneCallStatus::Errored),
            _ => None,
        }
    }

    /// Terminal states are never left by a remote status update.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PhoneCallStatus::Completed
                | PhoneCallStatus::Busy
                | PhoneCallStatus::Failed
                | PhoneCallStatus::NotAnswered
                | PhoneCallStatus::Canceled
                | PhoneCallStatus::Errored
        )
    }
}

/// The target status a provider-reported call status maps onto.
pub fn status_for_remote(remote: CallStatus) -> PhoneCallStatus {
    match remote {
        CallStatus::Queued => PhoneCallStatus::RemotelyQueued,
        CallStatus::Ringing | CallStatus::InProgress => PhoneCallStatus::InProgress,
        CallStatus::Completed => PhoneCallStatus::Completed,
        CallStatus::Busy => PhoneCallStatus::Busy,
        CallStatus::Failed => PhoneCallStatus::Failed,
        CallStatus::NoAnswer => PhoneCallStatus::NotAnswered,
        CallStatus::Canceled => PhoneCallStatus::Canceled,
    }
}

/// Webhook-driven transition.  Returns `Some(next)` when the row should be
/// updated; `None` when the update would be a no-op (identical status) or is
/// not permitted (the call already reached a terminal state).  Re-delivery of
/// the same provider event is therefore idempotent at the status level.
pub fn remote_transition(current: PhoneCallStatus, remote: CallStatus) -> Option<PhoneCallStatus> {
    let target = status_for_remote(remote);
    if current == target || current.is_terminal() {
        return None;
    }
    Some(target)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn callout_happy_path() {
        let status = CalloutEvent::Start.apply(CalloutStatus::Initialized);
        assert_eq!(status, Some(CalloutStatus::Running));
        let status = CalloutEvent::Pause.apply(status.unwrap());
        assert_eq!(status, Some(CalloutStatus::Paused));
        let status = CalloutEvent::Resume.apply(status.unwrap());
        assert_eq!(status, Some(CalloutStatus::Running));
        let status = CalloutEvent::Stop.apply(status.unwrap());
        assert_eq!(status, Some(CalloutStatus::Stopped));
        assert_eq!(
            CalloutEvent::Resume.apply(status.unwrap()),
            Some(CalloutStatus::Running)
        );
    }

    #[test]
    fn invalid_callout_transition_is_rejected() {
        assert_eq!(CalloutEvent::Pause.apply(CalloutStatus::Initialized), None);
        assert_eq!(CalloutEvent::Start.apply(CalloutStatus::Running), None);
        assert_eq!(CalloutEvent::Stop.apply(CalloutStatus::Initialized), None);
    }

    #[test]
    fn batch_operation_requeue_cycle() {
        let status = BatchOperationEvent::Queue.apply(BatchOperationStatus::Preview);
        assert_eq!(status, Some(BatchOperationStatus::Queued));
        let status = BatchOperationEvent::Start.apply(status.unwrap());
        assert_eq!(status, Some(BatchOperationStatus::Running));
        let status = BatchOperationEvent::Finish.apply(status.unwrap());
        assert_eq!(status, Some(BatchOperationStatus::Finished));
        // requeue re-enters the queue from finished, and only from finished
        assert_eq!(
            BatchOperationEvent::Requeue.apply(status.unwrap()),
            Some(BatchOperationStatus::Queued)
        );
        assert_eq!(
            BatchOperationEvent::Requeue.apply(BatchOperationStatus::Running),
            None
        );
    }

    #[test]
    fn queuing_a_queued_operation_is_rejected() {
        assert_eq!(
            BatchOperationEvent::Queue.apply(BatchOperationStatus::Queued),
            None
        );
        assert_eq!(
            BatchOperationEvent::Queue.apply(BatchOperationStatus::Finished),
            None
        );
    }

    #[test]
    fn remote_status_updates_map_onto_call_statuses() {
        assert_eq!(
            remote_transition(PhoneCallStatus::RemotelyQueued, CallStatus::Ringing),
            Some(PhoneCallStatus::InProgress)
        );
        assert_eq!(
            remote_transition(PhoneCallStatus::InProgress, CallStatus::Completed),
            Some(PhoneCallStatus::Completed)
        );
        assert_eq!(
            remote_transition(PhoneCallStatus::RemotelyQueued, CallStatus::NoAnswer),
            Some(PhoneCallStatus::NotAnswered)
        );
    }

    #[test]
    fn duplicate_remote_status_update_is_a_no_op() {
        assert_eq!(
            remote_transition(PhoneCallStatus::InProgress, CallStatus::InProgress),
            None
        );
        assert_eq!(
            remote_transition(PhoneCallStatus::Completed, CallStatus::Completed),
            None
        );
    }

    #[test]
    fn terminal_calls_are_never_reopened() {
        assert_eq!(
            remote_transition(PhoneCallStatus::Completed, CallStatus::Ringing),
            None
        );
        assert_eq!(
            remote_transition(PhoneCallStatus::Failed, CallStatus::Completed),
            None
        );
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            CalloutStatus::Initialized,
            CalloutStatus::Running,
            CalloutStatus::Paused,
            CalloutStatus::Stopped,
        ] {
            assert_eq!(CalloutStatus::from_str(status.as_str()), Some(status));
        }
        assert_eq!(CalloutStatus::from_str("bogus"), None);
    }
}
