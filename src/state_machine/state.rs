use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::unit::{FailureKind, ResultPayload, UnitStatus, WorkUnit};
use crate::error::PipelineError;

/// A status write requested against a stored work unit.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusUpdate {
    /// Mark the unit running, right before the invoker is called.
    Start,
    /// Terminal success with the produced payload.
    Complete(ResultPayload),
    /// Terminal failure.
    Fail(FailureKind),
}

impl StatusUpdate {
    pub fn status(&self) -> UnitStatus {
        match self {
            StatusUpdate::Start => UnitStatus::Running,
            StatusUpdate::Complete(_) => UnitStatus::Completed,
            StatusUpdate::Fail(_) => UnitStatus::Failed,
        }
    }
}

/// Applies status writes to work units.
///
/// `pending -> running -> completed | failed`, plus `pending -> failed` so a
/// unit that never started can still be superseded. Terminal units accept
/// nothing.
pub struct StateMachine;

impl StateMachine {
    pub fn can_transition(from: UnitStatus, to: UnitStatus) -> bool {
        matches!(
            (from, to),
            (UnitStatus::Pending, UnitStatus::Running)
                | (UnitStatus::Pending, UnitStatus::Failed)
                | (UnitStatus::Running, UnitStatus::Completed)
                | (UnitStatus::Running, UnitStatus::Failed)
        )
    }

    /// Apply `update` to `unit`, refreshing `updated_at`.
    pub fn apply(
        unit: &mut WorkUnit,
        update: StatusUpdate,
        now: DateTime<Utc>,
    ) -> Result<(), PipelineError> {
        let to = update.status();
        if !Self::can_transition(unit.status, to) {
            return Err(PipelineError::InvalidTransition {
                unit_id: unit.id.clone(),
                from: unit.status,
                to,
            });
        }

        match update {
            StatusUpdate::Start => {}
            StatusUpdate::Complete(payload) => unit.result_payload = Some(payload),
            StatusUpdate::Fail(kind) => unit.failure = Some(kind),
        }
        unit.status = to;
        // Keep the liveness signal monotonic even if clocks disagree.
        unit.updated_at = now.max(unit.updated_at);
        Ok(())
    }
}

/// Client-side phase of one stage of one target, as seen by the supervisor.
///
/// Unlike [`UnitStatus`], this includes `Stalled` and `Cancelled`, which are
/// never persisted, and `Retried`, the step between abandoning an attempt and
/// queueing its replacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StagePhase {
    Queued,
    Running,
    Stalled,
    Retried,
    Completed,
    Failed,
    Cancelled,
}

/// Inputs that move a [`StagePhase`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseEvent {
    /// The tracker saw the unit running.
    Started,
    /// The dispatcher returned a terminal unit.
    Finished(UnitStatus),
    /// The tracker flagged the unit as stalled.
    StallDetected,
    /// The caller stopped tracking this stage.
    CancelRequested,
    /// The caller asked for a fresh attempt.
    RetryRequested,
    /// The fresh attempt was created.
    Resubmitted,
}

impl StagePhase {
    /// Next phase for `event`, or `None` if the event does not apply.
    pub fn on(self, event: PhaseEvent) -> Option<StagePhase> {
        use PhaseEvent::*;
        use StagePhase::*;

        match (self, event) {
            (Queued | Running, Started) => Some(Running),
            (Queued | Running, Finished(UnitStatus::Completed)) => Some(Completed),
            // A retry whose resubmission is rejected fails without queueing.
            (Queued | Running | Retried, Finished(UnitStatus::Failed)) => Some(Failed),
            (Running, StallDetected) => Some(Stalled),
            (Queued | Running, CancelRequested) => Some(Cancelled),
            (Stalled | Failed | Cancelled, RetryRequested) => Some(Retried),
            (Retried, Resubmitted) => Some(Queued),
            _ => None,
        }
    }

    /// No further progress will happen without a caller action.
    pub fn is_settled(self) -> bool {
        matches!(
            self,
            StagePhase::Completed | StagePhase::Failed | StagePhase::Stalled | StagePhase::Cancelled
        )
    }

    pub fn is_retryable(self) -> bool {
        self.on(PhaseEvent::RetryRequested).is_some()
    }
}

impl fmt::Display for StagePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StagePhase::Queued => write!(f, "QUEUED"),
            StagePhase::Running => write!(f, "RUNNING"),
            StagePhase::Stalled => write!(f, "STALLED"),
            StagePhase::Retried => write!(f, "RETRIED"),
            StagePhase::Completed => write!(f, "COMPLETED"),
            StagePhase::Failed => write!(f, "FAILED"),
            StagePhase::Cancelled => write!(f, "CANCELLED"),
        }
    }
}
