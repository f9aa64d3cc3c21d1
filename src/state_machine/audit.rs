use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::state::StagePhase;
use super::unit::Stage;

/// Per-stage record of one target's progress, including wall-clock runtime.
///
/// The duration is informational only; nothing in the pipeline branches on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageAudit {
    pub stage: Stage,
    pub unit_id: Option<String>,
    pub phase: StagePhase,
    pub attempts: u32,
    pub submitted_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub error: Option<String>,
    pub findings: Option<usize>,
}

impl StageAudit {
    pub fn new(stage: Stage) -> Self {
        Self {
            stage,
            unit_id: None,
            phase: StagePhase::Queued,
            attempts: 0,
            submitted_at: Utc::now(),
            finished_at: None,
            duration_ms: None,
            error: None,
            findings: None,
        }
    }

    /// Start a new attempt. Clears whatever the previous attempt left behind.
    pub(crate) fn record_submission(&mut self, unit_id: Option<String>, at: DateTime<Utc>) {
        self.unit_id = unit_id;
        self.attempts += 1;
        self.submitted_at = at;
        self.finished_at = None;
        self.duration_ms = None;
        self.error = None;
        self.findings = None;
    }

    pub(crate) fn record_finish(&mut self, at: DateTime<Utc>) {
        self.finished_at = Some(at);
        self.duration_ms = Some((at - self.submitted_at).num_milliseconds());
    }
}

/// Outcome of one target: the primary stage and, once chained, its derived stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetReport {
    pub target: String,
    pub primary: StageAudit,
    pub derived: Option<StageAudit>,
    pub cancelled: bool,
}

impl TargetReport {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            primary: StageAudit::new(Stage::Primary),
            derived: None,
            cancelled: false,
        }
    }

    pub fn stage(&self, stage: Stage) -> Option<&StageAudit> {
        match stage {
            Stage::Primary => Some(&self.primary),
            Stage::Derived => self.derived.as_ref(),
        }
    }

    /// Mutable audit for `stage`, opening the derived record on first use.
    pub(crate) fn stage_entry(&mut self, stage: Stage) -> &mut StageAudit {
        match stage {
            Stage::Primary => &mut self.primary,
            Stage::Derived => self
                .derived
                .get_or_insert_with(|| StageAudit::new(Stage::Derived)),
        }
    }

    /// The furthest stage reached so far.
    pub fn current_stage(&self) -> Stage {
        if self.derived.is_some() {
            Stage::Derived
        } else {
            Stage::Primary
        }
    }

    pub fn is_settled(&self) -> bool {
        self.primary.phase.is_settled()
            && self.derived.as_ref().is_none_or(|d| d.phase.is_settled())
    }

    /// Primary and (if chained) derived stages both completed.
    pub fn is_completed(&self) -> bool {
        self.primary.phase == StagePhase::Completed
            && self
                .derived
                .as_ref()
                .is_none_or(|d| d.phase == StagePhase::Completed)
    }
}

/// Snapshot of a whole run across all of its targets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub parent_id: String,
    pub model_id: String,
    pub started_at: DateTime<Utc>,
    pub generated_at: DateTime<Utc>,
    pub targets: Vec<TargetReport>,
}

impl RunReport {
    pub fn target(&self, target: &str) -> Option<&TargetReport> {
        self.targets.iter().find(|t| t.target == target)
    }

    pub fn is_settled(&self) -> bool {
        self.targets.iter().all(TargetReport::is_settled)
    }

    pub fn all_completed(&self) -> bool {
        self.targets.iter().all(TargetReport::is_completed)
    }

    pub fn count_in_phase(&self, phase: StagePhase) -> usize {
        self.targets
            .iter()
            .filter(|t| {
                let current = t.stage(t.current_stage()).map(|s| s.phase);
                current == Some(phase)
            })
            .count()
    }
}
