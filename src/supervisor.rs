//! Per-parent supervisor task.
//!
//! Owns every target's [`TargetReport`] for one run. Stage tasks, tracker
//! events and caller commands all funnel into a single `select!` loop, so the
//! reports are only ever touched from this task.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::ProofreadMode;
use crate::dispatcher::Dispatcher;
use crate::error::{PipelineError, Result};
use crate::orchestrator::{PipelineEvent, RunSettings};
use crate::state_machine::{
    FailureKind, PhaseEvent, ResultPayload, RunReport, Stage, StagePhase, TargetReport,
    UnitStatus, WorkUnit,
};
use crate::task::{SourceInput, StageRequest, TaskKind};
use crate::tracker::{TrackerEvent, TrackerHandle};

#[derive(Debug)]
pub(crate) enum SupervisorCommand {
    Retry {
        target: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Cancel {
        target: String,
        reply: oneshot::Sender<Result<()>>,
    },
}

/// What a stage task sends back when its unit is done.
struct StageOutcome {
    index: usize,
    stage: Stage,
    unit_id: String,
    result: Result<WorkUnit>,
}

pub(crate) struct Supervisor {
    parent_id: String,
    model_id: String,
    source: SourceInput,
    settings: RunSettings,
    dispatcher: Arc<Dispatcher>,
    tracker: TrackerHandle,
    events: broadcast::Sender<PipelineEvent>,
    targets: Vec<TargetReport>,
    /// Completed primary (unit id, text) per target, input of the derived stage.
    primaries: HashMap<usize, (String, String)>,
    outcome_tx: mpsc::UnboundedSender<StageOutcome>,
    outcome_rx: mpsc::UnboundedReceiver<StageOutcome>,
    started_at: DateTime<Utc>,
    announced: bool,
}

impl Supervisor {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        parent_id: String,
        model_id: String,
        source: SourceInput,
        targets: Vec<String>,
        settings: RunSettings,
        dispatcher: Arc<Dispatcher>,
        tracker: TrackerHandle,
        events: broadcast::Sender<PipelineEvent>,
    ) -> Self {
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        Self {
            parent_id,
            model_id,
            source,
            settings,
            dispatcher,
            tracker,
            events,
            targets: targets.into_iter().map(TargetReport::new).collect(),
            primaries: HashMap::new(),
            outcome_tx,
            outcome_rx,
            started_at: Utc::now(),
            announced: false,
        }
    }

    /// Drive the run until commands are closed and every target has settled.
    pub(crate) async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<SupervisorCommand>,
    ) -> RunReport {
        for index in 0..self.targets.len() {
            self.start_stage(index, Stage::Primary).await;
        }
        self.tracker.wake();

        let mut accepting = true;
        loop {
            self.announce_if_settled();
            if !accepting && self.is_settled() {
                break;
            }

            tokio::select! {
                Some(outcome) = self.outcome_rx.recv() => self.on_outcome(outcome).await,
                Some(event) = self.tracker.next_event() => self.on_tracker_event(event),
                command = commands.recv(), if accepting => match command {
                    Some(command) => self.on_command(command).await,
                    None => accepting = false,
                },
                else => break,
            }
        }

        let report = self.report();
        info!(
            parent_id = %self.parent_id,
            completed = report.targets.iter().filter(|t| t.is_completed()).count(),
            targets = report.targets.len(),
            elapsed_ms = (report.generated_at - report.started_at).num_milliseconds(),
            "run finished"
        );
        self.tracker.stop();
        report
    }

    fn is_settled(&self) -> bool {
        self.targets.iter().all(TargetReport::is_settled)
    }

    fn report(&self) -> RunReport {
        RunReport {
            parent_id: self.parent_id.clone(),
            model_id: self.model_id.clone(),
            started_at: self.started_at,
            generated_at: Utc::now(),
            targets: self.targets.clone(),
        }
    }

    fn emit(&self, event: PipelineEvent) {
        // No subscribers is fine; the report still records everything.
        let _ = self.events.send(event);
    }

    fn announce_if_settled(&mut self) {
        if self.announced || !self.is_settled() {
            return;
        }
        self.announced = true;
        let report = self.report();
        info!(
            parent_id = %self.parent_id,
            completed = report.count_in_phase(StagePhase::Completed),
            failed = report.count_in_phase(StagePhase::Failed),
            stalled = report.count_in_phase(StagePhase::Stalled),
            cancelled = report.count_in_phase(StagePhase::Cancelled),
            "run settled"
        );
        self.emit(PipelineEvent::Settled { report });
    }

    fn stage_request(&self, index: usize, stage: Stage) -> Option<StageRequest> {
        let target = self.targets[index].target.clone();
        match stage {
            Stage::Primary => Some(StageRequest {
                parent_id: self.parent_id.clone(),
                target,
                model_id: self.model_id.clone(),
                task: self.source.primary_task(),
                input: self.source.clone(),
                derived_from: None,
            }),
            Stage::Derived => {
                let task = match self.settings.proofread {
                    ProofreadMode::Off => return None,
                    ProofreadMode::Rewrite => TaskKind::Proofread,
                    ProofreadMode::Rules => TaskKind::RuleProofread,
                };
                let (primary_id, text) = self.primaries.get(&index)?;
                Some(StageRequest {
                    parent_id: self.parent_id.clone(),
                    target,
                    model_id: self
                        .settings
                        .proofread_model
                        .clone()
                        .unwrap_or_else(|| self.model_id.clone()),
                    task,
                    input: SourceInput::Text(text.clone()),
                    derived_from: Some(primary_id.clone()),
                })
            }
        }
    }

    /// Create the unit for a stage and hand it to its own task.
    async fn start_stage(&mut self, index: usize, stage: Stage) {
        let Some(request) = self.stage_request(index, stage) else {
            return;
        };
        let target = request.target.clone();
        let now = Utc::now();

        match self.dispatcher.begin(&request).await {
            Ok(unit) => {
                let audit = self.targets[index].stage_entry(stage);
                audit.record_submission(Some(unit.id.clone()), now);
                if let Some(next) = audit.phase.on(PhaseEvent::Resubmitted) {
                    audit.phase = next;
                }
                self.emit(PipelineEvent::Queued {
                    target,
                    stage,
                    unit_id: unit.id.clone(),
                });
                self.spawn_stage(index, stage, unit, request);
            }
            Err(e) => {
                warn!(parent_id = %self.parent_id, target = %target, %stage, error = %e, "stage submission rejected");
                let audit = self.targets[index].stage_entry(stage);
                audit.record_submission(None, now);
                audit.phase = StagePhase::Failed;
                audit.error = Some(e.to_string());
                audit.record_finish(now);
                self.emit(PipelineEvent::Failed {
                    target,
                    stage,
                    unit_id: None,
                    error: e.to_string(),
                });
            }
        }
    }

    /// The inner task isolates panics: whatever happens, one outcome is sent.
    fn spawn_stage(&self, index: usize, stage: Stage, unit: WorkUnit, request: StageRequest) {
        let dispatcher = Arc::clone(&self.dispatcher);
        let outcomes = self.outcome_tx.clone();
        let unit_id = unit.id.clone();

        tokio::spawn(async move {
            let work = tokio::spawn(async move { dispatcher.execute(unit, &request).await });
            let result = match work.await {
                Ok(result) => result,
                Err(e) => Err(PipelineError::Internal(format!("stage task failed: {e}"))),
            };
            let _ = outcomes.send(StageOutcome {
                index,
                stage,
                unit_id,
                result,
            });
        });
    }

    async fn on_outcome(&mut self, outcome: StageOutcome) {
        let StageOutcome {
            index,
            stage,
            unit_id,
            result,
        } = outcome;

        let current = self.targets[index]
            .stage(stage)
            .and_then(|audit| audit.unit_id.as_deref());
        if current != Some(unit_id.as_str()) {
            debug!(unit_id = %unit_id, "outcome of a replaced attempt ignored");
            return;
        }

        let unit = match result {
            Ok(unit) => unit,
            Err(e) => {
                warn!(unit_id = %unit_id, error = %e, "stage ended without a terminal write");
                if let Err(err) = self
                    .dispatcher
                    .abandon(&unit_id, FailureKind::internal(e.to_string()))
                    .await
                {
                    debug!(unit_id = %unit_id, error = %err, "unit already terminal");
                }
                self.finish_stage(index, stage, UnitStatus::Failed, Some(e.to_string()), None);
                return;
            }
        };

        if unit.status != UnitStatus::Completed {
            let error = unit
                .failure
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_else(|| format!("unit ended {}", unit.status));
            self.finish_stage(index, stage, UnitStatus::Failed, Some(error), None);
            return;
        }

        let findings = unit
            .result_payload
            .as_ref()
            .and_then(ResultPayload::finding_count);
        if !self.finish_stage(index, stage, UnitStatus::Completed, None, findings) {
            return;
        }

        if stage == Stage::Primary {
            match unit.output_text() {
                Some(text) => {
                    self.primaries
                        .insert(index, (unit.id.clone(), text.to_string()));
                    self.start_stage(index, Stage::Derived).await;
                    self.tracker.wake();
                }
                None => debug!(unit_id = %unit.id, "primary produced no text, nothing to chain"),
            }
        }
    }

    /// Apply a stage's terminal outcome. `false` if the phase no longer accepts it
    /// (the caller cancelled or retried in the meantime).
    fn finish_stage(
        &mut self,
        index: usize,
        stage: Stage,
        status: UnitStatus,
        error: Option<String>,
        findings: Option<usize>,
    ) -> bool {
        let target = self.targets[index].target.clone();
        let audit = self.targets[index].stage_entry(stage);
        let Some(next) = audit.phase.on(PhaseEvent::Finished(status)) else {
            debug!(target = %target, %stage, phase = %audit.phase, "late outcome ignored");
            return false;
        };

        audit.phase = next;
        audit.error = error.clone();
        audit.findings = findings;
        audit.record_finish(Utc::now());
        let unit_id = audit.unit_id.clone();
        let duration_ms = audit.duration_ms.unwrap_or_default();

        let event = match status {
            UnitStatus::Completed => {
                info!(target = %target, %stage, duration_ms, "stage completed");
                PipelineEvent::Completed {
                    target,
                    stage,
                    unit_id: unit_id.unwrap_or_default(),
                    duration_ms,
                    findings,
                }
            }
            _ => {
                warn!(target = %target, %stage, duration_ms, error = ?error, "stage failed");
                PipelineEvent::Failed {
                    target,
                    stage,
                    unit_id,
                    error: error.unwrap_or_default(),
                }
            }
        };
        self.emit(event);
        true
    }

    fn locate(&self, unit_id: &str) -> Option<(usize, Stage)> {
        self.targets.iter().enumerate().find_map(|(index, report)| {
            [Stage::Primary, Stage::Derived].into_iter().find_map(|stage| {
                report
                    .stage(stage)
                    .filter(|audit| audit.unit_id.as_deref() == Some(unit_id))
                    .map(|_| (index, stage))
            })
        })
    }

    fn on_tracker_event(&mut self, event: TrackerEvent) {
        let (unit_id, phase_event, idle_ms) = match event {
            TrackerEvent::Running { unit_id, .. } => (unit_id, PhaseEvent::Started, None),
            TrackerEvent::Stalled {
                unit_id, idle_ms, ..
            } => (unit_id, PhaseEvent::StallDetected, Some(idle_ms)),
            // Outcomes arrive from the stage tasks themselves.
            TrackerEvent::Terminal { .. } | TrackerEvent::Idle => return,
        };

        // Units from other runs of the same parent are not ours.
        let Some((index, stage)) = self.locate(&unit_id) else {
            return;
        };
        let target = self.targets[index].target.clone();
        let audit = self.targets[index].stage_entry(stage);
        let Some(next) = audit.phase.on(phase_event) else {
            return;
        };
        if next == audit.phase {
            return;
        }
        audit.phase = next;

        let event = match idle_ms {
            Some(idle_ms) => PipelineEvent::Stalled {
                target,
                stage,
                unit_id,
                idle_ms,
            },
            None => PipelineEvent::Running {
                target,
                stage,
                unit_id,
            },
        };
        self.emit(event);
    }

    async fn on_command(&mut self, command: SupervisorCommand) {
        match command {
            SupervisorCommand::Retry { target, reply } => {
                let result = self.retry(&target).await;
                let _ = reply.send(result);
            }
            SupervisorCommand::Cancel { target, reply } => {
                let result = self.cancel(&target);
                let _ = reply.send(result);
            }
        }
    }

    fn index_of(&self, target: &str) -> Result<usize> {
        self.targets
            .iter()
            .position(|t| t.target == target)
            .ok_or_else(|| PipelineError::UnknownTarget(target.to_string()))
    }

    async fn retry(&mut self, target: &str) -> Result<()> {
        let index = self.index_of(target)?;
        let report = &self.targets[index];
        let stage = if report.derived.as_ref().is_some_and(|d| d.phase.is_retryable()) {
            Stage::Derived
        } else if report.primary.phase.is_retryable() {
            Stage::Primary
        } else {
            return Err(PipelineError::InvalidCommand(format!(
                "target `{target}` has no failed, stalled or cancelled stage"
            )));
        };

        let audit = self.targets[index].stage_entry(stage);
        audit.phase = audit
            .phase
            .on(PhaseEvent::RetryRequested)
            .unwrap_or(StagePhase::Retried);
        let previous = audit.unit_id.clone();
        info!(parent_id = %self.parent_id, target = %target, %stage, attempt = audit.attempts + 1, "retrying stage");
        self.emit(PipelineEvent::Retried {
            target: target.to_string(),
            stage,
        });

        // A stalled or cancelled attempt still holds the single-flight slot.
        if let Some(previous) = previous {
            match self.dispatcher.supersede(&previous).await {
                Ok(_) | Err(PipelineError::InvalidTransition { .. }) => {}
                Err(e) => warn!(unit_id = %previous, error = %e, "could not supersede previous attempt"),
            }
            self.tracker.resume(previous);
        }

        if stage == Stage::Primary {
            self.targets[index].derived = None;
            self.primaries.remove(&index);
        }
        self.targets[index].cancelled = false;
        self.announced = false;

        self.start_stage(index, stage).await;
        self.tracker.wake();
        Ok(())
    }

    /// Cooperative: the model call runs on, but its result is not chained.
    fn cancel(&mut self, target: &str) -> Result<()> {
        let index = self.index_of(target)?;
        let stage = self.targets[index].current_stage();
        let audit = self.targets[index].stage_entry(stage);
        let next = audit.phase.on(PhaseEvent::CancelRequested).ok_or_else(|| {
            PipelineError::InvalidCommand(format!("target `{target}` is not in flight"))
        })?;
        audit.phase = next;
        audit.record_finish(Utc::now());
        self.targets[index].cancelled = true;

        info!(parent_id = %self.parent_id, target = %target, %stage, "stage cancelled");
        self.emit(PipelineEvent::Cancelled {
            target: target.to_string(),
            stage,
        });
        Ok(())
    }
}
