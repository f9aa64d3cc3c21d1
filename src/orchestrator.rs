//! Fans a parent out across targets and chains proofreading onto each result.
//!
//! [`Orchestrator::run`] validates the request and hands it to a per-parent
//! supervisor task. The caller gets a [`RunHandle`]: an event stream plus
//! retry/cancel commands and the final [`RunReport`].

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{MultigenConfig, ProofreadMode};
use crate::dispatcher::{Dispatcher, validate_target};
use crate::error::{PipelineError, Result};
use crate::state_machine::{RunReport, Stage};
use crate::supervisor::{Supervisor, SupervisorCommand};
use crate::task::SourceInput;
use crate::tracker::{PollConfig, StatusTracker};

/// Per-run behaviour taken from configuration.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub poll: PollConfig,
    pub proofread: ProofreadMode,
    /// Model for the derived stage; the run's model when `None`.
    pub proofread_model: Option<String>,
    pub max_targets: usize,
    pub event_buffer: usize,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self::from(&MultigenConfig::default())
    }
}

impl From<&MultigenConfig> for RunSettings {
    fn from(config: &MultigenConfig) -> Self {
        Self {
            poll: PollConfig::from(config),
            proofread: config.proofread,
            proofread_model: config.proofread_model.clone(),
            max_targets: config.max_targets,
            event_buffer: config.event_buffer,
        }
    }
}

/// A parent submitted for generation across several targets.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub parent_id: String,
    pub targets: Vec<String>,
    pub model_id: String,
    pub source: SourceInput,
}

/// Progress notifications for one run, in the order the supervisor saw them.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    Queued {
        target: String,
        stage: Stage,
        unit_id: String,
    },
    Running {
        target: String,
        stage: Stage,
        unit_id: String,
    },
    Completed {
        target: String,
        stage: Stage,
        unit_id: String,
        duration_ms: i64,
        findings: Option<usize>,
    },
    /// `unit_id` is `None` when the submission itself was rejected.
    Failed {
        target: String,
        stage: Stage,
        unit_id: Option<String>,
        error: String,
    },
    Stalled {
        target: String,
        stage: Stage,
        unit_id: String,
        idle_ms: i64,
    },
    Cancelled {
        target: String,
        stage: Stage,
    },
    Retried {
        target: String,
        stage: Stage,
    },
    /// Every target is completed, failed, stalled or cancelled.
    Settled {
        report: RunReport,
    },
}

impl PipelineEvent {
    pub fn target(&self) -> Option<&str> {
        match self {
            PipelineEvent::Queued { target, .. }
            | PipelineEvent::Running { target, .. }
            | PipelineEvent::Completed { target, .. }
            | PipelineEvent::Failed { target, .. }
            | PipelineEvent::Stalled { target, .. }
            | PipelineEvent::Cancelled { target, .. }
            | PipelineEvent::Retried { target, .. } => Some(target),
            PipelineEvent::Settled { .. } => None,
        }
    }
}

pub struct Orchestrator {
    dispatcher: Arc<Dispatcher>,
    settings: RunSettings,
}

impl Orchestrator {
    pub fn new(dispatcher: Arc<Dispatcher>, settings: RunSettings) -> Self {
        Self {
            dispatcher,
            settings,
        }
    }

    /// Start a run. Every target is submitted concurrently by a background
    /// supervisor; per-target failures arrive as events, never as `Err`.
    pub fn run(&self, request: RunRequest) -> Result<RunHandle> {
        self.validate(&request)?;

        let (event_tx, events) = broadcast::channel(self.settings.event_buffer);
        let (commands, command_rx) = mpsc::unbounded_channel();
        let tracker = StatusTracker::new(self.dispatcher.store(), self.settings.poll)
            .watch(request.parent_id.clone());

        info!(
            parent_id = %request.parent_id,
            targets = request.targets.len(),
            model = %request.model_id,
            proofread = ?self.settings.proofread,
            "starting run"
        );

        let supervisor = Supervisor::new(
            request.parent_id.clone(),
            request.model_id,
            request.source,
            request.targets,
            self.settings.clone(),
            Arc::clone(&self.dispatcher),
            tracker,
            event_tx,
        );
        let task = tokio::spawn(supervisor.run(command_rx));

        Ok(RunHandle {
            parent_id: request.parent_id,
            events,
            commands: Some(commands),
            task,
        })
    }

    /// Run and wait until every target has settled.
    pub async fn run_to_completion(&self, request: RunRequest) -> Result<RunReport> {
        self.run(request)?.finish().await
    }

    fn validate(&self, request: &RunRequest) -> Result<()> {
        if request.targets.is_empty() {
            return Err(PipelineError::InvalidTarget("no targets selected".into()));
        }
        if request.targets.len() > self.settings.max_targets {
            return Err(PipelineError::InvalidTarget(format!(
                "{} targets requested, at most {} allowed",
                request.targets.len(),
                self.settings.max_targets
            )));
        }

        let mut seen = HashSet::new();
        for target in &request.targets {
            validate_target(target)?;
            if !seen.insert(target.as_str()) {
                return Err(PipelineError::InvalidTarget(format!(
                    "target `{target}` selected twice"
                )));
            }
        }

        self.dispatcher.models().resolve(&request.model_id)?;
        if self.settings.proofread != ProofreadMode::Off {
            if let Some(model) = &self.settings.proofread_model {
                self.dispatcher.models().resolve(model)?;
            }
        }
        Ok(())
    }
}

/// Caller side of a run.
pub struct RunHandle {
    parent_id: String,
    events: broadcast::Receiver<PipelineEvent>,
    commands: Option<mpsc::UnboundedSender<SupervisorCommand>>,
    task: JoinHandle<RunReport>,
}

impl RunHandle {
    pub fn parent_id(&self) -> &str {
        &self.parent_id
    }

    /// An additional independent event stream, starting from now.
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.resubscribe()
    }

    /// Next event, or `None` once the supervisor has shut down.
    pub async fn next_event(&mut self) -> Option<PipelineEvent> {
        loop {
            match self.events.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(parent_id = %self.parent_id, skipped, "event stream lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Consume events until the run settles and return that snapshot.
    pub async fn wait_settled(&mut self) -> Option<RunReport> {
        while let Some(event) = self.next_event().await {
            if let PipelineEvent::Settled { report } = event {
                return Some(report);
            }
        }
        None
    }

    /// Abandon the target's failed, stalled or cancelled stage and submit it again.
    pub async fn retry(&self, target: &str) -> Result<()> {
        let target = target.to_string();
        self.command(|reply| SupervisorCommand::Retry { target, reply })
            .await
    }

    /// Stop tracking the target's in-flight stage. The model call itself
    /// keeps running; its result will not be chained.
    pub async fn cancel(&self, target: &str) -> Result<()> {
        let target = target.to_string();
        self.command(|reply| SupervisorCommand::Cancel { target, reply })
            .await
    }

    async fn command(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<()>>) -> SupervisorCommand,
    ) -> Result<()> {
        let commands = self.commands.as_ref().ok_or(PipelineError::RunClosed)?;
        let (reply, response) = oneshot::channel();
        commands
            .send(build(reply))
            .map_err(|_| PipelineError::RunClosed)?;
        response.await.map_err(|_| PipelineError::RunClosed)?
    }

    /// Stop accepting commands and wait for every target to settle.
    pub async fn finish(mut self) -> Result<RunReport> {
        self.commands.take();
        self.task
            .await
            .map_err(|e| PipelineError::Internal(format!("run supervisor failed: {e}")))
    }
}
