//! Submits single stages: single-flight creation, one model call, terminal write.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::{EmptyFindings, ModelRegistry};
use crate::error::{PipelineError, Result};
use crate::extractor::{FINDING_SCHEMA, Finding, extract_with};
use crate::invoker::{InvocationRequest, ModelInvoker, RawOutput};
use crate::state_machine::{FailureKind, ResultPayload, StatusUpdate, UnitStatus, WorkUnit};
use crate::store::JobStore;
use crate::task::{StageRequest, TaskKind};

const MAX_TARGET_LEN: usize = 64;

/// Policy knobs the dispatcher applies to every stage.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub empty_findings: EmptyFindings,
    pub proofread_rules: Vec<String>,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            empty_findings: EmptyFindings::Complete,
            proofread_rules: Vec::new(),
        }
    }
}

/// Reject target keys that cannot be used as a stable identifier.
pub fn validate_target(target: &str) -> Result<()> {
    if target.is_empty() {
        return Err(PipelineError::InvalidTarget("target must not be empty".into()));
    }
    if target.len() > MAX_TARGET_LEN {
        return Err(PipelineError::InvalidTarget(format!(
            "target `{target}` is longer than {MAX_TARGET_LEN} characters"
        )));
    }
    if !target
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(PipelineError::InvalidTarget(format!(
            "target `{target}` may only contain letters, digits, '-' and '_'"
        )));
    }
    Ok(())
}

pub struct Dispatcher {
    store: Arc<dyn JobStore>,
    invoker: Arc<dyn ModelInvoker>,
    models: ModelRegistry,
    settings: DispatchSettings,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn JobStore>,
        invoker: Arc<dyn ModelInvoker>,
        models: ModelRegistry,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            store,
            invoker,
            models,
            settings,
        }
    }

    pub fn store(&self) -> Arc<dyn JobStore> {
        Arc::clone(&self.store)
    }

    pub fn models(&self) -> &ModelRegistry {
        &self.models
    }

    /// Validate and create the `pending` unit for a stage.
    ///
    /// Fails with `InvalidTarget`, `ModelUnavailable` or `AlreadyInFlight`.
    pub async fn begin(&self, request: &StageRequest) -> Result<WorkUnit> {
        validate_target(&request.target)?;
        self.models.resolve(&request.model_id)?;

        let unit = WorkUnit::new(
            &request.parent_id,
            &request.target,
            request.task,
            &request.model_id,
        )
        .with_derived_from(request.derived_from.clone());

        let unit = self.store.create(unit).await?;
        debug!(
            unit_id = %unit.id,
            parent_id = %unit.parent_id,
            target = %unit.target,
            task = %unit.task,
            "work unit created"
        );
        Ok(unit)
    }

    /// Run a unit created by [`Dispatcher::begin`] through exactly one model call.
    ///
    /// Provider and extraction failures are recorded on the unit and returned
    /// as `Ok` with a `failed` status; `Err` means the store rejected a write.
    pub async fn execute(&self, unit: WorkUnit, request: &StageRequest) -> Result<WorkUnit> {
        let model = match self.models.resolve(&unit.model_id) {
            Ok(model) => model.clone(),
            Err(e) => {
                return self
                    .store
                    .update_status(&unit.id, StatusUpdate::Fail(FailureKind::internal(e.to_string())))
                    .await;
            }
        };

        let unit = self.store.update_status(&unit.id, StatusUpdate::Start).await?;
        let prompt = request.prompt(&self.settings.proofread_rules);
        let invocation = InvocationRequest {
            prompt: prompt.text,
            model: model.provider_model.clone(),
            max_tokens: model.max_tokens,
            mode: prompt.mode,
            attachment: prompt.attachment,
            structured: unit.task.expects_structured(),
        };

        info!(
            unit_id = %unit.id,
            target = %unit.target,
            task = %unit.task,
            model = %model.provider_model,
            "invoking model"
        );

        let update = match self.invoker.invoke(invocation).await {
            Ok(raw) => self.settle(unit.task, raw),
            Err(e) => {
                warn!(unit_id = %unit.id, target = %unit.target, error = %e, "model invocation failed");
                StatusUpdate::Fail(FailureKind::from(e))
            }
        };

        let finished = self.store.update_status(&unit.id, update).await?;
        match finished.status {
            UnitStatus::Completed => info!(unit_id = %finished.id, target = %finished.target, "work unit completed"),
            _ => info!(
                unit_id = %finished.id,
                target = %finished.target,
                failure = ?finished.failure,
                "work unit failed"
            ),
        }
        Ok(finished)
    }

    /// `begin` followed by `execute`.
    pub async fn submit(&self, request: &StageRequest) -> Result<WorkUnit> {
        let unit = self.begin(request).await?;
        self.execute(unit, request).await
    }

    /// Turn raw model output into the terminal status write.
    fn settle(&self, task: TaskKind, raw: RawOutput) -> StatusUpdate {
        let text = match raw {
            RawOutput::Image { media_type, data } if !task.expects_structured() => {
                return StatusUpdate::Complete(ResultPayload::Image { media_type, data });
            }
            RawOutput::Image { .. } => {
                return StatusUpdate::Fail(FailureKind::extraction(
                    "model returned an image where findings were expected",
                ));
            }
            RawOutput::Text(text) => text,
        };

        if !task.expects_structured() {
            if text.trim().is_empty() {
                return StatusUpdate::Fail(FailureKind::extraction("model returned empty output"));
            }
            return StatusUpdate::Complete(ResultPayload::Text { text });
        }

        let extraction = extract_with(&text, &FINDING_SCHEMA);
        if !extraction.is_recognized() {
            return StatusUpdate::Fail(FailureKind::extraction(format!(
                "no findings could be decoded ({:?} response)",
                extraction.shape
            )));
        }

        let findings = Finding::from_records(&extraction.records);
        if findings.is_empty() && self.settings.empty_findings == EmptyFindings::Fail {
            return StatusUpdate::Fail(FailureKind::extraction("response contained no findings"));
        }
        debug!(count = findings.len(), shape = ?extraction.shape, "findings extracted");
        StatusUpdate::Complete(ResultPayload::Findings { findings })
    }

    /// Force a non-terminal unit to `failed` so a replacement can be created.
    pub async fn supersede(&self, unit_id: &str) -> Result<WorkUnit> {
        self.abandon(unit_id, FailureKind::Superseded).await
    }

    /// Record `failure` on a unit whose stage task never wrote a terminal status.
    pub async fn abandon(&self, unit_id: &str, failure: FailureKind) -> Result<WorkUnit> {
        let unit = self
            .store
            .update_status(unit_id, StatusUpdate::Fail(failure))
            .await?;
        info!(unit_id, target = %unit.target, failure = ?unit.failure, "work unit abandoned");
        Ok(unit)
    }

    /// Manually replace a completed unit's text. Not part of generation.
    pub async fn edit_result(&self, unit_id: &str, text: impl Into<String>) -> Result<WorkUnit> {
        self.store
            .replace_payload(unit_id, ResultPayload::Text { text: text.into() })
            .await
    }
}
