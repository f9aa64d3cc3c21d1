use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::extractor::Finding;
use crate::invoker::ProviderError;
use crate::task::TaskKind;

/// Why a work unit ended up `failed`.
///
/// Provider failures come from the model invoker; extraction failures mean
/// the model answered but nothing usable could be decoded from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureKind {
    /// Transport or provider failure (timeout, auth, rate limit, bad request).
    Provider { transient: bool, message: String },
    /// Well-formed response whose structured content was unusable.
    Extraction { message: String },
    /// Abandoned by the caller in favour of a fresh submission.
    Superseded,
    /// Store or task failure inside the pipeline itself.
    Internal { message: String },
}

impl FailureKind {
    pub fn extraction(message: impl Into<String>) -> Self {
        FailureKind::Extraction {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        FailureKind::Internal {
            message: message.into(),
        }
    }
}

impl From<ProviderError> for FailureKind {
    fn from(err: ProviderError) -> Self {
        FailureKind::Provider {
            transient: err.is_transient(),
            message: err.to_string(),
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Provider { transient, message } => {
                let label = if *transient { "transient" } else { "fatal" };
                write!(f, "Provider failure ({label}): {message}")
            }
            FailureKind::Extraction { message } => write!(f, "Extraction failure: {message}"),
            FailureKind::Superseded => write!(f, "Superseded by a newer submission"),
            FailureKind::Internal { message } => write!(f, "Internal failure: {message}"),
        }
    }
}

/// Lifecycle status of a work unit as persisted in the job store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl UnitStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, UnitStatus::Completed | UnitStatus::Failed)
    }
}

impl std::fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UnitStatus::Pending => write!(f, "pending"),
            UnitStatus::Running => write!(f, "running"),
            UnitStatus::Completed => write!(f, "completed"),
            UnitStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Position of a unit in the per-target chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Translation of the submitted document or image.
    Primary,
    /// Proofreading chained onto a completed primary result.
    Derived,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Primary => write!(f, "primary"),
            Stage::Derived => write!(f, "derived"),
        }
    }
}

/// What a completed unit produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResultPayload {
    /// Raw formatted model output, markup preserved verbatim.
    Text { text: String },
    /// Structured proofreading findings. May be empty ("no changes needed").
    Findings { findings: Vec<Finding> },
    /// Generated image bytes.
    Image { media_type: String, data: Vec<u8> },
}

impl ResultPayload {
    pub fn text(text: impl Into<String>) -> Self {
        ResultPayload::Text { text: text.into() }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ResultPayload::Text { text } => Some(text),
            _ => None,
        }
    }

    pub fn finding_count(&self) -> Option<usize> {
        match self {
            ResultPayload::Findings { findings } => Some(findings.len()),
            _ => None,
        }
    }
}

/// One tracked generation attempt for a single (parent, target) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkUnit {
    pub id: String,
    pub parent_id: String,
    pub target: String,
    pub stage: Stage,
    pub task: TaskKind,
    pub status: UnitStatus,
    pub model_id: String,
    pub result_payload: Option<ResultPayload>,
    pub failure: Option<FailureKind>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub derived_from: Option<String>,
    pub edited_at: Option<DateTime<Utc>>,
}

impl WorkUnit {
    pub fn new(
        parent_id: impl Into<String>,
        target: impl Into<String>,
        task: TaskKind,
        model_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            parent_id: parent_id.into(),
            target: target.into(),
            stage: task.stage(),
            task,
            status: UnitStatus::Pending,
            model_id: model_id.into(),
            result_payload: None,
            failure: None,
            created_at: now,
            updated_at: now,
            derived_from: None,
            edited_at: None,
        }
    }

    pub fn with_derived_from(mut self, unit_id: Option<String>) -> Self {
        self.derived_from = unit_id;
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Time since the last status transition.
    pub fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        now - self.updated_at
    }

    /// A running unit whose liveness timestamp is older than `window`.
    pub fn is_stalled(&self, now: DateTime<Utc>, window: Duration) -> bool {
        self.status == UnitStatus::Running && self.idle_for(now) > window
    }

    pub fn output_text(&self) -> Option<&str> {
        self.result_payload.as_ref().and_then(ResultPayload::as_text)
    }
}
