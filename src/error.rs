use thiserror::Error;

use crate::state_machine::UnitStatus;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    #[error("Model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("A job is already in flight for {parent_id}/{target} (unit {unit_id})")]
    AlreadyInFlight {
        parent_id: String,
        target: String,
        unit_id: String,
    },

    #[error("Work unit not found: {0}")]
    UnitNotFound(String),

    #[error("Invalid transition for unit {unit_id}: {from} -> {to}")]
    InvalidTransition {
        unit_id: String,
        from: UnitStatus,
        to: UnitStatus,
    },

    #[error("Work unit {unit_id} is {status} and cannot be edited")]
    NotEditable { unit_id: String, status: UnitStatus },

    #[error("Unknown target for this run: {0}")]
    UnknownTarget(String),

    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    #[error("Run supervisor has already shut down")]
    RunClosed,

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
