mod audit;
mod state;
mod unit;

pub use audit::{RunReport, StageAudit, TargetReport};
pub use state::{PhaseEvent, StagePhase, StateMachine, StatusUpdate};
pub use unit::{FailureKind, ResultPayload, Stage, UnitStatus, WorkUnit};
