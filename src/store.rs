//! Job store boundary and the in-memory implementation used by the CLI and tests.
//!
//! The store is the only shared mutable resource in the pipeline. The
//! single-flight rule (at most one non-terminal unit per parent/target) is
//! checked and enforced inside [`JobStore::create`] under one lock.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;

use crate::error::{PipelineError, Result};
use crate::state_machine::{ResultPayload, StateMachine, StatusUpdate, UnitStatus, WorkUnit};

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new unit, rejecting it if its (parent, target) already has a
    /// non-terminal unit.
    async fn create(&self, unit: WorkUnit) -> Result<WorkUnit>;

    async fn get(&self, unit_id: &str) -> Result<WorkUnit>;

    /// Apply a status transition, refreshing `updated_at`.
    async fn update_status(&self, unit_id: &str, update: StatusUpdate) -> Result<WorkUnit>;

    /// All units of a parent in creation order.
    async fn list_by_parent(&self, parent_id: &str) -> Result<Vec<WorkUnit>>;

    /// The non-terminal unit for (parent, target), if one exists.
    async fn in_flight(&self, parent_id: &str, target: &str) -> Result<Option<WorkUnit>>;

    /// Manual edit of a completed unit's payload. Not a status transition.
    async fn replace_payload(&self, unit_id: &str, payload: ResultPayload) -> Result<WorkUnit>;
}

#[derive(Default)]
struct Inner {
    units: HashMap<String, WorkUnit>,
    order: Vec<String>,
}

impl Inner {
    fn in_flight(&self, parent_id: &str, target: &str) -> Option<&WorkUnit> {
        self.units
            .values()
            .find(|u| u.parent_id == parent_id && u.target == target && !u.is_terminal())
    }

    fn get_mut(&mut self, unit_id: &str) -> Result<&mut WorkUnit> {
        self.units
            .get_mut(unit_id)
            .ok_or_else(|| PipelineError::UnitNotFound(unit_id.to_string()))
    }
}

/// Process-local store. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.read().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn create(&self, unit: WorkUnit) -> Result<WorkUnit> {
        let mut inner = self.inner.write();
        if let Some(existing) = inner.in_flight(&unit.parent_id, &unit.target) {
            return Err(PipelineError::AlreadyInFlight {
                parent_id: unit.parent_id.clone(),
                target: unit.target.clone(),
                unit_id: existing.id.clone(),
            });
        }
        if inner.units.contains_key(&unit.id) {
            return Err(PipelineError::Internal(format!(
                "duplicate unit id {}",
                unit.id
            )));
        }
        inner.order.push(unit.id.clone());
        inner.units.insert(unit.id.clone(), unit.clone());
        Ok(unit)
    }

    async fn get(&self, unit_id: &str) -> Result<WorkUnit> {
        self.inner
            .read()
            .units
            .get(unit_id)
            .cloned()
            .ok_or_else(|| PipelineError::UnitNotFound(unit_id.to_string()))
    }

    async fn update_status(&self, unit_id: &str, update: StatusUpdate) -> Result<WorkUnit> {
        let mut inner = self.inner.write();
        let unit = inner.get_mut(unit_id)?;
        StateMachine::apply(unit, update, Utc::now())?;
        Ok(unit.clone())
    }

    async fn list_by_parent(&self, parent_id: &str) -> Result<Vec<WorkUnit>> {
        let inner = self.inner.read();
        Ok(inner
            .order
            .iter()
            .filter_map(|id| inner.units.get(id))
            .filter(|u| u.parent_id == parent_id)
            .cloned()
            .collect())
    }

    async fn in_flight(&self, parent_id: &str, target: &str) -> Result<Option<WorkUnit>> {
        Ok(self.inner.read().in_flight(parent_id, target).cloned())
    }

    async fn replace_payload(&self, unit_id: &str, payload: ResultPayload) -> Result<WorkUnit> {
        let mut inner = self.inner.write();
        let unit = inner.get_mut(unit_id)?;
        if unit.status != UnitStatus::Completed {
            return Err(PipelineError::NotEditable {
                unit_id: unit_id.to_string(),
                status: unit.status,
            });
        }
        unit.result_payload = Some(payload);
        unit.edited_at = Some(Utc::now());
        Ok(unit.clone())
    }
}
