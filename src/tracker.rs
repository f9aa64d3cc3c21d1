//! Background status polling and stall detection for one parent.
//!
//! [`PollState`] holds the policy and is driven with explicit timestamps;
//! [`StatusTracker::watch`] wraps it in a task that polls the store on a fixed
//! interval while anything is live and idles otherwise.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, warn};

use crate::config::MultigenConfig;
use crate::state_machine::{UnitStatus, WorkUnit};
use crate::store::JobStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    pub interval: Duration,
    pub stall_timeout: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(2000),
            stall_timeout: Duration::from_millis(120_000),
        }
    }
}

impl From<&MultigenConfig> for PollConfig {
    fn from(config: &MultigenConfig) -> Self {
        Self {
            interval: config.poll_interval(),
            stall_timeout: config.stall_timeout(),
        }
    }
}

/// Something the tracker noticed. Each kind is reported at most once per unit.
#[derive(Debug, Clone, PartialEq)]
pub enum TrackerEvent {
    Running { unit_id: String, target: String },
    Stalled { unit_id: String, target: String, idle_ms: i64 },
    Terminal { unit: WorkUnit },
    /// Nothing live remains; polling paused until woken.
    Idle,
}

/// Deduplicating stall policy over successive store snapshots.
#[derive(Debug)]
pub struct PollState {
    stall_timeout: chrono::Duration,
    stalled: HashSet<String>,
    stall_notified: HashSet<String>,
    running_seen: HashSet<String>,
    terminal_seen: HashSet<String>,
}

impl PollState {
    pub fn new(stall_timeout: Duration) -> Self {
        Self {
            stall_timeout: chrono::Duration::from_std(stall_timeout)
                .unwrap_or_else(|_| chrono::Duration::weeks(5200)),
            stalled: HashSet::new(),
            stall_notified: HashSet::new(),
            running_seen: HashSet::new(),
            terminal_seen: HashSet::new(),
        }
    }

    /// Compare one snapshot of a parent's units against what was already reported.
    pub fn observe(&mut self, units: &[WorkUnit], now: DateTime<Utc>) -> Vec<TrackerEvent> {
        let mut events = Vec::new();

        for unit in units {
            if unit.is_terminal() {
                self.stalled.remove(&unit.id);
                if self.terminal_seen.insert(unit.id.clone()) {
                    events.push(TrackerEvent::Terminal { unit: unit.clone() });
                }
                continue;
            }
            if unit.status != UnitStatus::Running || self.stalled.contains(&unit.id) {
                continue;
            }

            if self.running_seen.insert(unit.id.clone()) {
                events.push(TrackerEvent::Running {
                    unit_id: unit.id.clone(),
                    target: unit.target.clone(),
                });
            }

            if unit.is_stalled(now, self.stall_timeout) {
                self.stalled.insert(unit.id.clone());
                if self.stall_notified.insert(unit.id.clone()) {
                    events.push(TrackerEvent::Stalled {
                        unit_id: unit.id.clone(),
                        target: unit.target.clone(),
                        idle_ms: unit.idle_for(now).num_milliseconds(),
                    });
                }
            }
        }

        events
    }

    /// Any unit still worth polling for: non-terminal and not stalled.
    pub fn has_live(&self, units: &[WorkUnit]) -> bool {
        units
            .iter()
            .any(|u| !u.is_terminal() && !self.stalled.contains(&u.id))
    }

    pub fn is_stalled(&self, unit_id: &str) -> bool {
        self.stalled.contains(unit_id)
    }

    /// Stop excluding `unit_id` from polling. The stall notification is not
    /// repeated if it stalls again.
    pub fn clear_stall(&mut self, unit_id: &str) -> bool {
        self.stalled.remove(unit_id)
    }
}

#[derive(Debug)]
enum TrackerCommand {
    Wake,
    Resume(String),
}

/// Owner side of a running tracker. Dropping it stops the task.
pub struct TrackerHandle {
    events: mpsc::UnboundedReceiver<TrackerEvent>,
    commands: mpsc::UnboundedSender<TrackerCommand>,
    task: JoinHandle<()>,
}

impl TrackerHandle {
    pub async fn next_event(&mut self) -> Option<TrackerEvent> {
        self.events.recv().await
    }

    /// A new unit was submitted; resume polling if idle.
    pub fn wake(&self) {
        let _ = self.commands.send(TrackerCommand::Wake);
    }

    /// Clear the stall marker of `unit_id` and resume polling.
    pub fn resume(&self, unit_id: impl Into<String>) {
        let _ = self.commands.send(TrackerCommand::Resume(unit_id.into()));
    }

    pub fn stop(self) {
        self.task.abort();
    }
}

pub struct StatusTracker {
    store: Arc<dyn JobStore>,
    config: PollConfig,
}

impl StatusTracker {
    pub fn new(store: Arc<dyn JobStore>, config: PollConfig) -> Self {
        Self { store, config }
    }

    /// Start polling `parent_id` in the background.
    pub fn watch(&self, parent_id: impl Into<String>) -> TrackerHandle {
        let (event_tx, events) = mpsc::unbounded_channel();
        let (commands, command_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(poll_loop(
            Arc::clone(&self.store),
            parent_id.into(),
            self.config,
            command_rx,
            event_tx,
        ));
        TrackerHandle {
            events,
            commands,
            task,
        }
    }
}

async fn poll_loop(
    store: Arc<dyn JobStore>,
    parent_id: String,
    config: PollConfig,
    mut commands: mpsc::UnboundedReceiver<TrackerCommand>,
    events: mpsc::UnboundedSender<TrackerEvent>,
) {
    let mut state = PollState::new(config.stall_timeout);
    let mut ticker = interval(config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut polling = true;

    loop {
        if !polling {
            match commands.recv().await {
                None => return,
                Some(TrackerCommand::Wake) => {}
                Some(TrackerCommand::Resume(unit_id)) => {
                    state.clear_stall(&unit_id);
                }
            }
            debug!(parent_id = %parent_id, "tracker woken");
            polling = true;
            ticker.reset_immediately();
            continue;
        }

        tokio::select! {
            _ = ticker.tick() => {
                let units = match store.list_by_parent(&parent_id).await {
                    Ok(units) => units,
                    Err(e) => {
                        warn!(parent_id = %parent_id, error = %e, "status poll failed");
                        continue;
                    }
                };
                for event in state.observe(&units, Utc::now()) {
                    if let TrackerEvent::Stalled { unit_id, target, idle_ms } = &event {
                        warn!(parent_id = %parent_id, unit_id = %unit_id, target = %target, idle_ms, "work unit stalled");
                    }
                    if events.send(event).is_err() {
                        return;
                    }
                }
                if !state.has_live(&units) {
                    debug!(parent_id = %parent_id, "no live units, tracker idle");
                    polling = false;
                    if events.send(TrackerEvent::Idle).is_err() {
                        return;
                    }
                }
            }
            command = commands.recv() => match command {
                None => return,
                Some(TrackerCommand::Wake) => {}
                Some(TrackerCommand::Resume(unit_id)) => {
                    state.clear_stall(&unit_id);
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::{ResultPayload, StatusUpdate};
    use crate::store::MemoryStore;
    use crate::task::TaskKind;
    use chrono::Duration as ChronoDuration;

    fn running_unit(target: &str, idle: ChronoDuration, now: DateTime<Utc>) -> WorkUnit {
        let mut unit = WorkUnit::new("doc-1", target, TaskKind::Translate, "sonnet");
        unit.status = UnitStatus::Running;
        unit.updated_at = now - idle;
        unit
    }

    #[test]
    fn stall_is_reported_exactly_once() {
        let now = Utc::now();
        let mut state = PollState::new(Duration::from_secs(120));
        let units = vec![
            running_unit("fr", ChronoDuration::minutes(5), now),
            running_unit("de", ChronoDuration::seconds(10), now),
        ];

        let first = state.observe(&units, now);
        let stalls: Vec<_> = first
            .iter()
            .filter(|e| matches!(e, TrackerEvent::Stalled { .. }))
            .collect();
        assert_eq!(stalls.len(), 1);
        assert!(matches!(stalls[0], TrackerEvent::Stalled { target, .. } if target == "fr"));
        assert!(state.is_stalled(&units[0].id));

        for later in 1..4 {
            let events = state.observe(&units, now + ChronoDuration::seconds(later * 2));
            assert!(
                !events.iter().any(|e| matches!(e, TrackerEvent::Stalled { target, .. } if target == "fr")),
                "stall re-reported on poll {later}"
            );
        }
    }

    #[test]
    fn stalled_units_do_not_keep_polling_alive() {
        let now = Utc::now();
        let mut state = PollState::new(Duration::from_secs(120));
        let units = vec![running_unit("fr", ChronoDuration::minutes(3), now)];

        assert!(state.has_live(&units));
        state.observe(&units, now);
        assert!(!state.has_live(&units));
    }

    #[test]
    fn stalled_is_distinct_from_failed() {
        let now = Utc::now();
        let mut state = PollState::new(Duration::from_secs(120));
        let mut failed = running_unit("fr", ChronoDuration::minutes(10), now);
        failed.status = UnitStatus::Failed;

        let events = state.observe(&[failed.clone()], now);
        assert_eq!(events, vec![TrackerEvent::Terminal { unit: failed }]);
    }

    #[test]
    fn running_and_terminal_reported_once_each() {
        let now = Utc::now();
        let mut state = PollState::new(Duration::from_secs(120));
        let mut unit = running_unit("fr", ChronoDuration::seconds(1), now);

        let events = state.observe(&[unit.clone()], now);
        assert!(matches!(events.as_slice(), [TrackerEvent::Running { .. }]));
        assert!(state.observe(&[unit.clone()], now).is_empty());

        unit.status = UnitStatus::Completed;
        assert_eq!(state.observe(&[unit.clone()], now).len(), 1);
        assert!(state.observe(&[unit], now).is_empty());
    }

    #[test]
    fn cleared_stall_is_not_renotified() {
        let now = Utc::now();
        let mut state = PollState::new(Duration::from_secs(60));
        let units = vec![running_unit("fr", ChronoDuration::minutes(2), now)];

        assert_eq!(state.observe(&units, now).len(), 2);
        assert!(state.clear_stall(&units[0].id));
        assert!(state.has_live(&units));

        // Still stale: excluded again, but silently.
        assert!(state.observe(&units, now).is_empty());
        assert!(state.is_stalled(&units[0].id));
    }

    #[test]
    fn pending_units_are_live_but_never_stall() {
        let now = Utc::now();
        let mut state = PollState::new(Duration::from_secs(1));
        let mut unit = WorkUnit::new("doc-1", "fr", TaskKind::Translate, "sonnet");
        unit.updated_at = now - ChronoDuration::hours(1);

        assert!(state.observe(&[unit.clone()], now).is_empty());
        assert!(state.has_live(&[unit]));
    }

    #[tokio::test]
    async fn background_tracker_flags_stall_then_idles() {
        let running = running_unit("fr", ChronoDuration::minutes(10), Utc::now());

        let tracker = StatusTracker::new(
            Arc::new(SnapshotStore(vec![running.clone()])),
            PollConfig {
                interval: Duration::from_millis(10),
                stall_timeout: Duration::from_millis(50),
            },
        );
        let mut handle = tracker.watch("doc-1");

        assert!(matches!(handle.next_event().await, Some(TrackerEvent::Running { .. })));
        assert!(matches!(
            handle.next_event().await,
            Some(TrackerEvent::Stalled { ref unit_id, .. }) if *unit_id == running.id
        ));
        assert_eq!(handle.next_event().await, Some(TrackerEvent::Idle));
        handle.stop();
    }

    #[tokio::test]
    async fn background_tracker_wakes_for_new_units() {
        let store = Arc::new(MemoryStore::new());
        let tracker = StatusTracker::new(
            store.clone(),
            PollConfig {
                interval: Duration::from_millis(10),
                stall_timeout: Duration::from_secs(60),
            },
        );
        let mut handle = tracker.watch("doc-1");
        assert_eq!(handle.next_event().await, Some(TrackerEvent::Idle));

        let unit = store
            .create(WorkUnit::new("doc-1", "fr", TaskKind::Translate, "sonnet"))
            .await
            .unwrap();
        store.update_status(&unit.id, StatusUpdate::Start).await.unwrap();
        handle.wake();
        assert!(matches!(handle.next_event().await, Some(TrackerEvent::Running { .. })));

        store
            .update_status(&unit.id, StatusUpdate::Complete(ResultPayload::text("ok")))
            .await
            .unwrap();
        assert!(matches!(handle.next_event().await, Some(TrackerEvent::Terminal { .. })));
        assert_eq!(handle.next_event().await, Some(TrackerEvent::Idle));
        handle.stop();
    }

    /// Store returning a fixed snapshot, for units with backdated timestamps.
    struct SnapshotStore(Vec<WorkUnit>);

    #[async_trait::async_trait]
    impl JobStore for SnapshotStore {
        async fn create(&self, unit: WorkUnit) -> crate::error::Result<WorkUnit> {
            Ok(unit)
        }
        async fn get(&self, unit_id: &str) -> crate::error::Result<WorkUnit> {
            self.0
                .iter()
                .find(|u| u.id == unit_id)
                .cloned()
                .ok_or_else(|| crate::error::PipelineError::UnitNotFound(unit_id.into()))
        }
        async fn update_status(
            &self,
            unit_id: &str,
            _update: StatusUpdate,
        ) -> crate::error::Result<WorkUnit> {
            self.get(unit_id).await
        }
        async fn list_by_parent(&self, parent_id: &str) -> crate::error::Result<Vec<WorkUnit>> {
            Ok(self.0.iter().filter(|u| u.parent_id == parent_id).cloned().collect())
        }
        async fn in_flight(
            &self,
            _parent_id: &str,
            _target: &str,
        ) -> crate::error::Result<Option<WorkUnit>> {
            Ok(None)
        }
        async fn replace_payload(
            &self,
            unit_id: &str,
            _payload: ResultPayload,
        ) -> crate::error::Result<WorkUnit> {
            self.get(unit_id).await
        }
    }
}
