//! Shared orchestrator state.
//!
//! The execution loop owns the running [`Mission`] and publishes snapshots
//! here; the controller and observers read from it. Guards are never held
//! across an await.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use mission_core::{CheckpointSnapshot, Id, Mission, MissionLog};
use tracing::warn;

/// Key for the retry counter table.
pub type RetryKey = (Id, Id);

#[derive(Debug, Default)]
pub struct OrchestratorState {
    /// Latest snapshot of the active mission.
    pub active: Option<Mission>,
    pub current_phase: Option<Id>,
    pub current_step: Option<Id>,
    pub progress: f64,
    /// Log trail of the active (or most recently finished) mission.
    pub logs: Vec<MissionLog>,
    /// Finished missions, most recent first.
    pub history: Vec<Mission>,
    pub retry_counts: HashMap<RetryKey, u32>,
    /// Last checkpoint per mission, cleared by the cleanup step.
    pub checkpoints: HashMap<Id, CheckpointSnapshot>,
}

impl OrchestratorState {
    pub fn with_history(history: Vec<Mission>) -> Self {
        Self {
            history,
            ..Self::default()
        }
    }

    pub fn is_active(&self, mission_id: &Id) -> bool {
        self.active.as_ref().is_some_and(|m| &m.id == mission_id)
    }

    /// Drop the active slot and its pointers.
    pub fn clear_active(&mut self) {
        self.active = None;
        self.current_phase = None;
        self.current_step = None;
    }

    /// Insert a finished mission at the head of history, replacing any
    /// earlier entry with the same id, and cap the list.
    pub fn push_history(&mut self, mission: Mission, limit: usize) {
        self.history.retain(|m| m.id != mission.id);
        self.history.insert(0, mission);
        self.history.truncate(limit);
    }
}

/// Lock a mutex, recovering the guard if a previous holder panicked.
pub fn lock_recover<'a, T>(mutex: &'a Mutex<T>, name: &str) -> MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        warn!(lock = name, "mutex poisoned, recovering");
        poisoned.into_inner()
    })
}
