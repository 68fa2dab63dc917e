//! Mission lifecycle controller.
//!
//! Owns the single active-mission slot. `start_mission` hands the mission to
//! a spawned [`MissionRun`]; pause, resume, and cancel flip shared control
//! handles that the loop observes at its next boundary. Observers read
//! snapshots through the accessors or subscribe to [`MissionEvent`]s.
//!
//! Lifecycle: planned -> running <-> paused -> completed | failed | cancelled

use std::sync::{Arc, Mutex};

use chrono::Utc;
use mission_core::{
    analyze_with, plan, CheckpointSnapshot, Config, Id, Mission, MissionContext, MissionEvent,
    MissionLog, MissionPhase, MissionStatus, MissionStep, PhaseStatus, StepStatus,
};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::execution::{MissionRun, RunControl, RunSettings};
use crate::executor::StepExecutor;
use crate::state::{lock_recover, OrchestratorState};
use crate::storage::{Storage, StorageError};

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("mission {0} is already active")]
    MissionAlreadyActive(Id),
    #[error("validation failed: {0}")]
    ValidationFailed(String),
    #[error("phase {phase} failed: {reason}")]
    PhaseExecutionFailed { phase: String, reason: String },
    #[error("step {step} failed: {reason}")]
    StepExecutionFailed { step: String, reason: String },
    #[error("checkpoint restore failed: {0}")]
    CheckpointRestoreFailed(String),
    #[error("no active mission")]
    NoActiveMission,
    #[error("no paused mission")]
    NoPausedMission,
    #[error("invalid transition from {} to {}", .from.as_str(), .to.as_str())]
    InvalidTransition {
        from: MissionStatus,
        to: MissionStatus,
    },
    #[error("mission cancelled")]
    Cancelled,
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Handle to the spawned loop of the active mission.
#[derive(Debug)]
struct RunHandle {
    mission_id: Id,
    control: RunControl,
    task: Option<JoinHandle<Mission>>,
}

#[derive(Debug)]
pub struct Orchestrator {
    config: Config,
    storage: Arc<Storage>,
    executor: Arc<StepExecutor>,
    state: Arc<Mutex<OrchestratorState>>,
    run: Mutex<Option<RunHandle>>,
    events: broadcast::Sender<MissionEvent>,
}

impl Orchestrator {
    /// Create an orchestrator, seeding in-memory history from storage.
    pub async fn new(config: Config, storage: Arc<Storage>, executor: StepExecutor) -> Result<Self> {
        let history = storage.load_history(config.history_limit).await?;
        info!(missions = history.len(), "loaded mission history");

        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Ok(Self {
            config,
            storage,
            executor: Arc::new(executor),
            state: Arc::new(Mutex::new(OrchestratorState::with_history(history))),
            run: Mutex::new(None),
            events,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Analyze a goal and plan it into a new mission in the planned state.
    /// The mission is not registered anywhere until it is started.
    pub fn create_mission(&self, goal: &str, context: Option<MissionContext>) -> Mission {
        let analysis = analyze_with(goal, &self.config.available_capabilities);
        let phases = plan(&analysis);
        let mission = Mission::new(goal, context.unwrap_or_default(), analysis, phases);
        info!(
            mission_id = %mission.id,
            complexity = mission.analysis.complexity.as_str(),
            feasible = mission.analysis.feasibility.feasible,
            phases = mission.phases.len(),
            "mission created"
        );
        mission
    }

    /// Start executing a planned mission in the background.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start_mission(&self, mut mission: Mission) -> Result<()> {
        let mut run = lock_recover(&self.run, "run");
        let control = RunControl::new();
        {
            let mut state = lock_recover(&self.state, "state");
            if let Some(active) = &state.active {
                return Err(OrchestratorError::MissionAlreadyActive(active.id.clone()));
            }
            if mission.status != MissionStatus::Planned {
                return Err(OrchestratorError::InvalidTransition {
                    from: mission.status,
                    to: MissionStatus::Running,
                });
            }

            mission.status = MissionStatus::Running;
            mission.started_at = Some(Utc::now());
            mission.completed_at = None;
            state.clear_active();
            state.logs.clear();
            state.progress = mission.progress();
            state.active = Some(mission.clone());
        }

        let mission_id = mission.id.clone();
        let mission_run = MissionRun::new(
            mission,
            RunSettings::from(&self.config),
            control.clone(),
            Arc::clone(&self.state),
            Arc::clone(&self.executor),
            Arc::clone(&self.storage),
            self.events.clone(),
        );
        let task = tokio::spawn(mission_run.run());

        *run = Some(RunHandle {
            mission_id: mission_id.clone(),
            control,
            task: Some(task),
        });
        drop(run);

        self.emit(MissionEvent::MissionStarted { mission_id });
        Ok(())
    }

    /// Pause the running mission. Takes effect at the next boundary.
    pub fn pause_mission(&self) -> Result<()> {
        let run = lock_recover(&self.run, "run");
        let mut state = lock_recover(&self.state, "state");
        let (Some(handle), Some(active)) = (run.as_ref(), state.active.as_mut()) else {
            return Err(OrchestratorError::NoActiveMission);
        };
        if active.status != MissionStatus::Running {
            return Err(OrchestratorError::InvalidTransition {
                from: active.status,
                to: MissionStatus::Paused,
            });
        }

        handle.control.set_paused(true);
        active.status = MissionStatus::Paused;
        let mission_id = active.id.clone();
        drop(state);
        drop(run);

        info!(mission_id = %mission_id, "mission pause requested");
        self.emit(MissionEvent::MissionPaused { mission_id });
        Ok(())
    }

    /// Resume a paused mission.
    pub fn resume_mission(&self) -> Result<()> {
        let run = lock_recover(&self.run, "run");
        let mut state = lock_recover(&self.state, "state");
        let (Some(handle), Some(active)) = (run.as_ref(), state.active.as_mut()) else {
            return Err(OrchestratorError::NoActiveMission);
        };
        if active.status != MissionStatus::Paused {
            return Err(OrchestratorError::NoPausedMission);
        }

        handle.control.set_paused(false);
        active.status = MissionStatus::Running;
        let mission_id = active.id.clone();
        drop(state);
        drop(run);

        info!(mission_id = %mission_id, "mission resumed");
        self.emit(MissionEvent::MissionResumed { mission_id });
        Ok(())
    }

    /// Cancel the active mission.
    ///
    /// The slot is released immediately. The loop stops at its next boundary,
    /// leaving completed steps as they are, and records the cancelled mission
    /// in history.
    pub fn cancel_mission(&self) -> Result<()> {
        let run = lock_recover(&self.run, "run");
        let mut state = lock_recover(&self.state, "state");
        let Some(handle) = run.as_ref() else {
            return Err(OrchestratorError::NoActiveMission);
        };
        let Some(active) = state.active.as_ref() else {
            return Err(OrchestratorError::NoActiveMission);
        };

        let mission_id = active.id.clone();
        handle.control.cancel.cancel();
        handle.control.set_paused(false);
        state.clear_active();
        drop(state);
        drop(run);

        info!(mission_id = %mission_id, "mission cancellation requested");
        Ok(())
    }

    /// Wait for the most recently started mission to reach a terminal state.
    ///
    /// Returns `None` when nothing has been started or the result was already
    /// collected.
    pub async fn wait(&self) -> Option<Mission> {
        let (mission_id, task) = {
            let mut run = lock_recover(&self.run, "run");
            let handle = run.as_mut()?;
            (handle.mission_id.clone(), handle.task.take()?)
        };

        match task.await {
            Ok(mission) => Some(mission),
            Err(e) => {
                warn!(mission_id = %mission_id, error = %e, "mission task aborted");
                self.history().into_iter().find(|m| m.id == mission_id)
            }
        }
    }

    /// Rebuild a mission from its last checkpoint so it can be started again.
    ///
    /// Phases before the checkpointed phase come back completed; the rest are
    /// reset to pending. Fails when no valid checkpoint exists and returns
    /// `None` when the mission is not in history.
    pub async fn restore_from_checkpoint(&self, mission_id: &Id) -> Result<Option<Mission>> {
        let snapshot = self
            .storage
            .load_checkpoint(mission_id)
            .await
            .map_err(|e| OrchestratorError::CheckpointRestoreFailed(e.to_string()))?
            .ok_or_else(|| {
                OrchestratorError::CheckpointRestoreFailed(format!(
                    "no checkpoint for mission {mission_id}"
                ))
            })?;

        let cached = self.history().into_iter().find(|m| &m.id == mission_id);
        let mission = match cached {
            Some(mission) => mission,
            None => match self.storage.get_history_mission(mission_id).await {
                Ok(mission) => mission,
                Err(StorageError::MissionNotFound(_)) => return Ok(None),
                Err(e) => return Err(e.into()),
            },
        };

        info!(
            mission_id = %mission_id,
            phase_order = snapshot.phase_order,
            step_order = snapshot.step_order,
            "restoring mission from checkpoint"
        );
        Ok(Some(rewind_to_checkpoint(mission, &snapshot)))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MissionEvent> {
        self.events.subscribe()
    }

    pub fn active_mission(&self) -> Option<Mission> {
        lock_recover(&self.state, "state").active.clone()
    }

    pub fn current_phase(&self) -> Option<MissionPhase> {
        let state = lock_recover(&self.state, "state");
        let phase_id = state.current_phase.as_ref()?;
        state
            .active
            .as_ref()?
            .phases
            .iter()
            .find(|p| &p.id == phase_id)
            .cloned()
    }

    pub fn current_step(&self) -> Option<MissionStep> {
        let state = lock_recover(&self.state, "state");
        let step_id = state.current_step.as_ref()?;
        state
            .active
            .as_ref()?
            .phases
            .iter()
            .flat_map(|p| p.steps.iter())
            .find(|s| &s.id == step_id)
            .cloned()
    }

    /// Fraction of steps completed for the active or last finished mission.
    pub fn progress(&self) -> f64 {
        lock_recover(&self.state, "state").progress
    }

    pub fn logs(&self) -> Vec<MissionLog> {
        lock_recover(&self.state, "state").logs.clone()
    }

    /// Finished missions, most recent first.
    pub fn history(&self) -> Vec<Mission> {
        lock_recover(&self.state, "state").history.clone()
    }

    pub fn retry_count(&self, phase_id: &Id, step_id: &Id) -> u32 {
        lock_recover(&self.state, "state")
            .retry_counts
            .get(&(phase_id.clone(), step_id.clone()))
            .copied()
            .unwrap_or(0)
    }

    /// Last checkpoint saved during this process for a mission.
    pub fn last_checkpoint(&self, mission_id: &Id) -> Option<CheckpointSnapshot> {
        lock_recover(&self.state, "state")
            .checkpoints
            .get(mission_id)
            .cloned()
    }

    pub fn is_paused(&self) -> bool {
        lock_recover(&self.state, "state")
            .active
            .as_ref()
            .is_some_and(|m| m.status == MissionStatus::Paused)
    }

    fn emit(&self, event: MissionEvent) {
        let _ = self.events.send(event);
    }
}

/// Mark work before the checkpointed phase complete and reset the rest.
fn rewind_to_checkpoint(mut mission: Mission, snapshot: &CheckpointSnapshot) -> Mission {
    let now = Utc::now();
    for phase in &mut mission.phases {
        if phase.order < snapshot.phase_order {
            phase.status = PhaseStatus::Completed;
            phase.completed_at.get_or_insert(now);
            for step in &mut phase.steps {
                step.status = StepStatus::Completed;
                step.error = None;
                step.completed_at.get_or_insert(now);
            }
        } else {
            phase.status = PhaseStatus::Pending;
            phase.started_at = None;
            phase.completed_at = None;
            for step in &mut phase.steps {
                step.status = StepStatus::Pending;
                step.started_at = None;
                step.completed_at = None;
                step.error = None;
            }
        }
    }

    mission.status = MissionStatus::Planned;
    mission.started_at = None;
    mission.completed_at = None;
    mission.error = None;
    mission.report = None;
    mission
}

#[cfg(test)]
mod tests {
    use super::*;
    use mission_core::analyze;

    fn finished_mission() -> Mission {
        let analysis = analyze("create feature then deploy service");
        let phases = plan(&analysis);
        let mut mission = Mission::new("goal", MissionContext::default(), analysis, phases);
        mission.status = MissionStatus::Failed;
        mission.error = Some("boom".to_string());
        mission.started_at = Some(Utc::now());
        mission.completed_at = Some(Utc::now());
        for phase in &mut mission.phases[..2] {
            phase.status = PhaseStatus::Completed;
            for step in &mut phase.steps {
                step.status = StepStatus::Completed;
            }
        }
        mission.phases[2].status = PhaseStatus::Failed;
        mission.phases[2].steps[0].status = StepStatus::Completed;
        mission.phases[2].steps[1].status = StepStatus::Failed;
        mission.phases[2].steps[1].error = Some("boom".to_string());
        mission
    }

    #[test]
    fn rewind_keeps_phases_before_checkpoint() {
        let mission = finished_mission();
        let snapshot = CheckpointSnapshot {
            mission_id: mission.id.clone(),
            phase_order: 3,
            step_order: 4,
            timestamp: Utc::now(),
        };

        let restored = rewind_to_checkpoint(mission, &snapshot);

        assert_eq!(restored.status, MissionStatus::Planned);
        assert!(restored.error.is_none());
        assert!(restored.started_at.is_none());
        assert_eq!(restored.phases[0].status, PhaseStatus::Completed);
        assert_eq!(restored.phases[1].status, PhaseStatus::Completed);
        assert_eq!(restored.phases[2].status, PhaseStatus::Pending);
        assert!(restored.phases[2]
            .steps
            .iter()
            .all(|s| s.status == StepStatus::Pending && s.error.is_none()));
        assert_eq!(restored.phases[3].status, PhaseStatus::Pending);
    }

    #[test]
    fn rewind_to_first_phase_resets_everything() {
        let mission = finished_mission();
        let snapshot = CheckpointSnapshot {
            mission_id: mission.id.clone(),
            phase_order: 1,
            step_order: 3,
            timestamp: Utc::now(),
        };

        let restored = rewind_to_checkpoint(mission, &snapshot);
        assert_eq!(restored.completed_steps(), 0);
        assert!(restored
            .phases
            .iter()
            .all(|p| p.status == PhaseStatus::Pending));
    }

    #[test]
    fn error_messages_name_the_failure() {
        let err = OrchestratorError::StepExecutionFailed {
            step: "Generate feature code".to_string(),
            reason: "compiler crashed".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "step Generate feature code failed: compiler crashed"
        );

        let err = OrchestratorError::InvalidTransition {
            from: MissionStatus::Completed,
            to: MissionStatus::Running,
        };
        assert_eq!(err.to_string(), "invalid transition from COMPLETED to RUNNING");
    }
}
