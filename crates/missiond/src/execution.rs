//! Mission execution loop.
//!
//! Runs phases in order and steps in order within each phase. The loop owns
//! the [`Mission`] while it runs and publishes a snapshot into the shared
//! state after every transition. Cancellation and pause are observed at
//! phase and step boundaries only; an in-flight step always finishes.
//!
//! Retry policy: each failure of a retryable step bumps a counter keyed by
//! `(phase id, step id)`. While the counter is below `max_retries` the step is
//! re-executed inline, up to `retry_attempts` times. Checkpoint failures are
//! fatal and leave the counter untouched.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use mission_core::events::{
    CheckpointSavedPayload, PhaseStartedPayload, StepFinishedPayload, StepRetriedPayload,
};
use mission_core::{
    build_report, Config, LogLevel, Mission, MissionEvent, MissionLog, MissionStatus,
    MissionStep, PhaseStatus, StepStatus,
};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::executor::{StepContext, StepEffect, StepError, StepExecutor};
use crate::orchestrator::OrchestratorError;
use crate::state::{lock_recover, OrchestratorState};
use crate::storage::Storage;

/// Control handles shared between the controller and one running mission.
#[derive(Debug, Clone, Default)]
pub struct RunControl {
    pub cancel: CancellationToken,
    pub paused: Arc<AtomicBool>,
}

impl RunControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
    }
}

/// Loop tunables taken from [`Config`].
#[derive(Debug, Clone, Copy)]
pub struct RunSettings {
    pub max_retries: u32,
    pub retry_attempts: u32,
    pub pause_poll: Duration,
    pub history_limit: usize,
}

impl From<&Config> for RunSettings {
    fn from(config: &Config) -> Self {
        Self {
            max_retries: config.max_retries,
            retry_attempts: config.retry_attempts,
            pause_poll: Duration::from_millis(config.pause_poll_ms.max(1)),
            history_limit: config.history_limit,
        }
    }
}

/// One execution of one mission.
#[derive(Debug)]
pub struct MissionRun {
    mission: Mission,
    logs: Vec<MissionLog>,
    /// Indices of the current phase and step.
    cursor: Option<(usize, Option<usize>)>,
    settings: RunSettings,
    control: RunControl,
    state: Arc<Mutex<OrchestratorState>>,
    executor: Arc<StepExecutor>,
    storage: Arc<Storage>,
    events: broadcast::Sender<MissionEvent>,
}

impl MissionRun {
    pub fn new(
        mission: Mission,
        settings: RunSettings,
        control: RunControl,
        state: Arc<Mutex<OrchestratorState>>,
        executor: Arc<StepExecutor>,
        storage: Arc<Storage>,
        events: broadcast::Sender<MissionEvent>,
    ) -> Self {
        Self {
            mission,
            logs: Vec::new(),
            cursor: None,
            settings,
            control,
            state,
            executor,
            storage,
            events,
        }
    }

    /// Drive the mission to a terminal state and return the final record.
    pub async fn run(mut self) -> Mission {
        info!(
            mission_id = %self.mission.id,
            phases = self.mission.phases.len(),
            steps = self.mission.total_steps(),
            "mission started"
        );
        self.log(LogLevel::Info, format!("Mission started: {}", self.mission.goal));

        match self.execute_phases().await {
            Ok(()) => self.finish(MissionStatus::Completed, None).await,
            Err(OrchestratorError::Cancelled) => self.finish(MissionStatus::Cancelled, None).await,
            Err(err) => self.finish(MissionStatus::Failed, Some(err.to_string())).await,
        }
        self.mission
    }

    async fn execute_phases(&mut self) -> Result<(), OrchestratorError> {
        for phase_idx in 0..self.mission.phases.len() {
            if self.mission.phases[phase_idx].status == PhaseStatus::Completed {
                debug!(
                    mission_id = %self.mission.id,
                    phase = %self.mission.phases[phase_idx].name,
                    "skipping completed phase"
                );
                continue;
            }

            self.wait_at_boundary().await?;
            self.start_phase(phase_idx);

            for step_idx in 0..self.mission.phases[phase_idx].steps.len() {
                if self.mission.phases[phase_idx].steps[step_idx].status == StepStatus::Completed {
                    continue;
                }

                self.wait_at_boundary().await?;
                let result = self.run_step(phase_idx, step_idx).await;
                self.report_progress();

                if let Err(err) = result {
                    self.end_phase(phase_idx, PhaseStatus::Failed);
                    return Err(match err {
                        OrchestratorError::StepExecutionFailed { .. } => {
                            OrchestratorError::PhaseExecutionFailed {
                                phase: self.mission.phases[phase_idx].name.clone(),
                                reason: err.to_string(),
                            }
                        }
                        other => other,
                    });
                }
            }

            self.end_phase(phase_idx, PhaseStatus::Completed);
        }
        Ok(())
    }

    /// Poll point between phases and steps: honours cancel, then blocks while
    /// the pause flag is set.
    async fn wait_at_boundary(&mut self) -> Result<(), OrchestratorError> {
        let mut waited = false;
        loop {
            if self.control.cancel.is_cancelled() {
                return Err(OrchestratorError::Cancelled);
            }
            if !self.control.is_paused() {
                break;
            }
            if !waited {
                waited = true;
                self.log(LogLevel::Warning, "Mission paused".to_string());
                self.publish();
            }
            tokio::time::sleep(self.settings.pause_poll).await;
        }

        if waited {
            self.log(LogLevel::Info, "Mission resumed".to_string());
            self.publish();
        }
        Ok(())
    }

    fn start_phase(&mut self, phase_idx: usize) {
        let phase = &mut self.mission.phases[phase_idx];
        phase.status = PhaseStatus::Running;
        phase.started_at = Some(Utc::now());
        phase.completed_at = None;

        let payload = PhaseStartedPayload {
            mission_id: self.mission.id.clone(),
            phase_id: phase.id.clone(),
            name: phase.name.clone(),
            order: phase.order,
        };

        self.cursor = Some((phase_idx, None));
        info!(mission_id = %payload.mission_id, phase = %payload.name, order = payload.order, "phase started");
        self.log(
            LogLevel::Info,
            format!("Starting phase {}: {}", payload.order, payload.name),
        );
        self.publish();
        self.emit(MissionEvent::PhaseStarted(payload));
    }

    fn end_phase(&mut self, phase_idx: usize, status: PhaseStatus) {
        let phase = &mut self.mission.phases[phase_idx];
        phase.status = status;
        phase.completed_at = Some(Utc::now());
        let name = phase.name.clone();

        self.cursor = Some((phase_idx, None));
        if status == PhaseStatus::Completed {
            self.log(LogLevel::Success, format!("Phase completed: {name}"));
        } else {
            self.log(LogLevel::Error, format!("Phase failed: {name}"));
        }
        self.publish();
    }

    /// Execute one step with the retry policy applied.
    async fn run_step(&mut self, phase_idx: usize, step_idx: usize) -> Result<(), OrchestratorError> {
        self.cursor = Some((phase_idx, Some(step_idx)));
        let mission_id = self.mission.id.clone();
        let step = self.step_mut(phase_idx, step_idx);
        step.status = StepStatus::Running;
        step.started_at = Some(Utc::now());
        step.completed_at = None;
        step.error = None;
        let name = step.name.clone();

        self.log(LogLevel::Info, format!("Executing step: {name}"));
        self.publish();

        let started = Instant::now();
        let mut attempts: u32 = 1;
        let outcome = loop {
            let err = match self.attempt_step(phase_idx, step_idx).await {
                Ok(()) => break Ok(()),
                Err(err) => err,
            };

            let step = self.step_mut(phase_idx, step_idx);
            step.status = StepStatus::Failed;
            step.error = Some(err.to_string());
            warn!(mission_id = %mission_id, step = %name, attempts, error = %err, "step failed");

            match self.next_retry(phase_idx, step_idx, attempts - 1) {
                Some(retry_count) => {
                    attempts += 1;
                    self.step_mut(phase_idx, step_idx).status = StepStatus::Running;
                    self.log(
                        LogLevel::Warning,
                        format!("Step failed: {name}: {err}; retrying (attempt {attempts})"),
                    );
                    self.publish();
                    let step_id = self.mission.phases[phase_idx].steps[step_idx].id.clone();
                    self.emit(MissionEvent::StepRetried(StepRetriedPayload {
                        mission_id: mission_id.clone(),
                        step_id,
                        retry_count,
                        reason: err.to_string(),
                    }));
                }
                None => break Err(err),
            }
        };

        let step = self.step_mut(phase_idx, step_idx);
        step.completed_at = Some(Utc::now());
        match &outcome {
            Ok(()) => {
                step.status = StepStatus::Completed;
                step.error = None;
            }
            Err(err) => {
                step.status = StepStatus::Failed;
                step.error = Some(err.to_string());
            }
        }
        let finished = StepFinishedPayload {
            mission_id: mission_id.clone(),
            step_id: step.id.clone(),
            step_type: step.step_type,
            status: step.status,
            attempts,
            duration_ms: started.elapsed().as_millis() as u64,
        };

        match &outcome {
            Ok(()) => self.log(LogLevel::Success, format!("Step completed: {name}")),
            Err(err) => {
                error!(mission_id = %mission_id, step = %name, error = %err, "step failed permanently");
                self.log(LogLevel::Error, format!("Step failed: {name}: {err}"));
            }
        }
        self.publish();
        self.emit(MissionEvent::StepFinished(finished));

        outcome.map_err(|err| match err {
            StepError::ValidationFailed(reason) => OrchestratorError::ValidationFailed(reason),
            other => OrchestratorError::StepExecutionFailed {
                step: name,
                reason: other.to_string(),
            },
        })
    }

    async fn attempt_step(&mut self, phase_idx: usize, step_idx: usize) -> Result<(), StepError> {
        let effect = {
            let ctx = StepContext {
                mission: &self.mission,
                phase_order: self.mission.phases[phase_idx].order,
                logs: &self.logs,
            };
            let step = &self.mission.phases[phase_idx].steps[step_idx];
            self.executor.execute(step, ctx).await?
        };
        self.apply_effect(effect);
        Ok(())
    }

    /// Record a failure and decide whether to retry. Returns the updated
    /// counter when another attempt is allowed.
    fn next_retry(&self, phase_idx: usize, step_idx: usize, retries_done: u32) -> Option<u32> {
        let phase = &self.mission.phases[phase_idx];
        let step = &phase.steps[step_idx];
        if !step.step_type.is_retryable() {
            return None;
        }

        let count = {
            let mut state = lock_recover(&self.state, "state");
            let count = state
                .retry_counts
                .entry((phase.id.clone(), step.id.clone()))
                .or_insert(0);
            *count += 1;
            *count
        };

        (count < self.settings.max_retries && retries_done < self.settings.retry_attempts)
            .then_some(count)
    }

    fn apply_effect(&mut self, effect: StepEffect) {
        match effect {
            StepEffect::None => {}
            StepEffect::AttachReport(report) => {
                self.mission.report = Some(*report);
            }
            StepEffect::ClearScratch => {
                let mut state = lock_recover(&self.state, "state");
                state.retry_counts.clear();
                state.checkpoints.clear();
            }
            StepEffect::CheckpointSaved(snapshot) => {
                let payload = CheckpointSavedPayload {
                    mission_id: snapshot.mission_id.clone(),
                    phase_order: snapshot.phase_order,
                    step_order: snapshot.step_order,
                };
                lock_recover(&self.state, "state")
                    .checkpoints
                    .insert(snapshot.mission_id.clone(), snapshot);
                self.log(
                    LogLevel::Info,
                    format!(
                        "Checkpoint saved at phase {} step {}",
                        payload.phase_order, payload.step_order
                    ),
                );
                self.emit(MissionEvent::CheckpointSaved(payload));
            }
        }
    }

    fn report_progress(&mut self) {
        let progress = self.mission.progress();
        self.publish();
        self.emit(MissionEvent::Progress {
            mission_id: self.mission.id.clone(),
            progress,
        });
    }

    async fn finish(&mut self, status: MissionStatus, error: Option<String>) {
        self.cursor = None;
        self.mission.status = status;
        self.mission.completed_at = Some(Utc::now());
        self.mission.error.clone_from(&error);

        match status {
            MissionStatus::Completed => {
                info!(mission_id = %self.mission.id, "mission completed");
                self.log(LogLevel::Success, "Mission completed".to_string());
            }
            MissionStatus::Cancelled => {
                info!(mission_id = %self.mission.id, "mission cancelled");
                self.log(LogLevel::Warning, "Mission cancelled".to_string());
            }
            _ => {
                let reason = error.unwrap_or_default();
                error!(mission_id = %self.mission.id, error = %reason, "mission failed");
                self.log(LogLevel::Error, format!("Mission failed: {reason}"));
            }
        }

        self.mission.report = Some(build_report(&self.mission, &self.logs));

        {
            let mut state = lock_recover(&self.state, "state");
            if !self.control.cancel.is_cancelled() && state.is_active(&self.mission.id) {
                state.clear_active();
                state.progress = self.mission.progress();
            }
            state.push_history(self.mission.clone(), self.settings.history_limit);
        }

        if let Err(e) = self
            .storage
            .append_to_history(&self.mission, self.settings.history_limit)
            .await
        {
            warn!(mission_id = %self.mission.id, error = %e, "failed to persist mission history");
        }

        let mission = Box::new(self.mission.clone());
        self.emit(match status {
            MissionStatus::Completed => MissionEvent::MissionCompleted(mission),
            MissionStatus::Cancelled => MissionEvent::MissionCancelled(mission),
            _ => MissionEvent::MissionFailed(mission),
        });
    }

    /// Copy the loop's view into the shared state. A cancelled run no longer
    /// owns the active slot and only keeps its local copy.
    fn publish(&mut self) {
        let mut state = lock_recover(&self.state, "state");
        if self.control.cancel.is_cancelled() || !state.is_active(&self.mission.id) {
            return;
        }

        if self.mission.status.is_active() {
            self.mission.status = if self.control.is_paused() {
                MissionStatus::Paused
            } else {
                MissionStatus::Running
            };
        }

        let (phase, step) = self.cursor_ids();
        state.current_phase = phase;
        state.current_step = step;
        state.progress = self.mission.progress();
        state.active = Some(self.mission.clone());
    }

    /// Append to the log trail, mirror to tracing, and notify observers.
    fn log(&mut self, level: LogLevel, message: String) {
        let (phase, step) = self.cursor_names();
        let entry = MissionLog {
            timestamp: Utc::now(),
            level,
            message,
            phase,
            step,
        };

        match level {
            LogLevel::Info | LogLevel::Success => {
                info!(mission_id = %self.mission.id, level = level.as_str(), "{}", entry.message);
            }
            LogLevel::Warning => warn!(mission_id = %self.mission.id, "{}", entry.message),
            LogLevel::Error => error!(mission_id = %self.mission.id, "{}", entry.message),
        }

        {
            let mut state = lock_recover(&self.state, "state");
            if !self.control.cancel.is_cancelled() && state.is_active(&self.mission.id) {
                state.logs.push(entry.clone());
            }
        }
        self.logs.push(entry.clone());
        self.emit(MissionEvent::Log(entry));
    }

    fn emit(&self, event: MissionEvent) {
        debug!(event = event.event_type().as_str(), "emitting event");
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn step_mut(&mut self, phase_idx: usize, step_idx: usize) -> &mut MissionStep {
        &mut self.mission.phases[phase_idx].steps[step_idx]
    }

    fn cursor_ids(&self) -> (Option<mission_core::Id>, Option<mission_core::Id>) {
        match self.cursor {
            Some((p, s)) => {
                let phase = &self.mission.phases[p];
                (
                    Some(phase.id.clone()),
                    s.map(|s| phase.steps[s].id.clone()),
                )
            }
            None => (None, None),
        }
    }

    fn cursor_names(&self) -> (Option<String>, Option<String>) {
        match self.cursor {
            Some((p, s)) => {
                let phase = &self.mission.phases[p];
                (
                    Some(phase.name.clone()),
                    s.map(|s| phase.steps[s].name.clone()),
                )
            }
            None => (None, None),
        }
    }
}
