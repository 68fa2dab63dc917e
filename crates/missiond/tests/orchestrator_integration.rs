//! Integration tests for the mission lifecycle.
//!
//! Drives the orchestrator end to end against a temporary SQLite database:
//! start, pause, resume, cancel, retry, checkpoint restore, and history.

use async_trait::async_trait;
use mission_core::{
    Config, Id, Mission, MissionEvent, MissionStatus, MissionStep, PhaseStatus, StepStatus,
    StepType,
};
use missiond::orchestrator::{Orchestrator, OrchestratorError};
use missiond::storage::Storage;
use missiond::{StepError, StepExecutor, StepHandler};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Notify;
use tokio::time::timeout;

const EXAMPLE_GOAL: &str = "create a new authentication feature";
const WAIT: Duration = Duration::from_secs(10);

struct TestOrchestrator {
    orchestrator: Orchestrator,
    storage: Arc<Storage>,
    _dir: TempDir,
}

fn test_config() -> Config {
    Config {
        pause_poll_ms: 5,
        ..Config::default()
    }
}

async fn create_test_orchestrator(
    config: Config,
    handlers: Vec<(StepType, Arc<dyn StepHandler>)>,
) -> TestOrchestrator {
    let dir = TempDir::new().unwrap();
    let storage = Storage::new(&dir.path().join("test.db")).await.unwrap();
    storage.migrate_embedded().await.unwrap();
    let storage = Arc::new(storage);

    let mut executor = StepExecutor::new(Arc::clone(&storage));
    for (step_type, handler) in handlers {
        executor.register(step_type, handler);
    }

    let orchestrator = Orchestrator::new(config, Arc::clone(&storage), executor)
        .await
        .unwrap();
    TestOrchestrator {
        orchestrator,
        storage,
        _dir: dir,
    }
}

fn handler(
    step_type: StepType,
    collaborator: Arc<dyn StepHandler>,
) -> Vec<(StepType, Arc<dyn StepHandler>)> {
    vec![(step_type, collaborator)]
}

async fn wait_for(orchestrator: &Orchestrator) -> Mission {
    timeout(WAIT, orchestrator.wait())
        .await
        .expect("mission did not finish in time")
        .expect("no mission to wait for")
}

/// Blocks inside the step until released.
#[derive(Default)]
struct Gate {
    entered: Notify,
    release: Notify,
}

#[async_trait]
impl StepHandler for Gate {
    async fn handle(&self, _step: &MissionStep, _mission: &Mission) -> Result<(), StepError> {
        self.entered.notify_one();
        self.release.notified().await;
        Ok(())
    }
}

impl Gate {
    async fn wait_entered(&self) {
        timeout(WAIT, self.entered.notified())
            .await
            .expect("gated step never started");
    }
}

/// Fails the first `failures` calls, then succeeds.
struct Flaky {
    failures: u32,
    calls: AtomicU32,
}

impl Flaky {
    fn new(failures: u32) -> Arc<Self> {
        Arc::new(Self {
            failures,
            calls: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl StepHandler for Flaky {
    async fn handle(&self, step: &MissionStep, _mission: &Mission) -> Result<(), StepError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            Err(StepError::collaborator(format!("{} failed on call {call}", step.name)))
        } else {
            Ok(())
        }
    }
}

// --- Lifecycle ---

#[tokio::test]
async fn example_goal_runs_to_completion() {
    let t = create_test_orchestrator(test_config(), vec![]).await;
    let orch = &t.orchestrator;
    let mut events = orch.subscribe();

    let mission = orch.create_mission(EXAMPLE_GOAL, None);
    assert_eq!(mission.status, MissionStatus::Planned);
    assert_eq!(mission.phases.len(), 3);
    assert_eq!(mission.total_steps(), 12);

    orch.start_mission(mission.clone()).unwrap();
    let done = wait_for(orch).await;

    assert_eq!(done.id, mission.id);
    assert_eq!(done.status, MissionStatus::Completed);
    assert!((done.progress() - 1.0).abs() < f64::EPSILON);
    assert!((orch.progress() - 1.0).abs() < f64::EPSILON);
    assert!(done.started_at.is_some());
    assert!(done.completed_at.is_some());
    assert!(done
        .phases
        .iter()
        .flat_map(|p| p.steps.iter())
        .all(|s| s.status == StepStatus::Completed));

    let report = done.report.as_ref().expect("terminal report");
    assert_eq!(report.status, MissionStatus::Completed);
    assert_eq!(report.phases_completed, 3);
    assert!(!report.logs.is_empty());

    assert!(orch.active_mission().is_none());
    assert!(orch.current_phase().is_none());
    assert!(orch.current_step().is_none());
    assert_eq!(orch.history()[0].id, mission.id);
    assert!(!orch.logs().is_empty());

    let mut progress = Vec::new();
    let mut started = 0;
    let mut completed = 0;
    while let Ok(event) = events.try_recv() {
        match event {
            MissionEvent::MissionStarted { .. } => started += 1,
            MissionEvent::Progress { progress: p, .. } => progress.push(p),
            MissionEvent::MissionCompleted(_) => completed += 1,
            _ => {}
        }
    }
    assert_eq!(started, 1);
    assert_eq!(completed, 1);
    assert_eq!(progress.len(), 12);
    assert!(progress.windows(2).all(|w| w[0] <= w[1]));
    assert!((progress[11] - 1.0).abs() < f64::EPSILON);
}

#[tokio::test]
async fn second_start_is_rejected_while_active() {
    let gate = Arc::new(Gate::default());
    let t = create_test_orchestrator(
        test_config(),
        handler(StepType::CodeGeneration, gate.clone()),
    )
    .await;
    let orch = &t.orchestrator;

    let first = orch.create_mission(EXAMPLE_GOAL, None);
    orch.start_mission(first.clone()).unwrap();
    gate.wait_entered().await;

    let second = orch.create_mission("fix the api", None);
    let err = orch.start_mission(second).unwrap_err();
    assert!(matches!(err, OrchestratorError::MissionAlreadyActive(ref id) if *id == first.id));

    assert_eq!(
        orch.current_step().map(|s| s.step_type),
        Some(StepType::CodeGeneration)
    );
    assert_eq!(
        orch.current_phase().map(|p| p.name),
        Some("Execute: create feature".to_string())
    );

    gate.release.notify_one();
    let done = wait_for(orch).await;
    assert_eq!(done.status, MissionStatus::Completed);

    // The slot is free again.
    let third = orch.create_mission("fix the api", None);
    orch.start_mission(third).unwrap();
    assert_eq!(wait_for(orch).await.status, MissionStatus::Completed);
    assert_eq!(orch.history().len(), 2);
}

#[tokio::test]
async fn finished_mission_cannot_be_restarted() {
    let t = create_test_orchestrator(test_config(), vec![]).await;
    let orch = &t.orchestrator;
    orch.start_mission(orch.create_mission("fix the api", None))
        .unwrap();
    let done = wait_for(orch).await;

    let err = orch.start_mission(done).unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::InvalidTransition {
            from: MissionStatus::Completed,
            to: MissionStatus::Running
        }
    ));
}

#[tokio::test]
async fn controls_without_active_mission_fail() {
    let t = create_test_orchestrator(test_config(), vec![]).await;
    let orch = &t.orchestrator;

    assert!(matches!(
        orch.pause_mission(),
        Err(OrchestratorError::NoActiveMission)
    ));
    assert!(matches!(
        orch.resume_mission(),
        Err(OrchestratorError::NoActiveMission)
    ));
    assert!(matches!(
        orch.cancel_mission(),
        Err(OrchestratorError::NoActiveMission)
    ));
    assert!(orch.wait().await.is_none());
    assert!(!orch.is_paused());
}

#[tokio::test]
async fn pause_holds_at_next_boundary_until_resume() {
    let gate = Arc::new(Gate::default());
    let t = create_test_orchestrator(
        test_config(),
        handler(StepType::CodeGeneration, gate.clone()),
    )
    .await;
    let orch = &t.orchestrator;

    let mission = orch.create_mission(EXAMPLE_GOAL, None);
    orch.start_mission(mission).unwrap();
    gate.wait_entered().await;

    assert!(matches!(
        orch.resume_mission(),
        Err(OrchestratorError::NoPausedMission)
    ));

    orch.pause_mission().unwrap();
    assert!(orch.is_paused());
    assert!(matches!(
        orch.pause_mission(),
        Err(OrchestratorError::InvalidTransition { .. })
    ));

    // The in-flight step finishes; the next one must not start.
    gate.release.notify_one();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let snapshot = orch.active_mission().expect("still active");
    assert_eq!(snapshot.status, MissionStatus::Paused);
    let phase = &snapshot.phases[1];
    assert_eq!(phase.steps[1].status, StepStatus::Completed);
    assert_eq!(phase.steps[2].status, StepStatus::Pending);
    let paused_progress = orch.progress();
    assert!(paused_progress < 1.0);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!((orch.progress() - paused_progress).abs() < f64::EPSILON);

    orch.resume_mission().unwrap();
    assert!(!orch.is_paused());
    let done = wait_for(orch).await;
    assert_eq!(done.status, MissionStatus::Completed);
    assert!(done.report.unwrap().logs.iter().any(|l| l.message == "Mission paused"));
}

#[tokio::test]
async fn paused_mission_blocks_start_and_can_be_cancelled() {
    let gate = Arc::new(Gate::default());
    let t = create_test_orchestrator(
        test_config(),
        handler(StepType::CodeGeneration, gate.clone()),
    )
    .await;
    let orch = &t.orchestrator;

    let first = orch.create_mission(EXAMPLE_GOAL, None);
    orch.start_mission(first.clone()).unwrap();
    gate.wait_entered().await;
    orch.pause_mission().unwrap();
    gate.release.notify_one();

    timeout(WAIT, async {
        while !orch.logs().iter().any(|l| l.message == "Mission paused") {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("loop never parked");
    let before = orch.active_mission().unwrap();

    let second = orch.create_mission("fix the api", None);
    let err = orch.start_mission(second).unwrap_err();
    assert!(matches!(err, OrchestratorError::MissionAlreadyActive(ref id) if *id == first.id));

    let after = orch.active_mission().expect("still active");
    assert_eq!(after.id, first.id);
    assert_eq!(after.status, MissionStatus::Paused);
    assert_eq!(after.completed_steps(), before.completed_steps());
    assert!(orch.is_paused());

    orch.cancel_mission().unwrap();
    assert!(orch.active_mission().is_none());
    let done = wait_for(orch).await;
    assert_eq!(done.id, first.id);
    assert_eq!(done.status, MissionStatus::Cancelled);
    assert_eq!(done.phases[1].steps[2].status, StepStatus::Pending);
    assert_eq!(orch.history()[0].id, first.id);
}

#[tokio::test]
async fn cancel_preserves_completed_steps() {
    let gate = Arc::new(Gate::default());
    let t = create_test_orchestrator(
        test_config(),
        handler(StepType::CodeGeneration, gate.clone()),
    )
    .await;
    let orch = &t.orchestrator;
    let mut events = orch.subscribe();

    let mission = orch.create_mission(EXAMPLE_GOAL, None);
    orch.start_mission(mission.clone()).unwrap();
    gate.wait_entered().await;

    orch.cancel_mission().unwrap();
    assert!(orch.active_mission().is_none());
    assert!(orch.current_step().is_none());

    gate.release.notify_one();
    let done = wait_for(orch).await;

    assert_eq!(done.status, MissionStatus::Cancelled);
    assert!(done.completed_at.is_some());
    assert!(done.error.is_none());
    assert_eq!(done.phases[0].status, PhaseStatus::Completed);
    assert_eq!(done.phases[1].steps[0].status, StepStatus::Completed);
    // The in-flight step runs to completion before the loop stops.
    assert_eq!(done.phases[1].steps[1].status, StepStatus::Completed);
    assert_eq!(done.phases[1].steps[2].status, StepStatus::Pending);
    assert_eq!(done.phases[2].status, PhaseStatus::Pending);

    let history = orch.history();
    assert_eq!(history[0].id, mission.id);
    assert_eq!(history[0].status, MissionStatus::Cancelled);

    let stored = t.storage.get_history_mission(&mission.id).await.unwrap();
    assert_eq!(stored.status, MissionStatus::Cancelled);

    let mut cancelled = false;
    while let Ok(event) = events.try_recv() {
        cancelled |= matches!(event, MissionEvent::MissionCancelled(ref m) if m.id == mission.id);
    }
    assert!(cancelled);
}

// --- Failure handling ---

#[tokio::test]
async fn single_failure_recovers_through_retry() {
    let flaky = Flaky::new(1);
    let t = create_test_orchestrator(
        test_config(),
        handler(StepType::CodeGeneration, flaky.clone()),
    )
    .await;
    let orch = &t.orchestrator;
    let mut events = orch.subscribe();

    orch.start_mission(orch.create_mission(EXAMPLE_GOAL, None))
        .unwrap();
    let done = wait_for(orch).await;

    assert_eq!(done.status, MissionStatus::Completed);
    assert_eq!(flaky.calls.load(Ordering::SeqCst), 2);

    let mut retried = Vec::new();
    let mut attempts = None;
    while let Ok(event) = events.try_recv() {
        match event {
            MissionEvent::StepRetried(payload) => retried.push(payload),
            MissionEvent::StepFinished(payload) if payload.step_type == StepType::CodeGeneration => {
                attempts = Some(payload.attempts);
            }
            _ => {}
        }
    }
    assert_eq!(retried.len(), 1);
    assert_eq!(retried[0].retry_count, 1);
    assert!(retried[0].reason.contains("failed on call 1"));
    assert_eq!(attempts, Some(2));
}

#[tokio::test]
async fn repeated_failure_fails_mission_with_last_error() {
    let flaky = Flaky::new(u32::MAX);
    let t = create_test_orchestrator(
        test_config(),
        handler(StepType::CodeGeneration, flaky.clone()),
    )
    .await;
    let orch = &t.orchestrator;

    let mission = orch.create_mission(EXAMPLE_GOAL, None);
    orch.start_mission(mission.clone()).unwrap();
    let done = wait_for(orch).await;

    assert_eq!(done.status, MissionStatus::Failed);
    assert_eq!(flaky.calls.load(Ordering::SeqCst), 2);

    let phase = &done.phases[1];
    let step = &phase.steps[1];
    assert_eq!(phase.status, PhaseStatus::Failed);
    assert_eq!(step.status, StepStatus::Failed);
    assert_eq!(
        step.error.as_deref(),
        Some("Generate feature code failed on call 2")
    );
    let error = done.error.as_deref().unwrap();
    assert!(error.contains("Execute: create feature"));
    assert!(error.contains("failed on call 2"));
    assert_eq!(orch.retry_count(&phase.id, &step.id), 2);

    let report = done.report.as_ref().unwrap();
    assert_eq!(report.status, MissionStatus::Failed);
    assert_eq!(report.phases_completed, 1);
    assert_eq!(orch.history()[0].status, MissionStatus::Failed);
}

#[tokio::test]
async fn infeasible_mission_fails_validation() {
    let config = Config {
        available_capabilities: vec!["network".to_string()],
        ..test_config()
    };
    let t = create_test_orchestrator(config, vec![]).await;
    let orch = &t.orchestrator;

    let mission = orch.create_mission(EXAMPLE_GOAL, None);
    assert!(!mission.analysis.feasibility.feasible);
    orch.start_mission(mission).unwrap();
    let done = wait_for(orch).await;

    assert_eq!(done.status, MissionStatus::Failed);
    let error = done.error.clone().unwrap();
    assert!(error.starts_with("validation failed"));
    assert!(error.contains("code_generation"));
    assert_eq!(done.completed_steps(), 0);
}

#[tokio::test]
async fn checkpoint_write_failure_aborts_without_retry() {
    let t = create_test_orchestrator(test_config(), vec![]).await;
    let orch = &t.orchestrator;
    t.storage.close().await;

    let mission = orch.create_mission(EXAMPLE_GOAL, None);
    orch.start_mission(mission).unwrap();
    let done = wait_for(orch).await;

    assert_eq!(done.status, MissionStatus::Failed);
    let phase = &done.phases[0];
    let checkpoint = &phase.steps[2];
    assert_eq!(checkpoint.step_type, StepType::Checkpoint);
    assert_eq!(checkpoint.status, StepStatus::Failed);
    assert_eq!(orch.retry_count(&phase.id, &checkpoint.id), 0);
    // Persistence is down, but in-memory history still records the outcome.
    assert_eq!(orch.history()[0].id, done.id);
}

// --- Checkpoint restore and history ---

#[tokio::test]
async fn restore_resumes_after_checkpointed_phases() {
    let flaky = Flaky::new(2);
    let t = create_test_orchestrator(test_config(), handler(StepType::Testing, flaky.clone()))
        .await;
    let orch = &t.orchestrator;

    let mission = orch.create_mission(EXAMPLE_GOAL, None);
    orch.start_mission(mission.clone()).unwrap();
    let failed = wait_for(orch).await;
    assert_eq!(failed.status, MissionStatus::Failed);
    assert_eq!(failed.phases[2].status, PhaseStatus::Failed);
    assert_eq!(
        orch.last_checkpoint(&mission.id).map(|c| c.phase_order),
        Some(2)
    );

    let restored = orch
        .restore_from_checkpoint(&mission.id)
        .await
        .unwrap()
        .expect("mission in history");
    assert_eq!(restored.id, mission.id);
    assert_eq!(restored.status, MissionStatus::Planned);
    assert!(restored.error.is_none());
    assert!(restored.report.is_none());
    assert_eq!(restored.phases[0].status, PhaseStatus::Completed);
    assert_eq!(restored.phases[1].status, PhaseStatus::Pending);
    assert_eq!(restored.phases[2].status, PhaseStatus::Pending);

    let mut events = orch.subscribe();
    orch.start_mission(restored).unwrap();
    let done = wait_for(orch).await;
    assert_eq!(done.status, MissionStatus::Completed);

    let mut started_phases = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let MissionEvent::PhaseStarted(payload) = event {
            started_phases.push(payload.order);
        }
    }
    assert_eq!(started_phases, vec![2, 3]);

    let history = orch.history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, MissionStatus::Completed);
    let stored = t.storage.load_history(10).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].status, MissionStatus::Completed);
}

#[tokio::test]
async fn restore_without_checkpoint_fails() {
    let t = create_test_orchestrator(test_config(), vec![]).await;
    let err = t
        .orchestrator
        .restore_from_checkpoint(&Id::new())
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::CheckpointRestoreFailed(_)));
}

#[tokio::test]
async fn restore_of_unknown_mission_returns_none() {
    let t = create_test_orchestrator(test_config(), vec![]).await;
    let snapshot = mission_core::CheckpointSnapshot {
        mission_id: Id::new(),
        phase_order: 1,
        step_order: 3,
        timestamp: chrono::Utc::now(),
    };
    t.storage.save_checkpoint(&snapshot).await.unwrap();

    let restored = t
        .orchestrator
        .restore_from_checkpoint(&snapshot.mission_id)
        .await
        .unwrap();
    assert!(restored.is_none());
}

#[tokio::test]
async fn history_survives_restart() {
    let t = create_test_orchestrator(test_config(), vec![]).await;
    let orch = &t.orchestrator;

    let mut ids = Vec::new();
    for goal in ["fix the api", "deploy service", "analyze database"] {
        let mission = orch.create_mission(goal, None);
        ids.push(mission.id.clone());
        orch.start_mission(mission).unwrap();
        wait_for(orch).await;
    }

    let config = Config {
        history_limit: 2,
        ..test_config()
    };
    let reopened = Orchestrator::new(
        config,
        Arc::clone(&t.storage),
        StepExecutor::new(Arc::clone(&t.storage)),
    )
    .await
    .unwrap();

    let history: Vec<Id> = reopened.history().into_iter().map(|m| m.id).collect();
    assert_eq!(history, vec![ids[2].clone(), ids[1].clone()]);
}
