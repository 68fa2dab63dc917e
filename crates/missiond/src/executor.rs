//! Step executor.
//!
//! Dispatches a single step to the handler for its [`StepType`]. Validation,
//! checkpoint, reporting, and cleanup have built-in logic; every other type is
//! a seam where an external collaborator (code generator, file writer, build
//! runner, test runner, packager) is plugged in as a [`StepHandler`]. Types
//! without a registered collaborator only log their intent.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use mission_core::{
    build_report, CheckpointSnapshot, Mission, MissionLog, MissionReport, MissionStep, StepType,
};
use thiserror::Error;
use tracing::{debug, info};

use crate::storage::{Storage, StorageError};

#[derive(Debug, Error)]
pub enum StepError {
    #[error("validation failed: {0}")]
    ValidationFailed(String),
    #[error("checkpoint write failed: {0}")]
    Checkpoint(#[from] StorageError),
    #[error("{0}")]
    Collaborator(String),
}

impl StepError {
    pub fn collaborator(message: impl Into<String>) -> Self {
        Self::Collaborator(message.into())
    }
}

pub type Result<T> = std::result::Result<T, StepError>;

/// External collaborator invoked for one step type.
///
/// Handlers either return normally (the step succeeds) or return an error
/// (the step fails and the retry policy applies). A handler may be invoked a
/// second time for the same step, so side effects should tolerate a rerun.
#[async_trait]
pub trait StepHandler: Send + Sync {
    async fn handle(&self, step: &MissionStep, mission: &Mission) -> Result<()>;
}

/// What the executor hands to a step besides the step itself.
#[derive(Debug, Clone, Copy)]
pub struct StepContext<'a> {
    /// Snapshot of the mission with the current step marked running.
    pub mission: &'a Mission,
    /// Order of the phase that owns the step.
    pub phase_order: u32,
    /// Log trail written so far.
    pub logs: &'a [MissionLog],
}

/// State change requested by a built-in handler, applied by the execution loop.
#[derive(Debug, Clone, PartialEq)]
pub enum StepEffect {
    None,
    CheckpointSaved(CheckpointSnapshot),
    AttachReport(Box<MissionReport>),
    ClearScratch,
}

pub struct StepExecutor {
    storage: Arc<Storage>,
    handlers: HashMap<StepType, Arc<dyn StepHandler>>,
}

impl std::fmt::Debug for StepExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut registered: Vec<_> = self.handlers.keys().map(StepType::as_str).collect();
        registered.sort_unstable();
        f.debug_struct("StepExecutor")
            .field("handlers", &registered)
            .finish_non_exhaustive()
    }
}

impl StepExecutor {
    /// Create an executor with no collaborators registered.
    pub fn new(storage: Arc<Storage>) -> Self {
        Self {
            storage,
            handlers: HashMap::new(),
        }
    }

    /// Register a collaborator for a step type, replacing any previous one.
    pub fn with_handler(mut self, step_type: StepType, handler: Arc<dyn StepHandler>) -> Self {
        self.register(step_type, handler);
        self
    }

    pub fn register(&mut self, step_type: StepType, handler: Arc<dyn StepHandler>) {
        self.handlers.insert(step_type, handler);
    }

    pub fn has_handler(&self, step_type: StepType) -> bool {
        self.handlers.contains_key(&step_type)
    }

    /// Execute one step.
    pub async fn execute(&self, step: &MissionStep, ctx: StepContext<'_>) -> Result<StepEffect> {
        match step.step_type {
            StepType::Validation => self.perform_validation(step, ctx).await,
            StepType::ResourceGathering => self.gather_resources(step, ctx).await,
            StepType::Checkpoint => self.save_checkpoint(step, ctx).await,
            StepType::Planning => self.perform_planning(step, ctx).await,
            StepType::CodeGeneration => self.generate_code(step, ctx).await,
            StepType::CodeModification => self.modify_code(step, ctx).await,
            StepType::FileOperation => self.perform_file_operation(step, ctx).await,
            StepType::DataCollection => self.collect_data(step, ctx).await,
            StepType::Processing => self.process_data(step, ctx).await,
            StepType::AiAnalysis => self.perform_ai_analysis(step, ctx).await,
            StepType::Building => self.perform_build(step, ctx).await,
            StepType::Testing => self.run_tests(step, ctx).await,
            StepType::Deployment => self.deploy(step, ctx).await,
            StepType::Reporting => Ok(Self::generate_report(ctx)),
            StepType::Cleanup => Ok(Self::cleanup_mission(ctx)),
            StepType::Execution => self.execute_generic(step, ctx).await,
        }
    }

    /// Fails when the analysis judged the mission infeasible, then runs any
    /// registered validation collaborator.
    async fn perform_validation(
        &self,
        step: &MissionStep,
        ctx: StepContext<'_>,
    ) -> Result<StepEffect> {
        let feasibility = &ctx.mission.analysis.feasibility;
        if !feasibility.feasible {
            return Err(StepError::ValidationFailed(feasibility.blockers.join("; ")));
        }
        self.delegate(step, ctx, "validating requirements").await
    }

    async fn save_checkpoint(
        &self,
        step: &MissionStep,
        ctx: StepContext<'_>,
    ) -> Result<StepEffect> {
        let snapshot = CheckpointSnapshot {
            mission_id: ctx.mission.id.clone(),
            phase_order: ctx.phase_order,
            step_order: step.order,
            timestamp: Utc::now(),
        };
        self.storage.save_checkpoint(&snapshot).await?;
        info!(
            mission_id = %snapshot.mission_id,
            phase_order = snapshot.phase_order,
            step_order = snapshot.step_order,
            "checkpoint saved"
        );
        Ok(StepEffect::CheckpointSaved(snapshot))
    }

    fn generate_report(ctx: StepContext<'_>) -> StepEffect {
        StepEffect::AttachReport(Box::new(build_report(ctx.mission, ctx.logs)))
    }

    fn cleanup_mission(ctx: StepContext<'_>) -> StepEffect {
        debug!(mission_id = %ctx.mission.id, "clearing retry counters and checkpoint scratch");
        StepEffect::ClearScratch
    }

    async fn gather_resources(
        &self,
        step: &MissionStep,
        ctx: StepContext<'_>,
    ) -> Result<StepEffect> {
        self.delegate(step, ctx, "gathering resources").await
    }

    async fn perform_planning(
        &self,
        step: &MissionStep,
        ctx: StepContext<'_>,
    ) -> Result<StepEffect> {
        self.delegate(step, ctx, "planning").await
    }

    async fn generate_code(&self, step: &MissionStep, ctx: StepContext<'_>) -> Result<StepEffect> {
        self.delegate(step, ctx, "generating code").await
    }

    async fn modify_code(&self, step: &MissionStep, ctx: StepContext<'_>) -> Result<StepEffect> {
        self.delegate(step, ctx, "modifying code").await
    }

    async fn perform_file_operation(
        &self,
        step: &MissionStep,
        ctx: StepContext<'_>,
    ) -> Result<StepEffect> {
        self.delegate(step, ctx, "writing files").await
    }

    async fn collect_data(&self, step: &MissionStep, ctx: StepContext<'_>) -> Result<StepEffect> {
        self.delegate(step, ctx, "collecting data").await
    }

    async fn process_data(&self, step: &MissionStep, ctx: StepContext<'_>) -> Result<StepEffect> {
        self.delegate(step, ctx, "processing data").await
    }

    async fn perform_ai_analysis(
        &self,
        step: &MissionStep,
        ctx: StepContext<'_>,
    ) -> Result<StepEffect> {
        self.delegate(step, ctx, "running analysis").await
    }

    async fn perform_build(&self, step: &MissionStep, ctx: StepContext<'_>) -> Result<StepEffect> {
        self.delegate(step, ctx, "building").await
    }

    async fn run_tests(&self, step: &MissionStep, ctx: StepContext<'_>) -> Result<StepEffect> {
        self.delegate(step, ctx, "running tests").await
    }

    async fn deploy(&self, step: &MissionStep, ctx: StepContext<'_>) -> Result<StepEffect> {
        self.delegate(step, ctx, "deploying").await
    }

    async fn execute_generic(
        &self,
        step: &MissionStep,
        ctx: StepContext<'_>,
    ) -> Result<StepEffect> {
        self.delegate(step, ctx, "executing").await
    }

    /// Hand the step to its collaborator, or log the intent when none is wired.
    async fn delegate(
        &self,
        step: &MissionStep,
        ctx: StepContext<'_>,
        intent: &str,
    ) -> Result<StepEffect> {
        match self.handlers.get(&step.step_type) {
            Some(handler) => {
                debug!(
                    mission_id = %ctx.mission.id,
                    step = %step.name,
                    step_type = step.step_type.as_str(),
                    "{intent}"
                );
                handler.handle(step, ctx.mission).await?;
            }
            None => {
                info!(
                    mission_id = %ctx.mission.id,
                    step = %step.name,
                    step_type = step.step_type.as_str(),
                    "{intent} (no collaborator registered)"
                );
            }
        }
        Ok(StepEffect::None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mission_core::{analyze, analyze_with, plan, MissionContext};
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    struct TestExecutor {
        executor: StepExecutor,
        storage: Arc<Storage>,
        _dir: TempDir,
    }

    async fn create_test_executor() -> TestExecutor {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(&dir.path().join("test.db")).await.unwrap();
        storage.migrate_embedded().await.unwrap();
        let storage = Arc::new(storage);
        TestExecutor {
            executor: StepExecutor::new(Arc::clone(&storage)),
            storage,
            _dir: dir,
        }
    }

    fn mission_for(goal: &str) -> Mission {
        let analysis = analyze(goal);
        let phases = plan(&analysis);
        Mission::new(goal, MissionContext::default(), analysis, phases)
    }

    fn ctx(mission: &Mission) -> StepContext<'_> {
        StepContext {
            mission,
            phase_order: 1,
            logs: &[],
        }
    }

    struct CountingHandler {
        calls: AtomicU32,
    }

    #[async_trait]
    impl StepHandler for CountingHandler {
        async fn handle(&self, _step: &MissionStep, _mission: &Mission) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingHandler;

    #[async_trait]
    impl StepHandler for FailingHandler {
        async fn handle(&self, step: &MissionStep, _mission: &Mission) -> Result<()> {
            Err(StepError::collaborator(format!("{} exploded", step.name)))
        }
    }

    #[tokio::test]
    async fn validation_passes_for_feasible_mission() {
        let te = create_test_executor().await;
        let mission = mission_for("create feature");
        let step = &mission.phases[0].steps[0];
        let effect = te.executor.execute(step, ctx(&mission)).await.unwrap();
        assert_eq!(effect, StepEffect::None);
    }

    #[tokio::test]
    async fn validation_fails_with_joined_blockers() {
        let te = create_test_executor().await;
        let analysis = analyze_with("build api", &["network"]);
        let phases = plan(&analysis);
        let mission = Mission::new("build api", MissionContext::default(), analysis, phases);

        let step = &mission.phases[0].steps[0];
        let err = te.executor.execute(step, ctx(&mission)).await.unwrap_err();
        match err {
            StepError::ValidationFailed(reason) => {
                assert!(reason.contains("code_generation"));
                assert!(reason.contains("file_system"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn checkpoint_step_persists_snapshot() {
        let te = create_test_executor().await;
        let mission = mission_for("create feature");
        let step = &mission.phases[0].steps[2];
        assert_eq!(step.step_type, StepType::Checkpoint);

        let effect = te.executor.execute(step, ctx(&mission)).await.unwrap();
        let StepEffect::CheckpointSaved(snapshot) = effect else {
            panic!("expected checkpoint effect");
        };
        assert_eq!(snapshot.phase_order, 1);
        assert_eq!(snapshot.step_order, 3);

        let stored = te.storage.load_checkpoint(&mission.id).await.unwrap();
        assert_eq!(stored, Some(snapshot));
    }

    #[tokio::test]
    async fn checkpoint_step_fails_when_storage_is_closed() {
        let te = create_test_executor().await;
        te.storage.close().await;
        let mission = mission_for("create feature");
        let step = &mission.phases[0].steps[2];
        let err = te.executor.execute(step, ctx(&mission)).await.unwrap_err();
        assert!(matches!(err, StepError::Checkpoint(_)));
    }

    #[tokio::test]
    async fn reporting_and_cleanup_return_effects() {
        let te = create_test_executor().await;
        let mission = mission_for("create feature");
        let verification = mission.phases.last().unwrap();

        let report = te
            .executor
            .execute(&verification.steps[2], ctx(&mission))
            .await
            .unwrap();
        assert!(matches!(report, StepEffect::AttachReport(r) if r.mission_id == mission.id));

        let cleanup = te
            .executor
            .execute(&verification.steps[3], ctx(&mission))
            .await
            .unwrap();
        assert_eq!(cleanup, StepEffect::ClearScratch);
    }

    #[tokio::test]
    async fn registered_collaborator_is_invoked() {
        let te = create_test_executor().await;
        let handler = Arc::new(CountingHandler {
            calls: AtomicU32::new(0),
        });
        let executor = te
            .executor
            .with_handler(StepType::CodeGeneration, handler.clone());
        assert!(executor.has_handler(StepType::CodeGeneration));
        assert!(!executor.has_handler(StepType::Building));

        let mission = mission_for("create feature");
        let step = &mission.phases[1].steps[1];
        assert_eq!(step.step_type, StepType::CodeGeneration);
        executor.execute(step, ctx(&mission)).await.unwrap();
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn collaborator_errors_propagate() {
        let te = create_test_executor().await;
        let executor = te
            .executor
            .with_handler(StepType::FileOperation, Arc::new(FailingHandler));
        let mission = mission_for("create feature");
        let step = &mission.phases[1].steps[2];
        let err = executor.execute(step, ctx(&mission)).await.unwrap_err();
        assert_eq!(err.to_string(), "Create feature files exploded");
    }

    #[tokio::test]
    async fn unregistered_types_are_no_ops() {
        let te = create_test_executor().await;
        let mission = mission_for("deploy service");
        for step in &mission.phases[1].steps {
            if step.step_type == StepType::Checkpoint {
                continue;
            }
            let effect = te.executor.execute(step, ctx(&mission)).await.unwrap();
            assert_eq!(effect, StepEffect::None);
        }
    }
}
