//! Core types for the mission orchestrator.
//!
//! A mission owns its phases, a phase owns its steps. Everything here is plain
//! data; the execution engine in `missiond` mutates statuses in place.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::analysis::MissionAnalysis;

/// Unique identifier for missions, phases, steps, and goal components.
/// Uses `UUIDv7` for time-ordered lexicographic sorting.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(pub String);

impl Id {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Id {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// --- Enumerations ---

/// Mission lifecycle status.
///
/// `Planned -> Running <-> Paused -> {Completed | Failed | Cancelled}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MissionStatus {
    Planned,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl MissionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planned => "PLANNED",
            Self::Running => "RUNNING",
            Self::Paused => "PAUSED",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }

    /// Running or paused missions occupy the single active slot.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Shared status for phases and steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Skipped => "SKIPPED",
        }
    }
}

pub type PhaseStatus = ExecutionStatus;
pub type StepStatus = ExecutionStatus;

/// Kind of work a step performs. The executor dispatches on this tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Validation,
    ResourceGathering,
    Checkpoint,
    Planning,
    CodeGeneration,
    CodeModification,
    FileOperation,
    DataCollection,
    Processing,
    AiAnalysis,
    Building,
    Testing,
    Deployment,
    Reporting,
    Cleanup,
    Execution,
}

impl StepType {
    pub const ALL: [Self; 16] = [
        Self::Validation,
        Self::ResourceGathering,
        Self::Checkpoint,
        Self::Planning,
        Self::CodeGeneration,
        Self::CodeModification,
        Self::FileOperation,
        Self::DataCollection,
        Self::Processing,
        Self::AiAnalysis,
        Self::Building,
        Self::Testing,
        Self::Deployment,
        Self::Reporting,
        Self::Cleanup,
        Self::Execution,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::ResourceGathering => "resource_gathering",
            Self::Checkpoint => "checkpoint",
            Self::Planning => "planning",
            Self::CodeGeneration => "code_generation",
            Self::CodeModification => "code_modification",
            Self::FileOperation => "file_operation",
            Self::DataCollection => "data_collection",
            Self::Processing => "processing",
            Self::AiAnalysis => "ai_analysis",
            Self::Building => "building",
            Self::Testing => "testing",
            Self::Deployment => "deployment",
            Self::Reporting => "reporting",
            Self::Cleanup => "cleanup",
            Self::Execution => "execution",
        }
    }

    /// Checkpoint failures are fatal; every other step type may be retried.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Checkpoint)
    }
}

/// Mission priority supplied by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissionPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl MissionPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_lowercase().as_str() {
            "low" => Some(Self::Low),
            "normal" => Some(Self::Normal),
            "high" => Some(Self::High),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }
}

/// Severity of a mission log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Success,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Success => "success",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

// --- Core Types ---

/// Caller-supplied context for a mission.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MissionContext {
    pub priority: MissionPriority,
    pub deadline: Option<DateTime<Utc>>,
    pub constraints: Vec<String>,
    pub preferences: Vec<String>,
}

/// The atomic unit of execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissionStep {
    pub id: Id,
    pub name: String,
    pub step_type: StepType,
    /// Position within the owning phase (1-indexed).
    pub order: u32,
    pub status: StepStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl MissionStep {
    pub fn new(name: impl Into<String>, step_type: StepType, order: u32) -> Self {
        Self {
            id: Id::new(),
            name: name.into(),
            step_type,
            order,
            status: StepStatus::Pending,
            started_at: None,
            completed_at: None,
            error: None,
        }
    }
}

/// An ordered group of steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissionPhase {
    pub id: Id,
    pub name: String,
    pub description: String,
    /// Position within the mission (1-indexed).
    pub order: u32,
    pub steps: Vec<MissionStep>,
    pub status: PhaseStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl MissionPhase {
    pub fn completed_steps(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .count()
    }
}

/// One entry in a mission's append-only log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissionLog {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    pub phase: Option<String>,
    pub step: Option<String>,
}

/// Terminal summary attached to a mission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissionReport {
    pub mission_id: Id,
    pub goal: String,
    pub status: MissionStatus,
    pub phases_completed: usize,
    pub total_phases: usize,
    /// Seconds between start and completion (None if never started).
    pub duration_secs: Option<f64>,
    pub logs: Vec<MissionLog>,
    pub generated_at: DateTime<Utc>,
}

/// Persisted execution position, written after each checkpoint step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointSnapshot {
    pub mission_id: Id,
    pub phase_order: u32,
    pub step_order: u32,
    pub timestamp: DateTime<Utc>,
}

/// A single end-to-end unit of autonomous work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mission {
    pub id: Id,
    pub goal: String,
    pub context: MissionContext,
    pub analysis: MissionAnalysis,
    pub phases: Vec<MissionPhase>,
    pub status: MissionStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub report: Option<MissionReport>,
}

impl Mission {
    /// Build a planned mission from a goal, its analysis, and its plan.
    pub fn new(
        goal: impl Into<String>,
        context: MissionContext,
        analysis: MissionAnalysis,
        phases: Vec<MissionPhase>,
    ) -> Self {
        Self {
            id: Id::new(),
            goal: goal.into(),
            context,
            analysis,
            phases,
            status: MissionStatus::Planned,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
            report: None,
        }
    }

    pub fn total_steps(&self) -> usize {
        self.phases.iter().map(|p| p.steps.len()).sum()
    }

    pub fn completed_steps(&self) -> usize {
        self.phases.iter().map(MissionPhase::completed_steps).sum()
    }

    pub fn phases_completed(&self) -> usize {
        self.phases
            .iter()
            .filter(|p| p.status == PhaseStatus::Completed)
            .count()
    }

    /// Fraction of steps completed across the whole mission (0.0 to 1.0).
    pub fn progress(&self) -> f64 {
        let total = self.total_steps();
        if total == 0 {
            return 0.0;
        }
        self.completed_steps() as f64 / total as f64
    }

    pub fn duration_secs(&self) -> Option<f64> {
        let start = self.started_at?;
        let end = self.completed_at.unwrap_or_else(Utc::now);
        Some((end - start).num_milliseconds() as f64 / 1000.0)
    }
}
