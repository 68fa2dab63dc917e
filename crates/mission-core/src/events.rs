//! Observer events emitted while a mission executes.
//!
//! Terminal notifications carry the full mission; everything else is a small
//! payload keyed by mission id.

use crate::types::{Id, Mission, MissionLog, StepStatus, StepType};
use serde::{Deserialize, Serialize};

/// Event type names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    MissionStarted,
    PhaseStarted,
    StepFinished,
    StepRetried,
    CheckpointSaved,
    Progress,
    Log,
    MissionPaused,
    MissionResumed,
    MissionCompleted,
    MissionFailed,
    MissionCancelled,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MissionStarted => "MISSION_STARTED",
            Self::PhaseStarted => "PHASE_STARTED",
            Self::StepFinished => "STEP_FINISHED",
            Self::StepRetried => "STEP_RETRIED",
            Self::CheckpointSaved => "CHECKPOINT_SAVED",
            Self::Progress => "PROGRESS",
            Self::Log => "LOG",
            Self::MissionPaused => "MISSION_PAUSED",
            Self::MissionResumed => "MISSION_RESUMED",
            Self::MissionCompleted => "MISSION_COMPLETED",
            Self::MissionFailed => "MISSION_FAILED",
            Self::MissionCancelled => "MISSION_CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::MissionCompleted | Self::MissionFailed | Self::MissionCancelled
        )
    }
}

/// Payload for PHASE_STARTED.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseStartedPayload {
    pub mission_id: Id,
    pub phase_id: Id,
    pub name: String,
    pub order: u32,
}

/// Payload for STEP_FINISHED.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepFinishedPayload {
    pub mission_id: Id,
    pub step_id: Id,
    pub step_type: StepType,
    pub status: StepStatus,
    /// Number of executions, including the inline retry.
    pub attempts: u32,
    pub duration_ms: u64,
}

/// Payload for STEP_RETRIED.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRetriedPayload {
    pub mission_id: Id,
    pub step_id: Id,
    pub retry_count: u32,
    pub reason: String,
}

/// Payload for CHECKPOINT_SAVED.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointSavedPayload {
    pub mission_id: Id,
    pub phase_order: u32,
    pub step_order: u32,
}

/// Union type for all observer events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MissionEvent {
    MissionStarted { mission_id: Id },
    PhaseStarted(PhaseStartedPayload),
    StepFinished(StepFinishedPayload),
    StepRetried(StepRetriedPayload),
    CheckpointSaved(CheckpointSavedPayload),
    Progress { mission_id: Id, progress: f64 },
    Log(MissionLog),
    MissionPaused { mission_id: Id },
    MissionResumed { mission_id: Id },
    MissionCompleted(Box<Mission>),
    MissionFailed(Box<Mission>),
    MissionCancelled(Box<Mission>),
}

impl MissionEvent {
    pub fn event_type(&self) -> EventType {
        match self {
            Self::MissionStarted { .. } => EventType::MissionStarted,
            Self::PhaseStarted(_) => EventType::PhaseStarted,
            Self::StepFinished(_) => EventType::StepFinished,
            Self::StepRetried(_) => EventType::StepRetried,
            Self::CheckpointSaved(_) => EventType::CheckpointSaved,
            Self::Progress { .. } => EventType::Progress,
            Self::Log(_) => EventType::Log,
            Self::MissionPaused { .. } => EventType::MissionPaused,
            Self::MissionResumed { .. } => EventType::MissionResumed,
            Self::MissionCompleted(_) => EventType::MissionCompleted,
            Self::MissionFailed(_) => EventType::MissionFailed,
            Self::MissionCancelled(_) => EventType::MissionCancelled,
        }
    }

    /// The terminal mission carried by completed/failed/cancelled events.
    pub fn terminal_mission(&self) -> Option<&Mission> {
        match self {
            Self::MissionCompleted(m) | Self::MissionFailed(m) | Self::MissionCancelled(m) => {
                Some(m)
            }
            _ => None,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
