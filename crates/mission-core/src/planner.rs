//! Phase planning.
//!
//! Expands a [`MissionAnalysis`] into ordered phases: a fixed preparation
//! phase, one execution phase per goal component, and a fixed verification
//! phase. Deterministic apart from freshly generated ids.

use crate::analysis::{GoalComponent, MissionAnalysis};
use crate::types::{Id, MissionPhase, MissionStep, PhaseStatus, StepType};

pub const PREPARATION_PHASE: &str = "Preparation";
pub const VERIFICATION_PHASE: &str = "Verification";

/// Build the full phase list for an analysis.
///
/// Always returns `analysis.components.len() + 2` phases, all pending.
pub fn plan(analysis: &MissionAnalysis) -> Vec<MissionPhase> {
    let mut phases = Vec::with_capacity(analysis.components.len() + 2);

    phases.push(build_phase(
        PREPARATION_PHASE,
        "Validate requirements and gather resources",
        &[
            ("Validate requirements", StepType::Validation),
            ("Gather resources", StepType::ResourceGathering),
            ("Create checkpoint", StepType::Checkpoint),
        ],
    ));

    for component in &analysis.components {
        let steps = component_steps(component);
        let refs: Vec<(&str, StepType)> = steps.iter().map(|(n, t)| (n.as_str(), *t)).collect();
        phases.push(build_phase(
            &format!("Execute: {} {}", component.action, component.target),
            component
                .detail
                .as_deref()
                .unwrap_or("Execute goal component"),
            &refs,
        ));
    }

    phases.push(build_phase(
        VERIFICATION_PHASE,
        "Verify outputs and finalize the mission",
        &[
            ("Verify outputs", StepType::Validation),
            ("Run tests", StepType::Testing),
            ("Generate report", StepType::Reporting),
            ("Cleanup", StepType::Cleanup),
        ],
    ));

    for (idx, phase) in phases.iter_mut().enumerate() {
        phase.order = idx as u32 + 1;
    }

    phases
}

/// Step list for a component phase, chosen by action. Every component phase
/// ends with a checkpoint.
fn component_steps(component: &GoalComponent) -> Vec<(String, StepType)> {
    let target = &component.target;
    let mut steps = match component.action.as_str() {
        "create" | "build" | "implement" => vec![
            (format!("Design {target}"), StepType::Planning),
            (format!("Generate {target} code"), StepType::CodeGeneration),
            (format!("Create {target} files"), StepType::FileOperation),
            (format!("Verify {target}"), StepType::Validation),
        ],
        "analyze" => vec![
            (format!("Gather {target} data"), StepType::DataCollection),
            (format!("Process {target} data"), StepType::Processing),
            ("Generate insights".to_string(), StepType::AiAnalysis),
        ],
        "fix" | "update" => vec![
            (format!("Identify {target} issues"), StepType::AiAnalysis),
            ("Plan changes".to_string(), StepType::Planning),
            ("Apply changes".to_string(), StepType::CodeModification),
            ("Verify changes".to_string(), StepType::Testing),
        ],
        "deploy" => vec![
            (format!("Build {target}"), StepType::Building),
            (format!("Test {target}"), StepType::Testing),
            (format!("Deploy {target}"), StepType::Deployment),
        ],
        action => vec![(format!("Execute {action} {target}"), StepType::Execution)],
    };
    steps.push(("Create checkpoint".to_string(), StepType::Checkpoint));
    steps
}

fn build_phase(name: &str, description: &str, steps: &[(&str, StepType)]) -> MissionPhase {
    MissionPhase {
        id: Id::new(),
        name: name.to_string(),
        description: description.to_string(),
        order: 0,
        steps: steps
            .iter()
            .enumerate()
            .map(|(idx, (step_name, step_type))| {
                MissionStep::new(*step_name, *step_type, idx as u32 + 1)
            })
            .collect(),
        status: PhaseStatus::Pending,
        started_at: None,
        completed_at: None,
    }
}
