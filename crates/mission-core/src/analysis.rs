//! Goal decomposition.
//!
//! Turns a free-text goal into components, required capabilities, a complexity
//! class, a dependency chain, and a feasibility verdict. This is a keyword
//! classifier, nothing more.

use serde::{Deserialize, Serialize};

use crate::types::Id;

/// Verbs recognised as the action half of a component.
pub const ACTION_KEYWORDS: [&str; 10] = [
    "create",
    "build",
    "implement",
    "design",
    "analyze",
    "fix",
    "update",
    "deploy",
    "test",
    "optimize",
];

/// Nouns recognised as the target half of a component.
pub const TARGET_KEYWORDS: [&str; 8] = [
    "feature",
    "system",
    "api",
    "ui",
    "database",
    "service",
    "module",
    "integration",
];

/// Capabilities the orchestrator can provide out of the box.
pub const AVAILABLE_CAPABILITIES: [&str; 9] = [
    "code_generation",
    "file_system",
    "ai_analysis",
    "build_system",
    "test_runner",
    "code_modification",
    "general_execution",
    "network",
    "data_storage",
];

/// Fallback component when no keyword pair is found.
const FALLBACK_ACTION: &str = "execute";
const FALLBACK_TARGET: &str = "task";

const CONFIDENCE_FEASIBLE: f64 = 0.9;
const CONFIDENCE_INFEASIBLE: f64 = 0.3;

/// One (action, target) pair extracted from the goal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GoalComponent {
    pub id: Id,
    pub action: String,
    pub target: String,
    pub detail: Option<String>,
}

/// How much a mission depends on a capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityImportance {
    Optional,
    Normal,
    Critical,
}

impl CapabilityImportance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Optional => "optional",
            Self::Normal => "normal",
            Self::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequiredCapability {
    pub name: String,
    pub importance: CapabilityImportance,
}

/// Complexity class derived from component and critical-capability counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissionComplexity {
    Simple,
    Moderate,
    Complex,
    Epic,
}

impl MissionComplexity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Simple => "simple",
            Self::Moderate => "moderate",
            Self::Complex => "complex",
            Self::Epic => "epic",
        }
    }

    /// Weighted score: 10 per component, 15 per critical capability.
    pub fn score(component_count: usize, critical_count: usize) -> usize {
        component_count * 10 + critical_count * 15
    }

    pub fn from_counts(component_count: usize, critical_count: usize) -> Self {
        match Self::score(component_count, critical_count) {
            s if s < 30 => Self::Simple,
            s if s < 60 => Self::Moderate,
            s if s < 100 => Self::Complex,
            _ => Self::Epic,
        }
    }

    /// Base duration in seconds for one component of this class.
    pub fn base_duration_secs(&self) -> u64 {
        match self {
            Self::Simple => 60,
            Self::Moderate => 300,
            Self::Complex => 900,
            Self::Epic => 3600,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyType {
    Sequential,
    Parallel,
    Conditional,
}

/// Edge between two goal components. Computed for observers; the planner
/// always runs phases sequentially.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentDependency {
    pub from: Id,
    pub to: Id,
    pub dependency_type: DependencyType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeasibilityAssessment {
    pub feasible: bool,
    /// Confidence in the verdict (0.0 to 1.0).
    pub confidence: f64,
    pub blockers: Vec<String>,
    pub recommendations: Vec<String>,
}

/// Read-only result of goal decomposition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissionAnalysis {
    pub components: Vec<GoalComponent>,
    pub capabilities: Vec<RequiredCapability>,
    pub complexity: MissionComplexity,
    pub dependencies: Vec<ComponentDependency>,
    pub feasibility: FeasibilityAssessment,
    pub estimated_duration_secs: u64,
}

fn critical(capabilities: &[RequiredCapability]) -> impl Iterator<Item = &RequiredCapability> {
    capabilities
        .iter()
        .filter(|c| c.importance == CapabilityImportance::Critical)
}

/// Analyze a goal against the default capability allow-list.
pub fn analyze(goal: &str) -> MissionAnalysis {
    analyze_with(goal, &AVAILABLE_CAPABILITIES)
}

/// Analyze a goal against a caller-supplied capability allow-list.
pub fn analyze_with<S: AsRef<str>>(goal: &str, available: &[S]) -> MissionAnalysis {
    let components = extract_components(goal);
    let capabilities = required_capabilities(&components);
    let critical_count = critical(&capabilities).count();
    let complexity = MissionComplexity::from_counts(components.len(), critical_count);
    let dependencies = chain_dependencies(&components);
    let feasibility = assess_feasibility(&capabilities, complexity, available);
    let estimated_duration_secs =
        complexity.base_duration_secs() * components.len().max(1) as u64;

    MissionAnalysis {
        components,
        capabilities,
        complexity,
        dependencies,
        feasibility,
        estimated_duration_secs,
    }
}

/// Pending (action, target) pair built up while scanning tokens.
#[derive(Default)]
struct PendingComponent {
    action: Option<String>,
    target: Option<String>,
    detail: Vec<String>,
}

impl PendingComponent {
    fn take_complete(&mut self) -> Option<GoalComponent> {
        let (Some(action), Some(target)) = (self.action.as_ref(), self.target.as_ref()) else {
            return None;
        };
        let detail = (!self.detail.is_empty()).then(|| self.detail.join(" "));
        let component = GoalComponent {
            id: Id::new(),
            action: action.clone(),
            target: target.clone(),
            detail,
        };
        *self = Self::default();
        Some(component)
    }
}

/// Scan the goal for action/target keyword pairs.
///
/// A new action keyword closes the pending pair if it already has a target.
/// Words between the action and the next component become its detail.
fn extract_components(goal: &str) -> Vec<GoalComponent> {
    let mut components = Vec::new();
    let mut pending = PendingComponent::default();

    for token in goal.split_whitespace() {
        let word = token
            .trim_matches(|c: char| !c.is_alphanumeric())
            .to_lowercase();
        if word.is_empty() {
            continue;
        }

        if ACTION_KEYWORDS.contains(&word.as_str()) {
            if let Some(component) = pending.take_complete() {
                components.push(component);
            }
            pending.action = Some(word);
            pending.detail.clear();
        } else if TARGET_KEYWORDS.contains(&word.as_str()) {
            pending.target = Some(word);
        } else if pending.action.is_some() {
            pending.detail.push(token.to_string());
        }
    }

    if let Some(component) = pending.take_complete() {
        components.push(component);
    }

    if components.is_empty() {
        components.push(GoalComponent {
            id: Id::new(),
            action: FALLBACK_ACTION.to_string(),
            target: FALLBACK_TARGET.to_string(),
            detail: Some(goal.trim().to_string()).filter(|d| !d.is_empty()),
        });
    }

    components
}

/// Capabilities an action needs, with importance.
pub fn capabilities_for_action(action: &str) -> Vec<(&'static str, CapabilityImportance)> {
    use CapabilityImportance::{Critical, Normal};
    match action {
        "create" | "build" | "implement" => {
            vec![("code_generation", Critical), ("file_system", Critical)]
        }
        "analyze" => vec![("ai_analysis", Critical)],
        "deploy" => vec![("build_system", Critical), ("file_system", Critical)],
        "test" => vec![("test_runner", Critical)],
        "fix" | "update" => vec![("code_modification", Critical)],
        _ => vec![("general_execution", Normal)],
    }
}

/// Union of capabilities across components, keeping the highest importance
/// seen for each name and first-seen order.
fn required_capabilities(components: &[GoalComponent]) -> Vec<RequiredCapability> {
    let mut capabilities: Vec<RequiredCapability> = Vec::new();
    for component in components {
        for (name, importance) in capabilities_for_action(&component.action) {
            match capabilities.iter_mut().find(|c| c.name == name) {
                Some(existing) => existing.importance = existing.importance.max(importance),
                None => capabilities.push(RequiredCapability {
                    name: name.to_string(),
                    importance,
                }),
            }
        }
    }
    capabilities
}

fn chain_dependencies(components: &[GoalComponent]) -> Vec<ComponentDependency> {
    components
        .windows(2)
        .map(|pair| ComponentDependency {
            from: pair[0].id.clone(),
            to: pair[1].id.clone(),
            dependency_type: DependencyType::Sequential,
        })
        .collect()
}

fn assess_feasibility<S: AsRef<str>>(
    capabilities: &[RequiredCapability],
    complexity: MissionComplexity,
    available: &[S],
) -> FeasibilityAssessment {
    let missing: Vec<&str> = critical(capabilities)
        .map(|c| c.name.as_str())
        .filter(|name| !available.iter().any(|a| a.as_ref() == *name))
        .collect();

    let blockers: Vec<String> = missing
        .iter()
        .map(|name| format!("missing critical capability: {name}"))
        .collect();

    let mut recommendations = Vec::new();
    if !missing.is_empty() {
        recommendations.push(format!(
            "provide the missing capabilities before starting: {}",
            missing.join(", ")
        ));
    }
    if complexity >= MissionComplexity::Complex {
        recommendations.push("split the goal into smaller missions".to_string());
    }

    let feasible = missing.is_empty();
    FeasibilityAssessment {
        feasible,
        confidence: if feasible {
            CONFIDENCE_FEASIBLE
        } else {
            CONFIDENCE_INFEASIBLE
        },
        blockers,
        recommendations,
    }
}
