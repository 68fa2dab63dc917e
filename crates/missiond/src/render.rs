//! Terminal output for the missiond CLI.

use mission_core::{LogLevel, Mission, MissionLog, StepStatus};

/// Print the analysis and plan of a freshly created mission.
pub fn print_mission_plan(mission: &Mission) {
    let analysis = &mission.analysis;
    println!("Mission: {}", mission.id);
    println!("  Goal:        {}", mission.goal);
    println!("  Priority:    {}", mission.context.priority.as_str());
    println!("  Complexity:  {}", analysis.complexity.as_str());
    println!("  Estimate:    {}", format_duration(analysis.estimated_duration_secs as f64));
    println!(
        "  Feasible:    {} (confidence {:.1})",
        if analysis.feasibility.feasible { "yes" } else { "no" },
        analysis.feasibility.confidence
    );
    for blocker in &analysis.feasibility.blockers {
        println!("    blocker: {blocker}");
    }
    for recommendation in &analysis.feasibility.recommendations {
        println!("    note:    {recommendation}");
    }

    println!();
    println!("  Components:");
    for component in &analysis.components {
        match component.detail {
            Some(ref detail) => println!("    {} {} ({detail})", component.action, component.target),
            None => println!("    {} {}", component.action, component.target),
        }
    }

    println!();
    println!("  Capabilities:");
    for capability in &analysis.capabilities {
        println!("    {:<20}  {}", capability.name, capability.importance.as_str());
    }

    println!();
    println!("  Plan:");
    for phase in &mission.phases {
        println!("    {}. {}", phase.order, phase.name);
        for step in &phase.steps {
            println!("       {}. {:<32}  {}", step.order, truncate(&step.name, 32), step.step_type.as_str());
        }
    }
}

/// Print the outcome of a finished mission.
pub fn print_mission_summary(mission: &Mission) {
    println!("Mission: {}", mission.id);
    println!("  Status:    {}", mission.status.as_str());
    println!(
        "  Progress:  {}/{} steps ({:.0}%)",
        mission.completed_steps(),
        mission.total_steps(),
        mission.progress() * 100.0
    );
    println!(
        "  Phases:    {}/{} completed",
        mission.phases_completed(),
        mission.phases.len()
    );
    for phase in &mission.phases {
        println!("    {:<32}  {}", truncate(&phase.name, 32), phase.status.as_str());
    }
    if let Some(secs) = mission.duration_secs() {
        println!("  Duration:  {}", format_duration(secs));
    }
    if let Some(ref error) = mission.error {
        println!("  Error:     {error}");
    }

    let failed: Vec<_> = mission
        .phases
        .iter()
        .flat_map(|p| p.steps.iter())
        .filter(|s| s.status == StepStatus::Failed)
        .collect();
    if !failed.is_empty() {
        println!();
        println!("  Failed steps:");
        for step in failed {
            println!(
                "    {:<32}  {}",
                truncate(&step.name, 32),
                step.error.as_deref().unwrap_or("-")
            );
        }
    }
}

/// Print finished missions in tabular format.
pub fn print_history(missions: &[Mission]) {
    if missions.is_empty() {
        println!("No missions found.");
        return;
    }

    println!(
        "{:<36}  {:<30}  {:<10}  {:<8}  {:<20}",
        "ID", "GOAL", "STATUS", "PROGRESS", "FINISHED"
    );
    println!("{}", "-".repeat(112));

    for mission in missions {
        let finished = mission
            .completed_at
            .map_or_else(|| "-".to_string(), |t| format_time(&t));
        println!(
            "{:<36}  {:<30}  {:<10}  {:<8}  {:<20}",
            mission.id.0,
            truncate(&mission.goal, 30),
            mission.status.as_str(),
            format!("{:.0}%", mission.progress() * 100.0),
            finished,
        );
    }

    println!();
    println!("{} mission(s)", missions.len());
}

/// Print one log entry as it streams in.
pub fn print_log(log: &MissionLog) {
    let location = match (&log.phase, &log.step) {
        (Some(phase), Some(step)) => format!(" [{phase} / {step}]"),
        (Some(phase), None) => format!(" [{phase}]"),
        _ => String::new(),
    };
    println!(
        "{} {:<7}{} {}",
        log.timestamp.format("%H:%M:%S"),
        format_level(log.level),
        location,
        log.message
    );
}

fn format_level(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Info => "INFO",
        LogLevel::Success => "OK",
        LogLevel::Warning => "WARN",
        LogLevel::Error => "ERROR",
    }
}

fn format_time(dt: &chrono::DateTime<chrono::Utc>) -> String {
    dt.format("%Y-%m-%d %H:%M:%S").to_string()
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn format_duration(secs: f64) -> String {
    if secs < 59.95 {
        return format!("{:.1}s", secs.max(0.0));
    }
    let whole = secs.round() as u64;
    if whole < 3600 {
        format!("{}m {}s", whole / 60, whole % 60)
    } else {
        format!("{}h {}m", whole / 3600, (whole % 3600) / 60)
    }
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{kept}...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("create a new authentication feature", 12), "create a ...");
        assert_eq!(truncate("ééééééé", 5), "éé...");
    }

    #[test]
    fn format_duration_picks_unit() {
        assert_eq!(format_duration(12.34), "12.3s");
        assert_eq!(format_duration(300.0), "5m 0s");
        assert_eq!(format_duration(3600.0), "1h 0m");
    }

    #[test]
    fn format_duration_carries_rounded_seconds() {
        assert_eq!(format_duration(59.97), "1m 0s");
        assert_eq!(format_duration(119.7), "2m 0s");
        assert_eq!(format_duration(125.4), "2m 5s");
        assert_eq!(format_duration(3599.7), "1h 0m");
        assert_eq!(format_duration(7199.0), "1h 59m");
    }
}
