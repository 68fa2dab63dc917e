//! Mission reports.
//!
//! Builds the terminal [`MissionReport`] and exports its log trail as TSV.
//!
//! Columns: `timestamp_ms`, level, phase, step, message

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use chrono::Utc;

use crate::types::{Mission, MissionLog, MissionReport};

/// TSV header row.
const HEADER: &str = "timestamp_ms\tlevel\tphase\tstep\tmessage";

/// Build a report for a mission from its current state and log trail.
pub fn build_report(mission: &Mission, logs: &[MissionLog]) -> MissionReport {
    MissionReport {
        mission_id: mission.id.clone(),
        goal: mission.goal.clone(),
        status: mission.status,
        phases_completed: mission.phases_completed(),
        total_phases: mission.phases.len(),
        duration_secs: mission.duration_secs(),
        logs: logs.to_vec(),
        generated_at: Utc::now(),
    }
}

/// A single row in the report TSV.
#[derive(Debug, Clone)]
pub struct ReportRow {
    /// Unix timestamp in milliseconds.
    pub timestamp_ms: i64,
    pub level: String,
    pub phase: String,
    pub step: String,
    pub message: String,
}

impl ReportRow {
    /// Format as a TSV line.
    fn to_tsv_line(&self) -> String {
        format!(
            "{}\t{}\t{}\t{}\t{}",
            self.timestamp_ms,
            self.level,
            sanitize_field(&self.phase),
            sanitize_field(&self.step),
            sanitize_field(&self.message),
        )
    }
}

impl From<&MissionLog> for ReportRow {
    fn from(log: &MissionLog) -> Self {
        Self {
            timestamp_ms: log.timestamp.timestamp_millis(),
            level: log.level.as_str().to_string(),
            phase: log.phase.clone().unwrap_or_default(),
            step: log.step.clone().unwrap_or_default(),
            message: log.message.clone(),
        }
    }
}

/// Sanitize a field value to prevent TSV breakage.
fn sanitize_field(value: &str) -> String {
    value.replace(['\t', '\n', '\r'], " ")
}

/// Write a report's log trail to a TSV file, replacing any existing file.
pub fn write_report(path: &Path, report: &MissionReport) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);

    writeln!(writer, "{HEADER}")?;
    for log in &report.logs {
        writeln!(writer, "{}", ReportRow::from(log).to_tsv_line())?;
    }

    writer.flush()
}
