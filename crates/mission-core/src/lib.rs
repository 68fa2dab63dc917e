pub mod analysis;
pub mod config;
pub mod events;
pub mod planner;
pub mod report;
pub mod types;

pub use analysis::{analyze, analyze_with, MissionAnalysis, MissionComplexity};
pub use config::Config;
pub use events::{EventType, MissionEvent};
pub use planner::plan;
pub use report::{build_report, write_report};
pub use types::*;
