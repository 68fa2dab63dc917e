//! Configuration parsing for the mission orchestrator.
//!
//! Key=value format, one setting per line, `#` comments.
//! Precedence: CLI flags > `--config` file > `.mission/config` > defaults.

use crate::analysis::AVAILABLE_CAPABILITIES;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default location of the per-workspace config file.
pub const DEFAULT_CONFIG_PATH: &str = ".mission/config";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("invalid config line: {0}")]
    InvalidLine(String),
    #[error("invalid integer value for {key}: {value}")]
    InvalidInt { key: String, value: String },
}

/// Orchestrator configuration.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Config {
    // Retry policy
    /// Failures tolerated per (phase, step) before giving up.
    pub max_retries: u32,
    /// Inline re-executions attempted for a single failure.
    pub retry_attempts: u32,

    // Control loop
    /// Sleep between pause checks, in milliseconds.
    pub pause_poll_ms: u64,

    // Persistence
    pub db_path: Option<PathBuf>,
    /// Number of finished missions kept in history.
    pub history_limit: usize,
    /// Directory for TSV reports (optional).
    pub report_dir: Option<PathBuf>,

    // Observers
    pub event_capacity: usize,

    // Analysis
    pub available_capabilities: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_attempts: 1,
            pause_poll_ms: 100,
            db_path: None,
            history_limit: 50,
            report_dir: None,
            event_capacity: 1024,
            available_capabilities: AVAILABLE_CAPABILITIES
                .iter()
                .map(ToString::to_string)
                .collect(),
        }
    }
}

impl Config {
    /// Load config from a file, merging with defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.load_file(path)?;
        Ok(config)
    }

    /// Load `.mission/config` under `root` if present, otherwise defaults.
    pub fn discover(root: &Path) -> Result<Self, ConfigError> {
        let path = root.join(DEFAULT_CONFIG_PATH);
        if path.exists() {
            Self::from_file(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load and merge values from a config file.
    pub fn load_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path)?;
        self.parse_content(&content)
    }

    /// Parse config content (key=value format).
    fn parse_content(&mut self, content: &str) -> Result<(), ConfigError> {
        for line in content.lines() {
            let trimmed = line.trim();

            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(ConfigError::InvalidLine(line.to_string()));
            };

            let key = key.trim();
            let value = Self::unquote(value.trim());

            self.apply_value(key, &value)?;
        }
        Ok(())
    }

    /// Remove surrounding quotes from a value.
    fn unquote(value: &str) -> String {
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            return value[1..value.len() - 1].to_string();
        }
        value.to_string()
    }

    /// Apply a single config value.
    fn apply_value(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "max_retries" => self.max_retries = Self::parse_int(key, value)?,
            "retry_attempts" => self.retry_attempts = Self::parse_int(key, value)?,
            "pause_poll_ms" => {
                let ms: u64 = Self::parse_int(key, value)?;
                if ms == 0 {
                    return Err(ConfigError::InvalidInt {
                        key: key.to_string(),
                        value: value.to_string(),
                    });
                }
                self.pause_poll_ms = ms;
            }
            "db_path" => {
                self.db_path = (!value.is_empty()).then(|| PathBuf::from(value));
            }
            "history_limit" => self.history_limit = Self::parse_int(key, value)?,
            "report_dir" => {
                self.report_dir = (!value.is_empty()).then(|| PathBuf::from(value));
            }
            "event_capacity" => self.event_capacity = Self::parse_int(key, value)?,
            "available_capabilities" => {
                self.available_capabilities =
                    value.split_whitespace().map(ToString::to_string).collect();
            }
            _ => {
                // Unknown keys warn but don't fail.
                eprintln!("Warning: unknown config key: {key}");
            }
        }
        Ok(())
    }

    fn parse_int<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
        value.parse().map_err(|_| ConfigError::InvalidInt {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    /// Resolve relative paths against a workspace root.
    pub fn resolve_paths(&mut self, workspace_root: &Path) {
        if let Some(ref db_path) = self.db_path {
            if db_path.is_relative() {
                self.db_path = Some(workspace_root.join(db_path));
            }
        }
        if let Some(ref report_dir) = self.report_dir {
            if report_dir.is_relative() {
                self.report_dir = Some(workspace_root.join(report_dir));
            }
        }
    }
}
