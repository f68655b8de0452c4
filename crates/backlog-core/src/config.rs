use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CONFIG_FILENAME: &str = "config.yml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskResolutionStrategy {
    /// Latest `updated_date` wins, ties go to the alphabetically first branch.
    #[default]
    MostRecent,
    /// Furthest status in the configured workflow wins.
    MostProgressed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BacklogConfig {
    pub project_name: Option<String>,
    pub default_status: String,
    pub statuses: Vec<String>,
    pub labels: Vec<String>,
    pub milestones: Vec<String>,
    pub date_format: Option<String>,
    pub task_prefix: String,
    pub check_active_branches: bool,
    /// Branches without backlog activity for this many days are ignored.
    pub active_branch_days: u32,
    pub task_resolution_strategy: TaskResolutionStrategy,
}

impl Default for BacklogConfig {
    fn default() -> Self {
        Self {
            project_name: None,
            default_status: "To Do".to_string(),
            statuses: vec![
                "To Do".to_string(),
                "In Progress".to_string(),
                "Done".to_string(),
            ],
            labels: Vec::new(),
            milestones: Vec::new(),
            date_format: None,
            task_prefix: "task".to_string(),
            check_active_branches: true,
            active_branch_days: 30,
            task_resolution_strategy: TaskResolutionStrategy::MostRecent,
        }
    }
}

impl BacklogConfig {
    pub fn status_index(&self, status: &str) -> Option<usize> {
        self.statuses
            .iter()
            .position(|candidate| candidate.trim().eq_ignore_ascii_case(status.trim()))
    }

    pub fn canonical_status(&self, status: &str) -> Option<&str> {
        self.status_index(status)
            .and_then(|idx| self.statuses.get(idx))
            .map(String::as_str)
    }

    fn normalized(mut self) -> Self {
        self.statuses.retain(|status| !status.trim().is_empty());
        if self.statuses.is_empty() {
            self.statuses = BacklogConfig::default().statuses;
        }
        if self.default_status.trim().is_empty() {
            self.default_status = self.statuses[0].clone();
        }
        if self.task_prefix.trim().is_empty() {
            self.task_prefix = BacklogConfig::default().task_prefix;
        }
        self.task_prefix = self.task_prefix.trim().trim_end_matches('-').to_string();
        self
    }
}

pub fn config_path(backlog_dir: &Path) -> PathBuf {
    backlog_dir.join(CONFIG_FILENAME)
}

/// Reads `config.yml`; a missing file yields the defaults.
pub fn load_config(backlog_dir: &Path) -> Result<BacklogConfig, ConfigError> {
    let path = config_path(backlog_dir);
    if !path.is_file() {
        return Ok(BacklogConfig::default());
    }
    let text = fs::read_to_string(&path)?;
    parse_config(&text)
}

pub fn parse_config(text: &str) -> Result<BacklogConfig, ConfigError> {
    if text.trim().is_empty() {
        return Ok(BacklogConfig::default());
    }
    let config: BacklogConfig = serde_yaml::from_str(text)?;
    Ok(config.normalized())
}

pub fn write_config(backlog_dir: &Path, config: &BacklogConfig) -> Result<PathBuf, ConfigError> {
    let path = config_path(backlog_dir);
    let body = serde_yaml::to_string(config)?;
    fs::write(&path, body)?;
    Ok(path)
}
