//! Scheduler configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid configuration: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// When downstream dependents of a triggered project are queued.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownstreamMode {
    /// After the triggered build completes successfully.
    #[default]
    OnCompletion,
    /// Together with the triggered build.
    AtTrigger,
}

/// What the recipe queue does with a recipe no online agent can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnsatisfiablePolicy {
    RejectImmediately,
    Timeout(Duration),
    WaitForever,
}

/// Scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Build requests are dropped while disabled.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Seconds an unsatisfiable recipe may wait. 0 rejects at once, a
    /// negative value waits forever.
    #[serde(default)]
    pub unsatisfiable_timeout_secs: i64,
    /// Upper bound between matcher passes.
    #[serde(default = "default_matcher_interval")]
    pub matcher_interval_secs: u64,
    /// Capacity of the matcher to dispatcher hand-off.
    #[serde(default = "default_dispatch_capacity")]
    pub dispatch_channel_capacity: usize,
    #[serde(default = "default_max_active_builds")]
    pub max_active_builds_per_project: usize,
    #[serde(default)]
    pub downstream_mode: DownstreamMode,
    /// Capacity of the orchestrator's inbound command channel.
    #[serde(default = "default_event_capacity")]
    pub event_channel_capacity: usize,
}

fn default_enabled() -> bool {
    true
}

fn default_matcher_interval() -> u64 {
    60
}

fn default_dispatch_capacity() -> usize {
    64
}

fn default_max_active_builds() -> usize {
    1
}

fn default_event_capacity() -> usize {
    256
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            unsatisfiable_timeout_secs: 0,
            matcher_interval_secs: default_matcher_interval(),
            dispatch_channel_capacity: default_dispatch_capacity(),
            max_active_builds_per_project: default_max_active_builds(),
            downstream_mode: DownstreamMode::default(),
            event_channel_capacity: default_event_capacity(),
        }
    }
}

impl SchedulerConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(contents)?)
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_unsatisfiable_timeout_secs(mut self, secs: i64) -> Self {
        self.unsatisfiable_timeout_secs = secs;
        self
    }

    pub fn with_matcher_interval_secs(mut self, secs: u64) -> Self {
        self.matcher_interval_secs = secs;
        self
    }

    pub fn with_max_active_builds_per_project(mut self, max: usize) -> Self {
        self.max_active_builds_per_project = max;
        self
    }

    pub fn with_downstream_mode(mut self, mode: DownstreamMode) -> Self {
        self.downstream_mode = mode;
        self
    }

    pub fn unsatisfiable_policy(&self) -> UnsatisfiablePolicy {
        match self.unsatisfiable_timeout_secs {
            0 => UnsatisfiablePolicy::RejectImmediately,
            secs if secs > 0 => UnsatisfiablePolicy::Timeout(Duration::from_secs(secs as u64)),
            _ => UnsatisfiablePolicy::WaitForever,
        }
    }

    pub fn matcher_interval(&self) -> Duration {
        Duration::from_secs(self.matcher_interval_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_yaml() {
        let config = SchedulerConfig::from_yaml("{}").unwrap();
        assert!(config.enabled);
        assert_eq!(config.matcher_interval_secs, 60);
        assert_eq!(config.max_active_builds_per_project, 1);
        assert_eq!(config.downstream_mode, DownstreamMode::OnCompletion);
        assert_eq!(
            config.unsatisfiable_policy(),
            UnsatisfiablePolicy::RejectImmediately
        );
    }

    #[test]
    fn test_unsatisfiable_policy() {
        let config = SchedulerConfig::default().with_unsatisfiable_timeout_secs(30);
        assert_eq!(
            config.unsatisfiable_policy(),
            UnsatisfiablePolicy::Timeout(Duration::from_secs(30))
        );
        let config = config.with_unsatisfiable_timeout_secs(-1);
        assert_eq!(config.unsatisfiable_policy(), UnsatisfiablePolicy::WaitForever);
    }

    #[test]
    fn test_parse_yaml() {
        let config = SchedulerConfig::from_yaml(
            "enabled: false\ndownstream_mode: at_trigger\nunsatisfiable_timeout_secs: 300\n",
        )
        .unwrap();
        assert!(!config.enabled);
        assert_eq!(config.downstream_mode, DownstreamMode::AtTrigger);
        assert_eq!(config.unsatisfiable_timeout_secs, 300);
    }
}
