//! Orchestrator configuration.

use crate::errors::{ManifestError, StackflowError};
use crate::orchestrator::{PollConfig, RetryConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_auto_rollback() -> bool {
    true
}

fn default_max_concurrency() -> usize {
    1
}

fn default_approval_timeout_secs() -> f64 {
    900.0
}

/// Settings for one orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Region exports are resolved and registered in.
    #[serde(default = "default_region")]
    pub region: String,
    /// Retry policy for transient provisioning errors.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Operation polling.
    #[serde(default)]
    pub poll: PollConfig,
    /// Revert failed stacks to their previous state.
    #[serde(default = "default_auto_rollback")]
    pub auto_rollback: bool,
    /// Stacks applied at the same time.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// How long a change set waits for approval.
    #[serde(default = "default_approval_timeout_secs")]
    pub approval_timeout_secs: f64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            region: default_region(),
            retry: RetryConfig::default(),
            poll: PollConfig::default(),
            auto_rollback: default_auto_rollback(),
            max_concurrency: default_max_concurrency(),
            approval_timeout_secs: default_approval_timeout_secs(),
        }
    }
}

impl OrchestratorConfig {
    /// Creates a default config for `region`.
    #[must_use]
    pub fn for_region(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            ..Self::default()
        }
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets operation polling.
    #[must_use]
    pub fn with_poll(mut self, poll: PollConfig) -> Self {
        self.poll = poll;
        self
    }

    /// Sets whether failed stacks are reverted.
    #[must_use]
    pub fn with_auto_rollback(mut self, enabled: bool) -> Self {
        self.auto_rollback = enabled;
        self
    }

    /// Sets how many independent stacks may apply at once.
    #[must_use]
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max;
        self
    }

    /// Concurrency actually used; never below one.
    #[must_use]
    pub fn effective_concurrency(&self) -> usize {
        self.max_concurrency.max(1)
    }

    /// Parses a JSON document.
    pub fn from_json(json: &str) -> Result<Self, StackflowError> {
        serde_json::from_str(json).map_err(|e| ManifestError::Parse(e).into())
    }

    /// Loads a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, StackflowError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = OrchestratorConfig::from_json("{}").unwrap();
        assert_eq!(config, OrchestratorConfig::default());
        assert!(config.auto_rollback);
        assert_eq!(config.max_concurrency, 1);
    }

    #[test]
    fn test_partial_override() {
        let config = OrchestratorConfig::from_json(
            r#"{"region": "eu-west-1", "max_concurrency": 4, "retry": {"max_attempts": 2}}"#,
        )
        .unwrap();
        assert_eq!(config.region, "eu-west-1");
        assert_eq!(config.effective_concurrency(), 4);
        assert_eq!(config.retry.max_attempts, 2);
        assert_eq!(config.retry.base_delay_ms, 500);
    }

    #[test]
    fn test_zero_concurrency_is_sequential() {
        assert_eq!(OrchestratorConfig::default().with_max_concurrency(0).effective_concurrency(), 1);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"auto_rollback": false}}"#).unwrap();
        let config = OrchestratorConfig::from_json_file(file.path()).unwrap();
        assert!(!config.auto_rollback);
    }

    #[test]
    fn test_invalid_json() {
        let err = OrchestratorConfig::from_json("{").unwrap_err();
        assert_eq!(err.code(), "MANIFEST-001-PARSE");
    }
}
