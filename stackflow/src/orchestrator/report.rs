//! Run reports.

use crate::core::{Operation, ParameterValues, StackLifecycle, StackState, StateTransition};
use crate::errors::{ErrorKind, StackflowError};
use crate::resolver::ResolvedReference;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What happened to one stack during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackReport {
    /// Stack name.
    pub name: String,
    /// Final state.
    pub state: StackState,
    /// Every state change, in order.
    pub history: Vec<StateTransition>,
    /// Values the stack's references resolved to.
    #[serde(default)]
    pub resolved: Vec<ResolvedReference>,
    /// Template URL the stack was deployed from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_url: Option<String>,
    /// Live outputs after the run.
    #[serde(default)]
    pub outputs: ParameterValues,
    /// Provisioning submit attempts.
    pub attempts: usize,
    /// Wall time spent on the stack.
    pub duration_ms: u64,
    /// Error message, if the stack did not succeed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StackReport {
    /// Creates a report for a stack that has not started.
    #[must_use]
    pub fn pending(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: StackState::Pending,
            history: Vec::new(),
            resolved: Vec::new(),
            template_url: None,
            outputs: ParameterValues::new(),
            attempts: 0,
            duration_ms: 0,
            error: None,
        }
    }

    pub(crate) fn record_lifecycle(&mut self, lifecycle: &StackLifecycle) {
        self.state = lifecycle.state();
        self.history = lifecycle.history().to_vec();
    }
}

/// The error that stopped a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFailure {
    /// Stack the error belongs to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    /// The stack's state when the run stopped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<StackState>,
    /// Error category.
    pub kind: ErrorKind,
    /// Stable error code.
    pub code: String,
    /// Human readable message.
    pub message: String,
}

impl RunFailure {
    /// Describes `error` raised while handling `stack`.
    #[must_use]
    pub fn from_error(stack: Option<&str>, state: Option<StackState>, error: &StackflowError) -> Self {
        Self {
            stack: stack.map(str::to_string),
            state,
            kind: error.kind(),
            code: error.code().to_string(),
            message: error.to_string(),
        }
    }
}

/// Result of one orchestrator run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentReport {
    /// Run identifier.
    pub run_id: String,
    /// What the run did.
    pub operation: Operation,
    /// Region the run targeted.
    pub region: String,
    /// Planned order.
    pub order: Vec<String>,
    /// Per-stack results, in plan order.
    pub stacks: Vec<StackReport>,
    /// True only if every stack succeeded and nothing was cancelled.
    pub success: bool,
    /// The run was stopped by cancellation.
    pub cancelled: bool,
    /// The error that stopped the run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<RunFailure>,
    /// Start time.
    pub started_at: DateTime<Utc>,
    /// Total wall time.
    pub duration_ms: u64,
}

impl DeploymentReport {
    /// Returns the report for `name`.
    #[must_use]
    pub fn stack(&self, name: &str) -> Option<&StackReport> {
        self.stacks.iter().find(|s| s.name == name)
    }

    /// Returns the state of `name`.
    #[must_use]
    pub fn state_of(&self, name: &str) -> Option<StackState> {
        self.stack(name).map(|s| s.state)
    }

    /// Returns the last stack in plan order that left `Pending`.
    #[must_use]
    pub fn furthest(&self) -> Option<&str> {
        self.stacks
            .iter()
            .rev()
            .find(|s| s.state != StackState::Pending)
            .map(|s| s.name.as_str())
    }

    /// Returns the names of stacks that reached `state`.
    #[must_use]
    pub fn stacks_in(&self, state: StackState) -> Vec<&str> {
        self.stacks
            .iter()
            .filter(|s| s.state == state)
            .map(|s| s.name.as_str())
            .collect()
    }

    pub(crate) fn finalize(&mut self) {
        let all_succeeded = self.stacks.iter().all(|s| s.state.is_success());
        self.success = all_succeeded && !self.cancelled && self.failure.is_none();
    }
}
