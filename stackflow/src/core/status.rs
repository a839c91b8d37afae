//! Per-stack lifecycle states and the operations that drive them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The lifecycle state of one stack within a deployment run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StackState {
    /// Waiting for producers.
    #[default]
    Pending,
    /// Resolving references into concrete inputs.
    Resolving,
    /// Publishing the template artifact at the required revision.
    Publishing,
    /// The provisioning operation is in flight.
    Applying,
    /// The operation completed.
    Succeeded,
    /// The operation failed and the stack reverted to its prior state.
    RolledBack,
    /// The operation failed and could not be recovered.
    Failed,
}

impl fmt::Display for StackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Resolving => write!(f, "resolving"),
            Self::Publishing => write!(f, "publishing"),
            Self::Applying => write!(f, "applying"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::RolledBack => write!(f, "rolled_back"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl StackState {
    /// Returns true if the state represents a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::RolledBack | Self::Failed)
    }

    /// Returns true if the state indicates success.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }

    /// Returns true if the state halts dependents.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::RolledBack | Self::Failed)
    }

    /// Returns true if moving to `next` is a legal transition.
    ///
    /// Deletions skip resolution (`Pending → Applying`), a stack refused by a
    /// safety check fails without applying (`Pending → Failed`), and a
    /// deletion of an absent stack completes immediately (`Pending → Succeeded`).
    #[must_use]
    pub fn can_transition_to(&self, next: Self) -> bool {
        use StackState::{Applying, Failed, Pending, Publishing, Resolving, RolledBack, Succeeded};
        matches!(
            (self, next),
            (Pending, Resolving | Applying | Failed | Succeeded)
                | (Resolving, Publishing | Applying | Failed)
                | (Publishing, Applying | Failed)
                | (Applying, Succeeded | RolledBack | Failed)
        )
    }
}

/// The operation a run performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Create stacks that do not exist yet.
    Create,
    /// Update existing stacks.
    Update,
    /// Delete stacks in teardown order.
    Delete,
    /// Preview and execute change sets.
    ChangeSet,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Update => write!(f, "update"),
            Self::Delete => write!(f, "delete"),
            Self::ChangeSet => write!(f, "changeset"),
        }
    }
}

/// A recorded state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransition {
    /// Previous state.
    pub from: StackState,
    /// New state.
    pub to: StackState,
    /// When the transition happened.
    pub at: DateTime<Utc>,
}

/// Tracks the current state of one stack and how it got there.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackLifecycle {
    state: StackState,
    history: Vec<StateTransition>,
}

impl StackLifecycle {
    /// Creates a lifecycle in `Pending`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> StackState {
        self.state
    }

    /// Returns the recorded transitions.
    #[must_use]
    pub fn history(&self) -> &[StateTransition] {
        &self.history
    }

    /// Moves to `next`, returning false if the transition is not legal.
    pub fn advance(&mut self, next: StackState) -> bool {
        if !self.state.can_transition_to(next) {
            tracing::warn!(from = %self.state, to = %next, "Rejected illegal stack state transition");
            return false;
        }
        self.history.push(StateTransition {
            from: self.state,
            to: next,
            at: Utc::now(),
        });
        self.state = next;
        true
    }

    /// Returns the visited states, starting with `Pending`.
    #[must_use]
    pub fn path(&self) -> Vec<StackState> {
        std::iter::once(StackState::Pending)
            .chain(self.history.iter().map(|t| t.to))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display() {
        assert_eq!(StackState::Pending.to_string(), "pending");
        assert_eq!(StackState::RolledBack.to_string(), "rolled_back");
        assert_eq!(Operation::ChangeSet.to_string(), "changeset");
    }

    #[test]
    fn test_state_is_terminal() {
        assert!(StackState::Succeeded.is_terminal());
        assert!(StackState::RolledBack.is_terminal());
        assert!(StackState::Failed.is_terminal());
        assert!(!StackState::Applying.is_terminal());
        assert!(!StackState::Pending.is_terminal());
    }

    #[test]
    fn test_legal_transitions() {
        assert!(StackState::Pending.can_transition_to(StackState::Resolving));
        assert!(StackState::Resolving.can_transition_to(StackState::Publishing));
        assert!(StackState::Resolving.can_transition_to(StackState::Applying));
        assert!(StackState::Applying.can_transition_to(StackState::RolledBack));
        assert!(!StackState::Pending.can_transition_to(StackState::RolledBack));
        assert!(!StackState::Succeeded.can_transition_to(StackState::Applying));
        assert!(!StackState::Publishing.can_transition_to(StackState::Resolving));
    }

    #[test]
    fn test_lifecycle_records_path() {
        let mut lifecycle = StackLifecycle::new();
        assert!(lifecycle.advance(StackState::Resolving));
        assert!(lifecycle.advance(StackState::Applying));
        assert!(!lifecycle.advance(StackState::Resolving));
        assert!(lifecycle.advance(StackState::Succeeded));

        assert_eq!(
            lifecycle.path(),
            vec![
                StackState::Pending,
                StackState::Resolving,
                StackState::Applying,
                StackState::Succeeded
            ]
        );
        assert_eq!(lifecycle.history().len(), 3);
    }

    #[test]
    fn test_state_serialize() {
        let json = serde_json::to_string(&StackState::RolledBack).unwrap();
        assert_eq!(json, r#""rolled_back""#);
    }
}
