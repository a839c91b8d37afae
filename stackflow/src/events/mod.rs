//! Lifecycle events.
//!
//! The orchestrator and change set planner report progress through an
//! injected [`EventSink`]. Stack events carry `run_id` and `stack`; run
//! events carry `run_id` and the operation.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

use crate::core::StackState;

/// A run began.
pub const RUN_STARTED: &str = "run.started";
/// A run stopped at a cancellation checkpoint.
pub const RUN_CANCELLED: &str = "run.cancelled";
/// A run finished, successfully or not.
pub const RUN_COMPLETED: &str = "run.completed";
/// A stack started resolving its references.
pub const STACK_RESOLVING: &str = "stack.resolving";
/// A stack's template is being published.
pub const STACK_PUBLISHING: &str = "stack.publishing";
/// A stack's provisioning operation was submitted.
pub const STACK_APPLYING: &str = "stack.applying";
/// A stack succeeded.
pub const STACK_SUCCEEDED: &str = "stack.succeeded";
/// A stack failed and was reverted.
pub const STACK_ROLLED_BACK: &str = "stack.rolled_back";
/// A stack failed.
pub const STACK_FAILED: &str = "stack.failed";
/// A change set was computed.
pub const CHANGESET_CREATED: &str = "changeset.created";
/// A change set was executed.
pub const CHANGESET_EXECUTED: &str = "changeset.executed";
/// A change set was dropped unexecuted.
pub const CHANGESET_DISCARDED: &str = "changeset.discarded";

/// Returns the event emitted on entering `state`, if any.
#[must_use]
pub fn stack_event(state: StackState) -> Option<&'static str> {
    match state {
        StackState::Pending => None,
        StackState::Resolving => Some(STACK_RESOLVING),
        StackState::Publishing => Some(STACK_PUBLISHING),
        StackState::Applying => Some(STACK_APPLYING),
        StackState::Succeeded => Some(STACK_SUCCEEDED),
        StackState::RolledBack => Some(STACK_ROLLED_BACK),
        StackState::Failed => Some(STACK_FAILED),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_event_names() {
        assert_eq!(stack_event(StackState::Pending), None);
        assert_eq!(stack_event(StackState::RolledBack), Some("stack.rolled_back"));
        assert_eq!(stack_event(StackState::Succeeded), Some(STACK_SUCCEEDED));
    }
}
