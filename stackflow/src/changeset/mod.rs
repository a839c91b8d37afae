//! Change set previews, approval, and execution.
//!
//! A change set captures the delta between live state and a target request
//! for a stack and its nested units, along with the live version each delta
//! was computed against. Executing it re-checks those versions first.

mod approval;
mod diff;
mod planner;

pub use approval::{ApprovalGate, ApprovalService, AutoApprove, PendingApproval};
pub use diff::{diff, Change, StackDelta};
pub use planner::{ChangeSet, ChangeSetOutcome, ChangeSetPlanner};
