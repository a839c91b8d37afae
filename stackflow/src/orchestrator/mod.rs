//! Deployment runs: scheduling, provisioning, polling, and retries.
//!
//! The [`DeploymentOrchestrator`] walks a plan, resolving each stack's
//! references, publishing its template if needed, and submitting it to a
//! [`Provisioner`]. Transient API errors go through [`with_retry`]; long
//! running operations are awaited with [`wait_for_terminal`].

mod cancellation;
mod engine;
mod inputs;
mod memory;
mod poll;
mod provisioner;
mod report;
mod retry;


pub use cancellation::CancellationToken;
pub use engine::DeploymentOrchestrator;
pub use inputs::assemble_inputs;
pub use memory::{render_expression, Fault, InMemoryProvisioner, ProvisionerSnapshot};
pub use poll::{wait_for_terminal, PollConfig};
pub use provisioner::{LiveStack, OperationId, OperationStatus, Provisioner, StackRequest, Submission};
pub use report::{DeploymentReport, RunFailure, StackReport};
pub use retry::{
    should_retry, with_retry, Attempted, BackoffStrategy, JitterStrategy, RetryConfig, RetryDecision,
    RetryState,
};
