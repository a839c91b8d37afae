//! Waiting for provisioning operations to finish.

use super::provisioner::{OperationId, OperationStatus, Provisioner};
use super::retry::{with_retry, RetryConfig};
use crate::errors::ProvisioningError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

fn default_interval_ms() -> u64 {
    5_000
}

fn default_timeout_secs() -> u64 {
    3_600
}

/// How often and how long to poll an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollConfig {
    /// Delay between polls in milliseconds.
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Give up after this many seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl PollConfig {
    /// Creates a poll config.
    #[must_use]
    pub fn new(interval_ms: u64, timeout_secs: u64) -> Self {
        Self {
            interval_ms,
            timeout_secs,
        }
    }
}

/// Polls `operation` until it reaches a terminal status.
///
/// Each poll is retried on transient errors. Exceeding the timeout yields
/// [`ProvisioningError::Timeout`]; the operation itself keeps running.
pub async fn wait_for_terminal(
    provisioner: &dyn Provisioner,
    stack: &str,
    operation: &OperationId,
    poll: &PollConfig,
    retry: &RetryConfig,
) -> Result<OperationStatus, ProvisioningError> {
    let started = Instant::now();
    let deadline = started + Duration::from_secs(poll.timeout_secs);
    let interval = Duration::from_millis(poll.interval_ms);

    loop {
        let status = with_retry(retry, "poll_operation", || provisioner.poll_operation(operation))
            .await?
            .value;

        if status.is_terminal() {
            tracing::debug!(stack, operation = %operation, status = ?status, "Operation finished");
            return Ok(status);
        }

        if Instant::now() + interval > deadline {
            tracing::warn!(stack, operation = %operation, "Operation did not finish in time");
            return Err(ProvisioningError::Timeout {
                stack: stack.to_string(),
                waited_secs: started.elapsed().as_secs(),
            });
        }
        tokio::time::sleep(interval).await;
    }
}
