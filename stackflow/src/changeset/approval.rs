//! Human approval of change sets.

use super::planner::ChangeSet;
use crate::errors::ApprovalError;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use uuid::Uuid;

/// Decides whether a change set may be executed.
#[async_trait]
pub trait ApprovalGate: Send + Sync {
    /// Resolves once the change set is approved.
    async fn review(&self, changeset: &ChangeSet) -> Result<(), ApprovalError>;
}

/// Approves everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoApprove;

#[async_trait]
impl ApprovalGate for AutoApprove {
    async fn review(&self, changeset: &ChangeSet) -> Result<(), ApprovalError> {
        tracing::debug!(changeset = %changeset.id(), stack = %changeset.stack(), "Change set auto-approved");
        Ok(())
    }
}

/// A pending approval as shown to reviewers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingApproval {
    /// Request ID, used to answer it.
    pub id: Uuid,
    /// Root stack of the change set.
    pub stack: String,
    /// Change set ID.
    pub changeset: String,
    /// One-line description of the changes.
    pub summary: String,
}

struct ApprovalRequest {
    info: PendingApproval,
    created_at: Instant,
    response_tx: Option<oneshot::Sender<bool>>,
}

/// Holds change sets until a reviewer approves or denies them.
pub struct ApprovalService {
    requests: RwLock<HashMap<Uuid, ApprovalRequest>>,
    timeout: Duration,
}

impl ApprovalService {
    /// Creates a service whose requests expire after `timeout`.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            requests: RwLock::new(HashMap::new()),
            timeout,
        }
    }

    /// Waits for a decision on `changeset`.
    pub async fn request_approval(&self, changeset: &ChangeSet) -> Result<(), ApprovalError> {
        let request_id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        let stack = changeset.stack().to_string();

        let info = PendingApproval {
            id: request_id,
            stack: stack.clone(),
            changeset: changeset.id().to_string(),
            summary: changeset.summary(),
        };
        tracing::info!(request = %request_id, stack = %stack, summary = %info.summary, "Approval requested");
        self.requests.write().insert(
            request_id,
            ApprovalRequest {
                info,
                created_at: Instant::now(),
                response_tx: Some(tx),
            },
        );

        let decision = tokio::time::timeout(self.timeout, rx).await;
        let waited = self
            .requests
            .write()
            .remove(&request_id)
            .map(|r| r.created_at.elapsed());
        tracing::debug!(request = %request_id, waited_ms = ?waited.map(|d| d.as_millis()), "Approval settled");

        match decision {
            Ok(Ok(true)) => Ok(()),
            Ok(Ok(false)) => Err(ApprovalError::Denied { stack }),
            Ok(Err(_)) => Err(ApprovalError::Cancelled { stack }),
            Err(_) => Err(ApprovalError::TimedOut {
                stack,
                timeout_seconds: self.timeout.as_secs_f64(),
            }),
        }
    }

    /// Approves a pending request.
    pub fn approve(&self, request_id: Uuid) -> bool {
        self.answer(request_id, true)
    }

    /// Denies a pending request.
    pub fn deny(&self, request_id: Uuid) -> bool {
        self.answer(request_id, false)
    }

    /// Withdraws a pending request.
    pub fn cancel(&self, request_id: Uuid) -> bool {
        self.requests.write().remove(&request_id).is_some()
    }

    /// Returns the number of pending requests.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.requests.read().len()
    }

    /// Lists pending requests.
    #[must_use]
    pub fn pending_requests(&self) -> Vec<PendingApproval> {
        self.requests.read().values().map(|r| r.info.clone()).collect()
    }

    fn answer(&self, request_id: Uuid, approved: bool) -> bool {
        let Some(mut request) = self.requests.write().remove(&request_id) else {
            return false;
        };
        request
            .response_tx
            .take()
            .is_some_and(|tx| tx.send(approved).is_ok())
    }
}

impl std::fmt::Debug for ApprovalService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApprovalService")
            .field("pending_count", &self.pending_count())
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[async_trait]
impl ApprovalGate for ApprovalService {
    async fn review(&self, changeset: &ChangeSet) -> Result<(), ApprovalError> {
        self.request_approval(changeset).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changeset::{Change, StackDelta};
    use std::sync::Arc;

    fn changeset() -> ChangeSet {
        ChangeSet::new(
            "Iam",
            vec![StackDelta {
                stack: "Iam".into(),
                expected_version: None,
                changes: vec![Change::CreateStack],
            }],
            vec![],
        )
    }

    async fn wait_for_request(service: &ApprovalService) -> PendingApproval {
        loop {
            if let Some(request) = service.pending_requests().into_iter().next() {
                return request;
            }
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_auto_approve() {
        assert!(AutoApprove.review(&changeset()).await.is_ok());
    }

    #[tokio::test]
    async fn test_approved() {
        let service = Arc::new(ApprovalService::new(Duration::from_secs(5)));
        let reviewer = service.clone();
        let handle = tokio::spawn(async move {
            let request = wait_for_request(&reviewer).await;
            assert_eq!(request.stack, "Iam");
            reviewer.approve(request.id)
        });

        assert!(service.review(&changeset()).await.is_ok());
        assert!(handle.await.unwrap());
        assert_eq!(service.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_denied() {
        let service = Arc::new(ApprovalService::new(Duration::from_secs(5)));
        let reviewer = service.clone();
        tokio::spawn(async move {
            let request = wait_for_request(&reviewer).await;
            reviewer.deny(request.id);
        });

        assert_eq!(
            service.review(&changeset()).await,
            Err(ApprovalError::Denied { stack: "Iam".into() })
        );
    }

    #[tokio::test]
    async fn test_cancelled() {
        let service = Arc::new(ApprovalService::new(Duration::from_secs(5)));
        let reviewer = service.clone();
        tokio::spawn(async move {
            let request = wait_for_request(&reviewer).await;
            reviewer.cancel(request.id);
        });

        assert_eq!(
            service.review(&changeset()).await,
            Err(ApprovalError::Cancelled { stack: "Iam".into() })
        );
    }

    #[tokio::test]
    async fn test_timeout() {
        let service = ApprovalService::new(Duration::from_millis(20));
        let err = service.review(&changeset()).await.unwrap_err();
        assert!(matches!(err, ApprovalError::TimedOut { .. }));
        assert!(!service.approve(Uuid::new_v4()));
    }
}
