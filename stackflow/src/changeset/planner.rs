//! Computing, approving, and executing change sets.

use super::approval::{ApprovalGate, AutoApprove};
use super::diff::{diff, StackDelta};
use crate::errors::{ProvisioningError, SafetyViolation, StackflowError};
use crate::events::{EventSink, NoOpEventSink, CHANGESET_CREATED, CHANGESET_DISCARDED, CHANGESET_EXECUTED};
use crate::orchestrator::{
    wait_for_terminal, with_retry, LiveStack, OperationStatus, PollConfig, Provisioner, RetryConfig,
    StackRequest,
};
use crate::utils::generate_changeset_id;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A computed, unexecuted transition of one stack and its nested units.
///
/// A change set is consumed by [`ChangeSetPlanner::execute`] or
/// [`ChangeSetPlanner::discard`]; it cannot be applied twice.
#[derive(Debug, PartialEq, Eq, Serialize)]
pub struct ChangeSet {
    id: String,
    stack: String,
    deltas: Vec<StackDelta>,
    #[serde(skip)]
    requests: Vec<StackRequest>,
    created_at: DateTime<Utc>,
}

impl ChangeSet {
    pub(crate) fn new(stack: impl Into<String>, deltas: Vec<StackDelta>, requests: Vec<StackRequest>) -> Self {
        Self {
            id: generate_changeset_id(),
            stack: stack.into(),
            deltas,
            requests,
            created_at: Utc::now(),
        }
    }

    /// Returns the change set ID.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the root stack.
    #[must_use]
    pub fn stack(&self) -> &str {
        &self.stack
    }

    /// Returns the per-stack deltas; the root stack comes first.
    #[must_use]
    pub fn deltas(&self) -> &[StackDelta] {
        &self.deltas
    }

    /// Returns the delta for `stack`.
    #[must_use]
    pub fn delta(&self, stack: &str) -> Option<&StackDelta> {
        self.deltas.iter().find(|d| d.stack == stack)
    }

    /// Returns true if no covered stack would change.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.deltas.iter().all(StackDelta::is_empty)
    }

    /// Returns when the change set was computed.
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Describes the change set in one line.
    #[must_use]
    pub fn summary(&self) -> String {
        let parts: Vec<String> = self
            .deltas
            .iter()
            .filter(|d| !d.is_empty())
            .map(|d| {
                if d.is_create() {
                    format!("{}: create", d.stack)
                } else {
                    format!("{}: {} change(s)", d.stack, d.changes.len())
                }
            })
            .collect();
        if parts.is_empty() {
            format!("{}: no changes", self.stack)
        } else {
            parts.join("; ")
        }
    }
}

/// How an executed change set ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ChangeSetOutcome {
    /// Every covered stack was updated.
    Applied,
    /// The change set failed and live state was restored.
    RolledBack {
        /// Provider message.
        reason: String,
    },
    /// The change set failed and live state may be partial.
    Failed {
        /// Provider message.
        reason: String,
    },
    /// Nothing needed to change.
    NoChanges,
}

impl ChangeSetOutcome {
    /// Returns true for `Applied` and `NoChanges`.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Applied | Self::NoChanges)
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::RolledBack { .. } => "rolled_back",
            Self::Failed { .. } => "failed",
            Self::NoChanges => "no_changes",
        }
    }
}

/// Previews updates against live state and executes them once approved.
#[derive(Clone)]
pub struct ChangeSetPlanner {
    provisioner: Arc<dyn Provisioner>,
    approval: Arc<dyn ApprovalGate>,
    events: Arc<dyn EventSink>,
    poll: PollConfig,
    retry: RetryConfig,
}

impl std::fmt::Debug for ChangeSetPlanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeSetPlanner")
            .field("poll", &self.poll)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl ChangeSetPlanner {
    /// Creates a planner that approves everything.
    #[must_use]
    pub fn new(provisioner: Arc<dyn Provisioner>) -> Self {
        Self {
            provisioner,
            approval: Arc::new(AutoApprove),
            events: Arc::new(NoOpEventSink),
            poll: PollConfig::default(),
            retry: RetryConfig::default(),
        }
    }

    /// Sets the approval gate.
    #[must_use]
    pub fn with_approval_gate(mut self, approval: Arc<dyn ApprovalGate>) -> Self {
        self.approval = approval;
        self
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Sets operation polling.
    #[must_use]
    pub fn with_poll(mut self, poll: PollConfig) -> Self {
        self.poll = poll;
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Computes the change set for one stack. Read-only.
    pub async fn plan(&self, target: StackRequest) -> Result<ChangeSet, StackflowError> {
        self.plan_with_nested(target, Vec::new()).await
    }

    /// Computes one change set covering a stack and its nested units.
    pub async fn plan_with_nested(
        &self,
        target: StackRequest,
        nested: Vec<StackRequest>,
    ) -> Result<ChangeSet, StackflowError> {
        let root = target.stack_name.clone();
        let mut deltas = Vec::with_capacity(nested.len() + 1);
        let mut requests = Vec::with_capacity(nested.len() + 1);

        for request in std::iter::once(target).chain(nested) {
            let live = self.describe(&request.stack_name).await?;
            let delta = diff(live.as_ref(), &request);
            requests.push(request.expecting_version(delta.expected_version));
            deltas.push(delta);
        }

        let changeset = ChangeSet::new(root, deltas, requests);
        tracing::info!(
            changeset = %changeset.id,
            stack = %changeset.stack,
            summary = %changeset.summary(),
            "Change set created"
        );
        self.events.try_emit(
            CHANGESET_CREATED,
            Some(serde_json::json!({
                "changeset": changeset.id,
                "stack": changeset.stack,
                "stacks": changeset.deltas.iter().map(|d| d.stack.as_str()).collect::<Vec<_>>(),
                "empty": changeset.is_empty(),
            })),
        );
        Ok(changeset)
    }

    /// Executes a change set as a single unit.
    ///
    /// Fails with [`SafetyViolation::ChangeSetStale`] if any covered stack
    /// changed since the change set was computed.
    pub async fn execute(&self, changeset: ChangeSet) -> Result<ChangeSetOutcome, StackflowError> {
        let outcome = if changeset.is_empty() {
            tracing::info!(changeset = %changeset.id, stack = %changeset.stack, "Change set has no changes");
            ChangeSetOutcome::NoChanges
        } else {
            self.approval.review(&changeset).await?;
            self.ensure_fresh(&changeset).await?;
            self.submit(&changeset).await?
        };

        self.events
            .emit(
                CHANGESET_EXECUTED,
                Some(serde_json::json!({
                    "changeset": changeset.id,
                    "stack": changeset.stack,
                    "outcome": outcome.name(),
                })),
            )
            .await;
        Ok(outcome)
    }

    /// Drops a change set without executing it.
    #[allow(clippy::needless_pass_by_value)]
    pub fn discard(&self, changeset: ChangeSet) {
        tracing::info!(changeset = %changeset.id, stack = %changeset.stack, "Change set discarded");
        self.events.try_emit(
            CHANGESET_DISCARDED,
            Some(serde_json::json!({
                "changeset": changeset.id,
                "stack": changeset.stack,
            })),
        );
    }

    async fn describe(&self, stack: &str) -> Result<Option<LiveStack>, StackflowError> {
        Ok(with_retry(&self.retry, "describe_stack", || self.provisioner.describe_stack(stack))
            .await?
            .value)
    }

    async fn ensure_fresh(&self, changeset: &ChangeSet) -> Result<(), StackflowError> {
        for delta in &changeset.deltas {
            let actual = self.describe(&delta.stack).await?.map(|live| live.version);
            if actual != delta.expected_version {
                tracing::warn!(
                    stack = %delta.stack,
                    expected = ?delta.expected_version,
                    actual = ?actual,
                    "Change set is stale"
                );
                return Err(SafetyViolation::ChangeSetStale {
                    stack: delta.stack.clone(),
                    expected: delta.expected_version,
                    actual,
                }
                .into());
            }
        }
        Ok(())
    }

    async fn submit(&self, changeset: &ChangeSet) -> Result<ChangeSetOutcome, StackflowError> {
        let requests: Vec<StackRequest> = changeset
            .requests
            .iter()
            .zip(&changeset.deltas)
            .filter(|(_, delta)| !delta.is_empty())
            .map(|(request, _)| request.clone())
            .collect();

        let operation = match with_retry(&self.retry, "execute_changeset", || {
            self.provisioner.execute_changeset(&requests)
        })
        .await
        {
            Ok(attempted) => attempted.value,
            Err(ProvisioningError::VersionConflict { stack, expected, actual }) => {
                return Err(SafetyViolation::ChangeSetStale { stack, expected, actual }.into());
            }
            Err(e) => return Err(e.into()),
        };

        let status = wait_for_terminal(
            self.provisioner.as_ref(),
            &changeset.stack,
            &operation,
            &self.poll,
            &self.retry,
        )
        .await?;

        Ok(match status {
            OperationStatus::Complete => ChangeSetOutcome::Applied,
            OperationStatus::RolledBack { reason } => ChangeSetOutcome::RolledBack { reason },
            OperationStatus::Failed { reason } => ChangeSetOutcome::Failed { reason },
            OperationStatus::InProgress => ChangeSetOutcome::Failed {
                reason: "operation did not finish".to_string(),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changeset::Change;
    use crate::core::{ParameterValues, StackDefinition};
    use crate::events::CollectingEventSink;
    use crate::orchestrator::{Fault, InMemoryProvisioner};
    use crate::resolver::{InMemoryExportRegistry, InMemoryParameterStore};
    use pretty_assertions::assert_eq;

    fn setup() -> (Arc<InMemoryProvisioner>, ChangeSetPlanner) {
        let provisioner = Arc::new(InMemoryProvisioner::new(
            "eu-west-1",
            Arc::new(InMemoryExportRegistry::new()),
            Arc::new(InMemoryParameterStore::new()),
        ));
        let planner = ChangeSetPlanner::new(provisioner.clone()).with_poll(PollConfig::new(1, 5));
        (provisioner, planner)
    }

    fn request(name: &str, env: &str) -> StackRequest {
        StackRequest::from_definition(
            &StackDefinition::new(name, "t.json"),
            format!("memory://{name}"),
            ParameterValues::from([("Env".to_string(), env.to_string())]),
        )
    }

    async fn deploy(planner: &ChangeSetPlanner, request: StackRequest) {
        let changeset = planner.plan(request).await.unwrap();
        assert_eq!(planner.execute(changeset).await.unwrap(), ChangeSetOutcome::Applied);
    }

    #[tokio::test]
    async fn test_plan_is_read_only() {
        let (provisioner, planner) = setup();
        let changeset = planner.plan(request("Iam", "dev")).await.unwrap();

        assert!(changeset.deltas()[0].is_create());
        assert!(provisioner.calls().is_empty());
        assert!(provisioner.live_stacks().is_empty());
        planner.discard(changeset);
    }

    #[tokio::test]
    async fn test_execute_applies_and_reports_no_changes() {
        let (provisioner, planner) = setup();
        deploy(&planner, request("Iam", "dev")).await;
        assert_eq!(provisioner.live_stacks(), vec!["Iam"]);

        let again = planner.plan(request("Iam", "dev")).await.unwrap();
        assert!(again.is_empty());
        assert_eq!(again.summary(), "Iam: no changes");
        assert_eq!(planner.execute(again).await.unwrap(), ChangeSetOutcome::NoChanges);
    }

    #[tokio::test]
    async fn test_stale_changeset_is_refused() {
        let (provisioner, planner) = setup();
        deploy(&planner, request("Iam", "dev")).await;

        let changeset = planner.plan(request("Iam", "prod")).await.unwrap();
        assert_eq!(
            changeset.delta("Iam").unwrap().changes,
            vec![Change::ParameterModified {
                name: "Env".into(),
                from: "dev".into(),
                to: "prod".into()
            }]
        );

        provisioner.touch("Iam").unwrap();
        let err = planner.execute(changeset).await.unwrap_err();
        assert_eq!(err.code(), "SAFETY-002-CHANGESET_STALE");
        assert_eq!(
            provisioner.describe_stack("Iam").await.unwrap().unwrap().parameters["Env"],
            "dev"
        );
    }

    #[tokio::test]
    async fn test_nested_units_apply_together() {
        let (provisioner, planner) = setup();
        let changeset = planner
            .plan_with_nested(request("App", "dev"), vec![request("Networking", "dev")])
            .await
            .unwrap();
        assert_eq!(changeset.deltas().len(), 2);
        assert_eq!(changeset.summary(), "App: create; Networking: create");

        provisioner.inject_fault("Networking", Fault::FailWithRollback("subnet overlap".into()));
        assert_eq!(
            planner.execute(changeset).await.unwrap(),
            ChangeSetOutcome::RolledBack {
                reason: "subnet overlap".into()
            }
        );
        assert!(provisioner.live_stacks().is_empty());
    }

    #[tokio::test]
    async fn test_events_emitted() {
        let (provisioner, _) = setup();
        let sink = Arc::new(CollectingEventSink::new());
        let planner = ChangeSetPlanner::new(provisioner)
            .with_poll(PollConfig::new(1, 5))
            .with_event_sink(sink.clone());

        deploy(&planner, request("Iam", "dev")).await;
        planner.discard(planner.plan(request("Iam", "prod")).await.unwrap());

        let types: Vec<String> = sink.events().into_iter().map(|(t, _)| t).collect();
        assert_eq!(
            types,
            vec![CHANGESET_CREATED, CHANGESET_EXECUTED, CHANGESET_CREATED, CHANGESET_DISCARDED]
        );
        assert_eq!(sink.stacks_for(CHANGESET_DISCARDED), vec!["Iam"]);
    }
}
