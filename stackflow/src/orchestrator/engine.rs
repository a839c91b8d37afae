//! The deployment orchestrator.

use super::cancellation::CancellationToken;
use super::inputs::assemble_inputs;
use super::poll::wait_for_terminal;
use super::provisioner::{LiveStack, OperationStatus, Provisioner, StackRequest, Submission};
use super::report::{DeploymentReport, RunFailure, StackReport};
use super::retry::{should_retry, with_retry, Attempted, RetryDecision, RetryState};
use crate::artifacts::{ArtifactPublisher, TemplateSource};
use crate::changeset::{ApprovalGate, AutoApprove, ChangeSet, ChangeSetOutcome, ChangeSetPlanner};
use crate::config::OrchestratorConfig;
use crate::core::{Operation, StackDefinition, StackLifecycle, StackState};
use crate::errors::{ArtifactError, ProvisioningError, ReferenceError, SafetyViolation, StackflowError};
use crate::events::{stack_event, EventSink, NoOpEventSink, RUN_CANCELLED, RUN_COMPLETED, RUN_STARTED};
use crate::graph::{DeploymentPlan, PlannedStack, TeardownGuard, TeardownPlan};
use crate::resolver::{ExportRegistry, ParameterStore, ReferenceResolver, ResolutionContext, ResolvedReference};
use crate::utils::{elapsed_ms, generate_run_id};
use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

struct StackRun {
    lifecycle: StackLifecycle,
    report: StackReport,
    started: Instant,
}

impl StackRun {
    fn new(name: &str) -> Self {
        Self {
            lifecycle: StackLifecycle::new(),
            report: StackReport::pending(name),
            started: Instant::now(),
        }
    }

    fn finish(mut self) -> StackReport {
        self.report.record_lifecycle(&self.lifecycle);
        self.report.duration_ms = elapsed_ms(self.started);
        self.report
    }
}

struct StackOutcome {
    report: StackReport,
    error: Option<StackflowError>,
}

/// Drives create, update, change set, and delete runs over a plan.
///
/// Stacks move through `Pending → Resolving → [Publishing] → Applying →
/// Succeeded | RolledBack | Failed`. A stack starts only once all of its
/// producers succeeded; any failure stops further scheduling, and stacks
/// already applying run to a terminal state.
pub struct DeploymentOrchestrator {
    config: OrchestratorConfig,
    provisioner: Arc<dyn Provisioner>,
    resolver: ReferenceResolver,
    guard: TeardownGuard,
    publisher: ArtifactPublisher,
    templates: Arc<dyn TemplateSource>,
    approval: Arc<dyn ApprovalGate>,
    events: Arc<dyn EventSink>,
    cancellation: Arc<CancellationToken>,
}

impl std::fmt::Debug for DeploymentOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeploymentOrchestrator")
            .field("config", &self.config)
            .field("publisher", &self.publisher)
            .field("cancellation", &self.cancellation)
            .finish_non_exhaustive()
    }
}

impl DeploymentOrchestrator {
    /// Creates an orchestrator over the given backends.
    #[must_use]
    pub fn new(
        config: OrchestratorConfig,
        provisioner: Arc<dyn Provisioner>,
        exports: Arc<dyn ExportRegistry>,
        parameters: Arc<dyn ParameterStore>,
        publisher: ArtifactPublisher,
        templates: Arc<dyn TemplateSource>,
    ) -> Self {
        let resolver = ReferenceResolver::new(exports.clone(), parameters, &config.region);
        let guard = TeardownGuard::new(exports, &config.region).with_retry(config.retry.clone());
        Self {
            config,
            provisioner,
            resolver,
            guard,
            publisher,
            templates,
            approval: Arc::new(AutoApprove),
            events: Arc::new(NoOpEventSink),
            cancellation: Arc::new(CancellationToken::new()),
        }
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Sets the gate change sets must pass before executing.
    #[must_use]
    pub fn with_approval_gate(mut self, approval: Arc<dyn ApprovalGate>) -> Self {
        self.approval = approval;
        self
    }

    /// Shares a cancellation token with the caller.
    #[must_use]
    pub fn with_cancellation(mut self, token: Arc<CancellationToken>) -> Self {
        self.cancellation = token;
        self
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Returns the cancellation token.
    #[must_use]
    pub fn cancellation(&self) -> &Arc<CancellationToken> {
        &self.cancellation
    }

    /// Returns the artifact publisher.
    #[must_use]
    pub fn publisher(&self) -> &ArtifactPublisher {
        &self.publisher
    }

    /// Returns a change set planner sharing this orchestrator's backends.
    #[must_use]
    pub fn planner(&self) -> ChangeSetPlanner {
        ChangeSetPlanner::new(self.provisioner.clone())
            .with_approval_gate(self.approval.clone())
            .with_event_sink(self.events.clone())
            .with_poll(self.config.poll.clone())
            .with_retry(self.config.retry.clone())
    }

    /// Creates every stack in the plan.
    pub async fn create(&self, plan: &DeploymentPlan) -> DeploymentReport {
        self.deploy(plan, Operation::Create).await
    }

    /// Updates every stack in the plan.
    pub async fn update(&self, plan: &DeploymentPlan) -> DeploymentReport {
        self.deploy(plan, Operation::Update).await
    }

    /// Deletes stacks in teardown order.
    ///
    /// The whole teardown is checked for imported exports first; each stack
    /// is checked again right before it is deleted. Stacks that are already
    /// gone count as deleted.
    pub async fn delete(&self, teardown: &TeardownPlan) -> DeploymentReport {
        let started = Instant::now();
        let context = ResolutionContext::new(generate_run_id());
        let mut report = self.start_run(&context, Operation::Delete, teardown.order()).await;

        if let Err(error) = self.guard.preflight(teardown).await {
            let blocked = blocked_stack(&error);
            if let Some((index, name)) = blocked.and_then(|n| teardown.position(n).map(|i| (i, n))) {
                let mut run = StackRun::new(name);
                run.report.error = Some(error.to_string());
                self.transition(&context, &mut run, StackState::Failed);
                report.stacks[index] = run.finish();
            }
            report.failure = Some(RunFailure::from_error(
                blocked,
                blocked.map(|_| StackState::Failed),
                &error,
            ));
            return self.finish_run(report, started).await;
        }

        for (index, planned) in teardown.stacks().iter().enumerate() {
            if self.cancellation.is_cancelled() {
                self.mark_cancelled(&mut report).await;
                break;
            }
            let (index, outcome) = self.run_stack(index, planned, Operation::Delete, &context).await;
            if record_outcome(&mut report, index, outcome) {
                break;
            }
        }

        self.finish_run(report, started).await
    }

    /// Previews every stack in the plan as change sets.
    ///
    /// Nested units are folded into their parent's change set when the
    /// parent is part of the plan. Nested outputs are read from live state.
    /// Missing template artifacts are published; live stacks are not touched.
    pub async fn changeset(&self, plan: &DeploymentPlan) -> Result<Vec<ChangeSet>, StackflowError> {
        let context = ResolutionContext::new(generate_run_id());
        for planned in plan.stacks() {
            if let Some(parent) = &planned.definition.parent {
                if let Some(live) = self.describe(planned.name()).await? {
                    context.record_nested_outputs(parent, planned.name(), live.output_values);
                }
            }
        }

        let planner = self.planner();
        let mut changesets = Vec::new();
        for planned in plan.stacks() {
            let definition = &planned.definition;
            if definition.parent.as_deref().is_some_and(|p| plan.get(p).is_some()) {
                continue;
            }

            let target = self.preview_request(definition, &context).await?;
            let mut nested = Vec::new();
            for child in plan
                .stacks()
                .iter()
                .filter(|p| p.definition.parent.as_deref() == Some(definition.name.as_str()))
            {
                nested.push(self.preview_request(&child.definition, &context).await?);
            }
            changesets.push(planner.plan_with_nested(target, nested).await?);
        }

        Ok(changesets)
    }

    /// Executes change sets in order, stopping at the first that does not
    /// succeed or at a cancellation request.
    pub async fn execute_changesets(
        &self,
        changesets: Vec<ChangeSet>,
    ) -> Result<Vec<(String, ChangeSetOutcome)>, StackflowError> {
        let planner = self.planner();
        let mut outcomes = Vec::with_capacity(changesets.len());
        let mut remaining = changesets.into_iter();

        while let Some(changeset) = remaining.next() {
            if let Err(e) = self.cancellation.checkpoint() {
                planner.discard(changeset);
                remaining.for_each(|skipped| planner.discard(skipped));
                return Err(e);
            }
            let stack = changeset.stack().to_string();
            let outcome = match planner.execute(changeset).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    remaining.for_each(|skipped| planner.discard(skipped));
                    return Err(e);
                }
            };
            let stop = !outcome.is_success();
            outcomes.push((stack, outcome));
            if stop {
                remaining.for_each(|skipped| planner.discard(skipped));
                break;
            }
        }
        Ok(outcomes)
    }

    async fn deploy(&self, plan: &DeploymentPlan, operation: Operation) -> DeploymentReport {
        let started = Instant::now();
        let context = ResolutionContext::new(generate_run_id());
        let mut report = self.start_run(&context, operation, plan.order()).await;

        let stacks = plan.stacks();
        let limit = self.config.effective_concurrency();
        let mut pending: Vec<usize> = (0..stacks.len()).collect();
        let mut in_flight = FuturesUnordered::new();
        let mut halted = false;

        loop {
            while !halted && in_flight.len() < limit {
                let Some(slot) = pending.iter().position(|&i| is_ready(&stacks[i], &report)) else {
                    break;
                };
                if self.cancellation.is_cancelled() {
                    self.mark_cancelled(&mut report).await;
                    halted = true;
                    break;
                }
                let index = pending.remove(slot);
                in_flight.push(self.run_stack(index, &stacks[index], operation, &context));
            }

            let Some((index, outcome)) = in_flight.next().await else {
                break;
            };
            if record_outcome(&mut report, index, outcome) {
                halted = true;
            }
        }

        self.finish_run(report, started).await
    }

    async fn run_stack(
        &self,
        index: usize,
        planned: &PlannedStack,
        operation: Operation,
        context: &ResolutionContext,
    ) -> (usize, StackOutcome) {
        let mut run = StackRun::new(planned.name());
        let result = match operation {
            Operation::Delete => self.delete_stack(&planned.definition, context, &mut run).await,
            Operation::Create | Operation::Update | Operation::ChangeSet => {
                self.apply_stack(&planned.definition, operation, context, &mut run).await
            }
        };

        let error = result.err().map(|error| {
            if run.report.error.is_none() {
                run.report.error = Some(error.to_string());
            }
            if !run.lifecycle.state().is_terminal() {
                self.transition(context, &mut run, StackState::Failed);
            }
            warn!(
                run_id = context.run_id(),
                stack = planned.name(),
                code = error.code(),
                error = %error,
                "Stack did not succeed"
            );
            error
        });

        (
            index,
            StackOutcome {
                report: run.finish(),
                error,
            },
        )
    }

    async fn apply_stack(
        &self,
        definition: &StackDefinition,
        operation: Operation,
        context: &ResolutionContext,
        run: &mut StackRun,
    ) -> Result<(), StackflowError> {
        self.transition(context, run, StackState::Resolving);
        let resolved = self.resolve(definition, context).await?;
        run.report.resolved.clone_from(&resolved);
        let inputs = assemble_inputs(definition, &resolved)?;

        let template_url = self.publisher.template_url(&definition.template)?;
        if !self.publisher.is_published(&definition.template).await? {
            self.transition(context, run, StackState::Publishing);
            self.publish_template(definition).await?;
        }
        run.report.template_url = Some(template_url.clone());

        let request = StackRequest::from_definition(definition, template_url, inputs)
            .with_disable_rollback(!self.config.auto_rollback);

        self.transition(context, run, StackState::Applying);
        let submitted = match operation {
            Operation::Create => self
                .submit(run, "create_stack", || self.provisioner.create_stack(&request))
                .await
                .map(Submission::Started),
            _ => {
                self.submit(run, "update_stack", || self.provisioner.update_stack(&request))
                    .await
            }
        }?;

        let status = match submitted {
            Submission::Started(operation_id) => {
                debug!(stack = %definition.name, operation = %operation_id, "Operation submitted");
                wait_for_terminal(
                    self.provisioner.as_ref(),
                    &definition.name,
                    &operation_id,
                    &self.config.poll,
                    &self.config.retry,
                )
                .await?
            }
            Submission::NoChanges => {
                info!(stack = %definition.name, "Stack is already up to date");
                OperationStatus::Complete
            }
        };

        self.settle(definition, status, context, run).await
    }

    async fn delete_stack(
        &self,
        definition: &StackDefinition,
        context: &ResolutionContext,
        run: &mut StackRun,
    ) -> Result<(), StackflowError> {
        if self.describe(&definition.name).await?.is_none() {
            info!(stack = %definition.name, "Stack is already absent");
            self.transition(context, run, StackState::Succeeded);
            return Ok(());
        }

        self.guard.verify(definition).await?;

        self.transition(context, run, StackState::Applying);
        let operation_id = self
            .submit(run, "delete_stack", || self.provisioner.delete_stack(&definition.name))
            .await?;
        let status = wait_for_terminal(
            self.provisioner.as_ref(),
            &definition.name,
            &operation_id,
            &self.config.poll,
            &self.config.retry,
        )
        .await?;

        self.settle(definition, status, context, run).await
    }

    async fn settle(
        &self,
        definition: &StackDefinition,
        status: OperationStatus,
        context: &ResolutionContext,
        run: &mut StackRun,
    ) -> Result<(), StackflowError> {
        let (state, reason) = match status {
            OperationStatus::Complete => {
                if let Some(live) = self.describe(&definition.name).await? {
                    if let Some(parent) = &definition.parent {
                        context.record_nested_outputs(parent, &definition.name, live.output_values.clone());
                    }
                    run.report.outputs = live.output_values;
                }
                self.transition(context, run, StackState::Succeeded);
                return Ok(());
            }
            OperationStatus::RolledBack { reason } => (StackState::RolledBack, reason),
            OperationStatus::Failed { reason } => (StackState::Failed, reason),
            OperationStatus::InProgress => (StackState::Failed, "operation did not finish".to_string()),
        };

        let error = ProvisioningError::OperationFailed {
            stack: definition.name.clone(),
            rolled_back: state == StackState::RolledBack,
            reason,
        };
        run.report.error = Some(error.to_string());
        self.transition(context, run, state);
        Err(error.into())
    }

    async fn submit<T, F, Fut>(&self, run: &mut StackRun, call: &str, operation: F) -> Result<T, StackflowError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, ProvisioningError>>,
    {
        match with_retry(&self.config.retry, call, operation).await {
            Ok(Attempted { value, attempts }) => {
                run.report.attempts = attempts;
                Ok(value)
            }
            Err(error) => {
                run.report.attempts = match &error {
                    ProvisioningError::RetriesExhausted { attempts, .. } => *attempts,
                    _ => 1,
                };
                Err(error.into())
            }
        }
    }

    async fn resolve(
        &self,
        definition: &StackDefinition,
        context: &ResolutionContext,
    ) -> Result<Vec<ResolvedReference>, StackflowError> {
        let mut state = RetryState::new();
        loop {
            match self.resolver.resolve_all(definition, context).await {
                Ok(resolved) => return Ok(resolved),
                Err(ReferenceError::Unavailable { source }) => {
                    match should_retry(&mut state, &self.config.retry, &source) {
                        RetryDecision::Retry(delay) => {
                            debug!(
                                stack = %definition.name,
                                attempt = state.attempt,
                                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                                "Retrying reference resolution"
                            );
                            tokio::time::sleep(delay).await;
                        }
                        RetryDecision::GiveUp => {
                            return Err(ReferenceError::Unavailable {
                                source: ProvisioningError::RetriesExhausted {
                                    operation: "resolve_references".to_string(),
                                    attempts: state.attempt + 1,
                                    last_error: source.to_string(),
                                },
                            }
                            .into());
                        }
                        RetryDecision::NotRetryable => {
                            return Err(ReferenceError::Unavailable { source }.into());
                        }
                    }
                }
                Err(other) => return Err(other.into()),
            }
        }
    }

    async fn describe(&self, stack: &str) -> Result<Option<LiveStack>, StackflowError> {
        Ok(with_retry(&self.config.retry, "describe_stack", || self.provisioner.describe_stack(stack))
            .await?
            .value)
    }

    async fn publish_template(&self, definition: &StackDefinition) -> Result<(), StackflowError> {
        let reference = &definition.template;
        let revision = reference.revision.as_ref().ok_or_else(|| ArtifactError::Unpinned {
            template: reference.template.clone(),
        })?;
        let body = self
            .templates
            .load(&reference.template, revision)
            .await?
            .ok_or_else(|| ArtifactError::NoTemplateSource {
                template: reference.template.clone(),
            })?;
        self.publisher.publish(&reference.template, &body, revision).await?;
        Ok(())
    }

    async fn preview_request(
        &self,
        definition: &StackDefinition,
        context: &ResolutionContext,
    ) -> Result<StackRequest, StackflowError> {
        let resolved = self.resolve(definition, context).await?;
        let inputs = assemble_inputs(definition, &resolved)?;
        let template_url = self.publisher.template_url(&definition.template)?;
        if !self.publisher.is_published(&definition.template).await? {
            self.publish_template(definition).await?;
        }
        Ok(StackRequest::from_definition(definition, template_url, inputs)
            .with_disable_rollback(!self.config.auto_rollback))
    }

    fn transition(&self, context: &ResolutionContext, run: &mut StackRun, next: StackState) {
        if !run.lifecycle.advance(next) {
            return;
        }
        info!(run_id = context.run_id(), stack = %run.report.name, state = %next, "Stack state changed");

        if let Some(event) = stack_event(next) {
            let mut data = json!({
                "run_id": context.run_id(),
                "stack": run.report.name,
                "state": next.to_string(),
            });
            if let Some(error) = &run.report.error {
                data["error"] = json!(error);
            }
            self.events.try_emit(event, Some(data));
        }
    }

    async fn start_run(
        &self,
        context: &ResolutionContext,
        operation: Operation,
        order: Vec<&str>,
    ) -> DeploymentReport {
        info!(
            run_id = context.run_id(),
            operation = %operation,
            region = %self.config.region,
            stacks = order.len(),
            "Run started"
        );
        self.events
            .emit(
                RUN_STARTED,
                Some(json!({
                    "run_id": context.run_id(),
                    "operation": operation,
                    "stacks": order,
                })),
            )
            .await;

        DeploymentReport {
            run_id: context.run_id().to_string(),
            operation,
            region: self.config.region.clone(),
            order: order.iter().map(|s| (*s).to_string()).collect(),
            stacks: order.iter().map(|s| StackReport::pending(*s)).collect(),
            success: false,
            cancelled: false,
            failure: None,
            started_at: Utc::now(),
            duration_ms: 0,
        }
    }

    async fn mark_cancelled(&self, report: &mut DeploymentReport) {
        let reason = self
            .cancellation
            .reason()
            .unwrap_or_else(|| "cancelled".to_string());
        warn!(run_id = %report.run_id, reason = %reason, furthest = ?report.furthest(), "Run cancelled");
        report.cancelled = true;
        if report.failure.is_none() {
            report.failure = Some(RunFailure::from_error(None, None, &StackflowError::Cancelled(reason.clone())));
        }
        self.events
            .emit(
                RUN_CANCELLED,
                Some(json!({
                    "run_id": report.run_id,
                    "reason": reason,
                    "furthest": report.furthest(),
                })),
            )
            .await;
    }

    async fn finish_run(&self, mut report: DeploymentReport, started: Instant) -> DeploymentReport {
        report.duration_ms = elapsed_ms(started);
        report.finalize();

        info!(
            run_id = %report.run_id,
            operation = %report.operation,
            success = report.success,
            furthest = ?report.furthest(),
            duration_ms = report.duration_ms,
            "Run completed"
        );
        self.events
            .emit(
                RUN_COMPLETED,
                Some(json!({
                    "run_id": report.run_id,
                    "operation": report.operation,
                    "success": report.success,
                    "cancelled": report.cancelled,
                    "failure": report.failure.as_ref().map(|f| f.code.clone()),
                })),
            )
            .await;
        report
    }
}

fn record_outcome(report: &mut DeploymentReport, index: usize, outcome: StackOutcome) -> bool {
    let StackOutcome { report: stack, error } = outcome;
    let halts = stack.state.is_failure();
    if let Some(error) = error {
        if report.failure.is_none() {
            report.failure = Some(RunFailure::from_error(Some(&stack.name), Some(stack.state), &error));
        }
    }
    if let Some(slot) = report.stacks.get_mut(index) {
        *slot = stack;
    }
    halts
}

fn is_ready(planned: &PlannedStack, report: &DeploymentReport) -> bool {
    planned
        .producers
        .iter()
        .all(|producer| report.state_of(producer) == Some(StackState::Succeeded))
}

fn blocked_stack(error: &StackflowError) -> Option<&str> {
    match error {
        StackflowError::Safety(SafetyViolation::ExportInUse { stack, .. }) => Some(stack),
        _ => None,
    }
}
