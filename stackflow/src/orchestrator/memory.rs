//! An in-memory provisioning backend with fault injection.
//!
//! Output expressions are evaluated by substituting `${Name}` placeholders
//! with the stack's parameters; anything else is kept verbatim.

use super::provisioner::{LiveStack, OperationId, OperationStatus, Provisioner, StackRequest, Submission};
use crate::core::ParameterValues;
use crate::errors::ProvisioningError;
use crate::resolver::{ExportEntry, InMemoryExportRegistry, InMemoryParameterStore};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, OnceLock};

fn placeholder() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    CELL.get_or_init(|| Regex::new(r"\$\{([A-Za-z0-9_.:-]+)\}").expect("static placeholder pattern compiles"))
}

/// Substitutes `${Name}` placeholders from `values`, leaving unknown ones intact.
#[must_use]
pub fn render_expression(expression: &str, values: &ParameterValues) -> String {
    placeholder()
        .replace_all(expression, |caps: &Captures<'_>| {
            values
                .get(&caps[1])
                .cloned()
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// A failure injected into the next operation touching a stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// The submit call fails with a transient error.
    Transient,
    /// The operation fails; the stack reverts unless rollback is disabled.
    FailWithRollback(String),
    /// The operation fails and cannot be reverted.
    FailWithoutRollback(String),
    /// The operation never leaves `InProgress`.
    Hang,
    /// The operation reports `InProgress` this many times before finishing.
    SlowPolls(u32),
}

#[derive(Debug, Clone)]
enum Mutation {
    Put(StackRequest),
    Delete(String),
}

#[derive(Debug)]
struct PendingOperation {
    mutations: Vec<Mutation>,
    polls_remaining: u32,
    failure: Option<Fault>,
    disable_rollback: bool,
    finished: Option<OperationStatus>,
}

#[derive(Debug, Default)]
struct SimulatorState {
    stacks: BTreeMap<String, LiveStack>,
    operations: HashMap<OperationId, PendingOperation>,
    faults: HashMap<String, VecDeque<Fault>>,
    calls: Vec<String>,
    next_operation: u64,
}

/// Serializable live stack state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionerSnapshot {
    /// Live stacks by name.
    pub stacks: BTreeMap<String, LiveStack>,
}

/// Simulated provisioning API.
///
/// Operations complete on the first poll unless a [`Fault`] says otherwise.
/// Completed operations register exports, record imports, and write
/// external parameters into the shared registry and store.
pub struct InMemoryProvisioner {
    region: String,
    exports: Arc<InMemoryExportRegistry>,
    parameters: Arc<InMemoryParameterStore>,
    state: Mutex<SimulatorState>,
}

impl InMemoryProvisioner {
    /// Creates an empty provisioner sharing `exports` and `parameters`.
    #[must_use]
    pub fn new(
        region: impl Into<String>,
        exports: Arc<InMemoryExportRegistry>,
        parameters: Arc<InMemoryParameterStore>,
    ) -> Self {
        Self {
            region: region.into(),
            exports,
            parameters,
            state: Mutex::new(SimulatorState::default()),
        }
    }

    /// Queues a fault for the next operation on `stack`.
    pub fn inject_fault(&self, stack: &str, fault: Fault) {
        self.state
            .lock()
            .faults
            .entry(stack.to_string())
            .or_default()
            .push_back(fault);
    }

    /// Returns the mutating calls received, as `call:stack` strings.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    /// Returns the names of live stacks.
    #[must_use]
    pub fn live_stacks(&self) -> Vec<String> {
        self.state.lock().stacks.keys().cloned().collect()
    }

    /// Bumps a live stack's version as an out-of-band change would.
    pub fn touch(&self, stack: &str) -> Result<u64, ProvisioningError> {
        let mut state = self.state.lock();
        let live = state.stacks.get_mut(stack).ok_or_else(|| ProvisioningError::NotFound {
            stack: stack.to_string(),
        })?;
        live.version += 1;
        live.last_updated = Utc::now();
        Ok(live.version)
    }

    /// Returns the live stack state.
    #[must_use]
    pub fn snapshot(&self) -> ProvisionerSnapshot {
        ProvisionerSnapshot {
            stacks: self.state.lock().stacks.clone(),
        }
    }

    /// Replaces the live stack state.
    pub fn restore(&self, snapshot: ProvisionerSnapshot) {
        self.state.lock().stacks = snapshot.stacks;
    }

    fn start(
        &self,
        state: &mut SimulatorState,
        stacks: &[&str],
        mutations: Vec<Mutation>,
        disable_rollback: bool,
        call: &str,
    ) -> Result<OperationId, ProvisioningError> {
        let mut polls_remaining = 0;
        let mut failure = None;

        for stack in stacks {
            let Some(fault) = state.faults.get_mut(*stack).and_then(VecDeque::pop_front) else {
                continue;
            };
            match fault {
                Fault::Transient => {
                    return Err(ProvisioningError::transient(call, "Rate exceeded"));
                }
                Fault::SlowPolls(n) => polls_remaining = polls_remaining.max(n),
                other => failure = failure.or(Some(other)),
            }
        }

        state.next_operation += 1;
        let id = OperationId(format!("op-{}", state.next_operation));
        state.operations.insert(
            id.clone(),
            PendingOperation {
                mutations,
                polls_remaining,
                failure,
                disable_rollback,
                finished: None,
            },
        );
        tracing::debug!(operation = %id, call, stacks = ?stacks, "Simulated operation started");
        Ok(id)
    }

    fn check_imports(&self, request: &StackRequest, call: &str) -> Result<(), ProvisioningError> {
        for import in &request.imports {
            if self.exports.exporters(&self.region, import).is_empty() {
                return Err(ProvisioningError::rejected(
                    call,
                    &request.stack_name,
                    format!("No export named {import} found"),
                ));
            }
        }
        for (_, export) in request_exports(request) {
            if let Some(owner) = self
                .exports
                .exporters(&self.region, export)
                .into_iter()
                .find(|owner| owner != &request.stack_name)
            {
                return Err(ProvisioningError::rejected(
                    call,
                    &request.stack_name,
                    format!("Export with name {export} is already exported by stack {owner}"),
                ));
            }
        }
        Ok(())
    }

    fn apply(&self, stacks: &mut BTreeMap<String, LiveStack>, mutation: Mutation) {
        match mutation {
            Mutation::Put(request) => {
                let version = stacks.get(&request.stack_name).map_or(1, |s| s.version + 1);
                let output_values: ParameterValues = request
                    .outputs
                    .iter()
                    .map(|o| (o.name.clone(), render_expression(&o.expression, &request.parameters)))
                    .collect();

                self.exports.remove_stack(&self.region, &request.stack_name);
                for output in &request.outputs {
                    if let (Some(export), Some(value)) = (&output.export, output_values.get(&output.name)) {
                        self.exports.register_unchecked(ExportEntry {
                            name: export.clone(),
                            value: value.clone(),
                            exporting_stack: request.stack_name.clone(),
                            region: self.region.clone(),
                        });
                    }
                }
                for import in &request.imports {
                    self.exports.record_import(&self.region, import, &request.stack_name);
                }

                let mut scope = request.parameters.clone();
                scope.extend(output_values.clone());
                for write in &request.parameter_writes {
                    let value = render_expression(&write.value, &scope);
                    let unchanged = self
                        .parameters
                        .latest(&write.path)
                        .is_some_and(|current| current.value == value);
                    if !unchanged {
                        let version = self.parameters.put(&write.path, value);
                        tracing::debug!(path = %write.path, version, "Parameter written");
                    }
                }

                stacks.insert(
                    request.stack_name.clone(),
                    LiveStack {
                        name: request.stack_name,
                        version,
                        template: request.template,
                        template_url: request.template_url,
                        parameters: request.parameters,
                        outputs: request.outputs,
                        output_values,
                        imports: request.imports,
                        capabilities: request.capabilities,
                        parent: request.parent,
                        last_updated: Utc::now(),
                    },
                );
            }
            Mutation::Delete(stack) => {
                stacks.remove(&stack);
                self.exports.remove_stack(&self.region, &stack);
            }
        }
    }
}

fn request_exports(request: &StackRequest) -> impl Iterator<Item = (&str, &str)> {
    request
        .outputs
        .iter()
        .filter_map(|o| o.export.as_deref().map(|e| (o.name.as_str(), e)))
}

fn unchanged(live: &LiveStack, request: &StackRequest) -> bool {
    live.template == request.template
        && live.parameters == request.parameters
        && live.outputs == request.outputs
        && live.imports == request.imports
        && live.capabilities == request.capabilities
}

fn check_version(
    stack: &str,
    live: Option<&LiveStack>,
    expected: Option<u64>,
) -> Result<(), ProvisioningError> {
    let actual = live.map(|s| s.version);
    if actual == expected {
        Ok(())
    } else {
        Err(ProvisioningError::VersionConflict {
            stack: stack.to_string(),
            expected,
            actual,
        })
    }
}

impl std::fmt::Debug for InMemoryProvisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryProvisioner")
            .field("region", &self.region)
            .field("stacks", &self.live_stacks())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Provisioner for InMemoryProvisioner {
    async fn create_stack(&self, request: &StackRequest) -> Result<OperationId, ProvisioningError> {
        let mut state = self.state.lock();
        state.calls.push(format!("create_stack:{}", request.stack_name));

        if state.stacks.contains_key(&request.stack_name) {
            return Err(ProvisioningError::rejected(
                "create_stack",
                &request.stack_name,
                "Stack already exists",
            ));
        }
        self.check_imports(request, "create_stack")?;

        self.start(
            &mut state,
            &[request.stack_name.as_str()],
            vec![Mutation::Put(request.clone())],
            request.disable_rollback,
            "create_stack",
        )
    }

    async fn update_stack(&self, request: &StackRequest) -> Result<Submission, ProvisioningError> {
        let mut state = self.state.lock();
        state.calls.push(format!("update_stack:{}", request.stack_name));

        let live = state
            .stacks
            .get(&request.stack_name)
            .ok_or_else(|| ProvisioningError::NotFound {
                stack: request.stack_name.clone(),
            })?;
        if request.expected_version.is_some() {
            check_version(&request.stack_name, Some(live), request.expected_version)?;
        }
        if unchanged(live, request) {
            return Ok(Submission::NoChanges);
        }
        self.check_imports(request, "update_stack")?;

        self.start(
            &mut state,
            &[request.stack_name.as_str()],
            vec![Mutation::Put(request.clone())],
            request.disable_rollback,
            "update_stack",
        )
        .map(Submission::Started)
    }

    async fn delete_stack(&self, stack: &str) -> Result<OperationId, ProvisioningError> {
        let mut state = self.state.lock();
        state.calls.push(format!("delete_stack:{stack}"));

        let live = state.stacks.get(stack).ok_or_else(|| ProvisioningError::NotFound {
            stack: stack.to_string(),
        })?;
        for (_, export) in live.exports() {
            let importers: Vec<String> = self
                .exports
                .importers(&self.region, export)
                .into_iter()
                .filter(|importer| importer != stack)
                .collect();
            if !importers.is_empty() {
                return Err(ProvisioningError::rejected(
                    "delete_stack",
                    stack,
                    format!(
                        "Export {export} cannot be deleted as it is in use by {}",
                        importers.join(", ")
                    ),
                ));
            }
        }

        self.start(&mut state, &[stack], vec![Mutation::Delete(stack.to_string())], false, "delete_stack")
    }

    async fn describe_stack(&self, stack: &str) -> Result<Option<LiveStack>, ProvisioningError> {
        Ok(self.state.lock().stacks.get(stack).cloned())
    }

    async fn poll_operation(&self, operation: &OperationId) -> Result<OperationStatus, ProvisioningError> {
        let mut state = self.state.lock();
        let SimulatorState { stacks, operations, .. } = &mut *state;
        let pending = operations.get_mut(operation).ok_or_else(|| {
            ProvisioningError::rejected("poll_operation", operation.to_string(), "Unknown operation")
        })?;

        if let Some(status) = &pending.finished {
            return Ok(status.clone());
        }
        if matches!(pending.failure, Some(Fault::Hang)) {
            return Ok(OperationStatus::InProgress);
        }
        if pending.polls_remaining > 0 {
            pending.polls_remaining -= 1;
            return Ok(OperationStatus::InProgress);
        }

        let status = match pending.failure.take() {
            Some(Fault::FailWithRollback(reason)) if pending.disable_rollback => {
                OperationStatus::Failed { reason }
            }
            Some(Fault::FailWithRollback(reason)) => OperationStatus::RolledBack { reason },
            Some(Fault::FailWithoutRollback(reason)) => OperationStatus::Failed { reason },
            _ => {
                for mutation in std::mem::take(&mut pending.mutations) {
                    self.apply(stacks, mutation);
                }
                OperationStatus::Complete
            }
        };
        pending.finished = Some(status.clone());
        Ok(status)
    }

    async fn execute_changeset(&self, requests: &[StackRequest]) -> Result<OperationId, ProvisioningError> {
        let mut state = self.state.lock();
        let names: Vec<&str> = requests.iter().map(|r| r.stack_name.as_str()).collect();
        state.calls.push(format!("execute_changeset:{}", names.join(",")));

        for request in requests {
            check_version(
                &request.stack_name,
                state.stacks.get(&request.stack_name),
                request.expected_version,
            )?;
            self.check_imports(request, "execute_changeset")?;
        }

        let disable_rollback = requests.iter().any(|r| r.disable_rollback);
        let mutations = requests.iter().cloned().map(Mutation::Put).collect();
        self.start(&mut state, &names, mutations, disable_rollback, "execute_changeset")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{OutputSpec, ParameterWrite, TemplateArtifactRef};
    use crate::resolver::{ExportFilter, ExportRegistry, ParameterStore};
    use pretty_assertions::assert_eq;

    fn simulator() -> (InMemoryProvisioner, Arc<InMemoryExportRegistry>, Arc<InMemoryParameterStore>) {
        let exports = Arc::new(InMemoryExportRegistry::new());
        let parameters = Arc::new(InMemoryParameterStore::new());
        let provisioner = InMemoryProvisioner::new("eu-west-1", exports.clone(), parameters.clone());
        (provisioner, exports, parameters)
    }

    fn request(name: &str) -> StackRequest {
        StackRequest {
            stack_name: name.into(),
            template: TemplateArtifactRef::new(format!("{}.json", name.to_lowercase())),
            template_url: format!("memory://templates/{name}"),
            parameters: ParameterValues::from([("Env".to_string(), "dev".to_string())]),
            capabilities: vec![],
            outputs: vec![],
            imports: vec![],
            parameter_writes: vec![],
            parent: None,
            disable_rollback: false,
            expected_version: None,
        }
    }

    async fn run(p: &InMemoryProvisioner, op: &OperationId) -> OperationStatus {
        loop {
            let status = p.poll_operation(op).await.unwrap();
            if status.is_terminal() {
                return status;
            }
        }
    }

    #[test]
    fn test_render_expression() {
        let values = ParameterValues::from([("Bucket".to_string(), "b-1".to_string())]);
        assert_eq!(render_expression("arn:s3:::${Bucket}", &values), "arn:s3:::b-1");
        assert_eq!(render_expression("${Missing}", &values), "${Missing}");
        assert_eq!(render_expression("plain", &values), "plain");
    }

    #[tokio::test]
    async fn test_create_registers_exports_and_writes_parameters() {
        let (p, exports, parameters) = simulator();
        let mut iam = request("Iam");
        iam.outputs.push(OutputSpec {
            name: "RoleArn".into(),
            expression: "arn:role/${Env}".into(),
            export: Some("role".into()),
        });
        iam.parameter_writes.push(ParameterWrite {
            path: "/org/role".into(),
            value: "${RoleArn}".into(),
        });

        let op = p.create_stack(&iam).await.unwrap();
        assert_eq!(run(&p, &op).await, OperationStatus::Complete);

        let live = p.describe_stack("Iam").await.unwrap().unwrap();
        assert_eq!(live.version, 1);
        assert_eq!(live.output_values["RoleArn"], "arn:role/dev");

        let listed = exports
            .list_exports(&ExportFilter::region("eu-west-1").named("role"))
            .await
            .unwrap();
        assert_eq!(listed[0].value, "arn:role/dev");
        assert_eq!(parameters.get_parameter("/org/role", 1).await.unwrap().value, "arn:role/dev");
    }

    #[tokio::test]
    async fn test_create_existing_is_rejected() {
        let (p, _, _) = simulator();
        let op = p.create_stack(&request("S3")).await.unwrap();
        run(&p, &op).await;

        let err = p.create_stack(&request("S3")).await.unwrap_err();
        assert!(matches!(err, ProvisioningError::Rejected { .. }));
    }

    #[tokio::test]
    async fn test_update_without_changes() {
        let (p, _, _) = simulator();
        let op = p.create_stack(&request("S3")).await.unwrap();
        run(&p, &op).await;

        assert_eq!(p.update_stack(&request("S3")).await.unwrap(), Submission::NoChanges);

        let mut changed = request("S3");
        changed.parameters.insert("Env".into(), "prod".into());
        let Submission::Started(op) = p.update_stack(&changed).await.unwrap() else {
            panic!("expected an operation");
        };
        run(&p, &op).await;
        assert_eq!(p.describe_stack("S3").await.unwrap().unwrap().version, 2);
    }

    #[tokio::test]
    async fn test_update_missing_stack() {
        let (p, _, _) = simulator();
        let err = p.update_stack(&request("Nope")).await.unwrap_err();
        assert_eq!(err, ProvisioningError::NotFound { stack: "Nope".into() });
    }

    #[tokio::test]
    async fn test_faults_are_consumed_in_order() {
        let (p, _, _) = simulator();
        p.inject_fault("S3", Fault::Transient);
        p.inject_fault("S3", Fault::SlowPolls(2));

        assert!(p.create_stack(&request("S3")).await.unwrap_err().is_transient());

        let op = p.create_stack(&request("S3")).await.unwrap();
        assert_eq!(p.poll_operation(&op).await.unwrap(), OperationStatus::InProgress);
        assert_eq!(p.poll_operation(&op).await.unwrap(), OperationStatus::InProgress);
        assert_eq!(p.poll_operation(&op).await.unwrap(), OperationStatus::Complete);
        assert_eq!(p.calls(), vec!["create_stack:S3", "create_stack:S3"]);
    }

    #[tokio::test]
    async fn test_rollback_leaves_state_untouched() {
        let (p, _, _) = simulator();
        p.inject_fault("S3", Fault::FailWithRollback("bucket name taken".into()));

        let op = p.create_stack(&request("S3")).await.unwrap();
        assert_eq!(
            run(&p, &op).await,
            OperationStatus::RolledBack {
                reason: "bucket name taken".into()
            }
        );
        assert!(p.describe_stack("S3").await.unwrap().is_none());

        p.inject_fault("S3", Fault::FailWithRollback("again".into()));
        let op = p
            .create_stack(&request("S3").with_disable_rollback(true))
            .await
            .unwrap();
        assert!(matches!(run(&p, &op).await, OperationStatus::Failed { .. }));
    }

    #[tokio::test]
    async fn test_delete_refused_while_imported() {
        let (p, exports, _) = simulator();
        let mut iam = request("Iam");
        iam.outputs.push(OutputSpec {
            name: "RoleArn".into(),
            expression: "arn".into(),
            export: Some("role".into()),
        });
        let op = p.create_stack(&iam).await.unwrap();
        run(&p, &op).await;

        let mut compute = request("Compute");
        compute.imports.push("role".into());
        let op = p.create_stack(&compute).await.unwrap();
        run(&p, &op).await;
        assert_eq!(exports.importers("eu-west-1", "role"), vec!["Compute"]);

        assert!(matches!(
            p.delete_stack("Iam").await.unwrap_err(),
            ProvisioningError::Rejected { .. }
        ));

        let op = p.delete_stack("Compute").await.unwrap();
        run(&p, &op).await;
        let op = p.delete_stack("Iam").await.unwrap();
        run(&p, &op).await;
        assert!(p.live_stacks().is_empty());
        assert!(exports.exporters("eu-west-1", "role").is_empty());
    }

    #[tokio::test]
    async fn test_changeset_checks_versions() {
        let (p, _, _) = simulator();
        let op = p.create_stack(&request("S3")).await.unwrap();
        run(&p, &op).await;
        p.touch("S3").unwrap();

        let stale = request("S3").expecting_version(Some(1));
        assert!(matches!(
            p.execute_changeset(&[stale]).await.unwrap_err(),
            ProvisioningError::VersionConflict {
                actual: Some(2),
                ..
            }
        ));

        let mut fresh = request("S3").expecting_version(Some(2));
        fresh.parameters.insert("Env".into(), "prod".into());
        let op = p.execute_changeset(&[fresh, request("Iam")]).await.unwrap();
        assert_eq!(run(&p, &op).await, OperationStatus::Complete);
        assert_eq!(p.live_stacks(), vec!["Iam", "S3"]);
    }

    #[tokio::test]
    async fn test_snapshot_restore() {
        let (p, _, _) = simulator();
        let op = p.create_stack(&request("S3")).await.unwrap();
        run(&p, &op).await;

        let json = serde_json::to_string(&p.snapshot()).unwrap();
        let (restored, _, _) = simulator();
        restored.restore(serde_json::from_str(&json).unwrap());
        assert_eq!(restored.live_stacks(), vec!["S3"]);
    }
}
