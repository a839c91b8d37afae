//! The stack provisioning API surface.

use crate::core::{
    Capability, OutputSpec, ParameterValues, ParameterWrite, ReferenceSpec, StackDefinition,
    TemplateArtifactRef,
};
use crate::errors::ProvisioningError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Handle of an asynchronous provisioning operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationId(pub String);

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result of submitting an update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submission {
    /// The operation is running.
    Started(OperationId),
    /// The stack already matches the request.
    NoChanges,
}

/// Status reported while polling an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OperationStatus {
    /// Still running.
    InProgress,
    /// Finished successfully.
    Complete,
    /// Failed and reverted to the previous live state.
    RolledBack {
        /// Provider message.
        reason: String,
    },
    /// Failed and could not be reverted.
    Failed {
        /// Provider message.
        reason: String,
    },
}

impl OperationStatus {
    /// Returns true once the operation stopped.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

/// Live state of a deployed stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveStack {
    /// Stack name.
    pub name: String,
    /// Incremented by every applied change.
    pub version: u64,
    /// The template the stack runs.
    pub template: TemplateArtifactRef,
    /// URL the template was fetched from.
    pub template_url: String,
    /// Concrete inputs.
    pub parameters: ParameterValues,
    /// Declared outputs.
    #[serde(default)]
    pub outputs: Vec<OutputSpec>,
    /// Evaluated output values.
    #[serde(default)]
    pub output_values: ParameterValues,
    /// Exports the stack imports.
    #[serde(default)]
    pub imports: Vec<String>,
    /// Capability acknowledgements it was deployed with.
    #[serde(default)]
    pub capabilities: Vec<Capability>,
    /// Deployment tree, for nested units.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    /// Time of the last applied change.
    pub last_updated: DateTime<Utc>,
}

impl LiveStack {
    /// Iterates over exported (output name, export name) pairs.
    pub fn exports(&self) -> impl Iterator<Item = (&str, &str)> {
        self.outputs
            .iter()
            .filter_map(|o| o.export.as_deref().map(|e| (o.name.as_str(), e)))
    }
}

/// A create, update, or change set entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackRequest {
    /// Stack name.
    pub stack_name: String,
    /// Template reference, pinned to a revision.
    pub template: TemplateArtifactRef,
    /// Revision-addressed template URL.
    pub template_url: String,
    /// Concrete inputs.
    pub parameters: ParameterValues,
    /// Capability acknowledgements, passed through unmodified.
    pub capabilities: Vec<Capability>,
    /// Outputs the template declares.
    pub outputs: Vec<OutputSpec>,
    /// Exports the stack imports.
    pub imports: Vec<String>,
    /// External parameters written on success.
    pub parameter_writes: Vec<ParameterWrite>,
    /// Deployment tree, for nested units.
    pub parent: Option<String>,
    /// Leave a failed stack as-is instead of reverting it.
    pub disable_rollback: bool,
    /// Live version the request was prepared against.
    pub expected_version: Option<u64>,
}

impl StackRequest {
    /// Builds a request from a definition and its resolved inputs.
    #[must_use]
    pub fn from_definition(
        definition: &StackDefinition,
        template_url: impl Into<String>,
        parameters: ParameterValues,
    ) -> Self {
        let imports = definition
            .references
            .iter()
            .filter_map(|r| match &r.spec {
                ReferenceSpec::Export { export_name } => Some(export_name.clone()),
                ReferenceSpec::NestedOutput { .. } | ReferenceSpec::ExternalParameter { .. } => None,
            })
            .collect();

        Self {
            stack_name: definition.name.clone(),
            template: definition.template.clone(),
            template_url: template_url.into(),
            parameters,
            capabilities: definition.capabilities.clone(),
            outputs: definition.outputs.clone(),
            imports,
            parameter_writes: definition.parameter_writes.clone(),
            parent: definition.parent.clone(),
            disable_rollback: false,
            expected_version: None,
        }
    }

    /// Sets whether failures are left in place.
    #[must_use]
    pub fn with_disable_rollback(mut self, disable: bool) -> Self {
        self.disable_rollback = disable;
        self
    }

    /// Requires the live stack to be at `version`.
    #[must_use]
    pub fn expecting_version(mut self, version: Option<u64>) -> Self {
        self.expected_version = version;
        self
    }
}

/// The external stack provisioning API.
///
/// Mutating calls return an operation handle; callers poll it to a terminal
/// status.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Creates a stack that does not exist yet.
    async fn create_stack(&self, request: &StackRequest) -> Result<OperationId, ProvisioningError>;

    /// Updates an existing stack.
    async fn update_stack(&self, request: &StackRequest) -> Result<Submission, ProvisioningError>;

    /// Deletes a stack.
    async fn delete_stack(&self, stack: &str) -> Result<OperationId, ProvisioningError>;

    /// Returns the live state of a stack, or `None` if it does not exist.
    async fn describe_stack(&self, stack: &str) -> Result<Option<LiveStack>, ProvisioningError>;

    /// Returns the status of an operation.
    async fn poll_operation(&self, operation: &OperationId) -> Result<OperationStatus, ProvisioningError>;

    /// Applies a change set covering one or more stacks as a single unit.
    async fn execute_changeset(&self, requests: &[StackRequest]) -> Result<OperationId, ProvisioningError>;
}
