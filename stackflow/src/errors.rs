//! Error types for the stackflow orchestrator.
//!
//! Errors below the orchestrator (graph building, reference resolution,
//! artifact handling) are plain values. The orchestrator is the only place
//! that decides whether an error is retried, halts the plan, or is handed
//! back to the caller.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// The main error type for stackflow operations.
#[derive(Debug, Error)]
pub enum StackflowError {
    /// The stack graph is invalid.
    #[error("{0}")]
    Graph(#[from] GraphError),

    /// A reference could not be resolved.
    #[error("{0}")]
    Reference(#[from] ReferenceError),

    /// Stack inputs could not be assembled.
    #[error("{0}")]
    Input(#[from] InputError),

    /// The provisioning API failed.
    #[error("{0}")]
    Provisioning(#[from] ProvisioningError),

    /// A destructive or stale operation was refused.
    #[error("{0}")]
    Safety(#[from] SafetyViolation),

    /// A template artifact could not be published or located.
    #[error("{0}")]
    Artifact(#[from] ArtifactError),

    /// A change set was not approved.
    #[error("{0}")]
    Approval(#[from] ApprovalError),

    /// The stack-set manifest is invalid.
    #[error("{0}")]
    Manifest(#[from] ManifestError),

    /// The run was cancelled at a checkpoint.
    #[error("Deployment cancelled: {0}")]
    Cancelled(String),

    /// A generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StackflowError {
    /// Returns the coarse category of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Graph(_) => ErrorKind::Graph,
            Self::Reference(_) => ErrorKind::Reference,
            Self::Input(_) => ErrorKind::Input,
            Self::Provisioning(_) => ErrorKind::Provisioning,
            Self::Safety(_) => ErrorKind::Safety,
            Self::Artifact(_) => ErrorKind::Artifact,
            Self::Approval(_) => ErrorKind::Approval,
            Self::Manifest(_) => ErrorKind::Manifest,
            Self::Cancelled(_) => ErrorKind::Cancelled,
            Self::Internal(_) | Self::Io(_) => ErrorKind::Internal,
        }
    }

    /// Returns the stable error code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Graph(e) => e.code(),
            Self::Reference(e) => e.code(),
            Self::Input(e) => e.code(),
            Self::Provisioning(e) => e.code(),
            Self::Safety(e) => e.code(),
            Self::Artifact(e) => e.code(),
            Self::Approval(e) => e.code(),
            Self::Manifest(e) => e.code(),
            Self::Cancelled(_) => "RUN-001-CANCELLED",
            Self::Internal(_) => "RUN-002-INTERNAL",
            Self::Io(_) => "RUN-003-IO",
        }
    }

    /// Returns true if retrying the failed call may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Provisioning(e) => e.is_transient(),
            Self::Reference(e) => e.is_transient(),
            _ => false,
        }
    }

    /// Builds diagnostic metadata for this error.
    #[must_use]
    pub fn error_info(&self) -> ErrorInfo {
        let code = self.code();
        let mut info = ErrorInfo::new(code, self.to_string()).with_context_entry("kind", self.kind().to_string());
        if let Some(hint) = ErrorSuggestions::get(code) {
            info = info.with_fix_hint(hint);
        }
        info
    }
}

/// Coarse error categories used in run reports and exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Graph validation failed before any provisioning.
    Graph,
    /// A reference could not be resolved.
    Reference,
    /// Inputs were missing or malformed.
    Input,
    /// The provisioning API failed.
    Provisioning,
    /// A safety check refused the operation.
    Safety,
    /// Template artifacts were unavailable.
    Artifact,
    /// Approval was not granted.
    Approval,
    /// The manifest was invalid.
    Manifest,
    /// The run was cancelled.
    Cancelled,
    /// Anything else.
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Graph => "graph",
            Self::Reference => "reference",
            Self::Input => "input",
            Self::Provisioning => "provisioning",
            Self::Safety => "safety",
            Self::Artifact => "artifact",
            Self::Approval => "approval",
            Self::Manifest => "manifest",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// Metadata about an error for better diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct ErrorInfo {
    /// Error code (e.g., "GRAPH-001-CYCLE").
    pub code: String,
    /// Short summary of the error.
    pub summary: String,
    /// Hint for fixing the error.
    pub fix_hint: Option<String>,
    /// Additional context key-value pairs.
    #[serde(default)]
    pub context: BTreeMap<String, String>,
}

impl ErrorInfo {
    /// Creates a new error info.
    #[must_use]
    pub fn new(code: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            summary: summary.into(),
            fix_hint: None,
            context: BTreeMap::new(),
        }
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }

    /// Adds a single context entry.
    #[must_use]
    pub fn with_context_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// Errors raised while validating definitions and building the stack graph.
///
/// All of these are reported before any provisioning begins.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    /// The dependency graph contains a cycle.
    #[error("Cycle detected in stack graph: {}", cycle.join(" -> "))]
    CycleDetected {
        /// The stacks forming the cycle, first stack repeated at the end.
        cycle: Vec<String>,
    },

    /// A reference has no matching producer.
    #[error("Stack '{stack}' has unresolved reference '{reference}'")]
    UnresolvedReference {
        /// The consuming stack.
        stack: String,
        /// The reference name.
        reference: String,
    },

    /// A stack references itself.
    #[error("Stack '{stack}' cannot depend on itself (reference '{reference}')")]
    SelfReference {
        /// The stack.
        stack: String,
        /// The reference or dependency name.
        reference: String,
    },

    /// A nested output is read from outside its deployment tree.
    #[error("Stack '{stack}' reads nested output via '{reference}' but is not part of tree '{parent}'")]
    NestedScopeViolation {
        /// The consuming stack.
        stack: String,
        /// The reference name.
        reference: String,
        /// The tree the output belongs to.
        parent: String,
    },

    /// An explicit dependency names no stack in the set.
    #[error("Stack '{stack}' depends on unknown stack '{dependency}'")]
    UnknownDependency {
        /// The dependent stack.
        stack: String,
        /// The missing dependency.
        dependency: String,
    },

    /// Two definitions share a name.
    #[error("Stack '{stack}' is defined more than once")]
    DuplicateStack {
        /// The duplicated stack name.
        stack: String,
    },

    /// A name is repeated within a stack.
    #[error("Stack '{stack}' declares {item} '{name}' more than once")]
    DuplicateName {
        /// The stack.
        stack: String,
        /// What was duplicated ("parameter", "output", "export", ...).
        item: &'static str,
        /// The duplicated name.
        name: String,
    },

    /// A name does not match the accepted pattern.
    #[error("Invalid {item} name '{name}'")]
    InvalidName {
        /// What was named ("stack", "export", "parameter path").
        item: &'static str,
        /// The rejected name.
        name: String,
    },

    /// A reference binds to an input the stack does not declare.
    #[error("Stack '{stack}' binds reference '{reference}' to an undeclared parameter")]
    UnknownParameter {
        /// The stack.
        stack: String,
        /// The reference name.
        reference: String,
    },

    /// An input is bound both statically and by reference.
    #[error("Stack '{stack}' binds parameter '{parameter}' both statically and by reference")]
    ConflictingInput {
        /// The stack.
        stack: String,
        /// The parameter.
        parameter: String,
    },

    /// More than one stack exports the same name.
    #[error("Export '{export}' is produced by more than one stack: {}", producers.join(", "))]
    DuplicateExport {
        /// The export name.
        export: String,
        /// The producing stacks.
        producers: Vec<String>,
    },

    /// More than one stack writes the same external parameter path.
    #[error("Parameter '{path}' is written by more than one stack: {}", producers.join(", "))]
    DuplicateParameterWriter {
        /// The parameter path.
        path: String,
        /// The writing stacks.
        producers: Vec<String>,
    },

    /// The plan would contain no stacks.
    #[error("Stack set has no stacks")]
    Empty,
}

impl GraphError {
    /// Returns the stable error code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::CycleDetected { .. } => "GRAPH-001-CYCLE",
            Self::UnresolvedReference { .. } => "GRAPH-002-UNRESOLVED",
            Self::SelfReference { .. } => "GRAPH-003-SELF_EDGE",
            Self::NestedScopeViolation { .. } => "GRAPH-004-NESTED_SCOPE",
            Self::UnknownDependency { .. } => "GRAPH-005-MISSING_DEP",
            Self::DuplicateStack { .. } => "GRAPH-006-DUPLICATE_STACK",
            Self::DuplicateName { .. } => "GRAPH-007-DUPLICATE_NAME",
            Self::InvalidName { .. } => "GRAPH-008-INVALID_NAME",
            Self::UnknownParameter { .. } => "GRAPH-009-UNKNOWN_PARAMETER",
            Self::ConflictingInput { .. } => "GRAPH-010-CONFLICTING_INPUT",
            Self::DuplicateExport { .. } => "GRAPH-011-DUPLICATE_EXPORT",
            Self::DuplicateParameterWriter { .. } => "GRAPH-012-DUPLICATE_WRITER",
            Self::Empty => "GRAPH-013-EMPTY",
        }
    }
}

/// Errors raised while resolving a single reference.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReferenceError {
    /// A nested unit has not produced the requested output yet.
    #[error("Nested stack '{child}' in '{parent}' has not produced output '{output}'")]
    OutputNotFound {
        /// The deployment tree.
        parent: String,
        /// The nested unit.
        child: String,
        /// The output name.
        output: String,
    },

    /// No live export has the requested name.
    #[error("Export '{export}' not found in region {region}")]
    ExportNotFound {
        /// The export name.
        export: String,
        /// The region searched.
        region: String,
    },

    /// More than one live export has the requested name.
    #[error("Export '{export}' in region {region} has {} live producers: {}", producers.len(), producers.join(", "))]
    AmbiguousExport {
        /// The export name.
        export: String,
        /// The region searched.
        region: String,
        /// The stacks claiming the export.
        producers: Vec<String>,
    },

    /// No parameter exists at the path.
    #[error("Parameter '{path}' not found")]
    ParameterNotFound {
        /// The parameter path.
        path: String,
    },

    /// The parameter exists but not at the pinned version.
    #[error("Parameter '{path}' has no version {version}")]
    ParameterVersionNotFound {
        /// The parameter path.
        path: String,
        /// The requested version.
        version: u64,
    },

    /// The backing registry or store could not be reached.
    #[error("Reference backend unavailable: {source}")]
    Unavailable {
        /// The underlying failure.
        source: ProvisioningError,
    },
}

impl ReferenceError {
    /// Returns the stable error code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::OutputNotFound { .. } => "REF-001-OUTPUT_NOT_FOUND",
            Self::ExportNotFound { .. } => "REF-002-EXPORT_NOT_FOUND",
            Self::AmbiguousExport { .. } => "REF-003-AMBIGUOUS_EXPORT",
            Self::ParameterNotFound { .. } => "REF-004-PARAMETER_NOT_FOUND",
            Self::ParameterVersionNotFound { .. } => "REF-005-PARAMETER_VERSION",
            Self::Unavailable { .. } => "REF-006-UNAVAILABLE",
        }
    }

    /// Returns true if the failure came from a transient backend error.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable { source } if source.is_transient())
    }
}

/// Errors raised while assembling the concrete inputs of a stack.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InputError {
    /// A required parameter received no value.
    #[error("Stack '{stack}' is missing a value for required parameter '{parameter}'")]
    MissingValue {
        /// The stack.
        stack: String,
        /// The parameter.
        parameter: String,
    },

    /// A value does not match the parameter type.
    #[error("Stack '{stack}' parameter '{parameter}' expects {expected}, got '{value}'")]
    InvalidValue {
        /// The stack.
        stack: String,
        /// The parameter.
        parameter: String,
        /// The expected type.
        expected: String,
        /// The offending value.
        value: String,
    },
}

impl InputError {
    /// Returns the stable error code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingValue { .. } => "INPUT-001-MISSING",
            Self::InvalidValue { .. } => "INPUT-002-INVALID",
        }
    }
}

/// Errors returned by the provisioning API and its waiters.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProvisioningError {
    /// Throttling, network, or other retryable failure.
    #[error("Transient failure during {operation}: {message}")]
    Transient {
        /// The API operation.
        operation: String,
        /// Provider message.
        message: String,
    },

    /// The API rejected the request.
    #[error("{operation} rejected for stack '{stack}': {message}")]
    Rejected {
        /// The API operation.
        operation: String,
        /// The stack.
        stack: String,
        /// Provider message.
        message: String,
    },

    /// The stack does not exist.
    #[error("Stack '{stack}' does not exist")]
    NotFound {
        /// The stack.
        stack: String,
    },

    /// The live stack changed since the request was prepared.
    #[error("Stack '{stack}' is at version {actual:?}, expected {expected:?}")]
    VersionConflict {
        /// The stack.
        stack: String,
        /// The version the request was prepared against.
        expected: Option<u64>,
        /// The live version.
        actual: Option<u64>,
    },

    /// The stack did not reach a terminal state in time.
    #[error("Stack '{stack}' did not reach a terminal state within {waited_secs}s")]
    Timeout {
        /// The stack.
        stack: String,
        /// Seconds waited.
        waited_secs: u64,
    },

    /// The operation reached a failed terminal state.
    #[error("Operation on stack '{stack}' {}: {reason}", if *rolled_back { "rolled back" } else { "failed" })]
    OperationFailed {
        /// The stack.
        stack: String,
        /// The stack was reverted to its previous state.
        rolled_back: bool,
        /// Provider message.
        reason: String,
    },

    /// Transient failures persisted past the retry limit.
    #[error("{operation} failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        /// The API operation.
        operation: String,
        /// Attempts made.
        attempts: usize,
        /// The last error message.
        last_error: String,
    },
}

impl ProvisioningError {
    /// Creates a transient error.
    #[must_use]
    pub fn transient(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transient {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Creates a rejection.
    #[must_use]
    pub fn rejected(
        operation: impl Into<String>,
        stack: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Rejected {
            operation: operation.into(),
            stack: stack.into(),
            message: message.into(),
        }
    }

    /// Returns true if the call may succeed when retried.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// Returns the stable error code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Transient { .. } => "PROV-001-TRANSIENT",
            Self::Rejected { .. } => "PROV-002-REJECTED",
            Self::NotFound { .. } => "PROV-003-NOT_FOUND",
            Self::VersionConflict { .. } => "PROV-004-CONFLICT",
            Self::Timeout { .. } => "PROV-005-TIMEOUT",
            Self::RetriesExhausted { .. } => "PROV-006-RETRIES_EXHAUSTED",
            Self::OperationFailed { .. } => "PROV-007-OPERATION_FAILED",
        }
    }
}

/// Operations refused to keep live state consistent.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SafetyViolation {
    /// The stack exports a value still imported by live stacks.
    #[error("Cannot delete '{stack}': export '{export}' is imported by {}", importers.join(", "))]
    ExportInUse {
        /// The stack to delete.
        stack: String,
        /// The export still in use.
        export: String,
        /// Live importers.
        importers: Vec<String>,
    },

    /// The live stack changed after the change set was computed.
    #[error("Change set for '{stack}' is stale: computed at version {expected:?}, live is {actual:?}")]
    ChangeSetStale {
        /// The stack.
        stack: String,
        /// Version captured when planning.
        expected: Option<u64>,
        /// Version observed at execution.
        actual: Option<u64>,
    },
}

impl SafetyViolation {
    /// Returns the stable error code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::ExportInUse { .. } => "SAFETY-001-EXPORT_IN_USE",
            Self::ChangeSetStale { .. } => "SAFETY-002-CHANGESET_STALE",
        }
    }
}

/// Errors related to template artifacts.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArtifactError {
    /// A different body already exists under an immutable revision key.
    #[error("Artifact '{key}' is already published with different content")]
    ImmutableRevision {
        /// The object key.
        key: String,
    },

    /// No body is published under the key.
    #[error("Artifact '{key}' is not published")]
    NotPublished {
        /// The object key.
        key: String,
    },

    /// The template is missing and no source can provide it.
    #[error("No template source provides '{template}'")]
    NoTemplateSource {
        /// The template object name.
        template: String,
    },

    /// A revision string is malformed.
    #[error("Invalid revision '{0}'")]
    InvalidRevision(String),

    /// The template reference carries no revision to deploy.
    #[error("Template '{template}' is not pinned to a revision")]
    Unpinned {
        /// The template object name.
        template: String,
    },

    /// The backing storage failed.
    #[error("Artifact storage error: {0}")]
    Storage(String),

    /// A source file's relative path is not valid UTF-8.
    #[error("Template path '{}' is not valid UTF-8", path.display())]
    NonUtf8Path {
        /// The offending path, relative to the tree root.
        path: std::path::PathBuf,
    },
}

impl ArtifactError {
    /// Returns the stable error code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::ImmutableRevision { .. } => "ARTIFACT-001-IMMUTABLE",
            Self::NotPublished { .. } => "ARTIFACT-002-NOT_PUBLISHED",
            Self::NoTemplateSource { .. } => "ARTIFACT-003-NO_SOURCE",
            Self::InvalidRevision(_) => "ARTIFACT-004-INVALID_REVISION",
            Self::Unpinned { .. } => "ARTIFACT-005-UNPINNED",
            Self::Storage(_) => "ARTIFACT-006-STORAGE",
            Self::NonUtf8Path { .. } => "ARTIFACT-007-NON_UTF8_PATH",
        }
    }
}

impl From<std::io::Error> for ArtifactError {
    fn from(err: std::io::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<walkdir::Error> for ArtifactError {
    fn from(err: walkdir::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

/// Change set approval outcomes other than approval.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ApprovalError {
    /// A reviewer denied the change set.
    #[error("Change set for '{stack}' was denied")]
    Denied {
        /// The stack.
        stack: String,
    },

    /// Nobody answered in time.
    #[error("Approval for '{stack}' timed out after {timeout_seconds}s")]
    TimedOut {
        /// The stack.
        stack: String,
        /// The timeout in seconds.
        timeout_seconds: f64,
    },

    /// The request was withdrawn.
    #[error("Approval for '{stack}' was cancelled")]
    Cancelled {
        /// The stack.
        stack: String,
    },
}

impl ApprovalError {
    /// Returns the stable error code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Denied { .. } => "APPROVAL-001-DENIED",
            Self::TimedOut { .. } => "APPROVAL-002-TIMEOUT",
            Self::Cancelled { .. } => "APPROVAL-003-CANCELLED",
        }
    }
}

/// Errors loading or applying a stack-set manifest.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// The manifest is not valid JSON for the schema.
    #[error("Invalid manifest: {0}")]
    Parse(#[from] serde_json::Error),

    /// The requested environment is not declared.
    #[error("Unknown environment '{0}'")]
    UnknownEnvironment(String),

    /// Environment values name a stack that is not declared.
    #[error("Environment '{environment}' sets values for unknown stack '{stack}'")]
    UnknownStack {
        /// The environment tag.
        environment: String,
        /// The stack name.
        stack: String,
    },
}

impl ManifestError {
    /// Returns the stable error code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Parse(_) => "MANIFEST-001-PARSE",
            Self::UnknownEnvironment(_) => "MANIFEST-002-UNKNOWN_ENV",
            Self::UnknownStack { .. } => "MANIFEST-003-UNKNOWN_STACK",
        }
    }
}

/// Provides default suggestions for common error codes.
pub struct ErrorSuggestions;

impl ErrorSuggestions {
    /// Gets a suggestion for a given error code.
    #[must_use]
    pub fn get(code: &str) -> Option<&'static str> {
        match code {
            "GRAPH-001-CYCLE" => Some(
                "Break the cycle by moving the shared value into an external parameter \
                 or by removing one of the dependencies.",
            ),
            "GRAPH-002-UNRESOLVED" => Some(
                "Include the producing stack in the stack set, or declare the parameter \
                 as externally supplied.",
            ),
            "REF-005-PARAMETER_VERSION" => Some(
                "Publish the parameter version before deploying, or pin an existing version.",
            ),
            "SAFETY-001-EXPORT_IN_USE" => Some(
                "Delete or update the importing stacks first so they no longer import the export.",
            ),
            "SAFETY-002-CHANGESET_STALE" => Some(
                "Recompute the change set against the current live state.",
            ),
            _ => None,
        }
    }
}

/// Convenient result alias.
pub type Result<T, E = StackflowError> = std::result::Result<T, E>;
