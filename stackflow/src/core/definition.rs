//! Stack definitions and the references between them.

use super::names::{
    validate_export_name, validate_logical_name, validate_parameter_path, validate_stack_name,
};
use crate::artifacts::RevisionId;
use crate::errors::GraphError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;

/// Resolved input values keyed by parameter name.
pub type ParameterValues = BTreeMap<String, String>;

/// The type of a stack parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ParameterType {
    /// Any string.
    #[default]
    String,
    /// A decimal number.
    Number,
    /// A comma separated list of strings.
    CommaDelimitedList,
}

impl ParameterType {
    /// Returns true if `value` is acceptable for this type.
    #[must_use]
    pub fn accepts(&self, value: &str) -> bool {
        match self {
            Self::String => true,
            Self::Number => value.trim().parse::<f64>().is_ok_and(f64::is_finite),
            Self::CommaDelimitedList => value.split(',').all(|item| !item.trim().is_empty()),
        }
    }
}

impl fmt::Display for ParameterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String => write!(f, "String"),
            Self::Number => write!(f, "Number"),
            Self::CommaDelimitedList => write!(f, "CommaDelimitedList"),
        }
    }
}

/// A declared stack input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterSpec {
    /// Parameter name.
    pub name: String,
    /// Parameter type.
    #[serde(rename = "type", default)]
    pub param_type: ParameterType,
    /// Default value; a parameter without one is required.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

impl ParameterSpec {
    /// Creates a required parameter.
    #[must_use]
    pub fn required(name: impl Into<String>, param_type: ParameterType) -> Self {
        Self {
            name: name.into(),
            param_type,
            default: None,
        }
    }

    /// Creates a parameter with a default value.
    #[must_use]
    pub fn optional(
        name: impl Into<String>,
        param_type: ParameterType,
        default: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            param_type,
            default: Some(default.into()),
        }
    }

    /// Returns true if the parameter must receive a value.
    #[must_use]
    pub fn is_required(&self) -> bool {
        self.default.is_none()
    }
}

/// A declared stack output.
///
/// The expression is opaque to the orchestrator; only the provisioner
/// evaluates it against the stack's resources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputSpec {
    /// Output name.
    pub name: String,
    /// Expression over the stack's internal resource state.
    pub expression: String,
    /// Region-wide export name, if the output is exported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export: Option<String>,
}

/// How a consumed value is produced.
///
/// Every consumption site matches this enum exhaustively, so adding a sharing
/// mechanism is a compile-checked change.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReferenceSpec {
    /// An output of a nested unit in the same deployment tree.
    NestedOutput {
        /// The deployment tree the child is instantiated in.
        parent_stack: String,
        /// The nested unit's logical name.
        child_stack: String,
        /// The output to read.
        output: String,
    },
    /// A region-scoped export.
    Export {
        /// The export name.
        export_name: String,
    },
    /// A versioned entry in the external parameter store.
    ExternalParameter {
        /// Hierarchical path.
        path: String,
        /// Pinned version.
        version: u64,
    },
}

impl ReferenceSpec {
    /// Creates a nested output reference.
    #[must_use]
    pub fn nested_output(
        parent_stack: impl Into<String>,
        child_stack: impl Into<String>,
        output: impl Into<String>,
    ) -> Self {
        Self::NestedOutput {
            parent_stack: parent_stack.into(),
            child_stack: child_stack.into(),
            output: output.into(),
        }
    }

    /// Creates an export reference.
    #[must_use]
    pub fn export(export_name: impl Into<String>) -> Self {
        Self::Export {
            export_name: export_name.into(),
        }
    }

    /// Creates an external parameter reference pinned to `version`.
    #[must_use]
    pub fn external_parameter(path: impl Into<String>, version: u64) -> Self {
        Self::ExternalParameter {
            path: path.into(),
            version,
        }
    }

    /// Returns the reference kind.
    #[must_use]
    pub fn kind(&self) -> ReferenceKind {
        match self {
            Self::NestedOutput { .. } => ReferenceKind::NestedOutput,
            Self::Export { .. } => ReferenceKind::Export,
            Self::ExternalParameter { .. } => ReferenceKind::ExternalParameter,
        }
    }
}

impl fmt::Display for ReferenceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NestedOutput {
                parent_stack,
                child_stack,
                output,
            } => write!(f, "nested:{parent_stack}/{child_stack}.{output}"),
            Self::Export { export_name } => write!(f, "export:{export_name}"),
            Self::ExternalParameter { path, version } => write!(f, "parameter:{path}@{version}"),
        }
    }
}

/// The three sharing mechanisms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceKind {
    /// Nested unit output.
    NestedOutput,
    /// Region export.
    Export,
    /// External parameter.
    ExternalParameter,
}

/// A named input bound to a reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceDecl {
    /// The parameter the resolved value is bound to.
    pub name: String,
    /// Where the value comes from.
    #[serde(flatten)]
    pub spec: ReferenceSpec,
}

/// An external parameter written when the stack reaches Succeeded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterWrite {
    /// Hierarchical path.
    pub path: String,
    /// Value expression, evaluated like an output expression.
    pub value: String,
}

/// Capability acknowledgements passed through to the provisioning API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Capability {
    /// The stack creates IAM resources.
    #[serde(rename = "CAPABILITY_IAM")]
    Iam,
    /// The stack creates IAM resources with custom names.
    #[serde(rename = "CAPABILITY_NAMED_IAM")]
    NamedIam,
    /// The template contains macros.
    #[serde(rename = "CAPABILITY_AUTO_EXPAND")]
    AutoExpand,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Iam => write!(f, "CAPABILITY_IAM"),
            Self::NamedIam => write!(f, "CAPABILITY_NAMED_IAM"),
            Self::AutoExpand => write!(f, "CAPABILITY_AUTO_EXPAND"),
        }
    }
}

/// Default alias repointed on every publish.
pub const LATEST_ALIAS: &str = "latest";

fn default_alias() -> String {
    LATEST_ALIAS.to_string()
}

/// Points a stack at a template body in the artifact store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateArtifactRef {
    /// Template object name within a revision (e.g. `iam.json`).
    pub template: String,
    /// The revision to deploy; unpinned refs cannot be deployed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<RevisionId>,
    /// Mutable alias, normally `latest`.
    #[serde(default = "default_alias")]
    pub alias: String,
}

impl TemplateArtifactRef {
    /// Creates an unpinned reference.
    #[must_use]
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            revision: None,
            alias: default_alias(),
        }
    }

    /// Pins the reference to a revision.
    #[must_use]
    pub fn at(mut self, revision: RevisionId) -> Self {
        self.revision = Some(revision);
        self
    }
}

/// A deployable stack: its inputs, outputs, references, and template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackDefinition {
    /// Unique stack name.
    pub name: String,
    /// Deployment tree this stack is nested in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    /// Declared inputs, in order.
    #[serde(default)]
    pub parameters: Vec<ParameterSpec>,
    /// Declared outputs.
    #[serde(default)]
    pub outputs: Vec<OutputSpec>,
    /// Inputs bound to references.
    #[serde(default)]
    pub references: Vec<ReferenceDecl>,
    /// Ordering-only dependencies.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Statically bound inputs.
    #[serde(default)]
    pub parameter_values: ParameterValues,
    /// External parameters this stack writes.
    #[serde(default)]
    pub parameter_writes: Vec<ParameterWrite>,
    /// Capability acknowledgements.
    #[serde(default)]
    pub capabilities: Vec<Capability>,
    /// Template location.
    pub template: TemplateArtifactRef,
}

impl StackDefinition {
    /// Creates a definition using `template` as its template object name.
    #[must_use]
    pub fn new(name: impl Into<String>, template: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parent: None,
            parameters: Vec::new(),
            outputs: Vec::new(),
            references: Vec::new(),
            depends_on: Vec::new(),
            parameter_values: ParameterValues::new(),
            parameter_writes: Vec::new(),
            capabilities: Vec::new(),
            template: TemplateArtifactRef::new(template),
        }
    }

    /// Instantiates the stack as a nested unit of `parent`.
    #[must_use]
    pub fn nested_in(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    /// Declares a parameter.
    #[must_use]
    pub fn with_parameter(mut self, parameter: ParameterSpec) -> Self {
        self.parameters.push(parameter);
        self
    }

    /// Declares an output.
    #[must_use]
    pub fn with_output(mut self, name: impl Into<String>, expression: impl Into<String>) -> Self {
        self.outputs.push(OutputSpec {
            name: name.into(),
            expression: expression.into(),
            export: None,
        });
        self
    }

    /// Declares an exported output.
    #[must_use]
    pub fn with_export(
        mut self,
        name: impl Into<String>,
        expression: impl Into<String>,
        export: impl Into<String>,
    ) -> Self {
        self.outputs.push(OutputSpec {
            name: name.into(),
            expression: expression.into(),
            export: Some(export.into()),
        });
        self
    }

    /// Binds input `name` to a reference.
    ///
    /// Declares a required `String` parameter of the same name if the stack
    /// does not declare one yet.
    #[must_use]
    pub fn with_reference(mut self, name: impl Into<String>, spec: ReferenceSpec) -> Self {
        let name = name.into();
        if self.parameter(&name).is_none() {
            self.parameters
                .push(ParameterSpec::required(name.clone(), ParameterType::String));
        }
        self.references.push(ReferenceDecl { name, spec });
        self
    }

    /// Adds an ordering-only dependency.
    #[must_use]
    pub fn depends_on(mut self, stack: impl Into<String>) -> Self {
        self.depends_on.push(stack.into());
        self
    }

    /// Binds a static value to a parameter.
    #[must_use]
    pub fn with_value(mut self, parameter: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameter_values.insert(parameter.into(), value.into());
        self
    }

    /// Declares an external parameter write.
    #[must_use]
    pub fn writes_parameter(mut self, path: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameter_writes.push(ParameterWrite {
            path: path.into(),
            value: value.into(),
        });
        self
    }

    /// Adds a capability acknowledgement.
    #[must_use]
    pub fn with_capability(mut self, capability: Capability) -> Self {
        if !self.capabilities.contains(&capability) {
            self.capabilities.push(capability);
        }
        self
    }

    /// Pins the template to a revision.
    #[must_use]
    pub fn at_revision(mut self, revision: RevisionId) -> Self {
        self.template.revision = Some(revision);
        self
    }

    /// Looks up a declared parameter.
    #[must_use]
    pub fn parameter(&self, name: &str) -> Option<&ParameterSpec> {
        self.parameters.iter().find(|p| p.name == name)
    }

    /// Looks up a declared output.
    #[must_use]
    pub fn output(&self, name: &str) -> Option<&OutputSpec> {
        self.outputs.iter().find(|o| o.name == name)
    }

    /// Iterates over (output name, export name) pairs.
    pub fn exports(&self) -> impl Iterator<Item = (&str, &str)> {
        self.outputs
            .iter()
            .filter_map(|o| o.export.as_deref().map(|e| (o.name.as_str(), e)))
    }

    /// Returns true if the stack is nested in `tree` or is the tree root.
    #[must_use]
    pub fn is_in_tree(&self, tree: &str) -> bool {
        self.name == tree || self.parent.as_deref() == Some(tree)
    }

    /// Validates the definition in isolation.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid names, duplicated names within the stack,
    /// references bound to undeclared parameters, and inputs bound both
    /// statically and by reference.
    pub fn validate(&self) -> Result<(), GraphError> {
        validate_stack_name(&self.name)?;
        if let Some(parent) = &self.parent {
            validate_stack_name(parent)?;
        }

        let mut seen = HashSet::new();
        for parameter in &self.parameters {
            validate_logical_name("parameter", &parameter.name)?;
            if !seen.insert(parameter.name.as_str()) {
                return Err(self.duplicate("parameter", &parameter.name));
            }
        }

        let mut seen = HashSet::new();
        let mut exports = HashSet::new();
        for output in &self.outputs {
            validate_logical_name("output", &output.name)?;
            if !seen.insert(output.name.as_str()) {
                return Err(self.duplicate("output", &output.name));
            }
            if let Some(export) = &output.export {
                validate_export_name(export)?;
                if !exports.insert(export.as_str()) {
                    return Err(self.duplicate("export", export));
                }
            }
        }

        let mut seen = HashSet::new();
        for reference in &self.references {
            if !seen.insert(reference.name.as_str()) {
                return Err(self.duplicate("reference", &reference.name));
            }
            if self.parameter(&reference.name).is_none() {
                return Err(GraphError::UnknownParameter {
                    stack: self.name.clone(),
                    reference: reference.name.clone(),
                });
            }
            if self.parameter_values.contains_key(&reference.name) {
                return Err(GraphError::ConflictingInput {
                    stack: self.name.clone(),
                    parameter: reference.name.clone(),
                });
            }
            match &reference.spec {
                ReferenceSpec::NestedOutput {
                    parent_stack,
                    child_stack,
                    output,
                } => {
                    validate_stack_name(parent_stack)?;
                    validate_stack_name(child_stack)?;
                    validate_logical_name("output", output)?;
                }
                ReferenceSpec::Export { export_name } => validate_export_name(export_name)?,
                ReferenceSpec::ExternalParameter { path, .. } => validate_parameter_path(path)?,
            }
        }

        let mut seen = HashSet::new();
        for write in &self.parameter_writes {
            validate_parameter_path(&write.path)?;
            if !seen.insert(write.path.as_str()) {
                return Err(self.duplicate("parameter write", &write.path));
            }
        }

        Ok(())
    }

    fn duplicate(&self, item: &'static str, name: &str) -> GraphError {
        GraphError::DuplicateName {
            stack: self.name.clone(),
            item,
            name: name.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parameter_type_accepts() {
        assert!(ParameterType::Number.accepts("42"));
        assert!(ParameterType::Number.accepts(" 3.5 "));
        assert!(!ParameterType::Number.accepts("forty"));
        assert!(ParameterType::CommaDelimitedList.accepts("a,b,c"));
        assert!(!ParameterType::CommaDelimitedList.accepts("a,,c"));
        assert!(ParameterType::String.accepts(""));
    }

    #[test]
    fn test_with_reference_declares_parameter() {
        let def = StackDefinition::new("Compute", "compute.json")
            .with_reference("RoleArn", ReferenceSpec::export("role"));

        assert!(def.parameter("RoleArn").is_some_and(ParameterSpec::is_required));
        assert!(def.validate().is_ok());
    }

    #[test]
    fn test_duplicate_output_rejected() {
        let def = StackDefinition::new("Iam", "iam.json")
            .with_output("RoleArn", "arn")
            .with_output("RoleArn", "arn2");

        assert_eq!(
            def.validate(),
            Err(GraphError::DuplicateName {
                stack: "Iam".into(),
                item: "output",
                name: "RoleArn".into(),
            })
        );
    }

    #[test]
    fn test_conflicting_input_rejected() {
        let def = StackDefinition::new("Iam", "iam.json")
            .with_reference("Bucket", ReferenceSpec::external_parameter("p", 1))
            .with_value("Bucket", "fixed");

        assert!(matches!(def.validate(), Err(GraphError::ConflictingInput { .. })));
    }

    #[test]
    fn test_reference_to_undeclared_parameter_rejected() {
        let mut def = StackDefinition::new("Iam", "iam.json");
        def.references.push(ReferenceDecl {
            name: "Ghost".into(),
            spec: ReferenceSpec::export("role"),
        });

        assert!(matches!(def.validate(), Err(GraphError::UnknownParameter { .. })));
    }

    #[test]
    fn test_exports_iterator() {
        let def = StackDefinition::new("Iam", "iam.json")
            .with_export("RoleArn", "${Role.Arn}", "role")
            .with_output("RoleName", "${Role}");

        let exports: Vec<_> = def.exports().collect();
        assert_eq!(exports, vec![("RoleArn", "role")]);
    }

    #[test]
    fn test_reference_spec_serde_shape() {
        let decl = ReferenceDecl {
            name: "Bucket".into(),
            spec: ReferenceSpec::external_parameter("/org/bucket", 3),
        };
        let json = serde_json::to_value(&decl).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"name": "Bucket", "kind": "external_parameter", "path": "/org/bucket", "version": 3})
        );

        let back: ReferenceDecl = serde_json::from_value(json).unwrap();
        assert_eq!(back, decl);
    }

    #[test]
    fn test_capability_serialization() {
        let json = serde_json::to_string(&Capability::NamedIam).unwrap();
        assert_eq!(json, r#""CAPABILITY_NAMED_IAM""#);
    }
}
