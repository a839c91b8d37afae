//! Stack-set manifests.
//!
//! A manifest declares a set of stacks together with the environments they
//! are deployed to. Environments override the region and bind per-stack
//! parameter values.

use crate::artifacts::RevisionId;
use crate::core::{ParameterValues, StackDefinition};
use crate::errors::{ManifestError, StackflowError};
use crate::graph::{DeploymentPlan, StackGraph};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_prefix() -> String {
    "templates".to_string()
}

/// Where template artifacts are published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactSettings {
    /// Key prefix inside the store.
    #[serde(default = "default_prefix")]
    pub prefix: String,
    /// Base URL of the store; a local directory store is used when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

impl Default for ArtifactSettings {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
            base_url: None,
        }
    }
}

/// Settings of one deployment environment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    /// Region override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    /// Parameter values by stack name.
    #[serde(default)]
    pub values: BTreeMap<String, ParameterValues>,
}

/// A set of stacks deployed together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackSetManifest {
    /// Stack-set name.
    pub name: String,
    /// Default region.
    #[serde(default = "default_region")]
    pub region: String,
    /// Artifact store settings.
    #[serde(default)]
    pub artifacts: ArtifactSettings,
    /// Parameter paths supplied from outside the set.
    #[serde(default)]
    pub external_parameters: Vec<String>,
    /// Exports supplied by stacks outside the set.
    #[serde(default)]
    pub live_exports: Vec<String>,
    /// Environments by tag.
    #[serde(default)]
    pub environments: BTreeMap<String, EnvironmentConfig>,
    /// Stack definitions.
    pub stacks: Vec<StackDefinition>,
}

impl StackSetManifest {
    /// Parses a JSON manifest.
    pub fn from_json(json: &str) -> Result<Self, StackflowError> {
        serde_json::from_str(json).map_err(|e| ManifestError::Parse(e).into())
    }

    /// Loads a JSON manifest file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, StackflowError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Returns the manifest as deployed to `environment`.
    ///
    /// The environment's region replaces the default and its values are
    /// bound onto the named stacks, overriding static values.
    pub fn for_environment(&self, environment: &str) -> Result<Self, ManifestError> {
        let config = self
            .environments
            .get(environment)
            .ok_or_else(|| ManifestError::UnknownEnvironment(environment.to_string()))?;

        if let Some(stack) = config
            .values
            .keys()
            .find(|stack| !self.stacks.iter().any(|d| &d.name == *stack))
        {
            return Err(ManifestError::UnknownStack {
                environment: environment.to_string(),
                stack: stack.clone(),
            });
        }

        let stacks = self
            .stacks
            .iter()
            .cloned()
            .map(|mut definition| {
                if let Some(values) = config.values.get(&definition.name) {
                    definition
                        .parameter_values
                        .extend(values.iter().map(|(k, v)| (k.clone(), v.clone())));
                }
                definition
            })
            .collect();

        Ok(Self {
            region: config.region.clone().unwrap_or_else(|| self.region.clone()),
            stacks,
            ..self.clone()
        })
    }

    /// Pins every template without a revision to `revision`.
    #[must_use]
    pub fn pin_revision(mut self, revision: &RevisionId) -> Self {
        for definition in &mut self.stacks {
            if definition.template.revision.is_none() {
                definition.template.revision = Some(revision.clone());
            }
        }
        self
    }

    /// Returns a graph over the stacks and the manifest's external inputs.
    #[must_use]
    pub fn graph(&self) -> StackGraph {
        StackGraph::new(self.stacks.clone())
            .with_external_parameters(self.external_parameters.iter().cloned())
            .with_live_exports(self.live_exports.iter().cloned())
    }

    /// Builds the deployment plan.
    pub fn plan(&self) -> Result<DeploymentPlan, StackflowError> {
        Ok(self.graph().build()?)
    }
}
