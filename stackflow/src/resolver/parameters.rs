//! The versioned external parameter store.

use crate::errors::ProvisioningError;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// A parameter value at a specific version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterValue {
    /// Hierarchical path.
    pub path: String,
    /// Version, starting at 1.
    pub version: u64,
    /// Stored value.
    pub value: String,
}

/// Failures reading the parameter store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParameterStoreError {
    /// Nothing is stored at the path.
    #[error("Parameter '{path}' not found")]
    NotFound {
        /// The path.
        path: String,
    },

    /// The path exists but the version does not.
    #[error("Parameter '{path}' has no version {version}")]
    VersionNotFound {
        /// The path.
        path: String,
        /// The requested version.
        version: u64,
    },

    /// The store could not be reached.
    #[error(transparent)]
    Backend(#[from] ProvisioningError),
}

/// Read access to the parameter store.
///
/// There is deliberately no unversioned read.
#[async_trait]
pub trait ParameterStore: Send + Sync {
    /// Fetches `path` at exactly `version`.
    async fn get_parameter(&self, path: &str, version: u64) -> Result<ParameterValue, ParameterStoreError>;
}

/// Serializable store contents: every version of every path, oldest first.
pub type ParameterSnapshot = BTreeMap<String, Vec<String>>;

/// In-memory parameter store with explicit versioning.
#[derive(Debug, Default)]
pub struct InMemoryParameterStore {
    parameters: RwLock<ParameterSnapshot>,
}

impl InMemoryParameterStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes a new version of `path` and returns its number.
    pub fn put(&self, path: &str, value: impl Into<String>) -> u64 {
        let mut parameters = self.parameters.write();
        let versions = parameters.entry(path.to_string()).or_default();
        versions.push(value.into());
        versions.len() as u64
    }

    /// Returns the newest version of `path`, if any.
    #[must_use]
    pub fn latest_version(&self, path: &str) -> Option<u64> {
        self.parameters
            .read()
            .get(path)
            .map(|versions| versions.len() as u64)
    }

    /// Returns the newest version of `path` with its value.
    #[must_use]
    pub fn latest(&self, path: &str) -> Option<ParameterValue> {
        let parameters = self.parameters.read();
        let versions = parameters.get(path)?;
        versions.last().map(|value| ParameterValue {
            path: path.to_string(),
            version: versions.len() as u64,
            value: value.clone(),
        })
    }

    /// Returns the store contents.
    #[must_use]
    pub fn snapshot(&self) -> ParameterSnapshot {
        self.parameters.read().clone()
    }

    /// Replaces the store contents.
    pub fn restore(&self, snapshot: ParameterSnapshot) {
        *self.parameters.write() = snapshot;
    }
}

#[async_trait]
impl ParameterStore for InMemoryParameterStore {
    async fn get_parameter(&self, path: &str, version: u64) -> Result<ParameterValue, ParameterStoreError> {
        let parameters = self.parameters.read();
        let versions = parameters.get(path).ok_or_else(|| ParameterStoreError::NotFound {
            path: path.to_string(),
        })?;

        let value = usize::try_from(version)
            .ok()
            .and_then(|v| v.checked_sub(1))
            .and_then(|index| versions.get(index))
            .ok_or_else(|| ParameterStoreError::VersionNotFound {
                path: path.to_string(),
                version,
            })?;

        Ok(ParameterValue {
            path: path.to_string(),
            version,
            value: value.clone(),
        })
    }
}
