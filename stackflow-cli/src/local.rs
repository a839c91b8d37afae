//! Local backend: simulated provisioning with state kept in a directory.
//!
//! Live stacks, exports, and external parameters are saved to
//! `<state-dir>/state.json` after every command; template artifacts are
//! written under `<state-dir>/artifacts`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use stackflow::artifacts::{ArtifactPublisher, FsArtifactStore};
use stackflow::orchestrator::{InMemoryProvisioner, ProvisionerSnapshot};
use stackflow::resolver::{InMemoryExportRegistry, InMemoryParameterStore, ParameterSnapshot, RegistrySnapshot};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const STATE_FILE: &str = "state.json";
const ARTIFACTS_DIR: &str = "artifacts";

/// Everything the local backend persists.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalState {
    /// Live stacks.
    #[serde(default)]
    pub provisioner: ProvisionerSnapshot,
    /// Exports and imports.
    #[serde(default)]
    pub registry: RegistrySnapshot,
    /// External parameters.
    #[serde(default)]
    pub parameters: ParameterSnapshot,
}

/// In-memory collaborators loaded from, and saved back to, a state directory.
#[derive(Debug)]
pub struct LocalBackend {
    dir: PathBuf,
    /// Export registry.
    pub exports: Arc<InMemoryExportRegistry>,
    /// External parameter store.
    pub parameters: Arc<InMemoryParameterStore>,
    /// Simulated provisioning API.
    pub provisioner: Arc<InMemoryProvisioner>,
    /// Publisher writing under `<state-dir>/artifacts`.
    pub publisher: ArtifactPublisher,
}

impl LocalBackend {
    /// Opens `dir`, creating it if needed, and restores any saved state.
    pub fn open(dir: impl Into<PathBuf>, region: &str, artifact_prefix: &str) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating state directory {}", dir.display()))?;

        let exports = Arc::new(InMemoryExportRegistry::new());
        let parameters = Arc::new(InMemoryParameterStore::new());
        let provisioner = Arc::new(InMemoryProvisioner::new(region, exports.clone(), parameters.clone()));
        let store = Arc::new(FsArtifactStore::new(dir.join(ARTIFACTS_DIR)));
        let publisher = ArtifactPublisher::new(store, artifact_prefix);

        let backend = Self {
            dir,
            exports,
            parameters,
            provisioner,
            publisher,
        };
        if let Some(state) = backend.load()? {
            backend.restore(state);
        }
        Ok(backend)
    }

    /// The state directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Captures the current state.
    pub fn snapshot(&self) -> LocalState {
        LocalState {
            provisioner: self.provisioner.snapshot(),
            registry: self.exports.snapshot(),
            parameters: self.parameters.snapshot(),
        }
    }

    /// Writes the current state to disk.
    pub fn save(&self) -> Result<()> {
        let path = self.dir.join(STATE_FILE);
        let json = serde_json::to_string_pretty(&self.snapshot())?;
        std::fs::write(&path, json).with_context(|| format!("writing {}", path.display()))?;
        tracing::debug!(path = %path.display(), "State saved");
        Ok(())
    }

    fn load(&self) -> Result<Option<LocalState>> {
        let path = self.dir.join(STATE_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let json = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
        let state = serde_json::from_str(&json).with_context(|| format!("parsing {}", path.display()))?;
        Ok(Some(state))
    }

    fn restore(&self, state: LocalState) {
        self.provisioner.restore(state.provisioner);
        self.exports.restore(state.registry);
        self.parameters.restore(state.parameters);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();

        let backend = LocalBackend::open(dir.path(), "us-east-1", "templates").unwrap();
        backend.parameters.put("/org/ami", "ami-1");
        backend.parameters.put("/org/ami", "ami-2");
        backend.save().unwrap();

        let reopened = LocalBackend::open(dir.path(), "us-east-1", "templates").unwrap();
        assert_eq!(reopened.snapshot(), backend.snapshot());
        assert_eq!(reopened.parameters.latest_version("/org/ami"), Some(2));
    }

    #[test]
    fn test_empty_directory() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::open(dir.path().join("nested"), "us-east-1", "templates").unwrap();
        assert_eq!(backend.snapshot(), LocalState::default());
        assert!(backend.dir().exists());
    }
}
