//! The region-scoped export registry.

use crate::errors::ProvisioningError;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// A live export.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExportEntry {
    /// Export name.
    pub name: String,
    /// Exported value.
    pub value: String,
    /// The stack that produced the export.
    pub exporting_stack: String,
    /// Region the export lives in.
    pub region: String,
}

/// Narrows a `list_exports` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExportFilter {
    /// Region to search.
    pub region: String,
    /// Only exports with this name.
    pub name: Option<String>,
    /// Only exports produced by this stack.
    pub exporting_stack: Option<String>,
}

impl ExportFilter {
    /// Matches every export in `region`.
    #[must_use]
    pub fn region(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            ..Self::default()
        }
    }

    /// Restricts the filter to one export name.
    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Restricts the filter to one exporting stack.
    #[must_use]
    pub fn exported_by(mut self, stack: impl Into<String>) -> Self {
        self.exporting_stack = Some(stack.into());
        self
    }

    /// Returns true if `entry` passes the filter.
    #[must_use]
    pub fn matches(&self, entry: &ExportEntry) -> bool {
        entry.region == self.region
            && self.name.as_ref().map_or(true, |n| n == &entry.name)
            && self
                .exporting_stack
                .as_ref()
                .map_or(true, |s| s == &entry.exporting_stack)
    }
}

/// Read access to the export registry.
///
/// Reads are point-in-time; nothing here locks the registry.
#[async_trait]
pub trait ExportRegistry: Send + Sync {
    /// Lists live exports matching `filter`.
    async fn list_exports(&self, filter: &ExportFilter) -> Result<Vec<ExportEntry>, ProvisioningError>;

    /// Lists the live stacks importing `export` in `region`, sorted.
    async fn list_importers(&self, region: &str, export: &str) -> Result<Vec<String>, ProvisioningError>;
}

/// One recorded import.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportRecord {
    /// Region of the export.
    pub region: String,
    /// Export name.
    pub export: String,
    /// Importing stack.
    pub importer: String,
}

/// Serializable registry contents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    /// Live exports.
    pub exports: Vec<ExportEntry>,
    /// Live imports.
    pub imports: Vec<ImportRecord>,
}

type RegionKey = (String, String);

#[derive(Debug, Default)]
struct RegistryState {
    exports: BTreeMap<RegionKey, Vec<ExportEntry>>,
    imports: BTreeMap<RegionKey, BTreeSet<String>>,
}

/// In-memory export registry.
#[derive(Debug, Default)]
pub struct InMemoryExportRegistry {
    state: RwLock<RegistryState>,
}

impl InMemoryExportRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an export, refusing a name another stack already exports.
    ///
    /// Re-registering from the same stack replaces the value.
    pub fn register(&self, entry: ExportEntry) -> Result<(), ProvisioningError> {
        let mut state = self.state.write();
        let slot = state
            .exports
            .entry((entry.region.clone(), entry.name.clone()))
            .or_default();

        if let Some(other) = slot.iter().find(|e| e.exporting_stack != entry.exporting_stack) {
            return Err(ProvisioningError::rejected(
                "create_export",
                entry.exporting_stack.clone(),
                format!(
                    "export '{}' is already exported by stack '{}'",
                    entry.name, other.exporting_stack
                ),
            ));
        }
        slot.retain(|e| e.exporting_stack != entry.exporting_stack);
        slot.push(entry);
        Ok(())
    }

    /// Registers an export without the one-producer check.
    ///
    /// Only useful for simulating a registry that violates its own invariant.
    pub fn register_unchecked(&self, entry: ExportEntry) {
        self.state
            .write()
            .exports
            .entry((entry.region.clone(), entry.name.clone()))
            .or_default()
            .push(entry);
    }

    /// Returns the stacks currently exporting `name` in `region`.
    #[must_use]
    pub fn exporters(&self, region: &str, name: &str) -> Vec<String> {
        self.state
            .read()
            .exports
            .get(&(region.to_string(), name.to_string()))
            .map(|entries| entries.iter().map(|e| e.exporting_stack.clone()).collect())
            .unwrap_or_default()
    }

    /// Returns the stacks importing `export` in `region`.
    #[must_use]
    pub fn importers(&self, region: &str, export: &str) -> Vec<String> {
        self.state
            .read()
            .imports
            .get(&(region.to_string(), export.to_string()))
            .map(|importers| importers.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Records that `importer` imports `export`.
    pub fn record_import(&self, region: &str, export: &str, importer: &str) {
        self.state
            .write()
            .imports
            .entry((region.to_string(), export.to_string()))
            .or_default()
            .insert(importer.to_string());
    }

    /// Drops every import recorded for `importer` in `region`.
    pub fn remove_imports_of(&self, region: &str, importer: &str) {
        let mut state = self.state.write();
        for ((r, _), importers) in &mut state.imports {
            if r == region {
                importers.remove(importer);
            }
        }
        state.imports.retain(|_, importers| !importers.is_empty());
    }

    /// Drops every export produced by and every import made by `stack`.
    pub fn remove_stack(&self, region: &str, stack: &str) {
        {
            let mut state = self.state.write();
            for ((r, _), entries) in &mut state.exports {
                if r == region {
                    entries.retain(|e| e.exporting_stack != stack);
                }
            }
            state.exports.retain(|_, entries| !entries.is_empty());
        }
        self.remove_imports_of(region, stack);
    }

    /// Returns the registry contents.
    #[must_use]
    pub fn snapshot(&self) -> RegistrySnapshot {
        let state = self.state.read();
        RegistrySnapshot {
            exports: state.exports.values().flatten().cloned().collect(),
            imports: state
                .imports
                .iter()
                .flat_map(|((region, export), importers)| {
                    importers.iter().map(move |importer| ImportRecord {
                        region: region.clone(),
                        export: export.clone(),
                        importer: importer.clone(),
                    })
                })
                .collect(),
        }
    }

    /// Replaces the registry contents.
    pub fn restore(&self, snapshot: RegistrySnapshot) {
        let mut state = RegistryState::default();
        for entry in snapshot.exports {
            state
                .exports
                .entry((entry.region.clone(), entry.name.clone()))
                .or_default()
                .push(entry);
        }
        for import in snapshot.imports {
            state
                .imports
                .entry((import.region, import.export))
                .or_default()
                .insert(import.importer);
        }
        *self.state.write() = state;
    }
}

#[async_trait]
impl ExportRegistry for InMemoryExportRegistry {
    async fn list_exports(&self, filter: &ExportFilter) -> Result<Vec<ExportEntry>, ProvisioningError> {
        Ok(self
            .state
            .read()
            .exports
            .values()
            .flatten()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect())
    }

    async fn list_importers(&self, region: &str, export: &str) -> Result<Vec<String>, ProvisioningError> {
        Ok(self.importers(region, export))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn entry(name: &str, stack: &str) -> ExportEntry {
        ExportEntry {
            name: name.into(),
            value: format!("{stack}-{name}"),
            exporting_stack: stack.into(),
            region: "eu-west-1".into(),
        }
    }

    #[tokio::test]
    async fn test_register_and_filter() {
        let registry = InMemoryExportRegistry::new();
        registry.register(entry("role", "Iam")).unwrap();
        registry.register(entry("vpc", "Networking")).unwrap();

        let all = registry.list_exports(&ExportFilter::region("eu-west-1")).await.unwrap();
        assert_eq!(all.len(), 2);

        let named = registry
            .list_exports(&ExportFilter::region("eu-west-1").named("role"))
            .await
            .unwrap();
        assert_eq!(named, vec![entry("role", "Iam")]);

        let other_region = registry.list_exports(&ExportFilter::region("us-east-1")).await.unwrap();
        assert!(other_region.is_empty());
    }

    #[test]
    fn test_second_producer_rejected() {
        let registry = InMemoryExportRegistry::new();
        registry.register(entry("role", "Iam")).unwrap();
        registry.register(entry("role", "Iam")).unwrap();

        let err = registry.register(entry("role", "Other")).unwrap_err();
        assert!(matches!(err, ProvisioningError::Rejected { .. }));
    }

    #[tokio::test]
    async fn test_imports_and_remove_stack() {
        let registry = InMemoryExportRegistry::new();
        registry.register(entry("role", "Iam")).unwrap();
        registry.record_import("eu-west-1", "role", "Compute");
        registry.record_import("eu-west-1", "role", "Batch");

        assert_eq!(
            registry.list_importers("eu-west-1", "role").await.unwrap(),
            vec!["Batch", "Compute"]
        );

        registry.remove_stack("eu-west-1", "Compute");
        assert_eq!(registry.list_importers("eu-west-1", "role").await.unwrap(), vec!["Batch"]);

        registry.remove_stack("eu-west-1", "Iam");
        assert!(registry
            .list_exports(&ExportFilter::region("eu-west-1"))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_restore() {
        let registry = InMemoryExportRegistry::new();
        registry.register(entry("role", "Iam")).unwrap();
        registry.record_import("eu-west-1", "role", "Compute");

        let json = serde_json::to_string(&registry.snapshot()).unwrap();
        let restored = InMemoryExportRegistry::new();
        restored.restore(serde_json::from_str(&json).unwrap());

        assert_eq!(restored.snapshot(), registry.snapshot());
        assert_eq!(
            restored.list_importers("eu-west-1", "role").await.unwrap(),
            vec!["Compute"]
        );
    }
}
