//! Export-in-use checks for stack deletion.

use super::plan::TeardownPlan;
use crate::core::StackDefinition;
use crate::errors::{SafetyViolation, StackflowError};
use crate::orchestrator::{with_retry, RetryConfig};
use crate::resolver::{ExportFilter, ExportRegistry};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// Refuses to delete a stack while a live stack still imports one of its
/// exports.
///
/// The check reads live state, so it runs twice: once over the whole
/// teardown before anything is deleted, and again immediately before each
/// deletion to catch importers deployed in between. Transient registry
/// failures are retried under the guard's [`RetryConfig`].
#[derive(Clone)]
pub struct TeardownGuard {
    registry: Arc<dyn ExportRegistry>,
    region: String,
    retry: RetryConfig,
}

impl std::fmt::Debug for TeardownGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TeardownGuard")
            .field("region", &self.region)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl TeardownGuard {
    /// Creates a guard over the registry of `region`.
    #[must_use]
    pub fn new(registry: Arc<dyn ExportRegistry>, region: impl Into<String>) -> Self {
        Self {
            registry,
            region: region.into(),
            retry: RetryConfig::default(),
        }
    }

    /// Sets the retry policy for registry reads.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Checks the whole teardown up front.
    ///
    /// An importer scheduled for deletion earlier in the same teardown does
    /// not block.
    pub async fn preflight(&self, teardown: &TeardownPlan) -> Result<(), StackflowError> {
        let mut deleted_earlier: HashSet<&str> = HashSet::new();
        for planned in teardown.stacks() {
            self.check(&planned.definition, &deleted_earlier).await?;
            deleted_earlier.insert(planned.name());
        }
        debug!(stacks = teardown.len(), "Teardown preflight passed");
        Ok(())
    }

    /// Checks one stack right before it is deleted.
    pub async fn verify(&self, definition: &StackDefinition) -> Result<(), StackflowError> {
        self.check(definition, &HashSet::new()).await
    }

    /// Returns the exports a stack owns: declared ones plus any the
    /// registry attributes to it.
    pub async fn exports_of(&self, definition: &StackDefinition) -> Result<BTreeSet<String>, StackflowError> {
        let mut exports: BTreeSet<String> = definition
            .exports()
            .map(|(_, export)| export.to_string())
            .collect();

        let filter = ExportFilter::region(&self.region).exported_by(&definition.name);
        let live = with_retry(&self.retry, "list_exports", || self.registry.list_exports(&filter))
            .await?
            .value;
        exports.extend(live.into_iter().map(|e| e.name));
        Ok(exports)
    }

    async fn check(
        &self,
        definition: &StackDefinition,
        deleted_earlier: &HashSet<&str>,
    ) -> Result<(), StackflowError> {
        for export in self.exports_of(definition).await? {
            let importers: Vec<String> = with_retry(&self.retry, "list_importers", || {
                self.registry.list_importers(&self.region, &export)
            })
            .await?
            .value
            .into_iter()
            .filter(|importer| importer != &definition.name && !deleted_earlier.contains(importer.as_str()))
            .collect();

            if !importers.is_empty() {
                warn!(
                    stack = %definition.name,
                    export = %export,
                    importers = ?importers,
                    "Refusing to delete stack with live importers"
                );
                return Err(SafetyViolation::ExportInUse {
                    stack: definition.name.clone(),
                    export,
                    importers,
                }
                .into());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::StackGraph;
    use crate::resolver::{ExportEntry, InMemoryExportRegistry};
    use crate::core::ReferenceSpec;

    const REGION: &str = "eu-west-1";

    fn setup() -> (Arc<InMemoryExportRegistry>, TeardownGuard, TeardownPlan) {
        let iam = StackDefinition::new("Iam", "iam.json").with_export("RoleArn", "arn", "role");
        let compute = StackDefinition::new("Compute", "compute.json")
            .with_reference("role", ReferenceSpec::export("role"));
        let plan = StackGraph::new([iam, compute]).build().unwrap();

        let registry = Arc::new(InMemoryExportRegistry::new());
        registry
            .register(ExportEntry {
                name: "role".into(),
                value: "arn".into(),
                exporting_stack: "Iam".into(),
                region: REGION.into(),
            })
            .unwrap();
        let guard = TeardownGuard::new(registry.clone(), REGION);
        (registry, guard, plan.teardown())
    }

    #[tokio::test]
    async fn test_importer_deleted_earlier_is_acceptable() {
        let (registry, guard, teardown) = setup();
        registry.record_import(REGION, "role", "Compute");

        assert_eq!(teardown.order(), vec!["Compute", "Iam"]);
        guard.preflight(&teardown).await.unwrap();

        let iam = &teardown.stacks()[1].definition;
        let err = guard.verify(iam).await.unwrap_err();
        assert!(matches!(
            err,
            StackflowError::Safety(SafetyViolation::ExportInUse { ref importers, .. })
                if importers == &vec!["Compute".to_string()]
        ));

        registry.remove_stack(REGION, "Compute");
        guard.verify(iam).await.unwrap();
    }

    #[tokio::test]
    async fn test_outside_importer_blocks_preflight() {
        let (registry, guard, teardown) = setup();
        registry.record_import(REGION, "role", "Batch");

        let err = guard.preflight(&teardown).await.unwrap_err();
        assert_eq!(err.code(), "SAFETY-001-EXPORT_IN_USE");
    }

    #[tokio::test]
    async fn test_registry_attributed_exports_are_checked() {
        let (registry, guard, _) = setup();
        registry
            .register(ExportEntry {
                name: "legacy".into(),
                value: "v".into(),
                exporting_stack: "Compute".into(),
                region: REGION.into(),
            })
            .unwrap();
        registry.record_import(REGION, "legacy", "Reporting");

        let compute = StackDefinition::new("Compute", "compute.json");
        let exports = guard.exports_of(&compute).await.unwrap();
        assert!(exports.contains("legacy"));
        assert!(guard.verify(&compute).await.is_err());
    }

    #[tokio::test]
    async fn test_stack_importing_its_own_export_is_ignored() {
        let (registry, guard, _) = setup();
        registry.record_import(REGION, "role", "Iam");

        let iam = StackDefinition::new("Iam", "iam.json").with_export("RoleArn", "arn", "role");
        guard.verify(&iam).await.unwrap();
    }
}
