//! Turning a [`ReferenceSpec`] into a concrete value.

use super::context::ResolutionContext;
use super::exports::{ExportFilter, ExportRegistry};
use super::parameters::{ParameterStore, ParameterStoreError};
use crate::core::{ReferenceSpec, StackDefinition};
use crate::errors::ReferenceError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error};

/// A reference together with the value it resolved to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedReference {
    /// The input the value is bound to.
    pub name: String,
    /// Where the value came from.
    pub spec: ReferenceSpec,
    /// The resolved value.
    pub value: String,
}

/// Resolves references against the export registry, the parameter store,
/// and the run's composition context.
///
/// The resolver never retries. Backend failures surface as
/// [`ReferenceError::Unavailable`] and the orchestrator decides what to do.
#[derive(Clone)]
pub struct ReferenceResolver {
    exports: Arc<dyn ExportRegistry>,
    parameters: Arc<dyn ParameterStore>,
    region: String,
}

impl std::fmt::Debug for ReferenceResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReferenceResolver")
            .field("region", &self.region)
            .finish_non_exhaustive()
    }
}

impl ReferenceResolver {
    /// Creates a resolver reading exports in `region`.
    #[must_use]
    pub fn new(
        exports: Arc<dyn ExportRegistry>,
        parameters: Arc<dyn ParameterStore>,
        region: impl Into<String>,
    ) -> Self {
        Self {
            exports,
            parameters,
            region: region.into(),
        }
    }

    /// Returns the region exports are read from.
    #[must_use]
    pub fn region(&self) -> &str {
        &self.region
    }

    /// Resolves one reference.
    pub async fn resolve(
        &self,
        spec: &ReferenceSpec,
        context: &ResolutionContext,
    ) -> Result<String, ReferenceError> {
        let value = match spec {
            ReferenceSpec::NestedOutput {
                parent_stack,
                child_stack,
                output,
            } => context
                .nested_output(parent_stack, child_stack, output)
                .ok_or_else(|| ReferenceError::OutputNotFound {
                    parent: parent_stack.clone(),
                    child: child_stack.clone(),
                    output: output.clone(),
                })?,
            ReferenceSpec::Export { export_name } => self.resolve_export(export_name, context).await?,
            ReferenceSpec::ExternalParameter { path, version } => {
                self.resolve_parameter(path, *version, context).await?
            }
        };

        debug!(reference = %spec, kind = ?spec.kind(), "Resolved reference");
        Ok(value)
    }

    /// Resolves every reference a stack declares, in declaration order.
    ///
    /// Stops at the first failure.
    pub async fn resolve_all(
        &self,
        definition: &StackDefinition,
        context: &ResolutionContext,
    ) -> Result<Vec<ResolvedReference>, ReferenceError> {
        let mut resolved = Vec::with_capacity(definition.references.len());
        for reference in &definition.references {
            let value = self.resolve(&reference.spec, context).await?;
            resolved.push(ResolvedReference {
                name: reference.name.clone(),
                spec: reference.spec.clone(),
                value,
            });
        }
        Ok(resolved)
    }

    async fn resolve_export(
        &self,
        export_name: &str,
        context: &ResolutionContext,
    ) -> Result<String, ReferenceError> {
        if let Some(pinned) = context.pinned_export(export_name) {
            return Ok(pinned);
        }

        let filter = ExportFilter::region(&self.region).named(export_name);
        let mut found = self
            .exports
            .list_exports(&filter)
            .await
            .map_err(|source| ReferenceError::Unavailable { source })?;

        match found.len() {
            0 => Err(ReferenceError::ExportNotFound {
                export: export_name.to_string(),
                region: self.region.clone(),
            }),
            1 => {
                let entry = found.remove(0);
                Ok(context.pin_export(export_name, entry.value))
            }
            _ => {
                let mut producers: Vec<String> =
                    found.into_iter().map(|e| e.exporting_stack).collect();
                producers.sort();
                error!(
                    export = %export_name,
                    region = %self.region,
                    producers = ?producers,
                    "Export registry holds more than one live producer"
                );
                Err(ReferenceError::AmbiguousExport {
                    export: export_name.to_string(),
                    region: self.region.clone(),
                    producers,
                })
            }
        }
    }

    async fn resolve_parameter(
        &self,
        path: &str,
        version: u64,
        context: &ResolutionContext,
    ) -> Result<String, ReferenceError> {
        if let Some(pinned) = context.pinned_parameter(path, version) {
            return Ok(pinned);
        }

        let fetched = self
            .parameters
            .get_parameter(path, version)
            .await
            .map_err(|e| match e {
                ParameterStoreError::NotFound { path } => ReferenceError::ParameterNotFound { path },
                ParameterStoreError::VersionNotFound { path, version } => {
                    ReferenceError::ParameterVersionNotFound { path, version }
                }
                ParameterStoreError::Backend(source) => ReferenceError::Unavailable { source },
            })?;

        Ok(context.pin_parameter(path, version, fetched.value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ProvisioningError;
    use crate::resolver::exports::ExportEntry;
    use crate::resolver::parameters::ParameterValue;
    use crate::resolver::{InMemoryExportRegistry, InMemoryParameterStore};
    use async_trait::async_trait;
    use mockall::mock;

    mock! {
        Registry {}

        #[async_trait]
        impl ExportRegistry for Registry {
            async fn list_exports(&self, filter: &ExportFilter) -> Result<Vec<ExportEntry>, ProvisioningError>;
            async fn list_importers(&self, region: &str, export: &str) -> Result<Vec<String>, ProvisioningError>;
        }
    }

    mock! {
        Parameters {}

        #[async_trait]
        impl ParameterStore for Parameters {
            async fn get_parameter(&self, path: &str, version: u64) -> Result<ParameterValue, ParameterStoreError>;
        }
    }

    fn export(name: &str, stack: &str, value: &str) -> ExportEntry {
        ExportEntry {
            name: name.into(),
            value: value.into(),
            exporting_stack: stack.into(),
            region: "eu-west-1".into(),
        }
    }

    fn in_memory() -> (Arc<InMemoryExportRegistry>, Arc<InMemoryParameterStore>, ReferenceResolver) {
        let registry = Arc::new(InMemoryExportRegistry::new());
        let store = Arc::new(InMemoryParameterStore::new());
        let resolver = ReferenceResolver::new(registry.clone(), store.clone(), "eu-west-1");
        (registry, store, resolver)
    }

    #[tokio::test]
    async fn test_nested_output_from_context() {
        let (_, _, resolver) = in_memory();
        let ctx = ResolutionContext::new("run");
        let spec = ReferenceSpec::nested_output("App", "Networking", "VpcId");

        assert_eq!(
            resolver.resolve(&spec, &ctx).await,
            Err(ReferenceError::OutputNotFound {
                parent: "App".into(),
                child: "Networking".into(),
                output: "VpcId".into()
            })
        );

        let mut outputs = crate::core::ParameterValues::new();
        outputs.insert("VpcId".into(), "vpc-123".into());
        ctx.record_nested_outputs("App", "Networking", outputs);
        assert_eq!(resolver.resolve(&spec, &ctx).await.unwrap(), "vpc-123");
    }

    #[tokio::test]
    async fn test_export_is_pinned_for_the_run() {
        let (registry, _, resolver) = in_memory();
        registry.register(export("role", "Iam", "arn:v1")).unwrap();
        let ctx = ResolutionContext::new("run");
        let spec = ReferenceSpec::export("role");

        assert_eq!(resolver.resolve(&spec, &ctx).await.unwrap(), "arn:v1");

        registry.register(export("role", "Iam", "arn:v2")).unwrap();
        assert_eq!(resolver.resolve(&spec, &ctx).await.unwrap(), "arn:v1");

        let next_run = ResolutionContext::new("run-2");
        assert_eq!(resolver.resolve(&spec, &next_run).await.unwrap(), "arn:v2");
    }

    #[tokio::test]
    async fn test_export_not_found_and_ambiguous() {
        let (registry, _, resolver) = in_memory();
        let ctx = ResolutionContext::new("run");
        let spec = ReferenceSpec::export("role");

        assert!(matches!(
            resolver.resolve(&spec, &ctx).await,
            Err(ReferenceError::ExportNotFound { .. })
        ));

        registry.register_unchecked(export("role", "Iam", "a"));
        registry.register_unchecked(export("role", "Rogue", "b"));
        assert_eq!(
            resolver.resolve(&spec, &ctx).await,
            Err(ReferenceError::AmbiguousExport {
                export: "role".into(),
                region: "eu-west-1".into(),
                producers: vec!["Iam".into(), "Rogue".into()],
            })
        );
    }

    #[tokio::test]
    async fn test_parameter_version_is_mandatory() {
        let (_, store, resolver) = in_memory();
        store.put("/org/p", "first");
        store.put("/org/p", "second");
        let ctx = ResolutionContext::new("run");

        let v1 = ReferenceSpec::external_parameter("/org/p", 1);
        assert_eq!(resolver.resolve(&v1, &ctx).await.unwrap(), "first");

        let v5 = ReferenceSpec::external_parameter("/org/p", 5);
        assert_eq!(
            resolver.resolve(&v5, &ctx).await,
            Err(ReferenceError::ParameterVersionNotFound {
                path: "/org/p".into(),
                version: 5
            })
        );

        let missing = ReferenceSpec::external_parameter("/org/none", 1);
        assert!(matches!(
            resolver.resolve(&missing, &ctx).await,
            Err(ReferenceError::ParameterNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_backend_failure_is_surfaced_not_retried() {
        let mut registry = MockRegistry::new();
        registry
            .expect_list_exports()
            .times(1)
            .returning(|_| Err(ProvisioningError::transient("list_exports", "throttled")));
        let mut parameters = MockParameters::new();
        parameters
            .expect_get_parameter()
            .times(1)
            .returning(|_, _| Err(ProvisioningError::transient("get_parameter", "timeout").into()));

        let resolver = ReferenceResolver::new(Arc::new(registry), Arc::new(parameters), "eu-west-1");
        let ctx = ResolutionContext::new("run");

        let err = resolver.resolve(&ReferenceSpec::export("role"), &ctx).await.unwrap_err();
        assert!(err.is_transient());

        let err = resolver
            .resolve(&ReferenceSpec::external_parameter("/p", 1), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, ReferenceError::Unavailable { .. }));
    }

    #[tokio::test]
    async fn test_export_lookup_is_region_scoped() {
        let mut registry = MockRegistry::new();
        registry
            .expect_list_exports()
            .withf(|f| f.region == "us-east-1" && f.name.as_deref() == Some("role"))
            .returning(|_| {
                Ok(vec![ExportEntry {
                    name: "role".into(),
                    value: "arn:us".into(),
                    exporting_stack: "Iam".into(),
                    region: "us-east-1".into(),
                }])
            });

        let resolver = ReferenceResolver::new(
            Arc::new(registry),
            Arc::new(InMemoryParameterStore::new()),
            "us-east-1",
        );
        let ctx = ResolutionContext::new("run");
        assert_eq!(resolver.resolve(&ReferenceSpec::export("role"), &ctx).await.unwrap(), "arn:us");
    }

    #[tokio::test]
    async fn test_resolve_all_in_declaration_order() {
        let (registry, store, resolver) = in_memory();
        registry.register(export("role", "Iam", "arn:role")).unwrap();
        store.put("/org/p", "bucket-1");

        let def = StackDefinition::new("Compute", "compute.json")
            .with_reference("RoleArn", ReferenceSpec::export("role"))
            .with_reference("Bucket", ReferenceSpec::external_parameter("/org/p", 1));
        let ctx = ResolutionContext::new("run");

        let resolved = resolver.resolve_all(&def, &ctx).await.unwrap();
        let pairs: Vec<_> = resolved.iter().map(|r| (r.name.as_str(), r.value.as_str())).collect();
        assert_eq!(pairs, vec![("RoleArn", "arn:role"), ("Bucket", "bucket-1")]);
    }
}
