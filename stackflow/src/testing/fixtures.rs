//! Shared fixtures: the reference stack set and an in-memory environment.

use std::sync::Arc;

use crate::artifacts::{ArtifactPublisher, InMemoryArtifactStore, InMemoryTemplateSource, RevisionId};
use crate::config::OrchestratorConfig;
use crate::core::{Capability, ParameterSpec, ParameterType, ReferenceSpec, StackDefinition};
use crate::events::CollectingEventSink;
use crate::graph::{DeploymentPlan, StackGraph};
use crate::orchestrator::{
    BackoffStrategy, DeploymentOrchestrator, InMemoryProvisioner, JitterStrategy, PollConfig, RetryConfig,
};
use crate::resolver::{InMemoryExportRegistry, InMemoryParameterStore};

/// Region used by fixtures.
pub const TEST_REGION: &str = "us-east-1";

/// Bucket name the `S3` stack creates by default.
pub const TEST_BUCKET: &str = "stackflow-artifacts";

/// The five-stack reference set.
///
/// `S3` writes the external parameter `p`, which `IAM` reads at version 1.
/// `IAM` exports `role`. `Networking`, `SecurityGroup`, and `Compute` are
/// nested in the `App` tree: `SecurityGroup` reads `Networking`'s `VpcId`
/// and `Compute` reads both `SecurityGroup`'s `GroupId` and the `role`
/// export.
#[must_use]
pub fn reference_stack_set() -> Vec<StackDefinition> {
    vec![
        StackDefinition::new("S3", "s3.json")
            .with_parameter(ParameterSpec::optional("BucketName", ParameterType::String, TEST_BUCKET))
            .with_output("BucketName", "${BucketName}")
            .writes_parameter("p", "${BucketName}"),
        StackDefinition::new("IAM", "iam.json")
            .with_reference("bucket", ReferenceSpec::external_parameter("p", 1))
            .with_export("RoleArn", "arn:role/${bucket}", "role")
            .with_capability(Capability::Iam),
        StackDefinition::new("Networking", "networking.json")
            .nested_in("App")
            .with_output("VpcId", "vpc-0a1b"),
        StackDefinition::new("SecurityGroup", "security-group.json")
            .nested_in("App")
            .with_reference("vpc", ReferenceSpec::nested_output("App", "Networking", "VpcId"))
            .with_output("GroupId", "sg-${vpc}"),
        StackDefinition::new("Compute", "compute.json")
            .nested_in("App")
            .with_reference("role", ReferenceSpec::export("role"))
            .with_reference("group", ReferenceSpec::nested_output("App", "SecurityGroup", "GroupId"))
            .with_output("InstanceProfile", "${role}@${group}"),
    ]
}

/// Template bodies for the reference set.
#[must_use]
pub fn reference_templates() -> InMemoryTemplateSource {
    InMemoryTemplateSource::new([
        ("s3.json", r#"{"Resources":{"Bucket":{}}}"#),
        ("iam.json", r#"{"Resources":{"Role":{}}}"#),
        ("networking.json", r#"{"Resources":{"Vpc":{}}}"#),
        ("security-group.json", r#"{"Resources":{"Group":{}}}"#),
        ("compute.json", r#"{"Resources":{"Instance":{}}}"#),
    ])
}

/// Config with short delays for tests.
#[must_use]
pub fn fast_config() -> OrchestratorConfig {
    OrchestratorConfig::for_region(TEST_REGION)
        .with_poll(PollConfig::new(5, 2))
        .with_retry(
            RetryConfig::new()
                .with_max_attempts(3)
                .with_base_delay_ms(1)
                .with_max_delay_ms(5)
                .with_backoff(BackoffStrategy::Constant)
                .with_jitter(JitterStrategy::None),
        )
}

/// In-memory backends wired together.
#[derive(Debug)]
pub struct TestEnvironment {
    /// Export registry shared by the provisioner and the resolver.
    pub exports: Arc<InMemoryExportRegistry>,
    /// Parameter store shared by the provisioner and the resolver.
    pub parameters: Arc<InMemoryParameterStore>,
    /// Simulated provisioning API.
    pub provisioner: Arc<InMemoryProvisioner>,
    /// Artifact store behind the publisher.
    pub store: Arc<InMemoryArtifactStore>,
    /// Publisher over `store`.
    pub publisher: ArtifactPublisher,
    /// Template bodies.
    pub templates: Arc<InMemoryTemplateSource>,
    /// Events emitted by orchestrators built from this environment.
    pub events: Arc<CollectingEventSink>,
}

impl Default for TestEnvironment {
    fn default() -> Self {
        Self::new()
    }
}

impl TestEnvironment {
    /// Creates an empty environment serving the reference templates.
    #[must_use]
    pub fn new() -> Self {
        let exports = Arc::new(InMemoryExportRegistry::new());
        let parameters = Arc::new(InMemoryParameterStore::new());
        let provisioner = Arc::new(InMemoryProvisioner::new(
            TEST_REGION,
            exports.clone(),
            parameters.clone(),
        ));
        let store = Arc::new(InMemoryArtifactStore::new("memory://artifacts"));
        let publisher = ArtifactPublisher::new(store.clone(), "templates");
        Self {
            exports,
            parameters,
            provisioner,
            store,
            publisher,
            templates: Arc::new(reference_templates()),
            events: Arc::new(CollectingEventSink::new()),
        }
    }

    /// Revision the templates are pinned to.
    #[must_use]
    pub fn revision(&self) -> &RevisionId {
        self.templates.revision()
    }

    /// The reference set pinned to [`Self::revision`].
    #[must_use]
    pub fn definitions(&self) -> Vec<StackDefinition> {
        reference_stack_set()
            .into_iter()
            .map(|d| d.at_revision(self.revision().clone()))
            .collect()
    }

    /// Plans `definitions`.
    ///
    /// # Panics
    ///
    /// Panics if the definitions do not form a valid graph.
    #[must_use]
    pub fn plan_of(&self, definitions: Vec<StackDefinition>) -> DeploymentPlan {
        StackGraph::new(definitions)
            .build()
            .unwrap_or_else(|e| panic!("invalid fixture graph: {e}"))
    }

    /// Plans the pinned reference set.
    #[must_use]
    pub fn plan(&self) -> DeploymentPlan {
        self.plan_of(self.definitions())
    }

    /// Builds an orchestrator over this environment.
    #[must_use]
    pub fn orchestrator(&self, config: OrchestratorConfig) -> DeploymentOrchestrator {
        DeploymentOrchestrator::new(
            config,
            self.provisioner.clone(),
            self.exports.clone(),
            self.parameters.clone(),
            self.publisher.clone(),
            self.templates.clone(),
        )
        .with_event_sink(self.events.clone())
    }
}
