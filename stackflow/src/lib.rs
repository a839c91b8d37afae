//! # Stackflow
//!
//! Dependency-ordered deployment of interdependent infrastructure stacks.
//!
//! Stackflow takes a set of stack definitions whose inputs are wired to one
//! another's outputs and:
//!
//! - **Plans**: builds the dependency graph from cross-stack references and
//!   orders it so every producer precedes its consumers
//! - **Resolves**: reads nested outputs, region exports, and versioned
//!   external parameters at deploy time, pinned for the whole run
//! - **Deploys**: publishes templates, applies stacks through a provisioning
//!   API, and halts dependents when a stack fails
//! - **Previews**: computes change sets against live state and executes them
//!   only while that state is unchanged
//! - **Tears down**: deletes in reverse order, refusing to remove exports that
//!   live stacks still import
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use stackflow::prelude::*;
//!
//! let plan = StackGraph::new(definitions).build()?;
//! let orchestrator = DeploymentOrchestrator::new(
//!     OrchestratorConfig::for_region("eu-west-1"),
//!     provisioner,
//!     exports,
//!     parameters,
//!     publisher,
//!     templates,
//! );
//!
//! let report = orchestrator.create(&plan).await;
//! assert!(report.success);
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod artifacts;
pub mod changeset;
pub mod config;
pub mod core;
pub mod errors;
pub mod events;
pub mod graph;
pub mod manifest;
pub mod observability;
pub mod orchestrator;
pub mod resolver;
pub mod testing;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::artifacts::{
        ArtifactPublisher, ArtifactStore, DirectoryTemplateSource, FsArtifactStore,
        InMemoryArtifactStore, InMemoryTemplateSource, RevisionId, TemplateSource,
    };
    pub use crate::changeset::{
        ApprovalGate, ApprovalService, AutoApprove, ChangeSet, ChangeSetOutcome, ChangeSetPlanner,
    };
    pub use crate::config::OrchestratorConfig;
    pub use crate::core::{
        Capability, Operation, OutputSpec, ParameterSpec, ParameterType, ReferenceSpec,
        StackDefinition, StackState, TemplateArtifactRef,
    };
    pub use crate::errors::{ErrorKind, StackflowError};
    pub use crate::events::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::graph::{DeploymentPlan, StackGraph, TeardownGuard, TeardownPlan};
    pub use crate::manifest::StackSetManifest;
    pub use crate::orchestrator::{
        CancellationToken, DeploymentOrchestrator, DeploymentReport, InMemoryProvisioner,
        PollConfig, Provisioner, RetryConfig, StackReport,
    };
    pub use crate::resolver::{
        ExportRegistry, InMemoryExportRegistry, InMemoryParameterStore, ParameterStore,
        ReferenceResolver, ResolutionContext,
    };
}
