//! Core types for stack definitions and lifecycle states.
//!
//! This module provides:
//! - Stack definitions with parameters, outputs, and references
//! - The three-way `ReferenceSpec` sharing model
//! - Per-stack lifecycle states

mod definition;
pub mod names;
mod status;

pub use definition::{
    Capability, OutputSpec, ParameterSpec, ParameterType, ParameterValues, ParameterWrite,
    ReferenceDecl, ReferenceKind, ReferenceSpec, StackDefinition, TemplateArtifactRef,
    LATEST_ALIAS,
};
pub use status::{Operation, StackLifecycle, StackState, StateTransition};
