//! Reference resolution.
//!
//! Each [`ReferenceSpec`](crate::core::ReferenceSpec) kind has its own
//! backend: nested outputs come from the run's [`ResolutionContext`], exports
//! from an [`ExportRegistry`], and external parameters from a
//! [`ParameterStore`]. Both backends are injected, never global.

mod context;
mod exports;
mod parameters;
mod reference;

pub use context::ResolutionContext;
pub use exports::{
    ExportEntry, ExportFilter, ExportRegistry, ImportRecord, InMemoryExportRegistry,
    RegistrySnapshot,
};
pub use parameters::{
    InMemoryParameterStore, ParameterSnapshot, ParameterStore, ParameterStoreError, ParameterValue,
};
pub use reference::{ReferenceResolver, ResolvedReference};
