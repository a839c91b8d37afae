//! Testing utilities for deployment runs.
//!
//! This module provides:
//! - The reference stack set used across the test suites
//! - An in-memory environment wiring provisioner, registry, store, and events

mod fixtures;

pub use fixtures::{
    fast_config, reference_stack_set, reference_templates, TestEnvironment, TEST_BUCKET, TEST_REGION,
};
