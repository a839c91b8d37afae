//! Per-run resolution state.

use crate::core::ParameterValues;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Values read during one deployment run.
///
/// The first value read for an export name or a `(path, version)` pair is
/// pinned; later reads in the same run get the pinned value even if the
/// registry or store changed underneath. Nested outputs are recorded here
/// as nested units succeed and read back without I/O.
#[derive(Debug, Default)]
pub struct ResolutionContext {
    run_id: String,
    exports: DashMap<String, String>,
    parameters: DashMap<(String, u64), String>,
    nested: RwLock<HashMap<(String, String), ParameterValues>>,
}

impl ResolutionContext {
    /// Creates an empty context for `run_id`.
    #[must_use]
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            ..Self::default()
        }
    }

    /// Returns the run this context belongs to.
    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Records the outputs of nested unit `child` in tree `parent`.
    pub fn record_nested_outputs(&self, parent: &str, child: &str, outputs: ParameterValues) {
        self.nested
            .write()
            .insert((parent.to_string(), child.to_string()), outputs);
    }

    /// Looks up a recorded nested output.
    #[must_use]
    pub fn nested_output(&self, parent: &str, child: &str, output: &str) -> Option<String> {
        self.nested
            .read()
            .get(&(parent.to_string(), child.to_string()))
            .and_then(|outputs| outputs.get(output).cloned())
    }

    /// Returns the pinned value of an export.
    #[must_use]
    pub fn pinned_export(&self, name: &str) -> Option<String> {
        self.exports.get(name).map(|v| v.value().clone())
    }

    /// Pins an export value unless one is already pinned, returning the
    /// value in effect.
    pub fn pin_export(&self, name: &str, value: String) -> String {
        self.exports
            .entry(name.to_string())
            .or_insert(value)
            .value()
            .clone()
    }

    /// Returns the pinned value of a parameter version.
    #[must_use]
    pub fn pinned_parameter(&self, path: &str, version: u64) -> Option<String> {
        self.parameters
            .get(&(path.to_string(), version))
            .map(|v| v.value().clone())
    }

    /// Pins a parameter value unless one is already pinned, returning the
    /// value in effect.
    pub fn pin_parameter(&self, path: &str, version: u64, value: String) -> String {
        self.parameters
            .entry((path.to_string(), version))
            .or_insert(value)
            .value()
            .clone()
    }

    /// Returns the number of pinned exports and parameters.
    #[must_use]
    pub fn pinned_count(&self) -> usize {
        self.exports.len() + self.parameters.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_pin_wins() {
        let ctx = ResolutionContext::new("run-1");
        assert_eq!(ctx.pin_export("role", "arn:1".into()), "arn:1");
        assert_eq!(ctx.pin_export("role", "arn:2".into()), "arn:1");
        assert_eq!(ctx.pinned_export("role").as_deref(), Some("arn:1"));

        assert_eq!(ctx.pin_parameter("/p", 1, "a".into()), "a");
        assert_eq!(ctx.pin_parameter("/p", 1, "b".into()), "a");
        assert_eq!(ctx.pin_parameter("/p", 2, "b".into()), "b");
        assert_eq!(ctx.pinned_count(), 3);
    }

    #[test]
    fn test_nested_outputs() {
        let ctx = ResolutionContext::new("run-1");
        let mut outputs = ParameterValues::new();
        outputs.insert("VpcId".into(), "vpc-1".into());
        ctx.record_nested_outputs("App", "Networking", outputs);

        assert_eq!(ctx.nested_output("App", "Networking", "VpcId").as_deref(), Some("vpc-1"));
        assert_eq!(ctx.nested_output("App", "Networking", "Subnet"), None);
        assert_eq!(ctx.nested_output("Other", "Networking", "VpcId"), None);
        assert_eq!(ctx.run_id(), "run-1");
    }
}
