//! Differences between a live stack and a target request.

use crate::core::Capability;
use crate::orchestrator::{LiveStack, StackRequest};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One difference a change set would apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum Change {
    /// The stack does not exist yet.
    CreateStack,
    /// The template URL (and so the revision) changes.
    Template {
        /// Live URL.
        from: String,
        /// Target URL.
        to: String,
    },
    /// A parameter gains a value.
    ParameterAdded {
        /// Parameter name.
        name: String,
        /// New value.
        value: String,
    },
    /// A parameter is no longer passed.
    ParameterRemoved {
        /// Parameter name.
        name: String,
        /// Previous value.
        value: String,
    },
    /// A parameter value changes.
    ParameterModified {
        /// Parameter name.
        name: String,
        /// Live value.
        from: String,
        /// Target value.
        to: String,
    },
    /// A new output.
    OutputAdded {
        /// Output name.
        name: String,
    },
    /// An output goes away.
    OutputRemoved {
        /// Output name.
        name: String,
    },
    /// An output's expression changes.
    OutputModified {
        /// Output name.
        name: String,
    },
    /// An export starts being published.
    ExportAdded {
        /// Export name.
        name: String,
    },
    /// An export stops being published.
    ExportRemoved {
        /// Export name.
        name: String,
    },
    /// The acknowledged capabilities change.
    Capabilities {
        /// Live capabilities.
        from: Vec<Capability>,
        /// Target capabilities.
        to: Vec<Capability>,
    },
}

/// The changes for one stack and the live version they were computed against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackDelta {
    /// Stack name.
    pub stack: String,
    /// Live version when the delta was computed; `None` if absent.
    pub expected_version: Option<u64>,
    /// The changes, in a stable order.
    pub changes: Vec<Change>,
}

impl StackDelta {
    /// Returns true if nothing would change.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Returns true if the stack would be created.
    #[must_use]
    pub fn is_create(&self) -> bool {
        self.changes.first() == Some(&Change::CreateStack)
    }
}

/// Computes what applying `target` to `live` would change.
#[must_use]
pub fn diff(live: Option<&LiveStack>, target: &StackRequest) -> StackDelta {
    let Some(live) = live else {
        return StackDelta {
            stack: target.stack_name.clone(),
            expected_version: None,
            changes: vec![Change::CreateStack],
        };
    };

    let mut changes = Vec::new();

    if live.template_url != target.template_url || live.template != target.template {
        changes.push(Change::Template {
            from: live.template_url.clone(),
            to: target.template_url.clone(),
        });
    }

    for (name, value) in &target.parameters {
        match live.parameters.get(name) {
            None => changes.push(Change::ParameterAdded {
                name: name.clone(),
                value: value.clone(),
            }),
            Some(current) if current != value => changes.push(Change::ParameterModified {
                name: name.clone(),
                from: current.clone(),
                to: value.clone(),
            }),
            Some(_) => {}
        }
    }
    for (name, value) in &live.parameters {
        if !target.parameters.contains_key(name) {
            changes.push(Change::ParameterRemoved {
                name: name.clone(),
                value: value.clone(),
            });
        }
    }

    let live_outputs: BTreeMap<&str, &str> = live
        .outputs
        .iter()
        .map(|o| (o.name.as_str(), o.expression.as_str()))
        .collect();
    let target_outputs: BTreeMap<&str, &str> = target
        .outputs
        .iter()
        .map(|o| (o.name.as_str(), o.expression.as_str()))
        .collect();
    for (name, expression) in &target_outputs {
        match live_outputs.get(name) {
            None => changes.push(Change::OutputAdded { name: (*name).to_string() }),
            Some(current) if current != expression => {
                changes.push(Change::OutputModified { name: (*name).to_string() });
            }
            Some(_) => {}
        }
    }
    for name in live_outputs.keys() {
        if !target_outputs.contains_key(name) {
            changes.push(Change::OutputRemoved { name: (*name).to_string() });
        }
    }

    let live_exports: Vec<&str> = live.exports().map(|(_, e)| e).collect();
    let target_exports: Vec<&str> = target
        .outputs
        .iter()
        .filter_map(|o| o.export.as_deref())
        .collect();
    for export in &target_exports {
        if !live_exports.contains(export) {
            changes.push(Change::ExportAdded { name: (*export).to_string() });
        }
    }
    for export in &live_exports {
        if !target_exports.contains(export) {
            changes.push(Change::ExportRemoved { name: (*export).to_string() });
        }
    }

    let mut from = live.capabilities.clone();
    let mut to = target.capabilities.clone();
    from.sort();
    to.sort();
    if from != to {
        changes.push(Change::Capabilities { from, to });
    }

    StackDelta {
        stack: target.stack_name.clone(),
        expected_version: Some(live.version),
        changes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{OutputSpec, ParameterValues, StackDefinition};
    use chrono::Utc;
    use pretty_assertions::assert_eq;

    fn target() -> StackRequest {
        let def = StackDefinition::new("Iam", "iam.json")
            .with_export("RoleArn", "arn:role", "role")
            .with_capability(Capability::Iam);
        StackRequest::from_definition(
            &def,
            "memory://r2/iam.json",
            ParameterValues::from([
                ("Env".to_string(), "prod".to_string()),
                ("Size".to_string(), "2".to_string()),
            ]),
        )
    }

    fn live() -> LiveStack {
        LiveStack {
            name: "Iam".into(),
            version: 3,
            template: target().template,
            template_url: "memory://r1/iam.json".into(),
            parameters: ParameterValues::from([
                ("Env".to_string(), "dev".to_string()),
                ("Old".to_string(), "x".to_string()),
            ]),
            outputs: vec![OutputSpec {
                name: "Legacy".into(),
                expression: "legacy".into(),
                export: Some("legacy".into()),
            }],
            output_values: ParameterValues::new(),
            imports: vec![],
            capabilities: vec![],
            parent: None,
            last_updated: Utc::now(),
        }
    }

    #[test]
    fn test_absent_stack_is_created() {
        let delta = diff(None, &target());
        assert!(delta.is_create());
        assert_eq!(delta.expected_version, None);
    }

    #[test]
    fn test_full_delta() {
        let delta = diff(Some(&live()), &target());
        assert_eq!(delta.expected_version, Some(3));
        assert_eq!(
            delta.changes,
            vec![
                Change::Template {
                    from: "memory://r1/iam.json".into(),
                    to: "memory://r2/iam.json".into()
                },
                Change::ParameterModified {
                    name: "Env".into(),
                    from: "dev".into(),
                    to: "prod".into()
                },
                Change::ParameterAdded {
                    name: "Size".into(),
                    value: "2".into()
                },
                Change::ParameterRemoved {
                    name: "Old".into(),
                    value: "x".into()
                },
                Change::OutputAdded { name: "RoleArn".into() },
                Change::OutputRemoved { name: "Legacy".into() },
                Change::ExportAdded { name: "role".into() },
                Change::ExportRemoved { name: "legacy".into() },
                Change::Capabilities {
                    from: vec![],
                    to: vec![Capability::Iam]
                },
            ]
        );
    }

    #[test]
    fn test_identical_is_empty() {
        let request = target();
        let mut current = live();
        current.template_url = request.template_url.clone();
        current.parameters = request.parameters.clone();
        current.outputs = request.outputs.clone();
        current.capabilities = request.capabilities.clone();

        assert!(diff(Some(&current), &request).is_empty());
    }
}
