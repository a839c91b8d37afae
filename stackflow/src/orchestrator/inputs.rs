//! Assembling the concrete inputs of a stack.

use crate::core::{ParameterValues, StackDefinition};
use crate::errors::InputError;
use crate::resolver::ResolvedReference;

/// Builds the parameter values submitted for `definition`.
///
/// Later sources win: declared defaults, then static values, then resolved
/// references. Every declared parameter must end up with a value of its type.
pub fn assemble_inputs(
    definition: &StackDefinition,
    resolved: &[ResolvedReference],
) -> Result<ParameterValues, InputError> {
    let mut values = ParameterValues::new();

    for parameter in &definition.parameters {
        if let Some(default) = &parameter.default {
            values.insert(parameter.name.clone(), default.clone());
        }
    }
    values.extend(
        definition
            .parameter_values
            .iter()
            .map(|(k, v)| (k.clone(), v.clone())),
    );
    values.extend(resolved.iter().map(|r| (r.name.clone(), r.value.clone())));

    for parameter in &definition.parameters {
        let Some(value) = values.get(&parameter.name) else {
            return Err(InputError::MissingValue {
                stack: definition.name.clone(),
                parameter: parameter.name.clone(),
            });
        };
        if !parameter.param_type.accepts(value) {
            return Err(InputError::InvalidValue {
                stack: definition.name.clone(),
                parameter: parameter.name.clone(),
                expected: parameter.param_type.to_string(),
                value: value.clone(),
            });
        }
    }

    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ParameterSpec, ParameterType, ReferenceSpec};
    use pretty_assertions::assert_eq;

    fn resolved(name: &str, value: &str) -> ResolvedReference {
        ResolvedReference {
            name: name.into(),
            spec: ReferenceSpec::export("role"),
            value: value.into(),
        }
    }

    #[test]
    fn test_precedence() {
        let def = StackDefinition::new("Compute", "compute.json")
            .with_parameter(ParameterSpec::optional("Size", ParameterType::Number, "1"))
            .with_parameter(ParameterSpec::optional("Env", ParameterType::String, "dev"))
            .with_value("Env", "prod")
            .with_reference("role", ReferenceSpec::export("role"));

        let values = assemble_inputs(&def, &[resolved("role", "arn:role")]).unwrap();
        assert_eq!(values["Size"], "1");
        assert_eq!(values["Env"], "prod");
        assert_eq!(values["role"], "arn:role");
    }

    #[test]
    fn test_missing_required() {
        let def = StackDefinition::new("Compute", "compute.json")
            .with_parameter(ParameterSpec::required("Size", ParameterType::Number));

        assert_eq!(
            assemble_inputs(&def, &[]),
            Err(InputError::MissingValue {
                stack: "Compute".into(),
                parameter: "Size".into()
            })
        );
    }

    #[test]
    fn test_type_mismatch() {
        let def = StackDefinition::new("Compute", "compute.json")
            .with_parameter(ParameterSpec::required("Size", ParameterType::Number))
            .with_value("Size", "large");

        let err = assemble_inputs(&def, &[]).unwrap_err();
        assert!(matches!(err, InputError::InvalidValue { ref expected, .. } if expected == "Number"));
    }
}
