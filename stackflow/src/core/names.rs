//! Name patterns accepted for stacks, logical ids, exports, and parameter paths.

use crate::errors::GraphError;
use regex::Regex;
use std::sync::OnceLock;

fn pattern(cell: &'static OnceLock<Regex>, source: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(source).expect("static name pattern compiles"))
}

fn stack_pattern() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    pattern(&CELL, r"^[A-Za-z][A-Za-z0-9-]{0,127}$")
}

fn logical_pattern() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    pattern(&CELL, r"^[A-Za-z][A-Za-z0-9_]{0,254}$")
}

fn export_pattern() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    pattern(&CELL, r"^[A-Za-z0-9:._-]{1,255}$")
}

fn parameter_path_pattern() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    pattern(&CELL, r"^/?[A-Za-z0-9_.-]+(/[A-Za-z0-9_.-]+)*$")
}

fn check(item: &'static str, name: &str, re: &Regex) -> Result<(), GraphError> {
    if re.is_match(name) {
        Ok(())
    } else {
        Err(GraphError::InvalidName {
            item,
            name: name.to_string(),
        })
    }
}

/// Validates a stack name.
pub fn validate_stack_name(name: &str) -> Result<(), GraphError> {
    check("stack", name, stack_pattern())
}

/// Validates a parameter, output, or reference name.
pub fn validate_logical_name(item: &'static str, name: &str) -> Result<(), GraphError> {
    check(item, name, logical_pattern())
}

/// Validates an export name.
pub fn validate_export_name(name: &str) -> Result<(), GraphError> {
    check("export", name, export_pattern())
}

/// Validates a hierarchical parameter path.
pub fn validate_parameter_path(path: &str) -> Result<(), GraphError> {
    check("parameter path", path, parameter_path_pattern())
}
