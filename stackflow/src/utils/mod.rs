//! Identifier and timestamp helpers.

use chrono::Utc;
use std::time::Instant;
use uuid::Uuid;

/// Returns the current UTC time as an RFC 3339 string with microseconds.
#[must_use]
pub fn iso_timestamp() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S%.6f+00:00").to_string()
}

/// Generates a time-ordered run identifier.
#[must_use]
pub fn generate_run_id() -> String {
    Uuid::now_v7().to_string()
}

/// Generates a change set identifier.
#[must_use]
pub fn generate_changeset_id() -> String {
    format!("cs-{}", Uuid::new_v4().simple())
}

/// Milliseconds since `start`, saturating.
#[must_use]
pub fn elapsed_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_ids_are_v7() {
        let first = generate_run_id();
        assert_eq!(Uuid::parse_str(&first).unwrap().get_version_num(), 7);
        assert_ne!(first, generate_run_id());
    }

    #[test]
    fn test_changeset_id_prefix() {
        let id = generate_changeset_id();
        assert!(id.starts_with("cs-"));
        assert_eq!(id.len(), 35);
    }

    #[test]
    fn test_iso_timestamp_format() {
        let ts = iso_timestamp();
        assert!(ts.contains('T'));
        assert!(ts.ends_with("+00:00"));
    }
}
