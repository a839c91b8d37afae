//! One comprehensive event per finished run.

use crate::orchestrator::DeploymentReport;
use std::collections::BTreeMap;

/// Summarizes finished runs as a single structured log event.
#[derive(Debug, Clone)]
pub struct WideEventEmitter {
    /// Event type carried in the payload.
    pub run_event_type: String,
}

impl Default for WideEventEmitter {
    fn default() -> Self {
        Self {
            run_event_type: "run.wide".to_string(),
        }
    }
}

impl WideEventEmitter {
    /// Creates a new wide event emitter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the payload for `report`.
    #[must_use]
    pub fn build_run_payload(report: &DeploymentReport) -> serde_json::Value {
        let mut state_counts: BTreeMap<String, u32> = BTreeMap::new();
        for stack in &report.stacks {
            *state_counts.entry(stack.state.to_string()).or_insert(0) += 1;
        }

        let stack_details: Vec<serde_json::Value> = report
            .stacks
            .iter()
            .map(|s| {
                let mut detail = serde_json::json!({
                    "stack": s.name,
                    "state": s.state.to_string(),
                    "attempts": s.attempts,
                    "duration_ms": s.duration_ms,
                });
                if let Some(error) = &s.error {
                    detail["error"] = serde_json::json!(error);
                }
                detail
            })
            .collect();

        let mut payload = serde_json::json!({
            "run_id": report.run_id,
            "operation": report.operation,
            "region": report.region,
            "status": if report.success { "succeeded" } else if report.cancelled { "cancelled" } else { "failed" },
            "furthest": report.furthest(),
            "started_at": report.started_at.to_rfc3339(),
            "duration_ms": report.duration_ms,
            "state_counts": state_counts,
            "stack_details": stack_details,
        });

        if let Some(failure) = &report.failure {
            payload["failure"] = serde_json::json!({
                "stack": failure.stack,
                "code": failure.code,
                "message": failure.message,
            });
        }

        payload
    }

    /// Logs the wide event for `report`.
    pub fn emit_run(&self, report: &DeploymentReport) {
        let payload = Self::build_run_payload(report);
        if report.success {
            tracing::info!(event_type = %self.run_event_type, payload = %payload, "Run summary");
        } else {
            tracing::warn!(event_type = %self.run_event_type, payload = %payload, "Run summary");
        }
    }
}
